use clap::Parser;
use log::{error, info};
use server::network::{RelayConfig, Server};
use std::time::Duration;

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about = "Multiplayer state relay")]
struct Args {
    /// Address to bind to
    #[clap(short = 'H', long, default_value = "0.0.0.0")]
    host: String,
    /// Port to listen on (0 picks a free port)
    #[clap(short, long, default_value = "5555")]
    port: u16,
    /// Frames buffered per client before broadcasts to it are dropped
    #[clap(long, default_value = "256")]
    queue_depth: usize,
    /// Time allowed for a single socket write, in milliseconds
    #[clap(long, default_value = "2000")]
    write_timeout_ms: u64,
    /// Seconds of silence before a client is dropped (0 disables)
    #[clap(long, default_value = "30")]
    idle_timeout_secs: u64,
    /// Largest accepted message payload, in bytes (at most 65536)
    #[clap(long, default_value = "65536")]
    max_frame_bytes: usize,
    /// Do not send existing player states to newly connected clients
    #[clap(long)]
    no_join_sync: bool,
}

impl Args {
    fn into_config(self) -> RelayConfig {
        RelayConfig {
            host: self.host,
            port: self.port,
            queue_depth: self.queue_depth.max(1),
            write_timeout: Duration::from_millis(self.write_timeout_ms),
            idle_timeout: match self.idle_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            max_frame_size: self.max_frame_bytes,
            join_sync: !self.no_join_sync,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let config = Args::parse().into_config();
    info!("Starting relay on {}", config.address());

    let server = match Server::bind(config).await {
        Ok(server) => server,
        Err(e) => {
            error!("{}", e);
            return Err(e.into());
        }
    };

    tokio::select! {
        _ = server.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
