use clap::Parser;
use client::network::RelayClient;
use client::world::RemoteWorld;
use log::{error, info, warn};
use rand::Rng;
use shared::{Message, PlayerId, PlayerState, ProjectileEvent};
use std::f64::consts::TAU;
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};

const WORLD_WIDTH: f64 = 800.0;
const WORLD_HEIGHT: f64 = 600.0;

#[derive(Parser, Debug)]
#[command(author, version, about = "Scripted bot client for the relay", long_about = None)]
struct Args {
    /// Relay address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:5555")]
    server: String,

    /// Player identity (a random UUID when omitted)
    #[arg(long)]
    id: Option<String>,

    /// State updates sent per second
    #[arg(short = 't', long, default_value = "60")]
    tick_rate: u32,

    /// Fire a projectile every N ticks (0 never fires)
    #[arg(long, default_value = "30")]
    fire_every: u32,

    /// Stop after this many seconds (0 runs until Ctrl+C)
    #[arg(short = 'd', long, default_value = "0")]
    duration_secs: u64,

    /// Radius of the circle the bot walks, in world units
    #[arg(short = 'r', long, default_value = "150")]
    radius: f64,
}

/// Pose on a circle around the middle of the world, facing along the path
fn pose_at(tick: u64, tick_rate: u32, radius: f64) -> (f64, f64, f64) {
    let phase = (tick as f64 / tick_rate.max(1) as f64) * 0.25 * TAU;
    let x = WORLD_WIDTH / 2.0 + radius * phase.cos();
    let y = WORLD_HEIGHT / 2.0 + radius * phase.sin();

    // Screen y grows downwards; angle 0 points up the screen
    let (dx, dy) = (-phase.sin(), phase.cos());
    let angle = (-dy).atan2(dx).to_degrees() - 90.0;
    (x, y, angle)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let id = PlayerId::from(
        args.id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
    );

    info!("Starting bot {} against {}", id, args.server);

    let mut relay = match RelayClient::connect(&args.server).await {
        Ok(relay) => relay,
        Err(e) => {
            error!("{}", e);
            return Err(e.into());
        }
    };
    let mut world = RemoteWorld::new(id.clone());
    let mut rng = rand::thread_rng();

    let mut ticker = interval(Duration::from_secs_f64(1.0 / args.tick_rate.max(1) as f64));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let deadline = sleep(match args.duration_secs {
        0 => Duration::from_secs(u64::MAX / 4),
        secs => Duration::from_secs(secs),
    });
    tokio::pin!(deadline);

    let report_every = u64::from(args.tick_rate.max(1)) * 5;
    let mut tick: u64 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let (x, y, angle) = pose_at(tick, args.tick_rate, args.radius);
                relay
                    .send(&Message::Player(PlayerState::new(id.clone(), x, y, angle)))
                    .await?;

                if args.fire_every > 0 && tick % u64::from(args.fire_every) == 0 {
                    let target_x = rng.gen_range(0.0..WORLD_WIDTH);
                    let target_y = rng.gen_range(0.0..WORLD_HEIGHT);
                    let bullet = ProjectileEvent::aimed(x, y, target_x, target_y);
                    relay.send(&Message::Bullet(bullet)).await?;
                }

                tick += 1;
                if tick % report_every == 0 {
                    info!(
                        "Tick {}: {} other players, {} bullets seen, {} departures",
                        tick,
                        world.player_count(),
                        world.bullets_seen(),
                        world.departures()
                    );
                }
            },

            message = relay.recv() => {
                match message {
                    Some(message) => world.apply(&message),
                    None => {
                        warn!("Relay connection closed");
                        break;
                    }
                }
            },

            _ = &mut deadline => {
                info!("Run time elapsed");
                break;
            },

            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, disconnecting");
                break;
            },
        }
    }

    for player in world.players() {
        info!(
            "Last seen {} at ({:.1}, {:.1}) facing {:.0}",
            player.id, player.x, player.y, player.angle
        );
    }

    relay.close().await?;
    Ok(())
}
