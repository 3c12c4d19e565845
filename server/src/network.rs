//! Relay network layer: TCP listener, per-connection receive loops and fan-out

use crate::connection::{spawn_writer, Connection, ConnectionId};
use crate::error::RelayError;
use crate::registry::Registry;
use bytes::Bytes;
use log::{debug, error, info, warn};
use shared::{encode_frame, read_frame, Message, PlayerId, ProtocolError, DEFAULT_MAX_FRAME_SIZE};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Runtime settings for the relay
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    /// Frames buffered per connection before broadcasts to it are dropped
    pub queue_depth: usize,
    pub write_timeout: Duration,
    /// Longest silence tolerated from a client; `None` waits forever
    pub idle_timeout: Option<Duration>,
    /// Largest payload accepted from or sent to a client; capped at
    /// `DEFAULT_MAX_FRAME_SIZE`, the most a `RelayClient` will read
    pub max_frame_size: usize,
    /// Send existing player states to each new connection
    pub join_sync: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5555,
            queue_depth: 256,
            write_timeout: Duration::from_millis(2000),
            idle_timeout: Some(Duration::from_secs(30)),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            join_sync: true,
        }
    }
}

impl RelayConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Lifecycle of one connection's receive loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// Accepted, no `player` message seen yet
    Connected,
    /// Bound to the identity from its first `player` message
    Identified(PlayerId),
    Closed,
}

/// Queues `frame` on every attached connection except `exclude`.
///
/// A peer that cannot take the frame is logged and skipped; delivery to the
/// rest carries on. Returns how many peers accepted the frame.
pub async fn broadcast(registry: &Registry, exclude: ConnectionId, frame: Bytes) -> usize {
    let targets = registry.broadcast_targets(exclude).await;
    let mut delivered = 0;

    for target in targets {
        match target.send(frame.clone()) {
            Ok(()) => delivered += 1,
            Err(e) => warn!("{}", e),
        }
    }

    delivered
}

/// Dispatches inbound payloads for a single connection
///
/// Tracks the connection's phase, keeps the registry current and forwards
/// accepted payloads to every other connection byte for byte.
pub struct ConnectionHandler {
    connection: ConnectionId,
    phase: ConnectionPhase,
    registry: Arc<Registry>,
    max_frame_size: usize,
}

impl ConnectionHandler {
    pub fn new(connection: ConnectionId, registry: Arc<Registry>, max_frame_size: usize) -> Self {
        Self {
            connection,
            phase: ConnectionPhase::Connected,
            registry,
            max_frame_size,
        }
    }

    pub fn phase(&self) -> &ConnectionPhase {
        &self.phase
    }

    /// Handles one payload and returns the number of peers it was queued for.
    ///
    /// Fails only with `MalformedMessage`, in which case nothing was changed
    /// or forwarded and the connection can keep reading.
    pub async fn handle_payload(&mut self, payload: Bytes) -> Result<usize, RelayError> {
        if self.phase == ConnectionPhase::Closed {
            return Ok(0);
        }
        let message = Message::decode(&payload).map_err(RelayError::MalformedMessage)?;
        let kind = message.kind();

        match message {
            Message::Player(state) => {
                let bound = match &self.phase {
                    ConnectionPhase::Identified(identity) => Some(identity.clone()),
                    _ => None,
                };

                match bound {
                    None => {
                        let identity = state.id.clone();
                        if !self.registry.register(self.connection, state).await {
                            return Ok(0);
                        }
                        self.phase = ConnectionPhase::Identified(identity);
                    }
                    Some(identity) if identity == state.id => {
                        self.registry.update_state(state).await;
                    }
                    Some(identity) => {
                        warn!(
                            "Connection {} is player {} but sent state for {}, dropping",
                            self.connection, identity, state.id
                        );
                        return Ok(0);
                    }
                }
            }
            Message::Bullet(_) => {}
            Message::Disconnect { id } => {
                warn!(
                    "Connection {} sent a disconnect notice for {}, dropping",
                    self.connection, id
                );
                return Ok(0);
            }
        }

        let frame =
            encode_frame(&payload, self.max_frame_size).map_err(RelayError::MalformedMessage)?;
        let delivered = broadcast(&self.registry, self.connection, frame).await;
        debug!(
            "Relayed {} from connection {} to {} peers",
            kind, self.connection, delivered
        );
        Ok(delivered)
    }

    /// Unregisters the connection and tells the remaining peers which player
    /// left. Only the first call has any effect; returns how many peers were
    /// notified.
    pub async fn close(&mut self) -> usize {
        if self.phase == ConnectionPhase::Closed {
            return 0;
        }
        self.phase = ConnectionPhase::Closed;

        let identity = match self.registry.unregister(self.connection).await {
            Some(identity) => identity,
            None => return 0,
        };

        match (Message::Disconnect { id: identity.clone() }).to_frame_within(self.max_frame_size) {
            Ok(frame) => {
                let notified = broadcast(&self.registry, self.connection, frame).await;
                info!("Player {} left, notified {} peers", identity, notified);
                notified
            }
            Err(e) => {
                error!("Failed to encode disconnect for {}: {}", identity, e);
                0
            }
        }
    }
}

/// Relay server owning the listening socket and the shared registry
pub struct Server {
    listener: TcpListener,
    registry: Arc<Registry>,
    config: Arc<RelayConfig>,
}

impl Server {
    pub async fn bind(mut config: RelayConfig) -> Result<Self, RelayError> {
        if config.max_frame_size > DEFAULT_MAX_FRAME_SIZE {
            warn!(
                "Frame limit {} exceeds what clients accept, using {}",
                config.max_frame_size, DEFAULT_MAX_FRAME_SIZE
            );
            config.max_frame_size = DEFAULT_MAX_FRAME_SIZE;
        }

        let address = config.address();
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|source| RelayError::Bind {
                addr: address.clone(),
                source,
            })?;

        Ok(Server {
            listener,
            registry: Arc::new(Registry::new()),
            config: Arc::new(config),
        })
    }

    /// Address actually bound, useful when the configured port is 0
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Accept loop. Spawns one task per connection and never returns;
    /// a failed accept is logged and retried.
    pub async fn run(self) {
        match self.listener.local_addr() {
            Ok(addr) => info!("Relay listening on {}", addr),
            Err(_) => info!("Relay listening on {}", self.config.address()),
        }

        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    let registry = Arc::clone(&self.registry);
                    let config = Arc::clone(&self.config);
                    tokio::spawn(async move {
                        handle_connection(stream, addr, registry, config).await;
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }
}

/// Receive loop for one client, from accept to cleanup
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: Arc<Registry>,
    config: Arc<RelayConfig>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Could not disable Nagle for {}: {}", addr, e);
    }

    let id = ConnectionId::next();
    let (read_half, write_half) = stream.into_split();
    let (sender, outbound) = mpsc::channel(config.queue_depth);
    let connection = Connection::new(id, addr, sender);
    spawn_writer(id, addr, write_half, outbound, config.write_timeout);

    if config.join_sync {
        registry
            .attach_and_sync(connection, config.max_frame_size)
            .await;
    } else {
        registry.attach(connection).await;
    }

    let mut reader = BufReader::new(read_half);
    let mut handler = ConnectionHandler::new(id, Arc::clone(&registry), config.max_frame_size);

    loop {
        let next = match config.idle_timeout {
            Some(limit) => match timeout(limit, read_frame(&mut reader, config.max_frame_size)).await
            {
                Ok(result) => result,
                Err(_) => Err(ProtocolError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("nothing received for {:?}", limit),
                ))),
            },
            None => read_frame(&mut reader, config.max_frame_size).await,
        };

        match next {
            Ok(Some(payload)) => {
                if let Err(e) = handler.handle_payload(payload).await {
                    warn!("Discarding message from connection {} ({}): {}", id, addr, e);
                }
            }
            Ok(None) => {
                info!("Connection {} ({}) closed by peer", id, addr);
                break;
            }
            Err(e) => {
                info!("Connection {} ({}): {}", id, addr, RelayError::ConnectionLost(e));
                break;
            }
        }
    }

    handler.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WriteFailure;
    use shared::{PlayerState, ProjectileEvent};

    struct Peer {
        id: ConnectionId,
        outbound: mpsc::Receiver<Bytes>,
    }

    impl Peer {
        fn drain(&mut self) -> Vec<Bytes> {
            let mut frames = Vec::new();
            while let Ok(frame) = self.outbound.try_recv() {
                frames.push(frame);
            }
            frames
        }
    }

    async fn attach_peer(registry: &Registry, id: u64, depth: usize) -> Peer {
        let (tx, rx) = mpsc::channel(depth);
        let addr: SocketAddr = format!("127.0.0.1:{}", 7000 + id).parse().unwrap();
        registry
            .attach(Connection::new(ConnectionId(id), addr, tx))
            .await;
        Peer {
            id: ConnectionId(id),
            outbound: rx,
        }
    }

    fn framed(payload: &[u8]) -> Bytes {
        encode_frame(payload, DEFAULT_MAX_FRAME_SIZE).unwrap()
    }

    fn handler_for(peer: &Peer, registry: &Arc<Registry>) -> ConnectionHandler {
        ConnectionHandler::new(peer.id, Arc::clone(registry), DEFAULT_MAX_FRAME_SIZE)
    }

    const PLAYER_P1: &[u8] = br#"{"type":"player","id":"p1","x":10,"y":20,"angle":0}"#;
    const BULLET: &[u8] = br#"{"type":"bullet","x":5,"y":5,"dx":1,"dy":0}"#;

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();

        assert_eq!(config.address(), "0.0.0.0:5555");
        assert_eq!(config.queue_depth, 256);
        assert_eq!(config.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
        assert!(config.join_sync);
    }

    #[tokio::test]
    async fn test_player_message_reaches_everyone_but_sender() {
        let registry = Arc::new(Registry::new());
        let mut a = attach_peer(&registry, 1, 8).await;
        let mut b = attach_peer(&registry, 2, 8).await;
        let mut c = attach_peer(&registry, 3, 8).await;
        let mut handler = handler_for(&a, &registry);

        let delivered = handler
            .handle_payload(Bytes::from_static(PLAYER_P1))
            .await
            .unwrap();

        assert_eq!(delivered, 2);
        assert!(a.drain().is_empty());
        assert_eq!(b.drain(), vec![framed(PLAYER_P1)]);
        assert_eq!(c.drain(), vec![framed(PLAYER_P1)]);
    }

    #[tokio::test]
    async fn test_player_message_updates_registry() {
        let registry = Arc::new(Registry::new());
        let x = attach_peer(&registry, 1, 8).await;
        let _y = attach_peer(&registry, 2, 8).await;
        let mut handler = handler_for(&x, &registry);

        handler
            .handle_payload(Bytes::from_static(PLAYER_P1))
            .await
            .unwrap();

        assert_eq!(
            handler.phase(),
            &ConnectionPhase::Identified(PlayerId::from("p1"))
        );
        assert_eq!(
            registry.state_of(&PlayerId::from("p1")).await,
            Some(PlayerState::new("p1", 10.0, 20.0, 0.0))
        );

        handler
            .handle_payload(Bytes::from_static(
                br#"{"type":"player","id":"p1","x":11,"y":21,"angle":90}"#,
            ))
            .await
            .unwrap();

        assert_eq!(
            registry.state_of(&PlayerId::from("p1")).await,
            Some(PlayerState::new("p1", 11.0, 21.0, 90.0))
        );
    }

    #[tokio::test]
    async fn test_bullet_is_forwarded_without_registry_change() {
        let registry = Arc::new(Registry::new());
        let x = attach_peer(&registry, 1, 8).await;
        let mut y = attach_peer(&registry, 2, 8).await;
        let mut handler = handler_for(&x, &registry);

        let before = registry.snapshot().await;
        let delivered = handler
            .handle_payload(Bytes::from_static(BULLET))
            .await
            .unwrap();
        let after = registry.snapshot().await;

        assert_eq!(delivered, 1);
        assert_eq!(y.drain(), vec![framed(BULLET)]);
        assert_eq!(before.identities, after.identities);
        assert_eq!(before.states, after.states);
        assert_eq!(handler.phase(), &ConnectionPhase::Connected);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_rejected_without_effect() {
        let registry = Arc::new(Registry::new());
        let x = attach_peer(&registry, 1, 8).await;
        let mut y = attach_peer(&registry, 2, 8).await;
        let mut handler = handler_for(&x, &registry);

        let result = handler
            .handle_payload(Bytes::from_static(br#"{"type":"player","id":"p1""#))
            .await;

        assert!(matches!(result, Err(RelayError::MalformedMessage(_))));
        assert!(y.drain().is_empty());
        assert_eq!(handler.phase(), &ConnectionPhase::Connected);

        // The same handler keeps working afterwards
        let delivered = handler
            .handle_payload(Bytes::from_static(BULLET))
            .await
            .unwrap();
        assert_eq!(delivered, 1);
    }

    #[tokio::test]
    async fn test_identity_change_is_dropped() {
        let registry = Arc::new(Registry::new());
        let x = attach_peer(&registry, 1, 8).await;
        let mut y = attach_peer(&registry, 2, 8).await;
        let mut handler = handler_for(&x, &registry);

        handler
            .handle_payload(Bytes::from_static(PLAYER_P1))
            .await
            .unwrap();
        y.drain();

        let delivered = handler
            .handle_payload(Bytes::from_static(
                br#"{"type":"player","id":"imposter","x":0,"y":0,"angle":0}"#,
            ))
            .await
            .unwrap();

        assert_eq!(delivered, 0);
        assert!(y.drain().is_empty());
        assert_eq!(registry.state_of(&PlayerId::from("imposter")).await, None);
        assert_eq!(
            registry.identity_of(x.id).await,
            Some(PlayerId::from("p1"))
        );
    }

    #[tokio::test]
    async fn test_client_disconnect_notice_is_not_forwarded() {
        let registry = Arc::new(Registry::new());
        let x = attach_peer(&registry, 1, 8).await;
        let mut y = attach_peer(&registry, 2, 8).await;
        let mut handler = handler_for(&x, &registry);

        let delivered = handler
            .handle_payload(Bytes::from_static(br#"{"type":"disconnect","id":"p2"}"#))
            .await
            .unwrap();

        assert_eq!(delivered, 0);
        assert!(y.drain().is_empty());
    }

    #[tokio::test]
    async fn test_close_notifies_remaining_peers_once() {
        let registry = Arc::new(Registry::new());
        let a = attach_peer(&registry, 1, 8).await;
        let mut b = attach_peer(&registry, 2, 8).await;
        let mut c = attach_peer(&registry, 3, 8).await;
        let mut handler = handler_for(&a, &registry);

        handler
            .handle_payload(Bytes::from_static(PLAYER_P1))
            .await
            .unwrap();
        b.drain();
        c.drain();

        assert_eq!(handler.close().await, 2);
        assert_eq!(handler.close().await, 0);

        let expected = Message::Disconnect {
            id: PlayerId::from("p1"),
        }
        .to_frame()
        .unwrap();
        assert_eq!(b.drain(), vec![expected.clone()]);
        assert_eq!(c.drain(), vec![expected]);

        let targets = registry.broadcast_targets(b.id).await;
        assert!(targets.iter().all(|target| target.id != a.id));
        assert_eq!(registry.state_of(&PlayerId::from("p1")).await, None);
    }

    #[tokio::test]
    async fn test_close_before_identifying_is_silent() {
        let registry = Arc::new(Registry::new());
        let a = attach_peer(&registry, 1, 8).await;
        let mut b = attach_peer(&registry, 2, 8).await;
        let mut handler = handler_for(&a, &registry);

        assert_eq!(handler.close().await, 0);
        assert!(b.drain().is_empty());
        assert_eq!(registry.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_closed_handler_ignores_state() {
        let registry = Arc::new(Registry::new());
        let a = attach_peer(&registry, 1, 8).await;
        let mut handler = handler_for(&a, &registry);

        handler.close().await;
        let delivered = handler
            .handle_payload(Bytes::from_static(PLAYER_P1))
            .await
            .unwrap();

        assert_eq!(delivered, 0);
        assert_eq!(registry.player_count().await, 0);
    }

    #[tokio::test]
    async fn test_closed_handler_forwards_nothing() {
        let registry = Arc::new(Registry::new());
        let a = attach_peer(&registry, 1, 8).await;
        let mut b = attach_peer(&registry, 2, 8).await;
        let mut handler = handler_for(&a, &registry);

        handler.close().await;
        let delivered = handler
            .handle_payload(Bytes::from_static(BULLET))
            .await
            .unwrap();

        assert_eq!(delivered, 0);
        assert!(b.drain().is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_skips_full_peer() {
        let registry = Arc::new(Registry::new());
        let sender = attach_peer(&registry, 1, 8).await;
        let mut slow = attach_peer(&registry, 2, 1).await;
        let mut fast = attach_peer(&registry, 3, 8).await;

        let first = framed(b"first");
        let second = framed(b"second");

        assert_eq!(broadcast(&registry, sender.id, first.clone()).await, 2);
        assert_eq!(broadcast(&registry, sender.id, second.clone()).await, 1);

        assert_eq!(slow.drain(), vec![first.clone()]);
        assert_eq!(fast.drain(), vec![first, second]);
    }

    #[tokio::test]
    async fn test_broadcast_skips_closed_peer() {
        let registry = Arc::new(Registry::new());
        let sender = attach_peer(&registry, 1, 8).await;
        let gone = attach_peer(&registry, 2, 8).await;
        let mut alive = attach_peer(&registry, 3, 8).await;
        drop(gone.outbound);

        let frame = framed(BULLET);
        assert_eq!(broadcast(&registry, sender.id, frame.clone()).await, 1);
        assert_eq!(alive.drain(), vec![frame]);

        let targets = registry.broadcast_targets(sender.id).await;
        let closed = targets.iter().find(|target| target.id == gone.id).unwrap();
        assert!(matches!(
            closed.send(framed(b"again")),
            Err(RelayError::PeerWriteFailure {
                reason: WriteFailure::Closed,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_fifo_per_sender() {
        let registry = Arc::new(Registry::new());
        let x = attach_peer(&registry, 1, 16).await;
        let mut y = attach_peer(&registry, 2, 16).await;
        let mut handler = handler_for(&x, &registry);

        let payloads: Vec<Vec<u8>> = (0..5)
            .map(|i| {
                Message::Bullet(ProjectileEvent {
                    x: i as f64,
                    y: 0.0,
                    dx: 1.0,
                    dy: 0.0,
                })
                .encode()
                .unwrap()
            })
            .collect();

        for payload in &payloads {
            handler
                .handle_payload(Bytes::from(payload.clone()))
                .await
                .unwrap();
        }

        let expected: Vec<Bytes> = payloads.iter().map(|p| framed(p)).collect();
        assert_eq!(y.drain(), expected);
    }

    #[tokio::test]
    async fn test_newcomer_hears_departure_after_sync() {
        let registry = Arc::new(Registry::new());
        let leaving = attach_peer(&registry, 1, 8).await;
        let mut handler = handler_for(&leaving, &registry);
        handler
            .handle_payload(Bytes::from_static(PLAYER_P1))
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let newcomer = Connection::new(ConnectionId(2), "127.0.0.1:7100".parse().unwrap(), tx);
        assert_eq!(
            registry
                .attach_and_sync(newcomer, DEFAULT_MAX_FRAME_SIZE)
                .await,
            1
        );
        handler.close().await;

        let kinds: Vec<&str> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|frame| Message::decode(&frame[4..]).unwrap().kind())
            .collect();
        assert_eq!(kinds, vec!["player", "disconnect"]);
    }

    /// Joining and leaving race each other; the newcomer must never end up
    /// with a `player` frame queued after the matching `disconnect`.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_departed_player_does_not_linger_after_join() {
        let mut lingering = 0;

        for _ in 0..2_000 {
            let registry = Arc::new(Registry::new());
            let leaving = attach_peer(&registry, 1, 8).await;
            let mut handler = handler_for(&leaving, &registry);
            handler
                .handle_payload(Bytes::from_static(PLAYER_P1))
                .await
                .unwrap();

            let (tx, mut rx) = mpsc::channel(8);
            let newcomer =
                Connection::new(ConnectionId(2), "127.0.0.1:7100".parse().unwrap(), tx);

            let join = tokio::spawn({
                let registry = Arc::clone(&registry);
                async move {
                    registry
                        .attach_and_sync(newcomer, DEFAULT_MAX_FRAME_SIZE)
                        .await
                }
            });
            let leave = tokio::spawn(async move { handler.close().await });
            join.await.unwrap();
            leave.await.unwrap();

            let last = std::iter::from_fn(|| rx.try_recv().ok()).last();
            if let Some(frame) = last {
                if matches!(Message::decode(&frame[4..]).unwrap(), Message::Player(_)) {
                    lingering += 1;
                }
            }
        }

        assert_eq!(lingering, 0);
    }

    #[tokio::test]
    async fn test_bind_reports_local_addr() {
        let config = RelayConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..RelayConfig::default()
        };

        let server = Server::bind(config).await.unwrap();
        let addr = server.local_addr().unwrap();

        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
        assert_eq!(server.registry().connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_bind_caps_frame_limit() {
        let server = Server::bind(RelayConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            max_frame_size: 1024 * 1024,
            ..RelayConfig::default()
        })
        .await
        .unwrap();

        assert_eq!(server.config().max_frame_size, DEFAULT_MAX_FRAME_SIZE);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let first = Server::bind(RelayConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..RelayConfig::default()
        })
        .await
        .unwrap();
        let taken = first.local_addr().unwrap().port();

        let result = Server::bind(RelayConfig {
            host: "127.0.0.1".to_string(),
            port: taken,
            ..RelayConfig::default()
        })
        .await;

        assert!(matches!(result, Err(RelayError::Bind { .. })));
    }
}
