use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use huddle_core::{Control, Message, PeerId};

use crate::config::MeshConfig;
use crate::error::{MeshError, Result};
use crate::roster::{PeerEntry, Roster};
use crate::telemetry::{NetEvent, Telemetry};

/// Topic every peer subscribes to at startup.
pub const PUBLIC_TOPIC: &str = "public";

/// Topic only the addressed peer's subscription matches.
pub fn private_topic(id: PeerId) -> String {
    format!("private:{id}")
}

/// Callback invoked for every non-control message that reaches this node.
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// Receiving end of the election control queue, drained by a single
/// consumer so handlers never run concurrently.
pub type ControlReceiver = mpsc::UnboundedReceiver<Control>;

const PORT_ATTEMPTS: usize = 32;
const FRAME_FANOUT_CAPACITY: usize = 256;

struct Shared {
    id: PeerId,
    ip: IpAddr,
    port: u16,
    roster: Roster,
    ready: Mutex<Option<bool>>,
    frames: broadcast::Sender<String>,
    inbound: mpsc::UnboundedSender<String>,
    control: mpsc::UnboundedSender<Control>,
    handler: MessageHandler,
    telemetry: Telemetry,
    stop: watch::Sender<bool>,
}

/// Sole owner of network identity, roster, and pub/sub sockets.
///
/// Publisher side: a TCP listener where every accepted connection is a
/// subscriber fed all published frames. Subscriber side: one outbound
/// connection per rostered peer, filtered by topic on receipt. All loops are
/// tokio tasks wired by channels and stopped cooperatively through a watch
/// signal. Each instance owns its whole context, so any number of transports
/// can coexist in one process.
#[derive(Clone)]
pub struct Transport {
    shared: Arc<Shared>,
}

impl Transport {
    /// Bind the publisher socket, resolve identity, and start the accept and
    /// routing loops. Fails synchronously when no port can be bound; no
    /// half-initialized transport is ever returned.
    pub async fn bind(
        config: &MeshConfig,
        handler: MessageHandler,
        telemetry: Telemetry,
    ) -> Result<(Transport, ControlReceiver)> {
        let listener = match config.bind_port {
            Some(port) => TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
                .await
                .map_err(|source| MeshError::Bind { port, source })?,
            None => bind_in_range(config).await?,
        };
        let port = listener.local_addr()?.port();

        let ip = match config.bind_ip {
            Some(ip) => ip,
            None => probe_local_ip(config.probe_addr)
                .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        };

        let id = PeerId::generate();
        let (frames, _) = broadcast::channel(FRAME_FANOUT_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (stop_tx, _) = watch::channel(false);

        let transport = Transport {
            shared: Arc::new(Shared {
                id,
                ip,
                port,
                roster: Roster::new(),
                ready: Mutex::new(None),
                frames,
                inbound: inbound_tx,
                control: control_tx,
                handler,
                telemetry,
                stop: stop_tx,
            }),
        };

        info!(id = %id, %ip, port, "transport online");
        tokio::spawn(accept_loop(
            listener,
            transport.shared.frames.clone(),
            transport.stop_signal(),
        ));
        tokio::spawn(route_loop(transport.clone(), inbound_rx));

        Ok((transport, control_rx))
    }

    pub fn id(&self) -> PeerId {
        self.shared.id
    }

    pub fn ip(&self) -> IpAddr {
        self.shared.ip
    }

    pub fn port(&self) -> u16 {
        self.shared.port
    }

    pub fn roster(&self) -> &Roster {
        &self.shared.roster
    }

    pub fn ready(&self) -> Option<bool> {
        *self.shared.ready.lock()
    }

    pub fn set_ready(&self, ready: bool) {
        *self.shared.ready.lock() = Some(ready);
    }

    pub(crate) fn stop_signal(&self) -> watch::Receiver<bool> {
        self.shared.stop.subscribe()
    }

    /// Register a remote peer and open a subscription to its publisher.
    /// A no-op for our own address and for already-known addresses.
    pub async fn add_peer(&self, ip: IpAddr, port: u16, peer_id: PeerId) {
        self.admit(ip, port, peer_id, None).await;
    }

    pub(crate) async fn admit(
        &self,
        ip: IpAddr,
        port: u16,
        peer_id: PeerId,
        ready: Option<bool>,
    ) -> bool {
        if ip == self.shared.ip && port == self.shared.port {
            return false;
        }
        let addr = SocketAddr::new(ip, port);
        let entry = PeerEntry {
            addr,
            id: peer_id,
            ready,
        };
        if !self.shared.roster.insert(entry) {
            debug!(%addr, "peer already known");
            return false;
        }
        info!(peer = %peer_id, %addr, "subscribing to peer");
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                tokio::spawn(subscription_reader(
                    stream,
                    self.shared.inbound.clone(),
                    self.stop_signal(),
                ));
            }
            // Entry stays: membership is not tied to reachability.
            Err(e) => warn!(%addr, "subscription connect failed: {e}"),
        }
        true
    }

    /// Publish to every subscriber. Fire-and-forget.
    pub fn send_public(&self, message: Message) {
        self.publish(PUBLIC_TOPIC, message);
    }

    /// Publish on the target's private topic; only the addressed peer's
    /// subscription filter matches.
    pub fn send_private(&self, target: PeerId, message: Message) {
        self.publish(&private_topic(target), message);
    }

    fn publish(&self, topic: &str, mut message: Message) {
        message.stamp_sent();
        self.shared.telemetry.record(&NetEvent::Sent(message.clone()));
        let frame = format!("{topic} {}", message.encode());
        if self.shared.frames.send(frame).is_err() {
            debug!(topic, "no subscribers connected, frame dropped");
        }
    }

    /// Stop every loop and let the sockets close. Idempotent.
    pub fn shutdown(&self) {
        if !self.shared.stop.send_replace(true) {
            info!(id = %self.shared.id, "transport shutting down");
        }
    }
}

async fn bind_in_range(config: &MeshConfig) -> Result<TcpListener> {
    for _ in 0..PORT_ATTEMPTS {
        let candidate = {
            let mut rng = rand::thread_rng();
            rng.gen_range(config.port_range.clone())
        };
        if let Ok(listener) = TcpListener::bind((Ipv4Addr::UNSPECIFIED, candidate)).await {
            return Ok(listener);
        }
    }
    Err(MeshError::NoPortAvailable(
        *config.port_range.start(),
        *config.port_range.end(),
    ))
}

/// Local address of a throwaway UDP socket pointed at a well-known external
/// host; connect() sends nothing, it only fixes the outbound route.
fn probe_local_ip(probe: SocketAddr) -> Option<IpAddr> {
    let socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect(probe).ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

/// Accept subscribers and hand each a forwarder draining the frame fan-out.
async fn accept_loop(
    listener: TcpListener,
    frames: broadcast::Sender<String>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!(%addr, "subscriber connected");
                    tokio::spawn(subscriber_writer(stream, frames.subscribe(), stop.clone()));
                }
                Err(e) => warn!("accept failed: {e}"),
            },
        }
    }
}

async fn subscriber_writer(
    mut stream: TcpStream,
    mut frames: broadcast::Receiver<String>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            frame = frames.recv() => match frame {
                Ok(line) => {
                    if stream.write_all(line.as_bytes()).await.is_err()
                        || stream.write_all(b"\n").await.is_err()
                    {
                        debug!("subscriber went away");
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "slow subscriber, frames dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

/// Read newline-delimited frames from one subscription into the shared
/// inbound queue. Ends quietly when the remote closes; the roster entry
/// outlives the connection.
async fn subscription_reader(
    stream: TcpStream,
    inbound: mpsc::UnboundedSender<String>,
    mut stop: watch::Receiver<bool>,
) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if inbound.send(line).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!("subscription closed by remote");
                    break;
                }
                Err(e) => {
                    warn!("subscription read failed: {e}");
                    break;
                }
            },
        }
    }
}

/// The receive loop: splits topic from payload, decodes the envelope, and
/// routes control kinds to the election queue and everything else to the
/// application handler. A bad frame is dropped, never fatal.
async fn route_loop(transport: Transport, mut inbound: mpsc::UnboundedReceiver<String>) {
    let own_private = private_topic(transport.id());
    let mut stop = transport.stop_signal();
    loop {
        let line = tokio::select! {
            _ = stop.changed() => break,
            line = inbound.recv() => match line {
                Some(line) => line,
                None => break,
            },
        };
        route_frame(&transport, &own_private, &line);
    }
}

fn route_frame(transport: &Transport, own_private: &str, line: &str) {
    let Some((topic, payload)) = line.split_once(' ') else {
        warn!("frame without topic separator, dropped");
        return;
    };
    if topic != PUBLIC_TOPIC && topic != own_private {
        // Some other peer's private traffic; the filter is ours to apply.
        return;
    }
    let Some(mut message) = Message::decode(payload) else {
        warn!(topic, "undecodable payload, dropped");
        return;
    };
    message.stamp_received();
    transport
        .shared
        .telemetry
        .record(&NetEvent::Received(message.clone()));
    match Control::classify(message) {
        Control::App(message) => (transport.shared.handler)(message),
        control => {
            if transport.shared.control.send(control).is_err() {
                debug!("election queue gone, control frame dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use std::time::Duration;

    fn test_config() -> MeshConfig {
        MeshConfig {
            bind_ip: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            port_range: 42000..=42999,
            ..MeshConfig::default()
        }
    }

    fn noop_handler() -> MessageHandler {
        Arc::new(|_| {})
    }

    async fn bind_test_transport() -> (Transport, ControlReceiver) {
        Transport::bind(&test_config(), noop_handler(), Telemetry::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_add_peer_is_idempotent() {
        let (transport, _control) = bind_test_transport().await;
        let peer = PeerId::generate();
        let ip = IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3));
        transport.add_peer(ip, 5005, peer).await;
        assert_eq!(transport.roster().len(), 1);
        transport.add_peer(ip, 5005, peer).await;
        assert_eq!(transport.roster().len(), 1);
        transport.shutdown();
    }

    #[tokio::test]
    async fn test_add_peer_excludes_self() {
        let (transport, _control) = bind_test_transport().await;
        transport
            .add_peer(transport.ip(), transport.port(), PeerId::generate())
            .await;
        assert!(transport.roster().is_empty());
        transport.shutdown();
    }

    #[tokio::test]
    async fn test_port_is_taken_from_configured_range() {
        let (transport, _control) = bind_test_transport().await;
        assert!((42000..=42999).contains(&transport.port()));
        transport.shutdown();
    }

    #[tokio::test]
    async fn test_explicit_port_conflict_is_fatal() {
        let mut config = test_config();
        let (transport, _control) = bind_test_transport().await;
        config.bind_port = Some(transport.port());
        let result = Transport::bind(&config, noop_handler(), Telemetry::default()).await;
        assert!(matches!(result, Err(MeshError::Bind { .. })));
        transport.shutdown();
    }

    #[tokio::test]
    async fn test_frames_flow_between_wired_transports() {
        let (alice, _alice_control) = bind_test_transport().await;
        let (received_tx, mut received_rx) = mpsc::unbounded_channel();
        let handler: MessageHandler = Arc::new(move |message| {
            let _ = received_tx.send(message);
        });
        let (bob, _bob_control) =
            Transport::bind(&test_config(), handler, Telemetry::default())
                .await
                .unwrap();

        // Bob subscribes to Alice's publisher.
        bob.add_peer(alice.ip(), alice.port(), alice.id()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut data = Map::new();
        data.insert("tick".into(), 7.into());
        alice.send_public(Message::new(alice.id(), "state", data));

        let delivered = tokio::time::timeout(Duration::from_secs(2), received_rx.recv())
            .await
            .expect("public frame should arrive")
            .unwrap();
        assert_eq!(delivered.kind, "state");
        assert_eq!(delivered.sender, alice.id());
        assert!(delivered.received_at_ms.is_some());

        alice.shutdown();
        bob.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (transport, _control) = bind_test_transport().await;
        transport.shutdown();
        transport.shutdown();
    }
}
