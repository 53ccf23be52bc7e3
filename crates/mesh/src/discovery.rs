use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde_json::{Map, Value};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use huddle_core::{kind, Message};

use crate::cipher::XorCipher;
use crate::config::MeshConfig;
use crate::error::{MeshError, Result};
use crate::transport::Transport;

const DATAGRAM_BUF: usize = 4096;

/// Serverless peer discovery over obfuscated UDP broadcast.
///
/// Two independent loops: a broadcaster announcing this node's presence
/// every `broadcast_interval`, and a listener feeding every foreign presence
/// into the transport's roster. Both check the stop signal each iteration
/// and use bounded waits, so `stop` takes effect within one poll interval.
pub struct Discovery {
    stop: watch::Sender<bool>,
}

impl Discovery {
    /// Validate the key, bind both sockets, and start the loops. Socket or
    /// key problems abort startup synchronously.
    pub async fn start(transport: Transport, config: &MeshConfig) -> Result<Discovery> {
        let cipher = XorCipher::new(&config.obfuscation_key)?;

        let listener = bind_listener(config.discovery_port)?;
        let announcer = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        announcer.set_broadcast(true)?;

        let target = config.broadcast_target.unwrap_or_else(|| {
            SocketAddr::new(subnet_broadcast(transport.ip()), config.discovery_port)
        });

        let (stop_tx, stop_rx) = watch::channel(false);

        info!(%target, port = config.discovery_port, "discovery started");
        tokio::spawn(announce_loop(
            transport.clone(),
            announcer,
            cipher.clone(),
            target,
            config.broadcast_interval,
            stop_rx.clone(),
        ));
        tokio::spawn(listen_loop(
            transport,
            listener,
            cipher,
            config.poll_timeout,
            stop_rx,
        ));

        Ok(Discovery { stop: stop_tx })
    }

    /// Stop both loops. Idempotent.
    pub fn stop(&self) {
        if !self.stop.send_replace(true) {
            info!("discovery stopping");
        }
    }
}

/// Listener socket on the well-known discovery port. `SO_REUSEADDR` lets a
/// restarted node rebind without waiting out the old socket.
fn bind_listener(port: u16) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| MeshError::Discovery(e.to_string()))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| MeshError::Discovery(e.to_string()))?;
    socket
        .set_broadcast(true)
        .map_err(|e| MeshError::Discovery(e.to_string()))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| MeshError::Discovery(e.to_string()))?;
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    socket
        .bind(&addr.into())
        .map_err(|e| MeshError::Discovery(format!("bind {addr}: {e}")))?;
    let socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(socket)?)
}

/// Directed broadcast address for the local /24. Networks cut differently
/// can override via `broadcast_target`.
fn subnet_broadcast(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, c, _] = v4.octets();
            IpAddr::V4(Ipv4Addr::new(a, b, c, 255))
        }
        IpAddr::V6(_) => IpAddr::V4(Ipv4Addr::BROADCAST),
    }
}

fn presence_message(transport: &Transport) -> Message {
    let mut data = Map::new();
    data.insert("ip".into(), Value::from(transport.ip().to_string()));
    data.insert("port".into(), Value::from(transport.port()));
    if let Some(ready) = transport.ready() {
        data.insert("ready".into(), Value::from(ready));
    }
    Message::new(transport.id(), kind::PRESENCE, data)
}

async fn announce_loop(
    transport: Transport,
    socket: UdpSocket,
    cipher: XorCipher,
    target: SocketAddr,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = ticker.tick() => {
                let payload = cipher.apply(presence_message(&transport).encode().as_bytes());
                match socket.send_to(&payload, target).await {
                    Ok(_) => debug!(%target, "presence announced"),
                    Err(e) => warn!(%target, "presence broadcast failed: {e}"),
                }
            }
        }
    }
    debug!("announcer stopped");
}

async fn listen_loop(
    transport: Transport,
    socket: UdpSocket,
    cipher: XorCipher,
    poll: Duration,
    stop: watch::Receiver<bool>,
) {
    let mut buf = [0u8; DATAGRAM_BUF];
    while !*stop.borrow() {
        match tokio::time::timeout(poll, socket.recv_from(&mut buf)).await {
            // Bounded wait expired; loop around and re-check the stop flag.
            Err(_) => continue,
            Ok(Err(e)) => warn!("discovery recv failed: {e}"),
            Ok(Ok((len, src))) => {
                handle_datagram(&transport, &cipher, &buf[..len], src).await;
            }
        }
    }
    debug!("listener stopped");
}

async fn handle_datagram(transport: &Transport, cipher: &XorCipher, datagram: &[u8], src: SocketAddr) {
    let clear = cipher.apply(datagram);
    let Ok(text) = std::str::from_utf8(&clear) else {
        debug!(%src, "datagram did not deobfuscate to text, likely a key mismatch");
        return;
    };
    let Some(message) = Message::decode(text) else {
        debug!(%src, "datagram is not a valid envelope");
        return;
    };
    if message.kind != kind::PRESENCE {
        debug!(%src, kind = %message.kind, "unexpected discovery kind");
        return;
    }
    if message.sender == transport.id() {
        return;
    }
    let Some(ip) = message
        .data
        .get("ip")
        .and_then(Value::as_str)
        .and_then(|raw| raw.parse::<IpAddr>().ok())
    else {
        debug!(%src, "presence without usable ip");
        return;
    };
    let Some(port) = message
        .data
        .get("port")
        .and_then(Value::as_u64)
        .and_then(|raw| u16::try_from(raw).ok())
    else {
        debug!(%src, "presence without usable port");
        return;
    };
    let ready = message.data.get("ready").and_then(Value::as_bool);
    if transport.admit(ip, port, message.sender, ready).await {
        info!(peer = %message.sender, %ip, port, "peer discovered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subnet_broadcast_is_last_octet_255() {
        let ip = IpAddr::V4(Ipv4Addr::new(192, 168, 4, 17));
        assert_eq!(
            subnet_broadcast(ip),
            IpAddr::V4(Ipv4Addr::new(192, 168, 4, 255))
        );
    }

    #[test]
    fn test_bad_key_aborts_before_any_socket_work() {
        let cipher = XorCipher::new(b"way too long to be a discovery key");
        assert!(cipher.is_err());
    }
}
