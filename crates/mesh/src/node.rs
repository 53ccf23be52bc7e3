use std::net::IpAddr;

use serde_json::Map;
use tracing::info;

use huddle_core::{Message, PeerId};

use crate::config::MeshConfig;
use crate::discovery::Discovery;
use crate::election::LeaderElection;
use crate::error::Result;
use crate::roster::PeerEntry;
use crate::telemetry::Telemetry;
use crate::transport::{MessageHandler, Transport};

/// A complete mesh participant: transport, discovery, and leader election
/// wired together.
///
/// Construction is all-or-nothing; a failure at any stage tears down what
/// was already started and surfaces the error, so no half-initialized node
/// escapes. Shutdown is cooperative and idempotent.
pub struct MeshNode {
    transport: Transport,
    discovery: Discovery,
    election: LeaderElection,
}

impl MeshNode {
    pub async fn spawn(
        config: MeshConfig,
        handler: MessageHandler,
        telemetry: Telemetry,
    ) -> Result<MeshNode> {
        let (transport, control_rx) = Transport::bind(&config, handler, telemetry).await?;
        let election = LeaderElection::spawn(transport.clone(), control_rx, &config);
        let discovery = match Discovery::start(transport.clone(), &config).await {
            Ok(discovery) => discovery,
            Err(e) => {
                transport.shutdown();
                return Err(e);
            }
        };
        info!(id = %transport.id(), ip = %transport.ip(), port = transport.port(), "mesh node online");
        Ok(MeshNode {
            transport,
            discovery,
            election,
        })
    }

    pub fn id(&self) -> PeerId {
        self.transport.id()
    }

    pub fn ip(&self) -> IpAddr {
        self.transport.ip()
    }

    pub fn port(&self) -> u16 {
        self.transport.port()
    }

    pub fn peers(&self) -> Vec<PeerEntry> {
        self.transport.roster().snapshot()
    }

    pub fn leader_id(&self) -> Option<PeerId> {
        self.election.leader_id()
    }

    pub fn is_leader(&self) -> bool {
        self.election.is_leader()
    }

    pub fn election_in_progress(&self) -> bool {
        self.election.in_progress()
    }

    /// Mark this node ready (or not); carried on subsequent presence
    /// announcements.
    pub fn set_ready(&self, ready: bool) {
        self.transport.set_ready(ready);
    }

    /// Publish an application message to every peer. The envelope is
    /// stamped with this node's identity.
    pub fn send_public(&self, kind: &str, data: Map<String, serde_json::Value>) {
        self.transport
            .send_public(Message::new(self.id(), kind, data));
    }

    /// Publish an application message only the addressed peer will see.
    pub fn send_private(&self, target: PeerId, kind: &str, data: Map<String, serde_json::Value>) {
        self.transport
            .send_private(target, Message::new(self.id(), kind, data));
    }

    /// Manually register a peer, bypassing discovery.
    pub async fn add_peer(&self, ip: IpAddr, port: u16, peer_id: PeerId) {
        self.transport.add_peer(ip, port, peer_id).await;
    }

    /// Stop discovery, then the transport. All loops observe the signal
    /// within one poll interval. Safe to call more than once.
    pub fn shutdown(&self) {
        self.discovery.stop();
        self.transport.shutdown();
    }
}
