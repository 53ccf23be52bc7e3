use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;

use huddle_core::PeerId;

/// A known remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    pub addr: SocketAddr,
    pub id: PeerId,
    /// Lobby readiness carried on the peer's first presence announcement.
    pub ready: Option<bool>,
}

/// Append-only set of known peers, keyed by address.
///
/// Entries live for the process lifetime; there is deliberately no removal
/// path. Iteration always goes through `snapshot` so concurrent insertion
/// from the discovery listener can never invalidate a walker.
#[derive(Clone, Default)]
pub struct Roster {
    peers: Arc<RwLock<HashMap<SocketAddr, PeerEntry>>>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a newly seen peer. Returns `false` and leaves the existing
    /// entry untouched when the address is already known.
    pub fn insert(&self, entry: PeerEntry) -> bool {
        let mut peers = self.peers.write();
        match peers.entry(entry.addr) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(entry);
                true
            }
        }
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.peers.read().contains_key(addr)
    }

    pub fn find(&self, id: PeerId) -> Option<PeerEntry> {
        self.peers.read().values().find(|p| p.id == id).cloned()
    }

    pub fn snapshot(&self) -> Vec<PeerEntry> {
        self.peers.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }
}
