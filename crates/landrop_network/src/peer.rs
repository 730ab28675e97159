//! Peer registry of devices seen on the LAN and their liveness.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};

use crate::identity::PeerId;
use crate::record::PeerEndpoint;

/// Information about a remote device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Stable, self-asserted device id. The registry key.
    pub id: PeerId,
    pub name: String,
    pub address: IpAddr,
    /// TCP port the peer accepts transfers on.
    pub port: u16,
    pub last_seen: DateTime<Utc>,
    pub online: bool,
}

impl PeerRecord {
    /// Where to connect to send this peer a file.
    pub fn transfer_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// Endpoint description for the transfer engine.
    pub fn endpoint(&self) -> PeerEndpoint {
        PeerEndpoint {
            id: Some(self.id.clone()),
            name: self.name.clone(),
            address: self.transfer_addr(),
        }
    }
}

/// Result of recording a sighting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sighting {
    /// The peer was not in the registry.
    New,
    /// An existing record was refreshed in place.
    Known,
}

/// Concurrent registry of known peers keyed by id.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: DashMap<PeerId, PeerRecord>,
}

impl PeerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert the peer or refresh name, address, port and liveness in place.
    pub fn upsert(
        &self,
        id: &PeerId,
        name: &str,
        address: IpAddr,
        port: u16,
        now: DateTime<Utc>,
    ) -> (Sighting, PeerRecord) {
        match self.peers.entry(id.clone()) {
            Entry::Occupied(mut slot) => {
                let peer = slot.get_mut();
                peer.name = name.to_string();
                peer.address = address;
                peer.port = port;
                peer.last_seen = now;
                peer.online = true;
                (Sighting::Known, peer.clone())
            }
            Entry::Vacant(slot) => {
                let peer = PeerRecord {
                    id: id.clone(),
                    name: name.to_string(),
                    address,
                    port,
                    last_seen: now,
                    online: true,
                };
                slot.insert(peer.clone());
                (Sighting::New, peer)
            }
        }
    }

    /// Remove every peer not seen within `timeout` of `now`.
    ///
    /// Each evicted record is returned exactly once, marked offline, even when
    /// sweeps race each other.
    pub fn evict_stale(&self, timeout: Duration, now: DateTime<Utc>) -> Vec<PeerRecord> {
        let Ok(timeout) = chrono::Duration::from_std(timeout) else {
            return Vec::new();
        };
        let cutoff = now - timeout;

        let stale: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|p| p.last_seen < cutoff)
            .map(|p| p.key().clone())
            .collect();

        stale
            .into_iter()
            .filter_map(|id| self.peers.remove_if(&id, |_, p| p.last_seen < cutoff))
            .map(|(_, mut peer)| {
                peer.online = false;
                peer
            })
            .collect()
    }

    pub fn get(&self, id: &PeerId) -> Option<PeerRecord> {
        self.peers.get(id).map(|p| p.clone())
    }

    pub fn remove(&self, id: &PeerId) -> Option<PeerRecord> {
        self.peers.remove(id).map(|(_, p)| p)
    }

    /// Snapshot of all known peers.
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.peers.iter().map(|p| p.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn clear(&self) {
        self.peers.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
