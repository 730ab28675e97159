//! Local device identity: stable id, display name and reachable address.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use serde::{Deserialize, Serialize};

/// A unique identifier for a device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    /// Generate a new random peer ID (UUID v4).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Create a PeerId from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Return the inner string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, for log lines.
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The identity this process announces on the network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalIdentity {
    /// Unique device identifier.
    pub id: PeerId,
    /// Human-readable device name.
    pub name: String,
    /// Address peers should use to reach this device.
    pub address: IpAddr,
}

impl LocalIdentity {
    /// Create an identity with a fresh id and the detected LAN address.
    pub fn generate(name: impl Into<String>) -> Self {
        Self::new(PeerId::generate(), name, detect_local_address())
    }

    pub fn new(id: PeerId, name: impl Into<String>, address: IpAddr) -> Self {
        Self {
            id,
            name: name.into(),
            address,
        }
    }

    /// Save the identity to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create directory: {e}"))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize identity: {e}"))?;
        std::fs::write(path, json).map_err(|e| format!("Failed to write identity file: {e}"))
    }

    /// Load the persisted device id, or generate and persist a new identity.
    ///
    /// The name always comes from `name` and the address is re-detected, since
    /// both may change between runs while the id must not.
    pub fn load_or_generate(path: &Path, name: impl Into<String>) -> Self {
        let name = name.into();
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<LocalIdentity>(&data) {
                    Ok(stored) => return Self::new(stored.id, name, detect_local_address()),
                    Err(e) => {
                        tracing::warn!("Corrupt identity file, generating new: {e}");
                    }
                },
                Err(e) => {
                    tracing::warn!("Cannot read identity file, generating new: {e}");
                }
            }
        }

        let identity = Self::generate(name);
        if let Err(e) = identity.save_to_file(path) {
            tracing::warn!("Failed to persist new identity: {e}");
        }
        identity
    }
}

/// Pick the IPv4 address peers are most likely to reach us on.
///
/// Private-range addresses win over other non-loopback ones; loopback is the
/// last resort.
pub fn detect_local_address() -> IpAddr {
    let candidates: Vec<Ipv4Addr> = match if_addrs::get_if_addrs() {
        Ok(ifaces) => ifaces
            .into_iter()
            .filter(|iface| !iface.is_loopback())
            .filter_map(|iface| match iface.ip() {
                IpAddr::V4(v4) if !v4.is_loopback() && !v4.is_unspecified() => Some(v4),
                _ => None,
            })
            .collect(),
        Err(e) => {
            tracing::debug!("Interface enumeration failed: {e}");
            Vec::new()
        }
    };

    pick_preferred(&candidates)
        .map(IpAddr::V4)
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

fn pick_preferred(candidates: &[Ipv4Addr]) -> Option<Ipv4Addr> {
    candidates
        .iter()
        .find(|a| a.is_private())
        .or_else(|| candidates.first())
        .copied()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
