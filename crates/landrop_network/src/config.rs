//! Configuration for the discovery and transfer engines.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default UDP port for presence announcements.
pub const DEFAULT_DISCOVERY_PORT: u16 = 35731;

/// Default TCP port for file transfers.
pub const DEFAULT_TRANSFER_PORT: u16 = 35732;

/// Top-level configuration, persisted as JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DropConfig {
    pub discovery: DiscoveryConfig,
    pub transfer: TransferConfig,
}

/// Settings for the UDP discovery engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Local address the UDP socket binds to.
    pub bind_addr: IpAddr,

    /// Preferred UDP port. Also the first port of the broadcast window.
    pub port: u16,

    /// How many consecutive ports (starting at `port`) to try before falling
    /// back to an ephemeral port.
    pub port_scan_attempts: u16,

    /// Number of consecutive ports each announcement is sent to, so peers that
    /// fell back to an alternate port are still reached.
    pub port_window: u16,

    /// Interval between heartbeat broadcasts.
    #[serde(with = "duration_millis")]
    pub heartbeat_interval: Duration,

    /// A peer not heard from for this long is evicted.
    #[serde(with = "duration_millis")]
    pub peer_timeout: Duration,

    /// Interval of the eviction sweep.
    #[serde(with = "duration_millis")]
    pub sweep_interval: Duration,

    /// Number of Discovery announcements sent on start and on refresh.
    pub announce_repeats: u32,

    /// Delay between repeated announcements.
    #[serde(with = "duration_millis")]
    pub announce_delay: Duration,

    /// Send to the global and per-interface broadcast addresses.
    pub use_broadcast: bool,

    /// Extra unicast targets that receive every announcement.
    pub static_targets: Vec<IpAddr>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_DISCOVERY_PORT,
            port_scan_attempts: 10,
            port_window: 10,
            heartbeat_interval: Duration::from_millis(3_000),
            peer_timeout: Duration::from_millis(12_000),
            sweep_interval: Duration::from_millis(12_000),
            announce_repeats: 3,
            announce_delay: Duration::from_millis(500),
            use_broadcast: true,
            static_targets: Vec::new(),
        }
    }
}

/// Settings for the TCP transfer engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Local address the TCP listener binds to.
    pub bind_addr: IpAddr,

    /// Preferred TCP port.
    pub port: u16,

    /// How many consecutive ports to try before an ephemeral one.
    pub port_scan_attempts: u16,

    /// Size of each streamed chunk in bytes.
    pub chunk_size: usize,

    /// Largest file that may be sent or accepted.
    pub max_file_size: u64,

    /// Timeout for establishing an outbound connection.
    #[serde(with = "duration_millis")]
    pub connect_timeout: Duration,

    /// Reject an inbound request if no decision arrives within this time.
    /// `None` waits indefinitely.
    #[serde(with = "option_duration_millis")]
    pub decision_timeout: Option<Duration>,

    /// Directory received files are written to unless a decision overrides it.
    pub download_dir: PathBuf,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_TRANSFER_PORT,
            port_scan_attempts: 10,
            chunk_size: 64 * 1024,
            max_file_size: 10 * 1024 * 1024 * 1024,
            connect_timeout: Duration::from_secs(10),
            decision_timeout: None,
            download_dir: default_download_dir(),
        }
    }
}

/// `~/Downloads/LanDrop`, or `./LanDrop Downloads` when no home is known.
pub fn default_download_dir() -> PathBuf {
    dirs::download_dir()
        .or_else(dirs::home_dir)
        .map(|d| d.join("LanDrop"))
        .unwrap_or_else(|| PathBuf::from("LanDrop Downloads"))
}

impl DropConfig {
    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create directory: {e}"))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {e}"))?;
        std::fs::write(path, json).map_err(|e| format!("Failed to write config file: {e}"))
    }

    /// Load config from a JSON file, or return defaults if the file is missing.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<DropConfig>(&data) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Corrupt config file, using defaults: {e}");
                    }
                },
                Err(e) => {
                    tracing::warn!("Cannot read config file, using defaults: {e}");
                }
            }
        }
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match dur {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let millis = Option::<u64>::deserialize(d)?;
        Ok(millis.map(Duration::from_millis))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
