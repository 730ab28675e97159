//! LanDrop Network: LAN device discovery and direct file transfer.
//!
//! Two independent engines share one wire format:
//!
//! - **Discovery**: UDP presence broadcasts (Discovery on start and refresh,
//!   periodic Heartbeats) with a peer registry that evicts silent devices.
//! - **Transfer**: one TCP connection per file. A framed request/response
//!   negotiates the transfer, raw chunks carry the bytes, and the receiver
//!   reports the verified SHA-256 outcome.
//!
//! Both engines publish events on `tokio::sync::broadcast` channels. The
//! application wires them together by handing a [`PeerRecord`] from discovery
//! to [`TransferEngine::send_file`].
//!
//! # Quick start
//!
//! ```rust,no_run
//! use landrop_network::{DiscoveryEngine, DropConfig, LocalIdentity, TransferEngine};
//!
//! # async fn example() -> Result<(), landrop_network::NetworkError> {
//! let identity = LocalIdentity::generate("my-laptop");
//! let config = DropConfig::default();
//!
//! let transfers = TransferEngine::new(identity.clone(), config.transfer);
//! let tcp_port = transfers.start().await?;
//!
//! let discovery = DiscoveryEngine::new(identity, config.discovery);
//! discovery.start("my-laptop", tcp_port).await?;
//!
//! for peer in discovery.peers() {
//!     let record = transfers.send_file("notes.txt", peer.endpoint()).await?;
//!     println!("{} -> {:?}", peer.name, record.status);
//! }
//!
//! discovery.stop();
//! transfers.stop();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod discovery;
pub mod error;
pub mod hash;
pub mod identity;
pub mod message;
pub mod net;
pub mod peer;
pub mod record;
pub mod transfer;
pub mod wire;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use config::{DiscoveryConfig, DropConfig, TransferConfig};
pub use discovery::{DiscoveryEngine, DiscoveryEvent, EngineState};
pub use error::{CodecError, NetworkError};
pub use identity::{LocalIdentity, PeerId};
pub use message::{Envelope, MessageKind};
pub use peer::{PeerRecord, PeerRegistry};
pub use record::{PeerEndpoint, TransferDirection, TransferRecord, TransferStatus};
pub use transfer::{IncomingTransfer, TransferEngine, TransferEvent};
