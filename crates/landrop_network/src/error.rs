//! Network error types.

use std::path::PathBuf;
use std::time::Duration;

use crate::record::TransferStatus;

/// Errors produced while encoding, decoding or framing an [`Envelope`](crate::Envelope).
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The input ended before the declared number of bytes was available.
    #[error("Truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// The length prefix announced a frame larger than the accepted maximum.
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(u32),

    /// The bytes were not a valid JSON envelope.
    #[error("Malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The envelope payload did not match the expected record.
    #[error("Unexpected payload: {0}")]
    Payload(String),

    /// The underlying stream failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur in the landrop_network crate.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// A transport-level error (connect/send/receive).
    #[error("Transport error: {0}")]
    Transport(String),

    /// No port in the fallback scan could be bound.
    #[error("No available {protocol} port (tried {first}..={last} and an ephemeral port)")]
    PortExhausted {
        protocol: &'static str,
        first: u16,
        last: u16,
    },

    /// The file to send does not exist or is not a regular file.
    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// The file to send exceeds the configured ceiling.
    #[error("File too large: {size} bytes (maximum {max} bytes)")]
    FileTooLarge { size: u64, max: u64 },

    /// A transfer with this id is already pending or active.
    #[error("Duplicate transfer id: {0}")]
    DuplicateTransfer(String),

    /// No pending request or active transfer has this id.
    #[error("Unknown transfer: {0}")]
    UnknownTransfer(String),

    /// A status change that would move a transfer backwards.
    #[error("Invalid transfer transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: TransferStatus,
        to: TransferStatus,
    },

    /// Wire encoding or framing failed.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// An operation timed out.
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// The engine is not running.
    #[error("Engine not running")]
    NotRunning,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
