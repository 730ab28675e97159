//! Wire message: the envelope shared by discovery and transfer traffic.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::identity::{LocalIdentity, PeerId};
use crate::record::TransferStatus;

/// The kind of message carried in an [`Envelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Presence announcement sent on start and refresh.
    Discovery,
    /// Periodic presence broadcast, also the direct reply to a Discovery.
    Heartbeat,
    /// Offer to send a file.
    TransferRequest,
    /// Accept or reject answer to a TransferRequest.
    TransferResponse,
    /// Receiver-side outcome report after the byte stream.
    TransferStatus,
}

/// A network message envelope carrying a typed payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Unique message identifier (UUID v4).
    pub message_id: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub sender_id: PeerId,
    pub sender_name: String,
    /// Address the sender believes it is reachable on.
    pub sender_address: String,
    /// TCP port the sender accepts transfers on.
    pub sender_port: u16,
    pub timestamp: DateTime<Utc>,
    /// Kind-specific record, `null` for presence messages.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Envelope {
    /// Create an envelope stamped with the sender's identity and the current time.
    pub fn new(
        sender: &LocalIdentity,
        sender_port: u16,
        kind: MessageKind,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            kind,
            sender_id: sender.id.clone(),
            sender_name: sender.name.clone(),
            sender_address: sender.address.to_string(),
            sender_port,
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Presence envelope (Discovery or Heartbeat) without payload.
    pub fn presence(sender: &LocalIdentity, sender_port: u16, kind: MessageKind) -> Self {
        Self::new(sender, sender_port, kind, serde_json::Value::Null)
    }

    /// Create an envelope carrying a typed payload record.
    pub fn with_payload<T: Serialize>(
        sender: &LocalIdentity,
        sender_port: u16,
        kind: MessageKind,
        payload: &T,
    ) -> Self {
        // Payload records only contain strings, numbers and booleans.
        let value = serde_json::to_value(payload).unwrap_or_default();
        Self::new(sender, sender_port, kind, value)
    }

    /// Interpret the payload as `T`, checking the envelope kind first.
    pub fn payload_as<T: DeserializeOwned>(&self, expected: MessageKind) -> Result<T, CodecError> {
        if self.kind != expected {
            return Err(CodecError::Payload(format!(
                "expected {expected:?} envelope, got {:?}",
                self.kind
            )));
        }
        serde_json::from_value(self.payload.clone())
            .map_err(|e| CodecError::Payload(format!("{expected:?} payload: {e}")))
    }
}

/// Payload of a [`MessageKind::TransferRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequestPayload {
    pub transfer_id: String,
    pub file_name: String,
    pub file_size: u64,
    /// Uppercase hex SHA-256 of the whole file.
    pub file_hash: String,
}

/// Payload of a [`MessageKind::TransferResponse`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferResponsePayload {
    pub transfer_id: String,
    pub accepted: bool,
    #[serde(default)]
    pub reject_reason: String,
    pub listen_port: u16,
}

/// Payload of a [`MessageKind::TransferStatus`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferStatusPayload {
    pub transfer_id: String,
    pub status: TransferStatus,
    pub bytes_transferred: u64,
    #[serde(default)]
    pub error_message: String,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
