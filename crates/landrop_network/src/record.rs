//! Transfer records and the registry of active transfers.

use std::net::SocketAddr;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};

use crate::error::NetworkError;
use crate::identity::PeerId;

/// Lifecycle of a transfer. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TransferStatus {
    /// Completed, Failed and Cancelled are final.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::InProgress => 1,
            Self::Completed | Self::Failed | Self::Cancelled => 2,
        }
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(self, next: TransferStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Sending,
    Receiving,
}

/// The remote side of a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEndpoint {
    /// Self-asserted device id, when known.
    pub id: Option<PeerId>,
    pub name: String,
    /// TCP address of the peer's transfer listener (outbound) or of the
    /// accepted connection (inbound).
    pub address: SocketAddr,
}

impl PeerEndpoint {
    /// An endpoint known only by address.
    pub fn from_addr(address: SocketAddr) -> Self {
        Self {
            id: None,
            name: address.to_string(),
            address,
        }
    }
}

/// State of one file transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub id: String,
    pub file_name: String,
    pub file_size: u64,
    pub bytes_transferred: u64,
    pub direction: TransferDirection,
    pub status: TransferStatus,
    pub peer: PeerEndpoint,
    /// Uppercase hex SHA-256 announced by the sender.
    pub file_hash: String,
    /// Where the receiver writes the file.
    pub save_path: Option<PathBuf>,
    pub error_message: Option<String>,
    pub start_time: DateTime<Utc>,
}

impl TransferRecord {
    pub fn new(
        id: impl Into<String>,
        file_name: impl Into<String>,
        file_size: u64,
        direction: TransferDirection,
        peer: PeerEndpoint,
    ) -> Self {
        Self {
            id: id.into(),
            file_name: file_name.into(),
            file_size,
            bytes_transferred: 0,
            direction,
            status: TransferStatus::Pending,
            peer,
            file_hash: String::new(),
            save_path: None,
            error_message: None,
            start_time: Utc::now(),
        }
    }

    /// Percentage of bytes moved, 100 for empty files.
    pub fn progress_percent(&self) -> f64 {
        if self.file_size == 0 {
            return 100.0;
        }
        self.bytes_transferred as f64 / self.file_size as f64 * 100.0
    }

    fn advance(&mut self, next: TransferStatus) -> Result<(), NetworkError> {
        if !self.status.can_transition_to(next) {
            return Err(NetworkError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }
}

/// Concurrent table of active (non-terminal) transfers keyed by id.
#[derive(Debug, Default)]
pub struct TransferRegistry {
    transfers: DashMap<String, TransferRecord>,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record unless one with the same id is already active.
    pub fn insert(&self, record: TransferRecord) -> Result<(), NetworkError> {
        match self.transfers.entry(record.id.clone()) {
            Entry::Occupied(_) => Err(NetworkError::DuplicateTransfer(record.id)),
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(())
            }
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.transfers.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<TransferRecord> {
        self.transfers.get(id).map(|r| r.clone())
    }

    /// Move an active transfer to a later non-terminal status.
    pub fn advance(&self, id: &str, next: TransferStatus) -> Result<TransferRecord, NetworkError> {
        let mut record = self
            .transfers
            .get_mut(id)
            .ok_or_else(|| NetworkError::UnknownTransfer(id.to_string()))?;
        record.advance(next)?;
        Ok(record.clone())
    }

    /// Record progress. Values lower than the current count are ignored.
    pub fn update_progress(&self, id: &str, bytes: u64) -> Option<TransferRecord> {
        let mut record = self.transfers.get_mut(id)?;
        record.bytes_transferred = record.bytes_transferred.max(bytes);
        Some(record.clone())
    }

    /// Set a terminal status and remove the record, returning the final copy.
    pub fn finish(
        &self,
        id: &str,
        status: TransferStatus,
        error: Option<String>,
    ) -> Result<TransferRecord, NetworkError> {
        let (_, mut record) = self
            .transfers
            .remove(id)
            .ok_or_else(|| NetworkError::UnknownTransfer(id.to_string()))?;
        record.advance(status)?;
        record.error_message = error;
        Ok(record)
    }

    /// Snapshot of all active transfers.
    pub fn snapshot(&self) -> Vec<TransferRecord> {
        self.transfers.iter().map(|r| r.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    pub fn clear(&self) {
        self.transfers.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> TransferRecord {
        TransferRecord::new(
            id,
            "report.pdf",
            1000,
            TransferDirection::Sending,
            PeerEndpoint::from_addr("127.0.0.1:35732".parse().unwrap()),
        )
    }

    #[test]
    fn test_status_transitions() {
        use TransferStatus::*;
        assert!(Pending.can_transition_to(InProgress));
        assert!(Pending.can_transition_to(Failed));
        assert!(InProgress.can_transition_to(Completed));
        assert!(InProgress.can_transition_to(Cancelled));
        assert!(!InProgress.can_transition_to(Pending));
        assert!(!InProgress.can_transition_to(InProgress));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(InProgress));
    }

    #[test]
    fn test_insert_rejects_duplicate_id() {
        let registry = TransferRegistry::new();
        registry.insert(record("t-1")).unwrap();
        let err = registry.insert(record("t-1")).unwrap_err();
        assert!(matches!(err, NetworkError::DuplicateTransfer(id) if id == "t-1"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_progress_is_monotonic() {
        let registry = TransferRegistry::new();
        registry.insert(record("t-2")).unwrap();
        registry.update_progress("t-2", 400);
        let r = registry.update_progress("t-2", 100).unwrap();
        assert_eq!(r.bytes_transferred, 400);
        assert!((r.progress_percent() - 40.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_finish_removes_and_returns_final_copy() {
        let registry = TransferRegistry::new();
        registry.insert(record("t-3")).unwrap();
        registry.advance("t-3", TransferStatus::InProgress).unwrap();

        let done = registry
            .finish("t-3", TransferStatus::Failed, Some("boom".into()))
            .unwrap();
        assert_eq!(done.status, TransferStatus::Failed);
        assert_eq!(done.error_message.as_deref(), Some("boom"));
        assert!(registry.is_empty());
        assert!(registry.finish("t-3", TransferStatus::Completed, None).is_err());
    }

    #[test]
    fn test_backward_transition_rejected() {
        let registry = TransferRegistry::new();
        registry.insert(record("t-4")).unwrap();
        registry.advance("t-4", TransferStatus::InProgress).unwrap();
        let err = registry.advance("t-4", TransferStatus::Pending).unwrap_err();
        assert!(matches!(err, NetworkError::InvalidTransition { .. }));
        assert_eq!(registry.get("t-4").unwrap().status, TransferStatus::InProgress);
    }

    #[test]
    fn test_snapshot_and_clear() {
        let registry = TransferRegistry::new();
        registry.insert(record("a")).unwrap();
        registry.insert(record("b")).unwrap();
        assert_eq!(registry.snapshot().len(), 2);
        registry.clear();
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn test_empty_file_progress() {
        let mut r = record("empty");
        r.file_size = 0;
        assert_eq!(r.progress_percent(), 100.0);
    }
}
