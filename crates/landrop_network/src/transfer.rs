//! TCP file transfer.
//!
//! One connection carries one file:
//!
//! 1. sender → receiver: framed `TransferRequest`
//! 2. receiver → sender: framed `TransferResponse` (accept or reject)
//! 3. sender → receiver: exactly `fileSize` raw bytes, in chunks
//! 4. receiver → sender: framed `TransferStatus` with the verified outcome
//!
//! The receiver parks each request until the application calls
//! [`TransferEngine::accept_incoming`] or [`TransferEngine::reject_incoming`].
//! Every transfer owns a child of the engine's [`CancellationToken`], checked
//! before each chunk.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TransferConfig;
use crate::error::NetworkError;
use crate::hash::{self, StreamHasher};
use crate::identity::LocalIdentity;
use crate::message::{
    Envelope, MessageKind, TransferRequestPayload, TransferResponsePayload, TransferStatusPayload,
};
use crate::net;
use crate::record::{
    PeerEndpoint, TransferDirection, TransferRecord, TransferRegistry, TransferStatus,
};
use crate::wire;

const DUPLICATE_ID: &str = "Duplicate transfer id";
const SHUTTING_DOWN: &str = "Receiver shutting down";

/// Notifications published by the transfer engine.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// A transfer was registered.
    Started(TransferRecord),
    /// Bytes moved. Emitted once per chunk.
    ProgressUpdated(TransferRecord),
    Completed(TransferRecord),
    Failed(TransferRecord),
    Cancelled(TransferRecord),
    /// A peer offers a file and waits for a decision.
    IncomingRequest(IncomingTransfer),
    /// A received file was verified and written to `path`.
    IncomingFileCompleted { record: TransferRecord, path: PathBuf },
    /// A failure outside any single transfer record.
    Error(String),
}

/// A parked inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingTransfer {
    pub transfer_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub file_hash: String,
    pub peer: PeerEndpoint,
}

#[derive(Debug)]
enum Decision {
    Accept(Option<PathBuf>),
    Reject(String),
}

/// How a transfer ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    Completed,
    Failed(String),
    Cancelled,
}

impl Outcome {
    fn into_parts(self) -> (TransferStatus, Option<String>) {
        match self {
            Self::Completed => (TransferStatus::Completed, None),
            Self::Failed(reason) => (TransferStatus::Failed, Some(reason)),
            Self::Cancelled => (TransferStatus::Cancelled, None),
        }
    }
}

/// Sends files to peers and receives files from them.
pub struct TransferEngine {
    inner: Arc<TransferInner>,
}

struct TransferInner {
    config: TransferConfig,
    identity: LocalIdentity,
    registry: TransferRegistry,
    pending: DashMap<String, oneshot::Sender<Decision>>,
    /// Inbound ids held by a connection, from parking until its handler ends.
    claims: DashMap<String, u64>,
    next_claim: AtomicU64,
    tokens: DashMap<String, CancellationToken>,
    events: broadcast::Sender<TransferEvent>,
    /// Root of the cancellation tree for the current run.
    root: Mutex<CancellationToken>,
    listen_port: Mutex<Option<u16>>,
}

/// Exclusive hold on an inbound transfer id. Released on drop, and only if
/// the id still belongs to this holder.
struct Claim<'a> {
    inner: &'a TransferInner,
    id: String,
    serial: u64,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.inner
            .claims
            .remove_if(&self.id, |_, serial| *serial == self.serial);
    }
}

impl TransferEngine {
    pub fn new(identity: LocalIdentity, config: TransferConfig) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(TransferInner {
                config,
                identity,
                registry: TransferRegistry::new(),
                pending: DashMap::new(),
                claims: DashMap::new(),
                next_claim: AtomicU64::new(0),
                tokens: DashMap::new(),
                events,
                root: Mutex::new(CancellationToken::new()),
                listen_port: Mutex::new(None),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.inner.events.subscribe()
    }

    /// TCP port actually bound, while listening.
    pub fn listen_port(&self) -> Option<u16> {
        *self.inner.listen_port.lock()
    }

    pub fn is_listening(&self) -> bool {
        self.listen_port().is_some()
    }

    /// Snapshot of transfers that have not reached a terminal status.
    pub fn active_transfers(&self) -> Vec<TransferRecord> {
        self.inner.registry.snapshot()
    }

    /// Bind the listener and start accepting connections. Returns the bound
    /// port; calling it again while listening returns the same port.
    pub async fn start(&self) -> Result<u16, NetworkError> {
        if let Some(port) = self.listen_port() {
            return Ok(port);
        }

        let config = &self.inner.config;
        let listener =
            match net::bind_tcp(config.bind_addr, config.port, config.port_scan_attempts).await {
                Ok(listener) => listener,
                Err(e) => {
                    self.inner
                        .publish(TransferEvent::Error(format!("Failed to start listener: {e}")));
                    return Err(e);
                }
            };
        let port = listener.local_addr()?.port();

        {
            let mut slot = self.inner.listen_port.lock();
            if let Some(existing) = *slot {
                // Lost a concurrent start; the new listener is dropped.
                return Ok(existing);
            }
            *slot = Some(port);
        }

        let cancel = self.inner.root.lock().clone();
        tokio::spawn(Self::accept_loop(Arc::clone(&self.inner), listener, cancel));
        info!("Transfer listener started on TCP {port}");
        Ok(port)
    }

    /// Stop listening, cancel every in-flight transfer and reject every
    /// parked request. Returns immediately.
    pub fn stop(&self) {
        let was_listening = self.inner.listen_port.lock().take().is_some();

        let old = std::mem::replace(&mut *self.inner.root.lock(), CancellationToken::new());
        old.cancel();

        let parked: Vec<String> = self.inner.pending.iter().map(|e| e.key().clone()).collect();
        for id in parked {
            if let Some((_, tx)) = self.inner.pending.remove(&id) {
                let _ = tx.send(Decision::Reject(SHUTTING_DOWN.to_string()));
            }
        }

        if was_listening {
            info!("Transfer listener stopped");
        }
    }

    /// Send one file to `target` and drive it to a terminal status.
    ///
    /// Validation problems (missing file, directory, oversize) are returned as
    /// errors before anything is registered. Once registered, the outcome
    /// (including rejection, I/O failure and cancellation) is reported in the
    /// returned record.
    pub async fn send_file(
        &self,
        path: impl AsRef<Path>,
        target: PeerEndpoint,
    ) -> Result<TransferRecord, NetworkError> {
        let path = path.as_ref();
        let (file_name, file_size, file_hash) = match self.inner.prepare_outbound(path).await {
            Ok(prepared) => prepared,
            Err(e) => {
                self.inner.publish(TransferEvent::Error(e.to_string()));
                return Err(e);
            }
        };

        let id = uuid::Uuid::new_v4().to_string();
        let mut record = TransferRecord::new(
            id.clone(),
            file_name,
            file_size,
            TransferDirection::Sending,
            target,
        );
        record.file_hash = file_hash;
        self.inner.registry.insert(record.clone())?;

        let token = self.inner.root.lock().child_token();
        self.inner.tokens.insert(id.clone(), token.clone());
        info!(
            "Sending '{}' ({} bytes) to {}",
            record.file_name, record.file_size, record.peer.address
        );
        self.inner.publish(TransferEvent::Started(record.clone()));

        let outcome = self.inner.run_outbound(path, &record, &token).await;
        self.inner
            .conclude(&id, outcome)
            .ok_or(NetworkError::UnknownTransfer(id))
    }

    /// Accept a parked request, optionally overriding the download directory.
    pub fn accept_incoming(
        &self,
        transfer_id: &str,
        save_dir: Option<PathBuf>,
    ) -> Result<(), NetworkError> {
        self.inner.decide(transfer_id, Decision::Accept(save_dir))
    }

    /// Reject a parked request with a reason the sender will see.
    pub fn reject_incoming(&self, transfer_id: &str, reason: &str) -> Result<(), NetworkError> {
        self.inner
            .decide(transfer_id, Decision::Reject(reason.to_string()))
    }

    /// Cancel an active transfer, or reject a parked request.
    ///
    /// Returns `false` if the id is unknown.
    pub fn cancel_transfer(&self, transfer_id: &str) -> bool {
        if let Some((_, tx)) = self.inner.pending.remove(transfer_id) {
            let _ = tx.send(Decision::Reject("Transfer cancelled".to_string()));
            return true;
        }
        match self.inner.tokens.get(transfer_id) {
            Some(token) => {
                debug!("Cancelling transfer {transfer_id}");
                token.cancel();
                true
            }
            None => false,
        }
    }

    async fn accept_loop(inner: Arc<TransferInner>, listener: TcpListener, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Transfer listener shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            debug!("Inbound transfer connection from {addr}");
                            let inner = Arc::clone(&inner);
                            let token = cancel.child_token();
                            tokio::spawn(async move {
                                inner.handle_incoming(stream, addr, token).await;
                            });
                        }
                        Err(e) => warn!("Transfer accept failed: {e}"),
                    }
                }
            }
        }
    }
}

impl Drop for TransferEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

impl TransferInner {
    fn publish(&self, event: TransferEvent) {
        let _ = self.events.send(event);
    }

    fn envelope<T: serde::Serialize>(&self, kind: MessageKind, payload: &T) -> Envelope {
        let port = self.listen_port.lock().unwrap_or(0);
        Envelope::with_payload(&self.identity, port, kind, payload)
    }

    fn decide(&self, transfer_id: &str, decision: Decision) -> Result<(), NetworkError> {
        let (_, tx) = self
            .pending
            .remove(transfer_id)
            .ok_or_else(|| NetworkError::UnknownTransfer(transfer_id.to_string()))?;
        tx.send(decision)
            .map_err(|_| NetworkError::UnknownTransfer(transfer_id.to_string()))
    }

    /// Set the terminal status, drop the record and publish the terminal event.
    fn conclude(&self, id: &str, outcome: Outcome) -> Option<TransferRecord> {
        self.tokens.remove(id);
        let (status, error) = outcome.into_parts();
        let record = match self.registry.finish(id, status, error) {
            Ok(record) => record,
            Err(e) => {
                warn!("Cannot finish transfer {id}: {e}");
                return None;
            }
        };

        match record.status {
            TransferStatus::Completed => {
                info!("Transfer {} '{}' completed", record.id, record.file_name);
                self.publish(TransferEvent::Completed(record.clone()));
            }
            TransferStatus::Cancelled => {
                info!("Transfer {} '{}' cancelled", record.id, record.file_name);
                self.publish(TransferEvent::Cancelled(record.clone()));
            }
            _ => {
                warn!(
                    "Transfer {} '{}' failed: {}",
                    record.id,
                    record.file_name,
                    record.error_message.as_deref().unwrap_or("unknown error")
                );
                self.publish(TransferEvent::Failed(record.clone()));
            }
        }
        Some(record)
    }

    fn progress(&self, id: &str, bytes: u64) {
        if let Some(record) = self.registry.update_progress(id, bytes) {
            self.publish(TransferEvent::ProgressUpdated(record));
        }
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    async fn prepare_outbound(&self, path: &Path) -> Result<(String, u64, String), NetworkError> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|_| NetworkError::FileNotFound(path.to_path_buf()))?;
        if !meta.is_file() {
            return Err(NetworkError::FileNotFound(path.to_path_buf()));
        }
        let max = self.config.max_file_size;
        if meta.len() > max {
            return Err(NetworkError::FileTooLarge {
                size: meta.len(),
                max,
            });
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| NetworkError::FileNotFound(path.to_path_buf()))?;
        let file_hash = hash::sha256_file_async(path.to_path_buf()).await?;
        Ok((file_name, meta.len(), file_hash))
    }

    async fn run_outbound(
        &self,
        path: &Path,
        record: &TransferRecord,
        token: &CancellationToken,
    ) -> Outcome {
        let addr = record.peer.address;
        let connect = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr));
        let mut stream = tokio::select! {
            _ = token.cancelled() => return Outcome::Cancelled,
            result = connect => match result {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => return Outcome::Failed(format!("Connection to {addr} failed: {e}")),
                Err(_) => return Outcome::Failed(format!("Connection to {addr} timed out")),
            },
        };

        let request = self.envelope(
            MessageKind::TransferRequest,
            &TransferRequestPayload {
                transfer_id: record.id.clone(),
                file_name: record.file_name.clone(),
                file_size: record.file_size,
                file_hash: record.file_hash.clone(),
            },
        );
        if let Err(e) = wire::write_frame(&mut stream, &request).await {
            return Outcome::Failed(format!("Failed to send request: {e}"));
        }

        let response = tokio::select! {
            _ = token.cancelled() => return Outcome::Cancelled,
            result = wire::read_frame(&mut stream) => result,
        };
        let response: TransferResponsePayload = match response {
            Ok(Some(envelope)) => match envelope.payload_as(MessageKind::TransferResponse) {
                Ok(payload) => payload,
                Err(e) => return Outcome::Failed(format!("Invalid response: {e}")),
            },
            Ok(None) => {
                return Outcome::Failed("Receiver closed the connection without answering".into());
            }
            Err(e) => return Outcome::Failed(format!("Failed to read response: {e}")),
        };

        if response.transfer_id != record.id {
            return Outcome::Failed(format!(
                "Response was for transfer {}",
                response.transfer_id
            ));
        }
        if !response.accepted {
            let reason = if response.reject_reason.is_empty() {
                "Transfer rejected".to_string()
            } else {
                response.reject_reason
            };
            return Outcome::Failed(reason);
        }

        match self.registry.advance(&record.id, TransferStatus::InProgress) {
            Ok(updated) => self.publish(TransferEvent::ProgressUpdated(updated)),
            Err(e) => return Outcome::Failed(e.to_string()),
        }

        if let Some(outcome) = self
            .stream_file(path, record, &mut stream, token)
            .await
        {
            return outcome;
        }

        self.await_receiver_report(&record.id, &mut stream, token).await
    }

    /// Push the file body. Returns `Some` only if the transfer ended early.
    ///
    /// Cancellation is checked between chunks and also interrupts a write
    /// stalled on a receiver that stopped reading. An interrupted chunk is
    /// not counted, so `bytes_transferred` only ever covers whole chunks, and
    /// the connection is dropped right after.
    async fn stream_file(
        &self,
        path: &Path,
        record: &TransferRecord,
        stream: &mut TcpStream,
        token: &CancellationToken,
    ) -> Option<Outcome> {
        let mut file = match File::open(path).await {
            Ok(file) => file,
            Err(e) => return Some(Outcome::Failed(format!("Cannot open file: {e}"))),
        };

        let mut buf = vec![0u8; self.config.chunk_size.max(1)];
        let mut sent = 0u64;
        while sent < record.file_size {
            if token.is_cancelled() {
                return Some(Outcome::Cancelled);
            }

            let want = (record.file_size - sent).min(buf.len() as u64) as usize;
            if let Err(e) = file.read_exact(&mut buf[..want]).await {
                return Some(Outcome::Failed(format!("File read failed: {e}")));
            }

            tokio::select! {
                _ = token.cancelled() => return Some(Outcome::Cancelled),
                result = stream.write_all(&buf[..want]) => {
                    if let Err(e) = result {
                        return Some(Outcome::Failed(format!("Send failed: {e}")));
                    }
                }
            }

            sent += want as u64;
            self.progress(&record.id, sent);
        }

        if let Err(e) = stream.flush().await {
            return Some(Outcome::Failed(format!("Send failed: {e}")));
        }
        None
    }

    /// The receiver's verdict after all bytes went out. A connection closed
    /// without a report counts as success.
    async fn await_receiver_report(
        &self,
        id: &str,
        stream: &mut TcpStream,
        token: &CancellationToken,
    ) -> Outcome {
        let report = tokio::select! {
            _ = token.cancelled() => return Outcome::Cancelled,
            result = tokio::time::timeout(self.config.connect_timeout, wire::read_frame(stream)) => result,
        };

        let envelope = match report {
            Ok(Ok(Some(envelope))) => envelope,
            Ok(Ok(None)) => {
                debug!("Receiver closed transfer {id} without a status report");
                return Outcome::Completed;
            }
            Ok(Err(e)) => {
                debug!("No status report for transfer {id}: {e}");
                return Outcome::Completed;
            }
            Err(_) => {
                debug!("Status report for transfer {id} timed out");
                return Outcome::Completed;
            }
        };

        match envelope.payload_as::<TransferStatusPayload>(MessageKind::TransferStatus) {
            Ok(status) if status.status == TransferStatus::Completed => Outcome::Completed,
            Ok(status) => {
                let reason = if status.error_message.is_empty() {
                    format!("Receiver reported {:?}", status.status)
                } else {
                    status.error_message
                };
                Outcome::Failed(reason)
            }
            Err(e) => {
                debug!("Ignoring unexpected report for transfer {id}: {e}");
                Outcome::Completed
            }
        }
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    async fn handle_incoming(&self, mut stream: TcpStream, addr: SocketAddr, cancel: CancellationToken) {
        let read = tokio::select! {
            _ = cancel.cancelled() => return,
            result = wire::read_frame(&mut stream) => result,
        };
        let envelope = match read {
            Ok(Some(envelope)) => envelope,
            Ok(None) => {
                debug!("{addr} closed before sending a request");
                return;
            }
            Err(e) => {
                debug!("Dropping connection from {addr}: {e}");
                return;
            }
        };
        let request: TransferRequestPayload =
            match envelope.payload_as(MessageKind::TransferRequest) {
                Ok(request) => request,
                Err(e) => {
                    debug!("Dropping connection from {addr}: {e}");
                    return;
                }
            };

        let id = request.transfer_id.clone();
        if request.file_size > self.config.max_file_size {
            info!(
                "Rejecting '{}' from {addr}: {} bytes exceeds the limit",
                request.file_name, request.file_size
            );
            self.respond(&mut stream, &id, Some("File too large")).await;
            return;
        }

        let (_claim, rx) = match self.park(&id) {
            Some(parked) => parked,
            None => {
                info!("Rejecting transfer {id} from {addr}: {DUPLICATE_ID}");
                self.respond(&mut stream, &id, Some(DUPLICATE_ID)).await;
                return;
            }
        };

        let peer = PeerEndpoint {
            id: Some(envelope.sender_id.clone()),
            name: envelope.sender_name.clone(),
            address: addr,
        };
        info!(
            "Incoming '{}' ({} bytes) from '{}' at {addr}",
            request.file_name, request.file_size, peer.name
        );
        self.publish(TransferEvent::IncomingRequest(IncomingTransfer {
            transfer_id: id.clone(),
            file_name: request.file_name.clone(),
            file_size: request.file_size,
            file_hash: request.file_hash.clone(),
            peer: peer.clone(),
        }));

        let save_dir = match self.await_decision(&id, rx, &cancel).await {
            Decision::Accept(dir) => dir.unwrap_or_else(|| self.config.download_dir.clone()),
            Decision::Reject(reason) => {
                info!("Transfer {id} rejected: {reason}");
                self.respond(&mut stream, &id, Some(&reason)).await;
                return;
            }
        };

        self.receive(stream, request, peer, save_dir, cancel).await;
    }

    /// Claim the id and register a decision slot, unless another connection
    /// already holds the id or a transfer with that id is active.
    fn park(&self, id: &str) -> Option<(Claim<'_>, oneshot::Receiver<Decision>)> {
        if self.registry.contains(id) {
            return None;
        }
        let serial = self.next_claim.fetch_add(1, Ordering::Relaxed);
        match self.claims.entry(id.to_string()) {
            Entry::Occupied(_) => return None,
            Entry::Vacant(slot) => {
                slot.insert(serial);
            }
        }
        let claim = Claim {
            inner: self,
            id: id.to_string(),
            serial,
        };

        // Only the claim holder touches `pending` for this id.
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.to_string(), tx);
        Some((claim, rx))
    }

    async fn await_decision(
        &self,
        id: &str,
        rx: oneshot::Receiver<Decision>,
        cancel: &CancellationToken,
    ) -> Decision {
        let wait = async { rx.await.unwrap_or(Decision::Reject(SHUTTING_DOWN.to_string())) };
        let decision = match self.config.decision_timeout {
            Some(limit) => tokio::select! {
                _ = cancel.cancelled() => Decision::Reject(SHUTTING_DOWN.to_string()),
                result = tokio::time::timeout(limit, wait) => result
                    .unwrap_or_else(|_| Decision::Reject("No decision in time".to_string())),
            },
            None => tokio::select! {
                _ = cancel.cancelled() => Decision::Reject(SHUTTING_DOWN.to_string()),
                decision = wait => decision,
            },
        };
        self.pending.remove(id);
        decision
    }

    /// Send a TransferResponse. `reject` carries the reason for a refusal.
    async fn respond(&self, stream: &mut TcpStream, id: &str, reject: Option<&str>) -> bool {
        // Read the port before `envelope` takes the same non-reentrant lock.
        let listen_port = self.listen_port.lock().unwrap_or(0);
        let response = self.envelope(
            MessageKind::TransferResponse,
            &TransferResponsePayload {
                transfer_id: id.to_string(),
                accepted: reject.is_none(),
                reject_reason: reject.unwrap_or_default().to_string(),
                listen_port,
            },
        );
        match wire::write_frame(stream, &response).await {
            Ok(()) => true,
            Err(e) => {
                debug!("Failed to answer transfer {id}: {e}");
                false
            }
        }
    }

    async fn receive(
        &self,
        mut stream: TcpStream,
        request: TransferRequestPayload,
        peer: PeerEndpoint,
        save_dir: PathBuf,
        cancel: CancellationToken,
    ) {
        let id = request.transfer_id.clone();
        let file_name = sanitize_file_name(&request.file_name);
        let (save_path, file) = match create_destination(&save_dir, &file_name).await {
            Ok(created) => created,
            Err(e) => {
                let message = format!("Cannot create file in {}: {e}", save_dir.display());
                warn!("{message}");
                self.publish(TransferEvent::Error(message));
                self.respond(&mut stream, &id, Some("Receiver cannot store the file"))
                    .await;
                return;
            }
        };

        let mut record = TransferRecord::new(
            id.clone(),
            file_name,
            request.file_size,
            TransferDirection::Receiving,
            peer,
        );
        record.file_hash = request.file_hash.clone();
        record.save_path = Some(save_path.clone());
        if self.registry.insert(record).is_err() {
            drop(file);
            let _ = tokio::fs::remove_file(&save_path).await;
            self.respond(&mut stream, &id, Some(DUPLICATE_ID)).await;
            return;
        }
        let token = cancel.child_token();
        self.tokens.insert(id.clone(), token.clone());

        match self.registry.advance(&id, TransferStatus::InProgress) {
            Ok(record) => self.publish(TransferEvent::Started(record)),
            Err(e) => warn!("Transfer {id}: {e}"),
        }

        let outcome = if self.respond(&mut stream, &id, None).await {
            self.receive_body(&mut stream, &request, file, &token).await
        } else {
            Outcome::Failed("Failed to send response".to_string())
        };

        if outcome != Outcome::Completed {
            if let Err(e) = tokio::fs::remove_file(&save_path).await {
                debug!("Cannot remove partial file {}: {e}", save_path.display());
            }
        }

        let report_status = match &outcome {
            Outcome::Completed => TransferStatus::Completed,
            Outcome::Failed(_) => TransferStatus::Failed,
            Outcome::Cancelled => TransferStatus::Cancelled,
        };
        let report_error = match &outcome {
            Outcome::Failed(reason) => reason.clone(),
            _ => String::new(),
        };

        let Some(record) = self.conclude(&id, outcome) else {
            return;
        };
        if record.status == TransferStatus::Completed {
            self.publish(TransferEvent::IncomingFileCompleted {
                record: record.clone(),
                path: save_path,
            });
        }

        let report = self.envelope(
            MessageKind::TransferStatus,
            &TransferStatusPayload {
                transfer_id: id.clone(),
                status: report_status,
                bytes_transferred: record.bytes_transferred,
                error_message: report_error,
            },
        );
        if let Err(e) = wire::write_frame(&mut stream, &report).await {
            debug!("Status report for transfer {id} not delivered: {e}");
        }
    }

    /// Read exactly `file_size` bytes into `file`, hashing along the way.
    async fn receive_body(
        &self,
        stream: &mut TcpStream,
        request: &TransferRequestPayload,
        mut file: File,
        token: &CancellationToken,
    ) -> Outcome {
        let id = &request.transfer_id;
        let size = request.file_size;
        let mut hasher = StreamHasher::new();
        let mut buf = vec![0u8; self.config.chunk_size.max(1)];
        let mut received = 0u64;

        while received < size {
            if token.is_cancelled() {
                return Outcome::Cancelled;
            }

            let want = (size - received).min(buf.len() as u64) as usize;
            // `read` is cancel safe: an abandoned wait consumes nothing, and
            // bytes that did arrive are written before the next check.
            let n = tokio::select! {
                _ = token.cancelled() => return Outcome::Cancelled,
                result = stream.read(&mut buf[..want]) => match result {
                    Ok(n) => n,
                    Err(e) => return Outcome::Failed(format!("Receive failed: {e}")),
                },
            };
            if n == 0 {
                return Outcome::Failed(format!(
                    "Sender closed the connection after {received} of {size} bytes"
                ));
            }

            if let Err(e) = file.write_all(&buf[..n]).await {
                return Outcome::Failed(format!("Write failed: {e}"));
            }
            hasher.update(&buf[..n]);
            received += n as u64;
            self.progress(id, received);
        }

        if let Err(e) = file.flush().await {
            return Outcome::Failed(format!("Write failed: {e}"));
        }

        if !request.file_hash.is_empty() && !hash::hashes_match(&hasher.finish(), &request.file_hash)
        {
            return Outcome::Failed("Content hash mismatch".to_string());
        }
        Outcome::Completed
    }
}

// ---------------------------------------------------------------------------
// Destination handling
// ---------------------------------------------------------------------------

/// Reduce an announced file name to its final path component.
pub fn sanitize_file_name(name: &str) -> String {
    let last = name.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    match last {
        "" | "." | ".." => "received_file".to_string(),
        other => other.to_string(),
    }
}

/// `report.pdf` → `report (1).pdf`, `README` → `README (1)`.
fn numbered_name(name: &str, n: u32) -> String {
    let path = Path::new(name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    match path.extension() {
        Some(ext) => format!("{stem} ({n}).{}", ext.to_string_lossy()),
        None => format!("{stem} ({n})"),
    }
}

/// Create a new file for `name` in `dir`, never replacing an existing one.
async fn create_destination(dir: &Path, name: &str) -> std::io::Result<(PathBuf, File)> {
    tokio::fs::create_dir_all(dir).await?;
    for n in 0..10_000u32 {
        let candidate = if n == 0 {
            dir.join(name)
        } else {
            dir.join(numbered_name(name, n))
        };
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
            .await
        {
            Ok(file) => return Ok((candidate, file)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        format!("no free name for {name}"),
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
