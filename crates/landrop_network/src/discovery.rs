//! LAN peer discovery via UDP broadcast.
//!
//! The [`DiscoveryEngine`] announces this device with Discovery envelopes on
//! start and refresh, keeps announcing with periodic Heartbeats, and listens
//! for both from other devices. Peers that fall silent for longer than the
//! configured timeout are evicted by a periodic sweep.
//!
//! Every background task shares one [`CancellationToken`]; `stop()` cancels
//! it, so a timer that fires late finds the token cancelled and does nothing.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::DiscoveryConfig;
use crate::error::NetworkError;
use crate::identity::LocalIdentity;
use crate::message::{Envelope, MessageKind};
use crate::net;
use crate::peer::{PeerRecord, PeerRegistry, Sighting};
use crate::wire;

/// Largest datagram the receive loop accepts.
const MAX_DATAGRAM: usize = 64 * 1024;

/// Pause after a failed receive: 50 ms doubling per consecutive failure, capped at 2 s.
fn recv_backoff(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(6);
    Duration::from_millis(50 * 2u64.pow(exp)).min(Duration::from_secs(2))
}

/// Lifecycle of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Notifications published by the discovery engine.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// A device was seen for the first time.
    PeerDiscovered(PeerRecord),
    /// A known device announced itself again.
    PeerUpdated(PeerRecord),
    /// A device timed out and was evicted. Carries its last known record.
    PeerLost(PeerRecord),
    /// A failure worth surfacing, e.g. no UDP port could be bound.
    Error(String),
}

/// UDP presence protocol with liveness tracking.
pub struct DiscoveryEngine {
    inner: Arc<DiscoveryInner>,
}

struct DiscoveryInner {
    config: DiscoveryConfig,
    identity: RwLock<LocalIdentity>,
    tcp_port: AtomicU16,
    peers: PeerRegistry,
    events: broadcast::Sender<DiscoveryEvent>,
    state: Mutex<EngineState>,
    runtime: Mutex<Option<Runtime>>,
}

/// Resources that exist only while running.
struct Runtime {
    socket: Arc<UdpSocket>,
    cancel: CancellationToken,
    port: u16,
}

/// What the receive loop learned from one envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Observation {
    peer: PeerRecord,
    sighting: Sighting,
    /// Answer directly with a Heartbeat so the sender learns about us
    /// without waiting for the next broadcast.
    reply: bool,
}

impl DiscoveryEngine {
    pub fn new(identity: LocalIdentity, config: DiscoveryConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(DiscoveryInner {
                config,
                identity: RwLock::new(identity),
                tcp_port: AtomicU16::new(0),
                peers: PeerRegistry::new(),
                events,
                state: Mutex::new(EngineState::Stopped),
                runtime: Mutex::new(None),
            }),
        }
    }

    /// Subscribe to discovery events.
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> EngineState {
        *self.inner.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    /// UDP port actually bound, while running.
    pub fn bound_port(&self) -> Option<u16> {
        self.inner.runtime.lock().as_ref().map(|rt| rt.port)
    }

    /// Snapshot of currently known peers.
    pub fn peers(&self) -> Vec<PeerRecord> {
        self.inner.peers.snapshot()
    }

    /// This device as other peers see it.
    pub fn local_peer(&self) -> PeerRecord {
        let identity = self.inner.identity.read();
        PeerRecord {
            id: identity.id.clone(),
            name: identity.name.clone(),
            address: identity.address,
            port: self.inner.tcp_port.load(Ordering::Relaxed),
            last_seen: Utc::now(),
            online: true,
        }
    }

    /// Bind the socket and start the receive loop and both timers.
    ///
    /// A no-op unless the engine is stopped. If no UDP port can be bound an
    /// [`DiscoveryEvent::Error`] is published, the error is returned and the
    /// engine stays stopped.
    pub async fn start(&self, device_name: &str, tcp_port: u16) -> Result<(), NetworkError> {
        {
            let mut state = self.inner.state.lock();
            if *state != EngineState::Stopped {
                return Ok(());
            }
            *state = EngineState::Starting;
        }

        self.inner.identity.write().name = device_name.to_string();
        self.inner.tcp_port.store(tcp_port, Ordering::Relaxed);

        let config = &self.inner.config;
        let bound = net::bind_udp(config.bind_addr, config.port, config.port_scan_attempts)
            .await
            .and_then(|socket| {
                let port = socket.local_addr()?.port();
                Ok((Arc::new(socket), port))
            });
        let (socket, port) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                *self.inner.state.lock() = EngineState::Stopped;
                self.inner
                    .publish(DiscoveryEvent::Error(format!("Failed to start discovery: {e}")));
                return Err(e);
            }
        };
        let cancel = CancellationToken::new();

        tokio::spawn(Self::receive_loop(
            Arc::clone(&self.inner),
            Arc::clone(&socket),
            cancel.clone(),
        ));
        tokio::spawn(Self::heartbeat_loop(
            Arc::clone(&self.inner),
            Arc::clone(&socket),
            cancel.clone(),
        ));
        tokio::spawn(Self::sweep_loop(Arc::clone(&self.inner), cancel.clone()));

        let inner = Arc::clone(&self.inner);
        let burst_socket = Arc::clone(&socket);
        let burst_cancel = cancel.clone();
        tokio::spawn(async move { inner.announce_burst(&burst_socket, &burst_cancel).await });

        *self.inner.runtime.lock() = Some(Runtime {
            socket,
            cancel,
            port,
        });
        *self.inner.state.lock() = EngineState::Running;

        let identity = self.inner.identity.read();
        info!(
            "Discovery started for '{}' ({}) on UDP {port}, advertising TCP {tcp_port}",
            identity.name,
            identity.id.short()
        );
        Ok(())
    }

    /// Cancel the timers and receive loop, release the socket and forget all
    /// peers. No per-peer events are published for the bulk clear.
    pub fn stop(&self) {
        {
            let mut state = self.inner.state.lock();
            if *state != EngineState::Running {
                return;
            }
            *state = EngineState::Stopping;
        }

        if let Some(runtime) = self.inner.runtime.lock().take() {
            runtime.cancel.cancel();
        }
        self.inner.peers.clear();

        *self.inner.state.lock() = EngineState::Stopped;
        info!("Discovery stopped");
    }

    /// Re-announce this device with a burst of Discovery envelopes.
    pub async fn refresh(&self) {
        let Some((socket, cancel)) = self
            .inner
            .runtime
            .lock()
            .as_ref()
            .map(|rt| (Arc::clone(&rt.socket), rt.cancel.clone()))
        else {
            return;
        };
        self.inner.announce_burst(&socket, &cancel).await;
    }

    // -----------------------------------------------------------------------
    // Background tasks
    // -----------------------------------------------------------------------

    async fn receive_loop(
        inner: Arc<DiscoveryInner>,
        socket: Arc<UdpSocket>,
        cancel: CancellationToken,
    ) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut failures = 0u32;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Discovery listener shutting down");
                    break;
                }
                result = socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, src)) => {
                            failures = 0;
                            inner.handle_datagram(&buf[..len], src, &socket).await;
                        }
                        Err(e) => {
                            failures = failures.saturating_add(1);
                            let delay = recv_backoff(failures);
                            warn!("Discovery recv error ({failures} in a row, retrying in {delay:?}): {e}");
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                    }
                }
            }
        }
    }

    async fn heartbeat_loop(
        inner: Arc<DiscoveryInner>,
        socket: Arc<UdpSocket>,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(inner.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Heartbeat timer shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    inner.broadcast(&socket, MessageKind::Heartbeat).await;
                }
            }
        }
    }

    async fn sweep_loop(inner: Arc<DiscoveryInner>, cancel: CancellationToken) {
        let period = inner.config.sweep_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Peer sweep shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    inner.sweep();
                }
            }
        }
    }
}

impl Drop for DiscoveryEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

impl DiscoveryInner {
    fn publish(&self, event: DiscoveryEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn envelope(&self, kind: MessageKind) -> Envelope {
        let identity = self.identity.read();
        Envelope::presence(&identity, self.tcp_port.load(Ordering::Relaxed), kind)
    }

    async fn handle_datagram(&self, bytes: &[u8], src: SocketAddr, socket: &UdpSocket) {
        let envelope = match wire::decode(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!("Dropping malformed datagram from {src}: {e}");
                return;
            }
        };

        let Some(observation) = self.observe(&envelope, src) else {
            return;
        };

        if observation.reply {
            let reply = wire::encode(&self.envelope(MessageKind::Heartbeat));
            if let Err(e) = socket.send_to(&reply, src).await {
                debug!("Heartbeat reply to {src} failed: {e}");
            }
        }
    }

    /// Apply one decoded envelope to the registry and publish the matching event.
    fn observe(&self, envelope: &Envelope, src: SocketAddr) -> Option<Observation> {
        if envelope.sender_id == self.identity.read().id {
            trace!("Ignoring own {:?} from {src}", envelope.kind);
            return None;
        }
        if !matches!(envelope.kind, MessageKind::Discovery | MessageKind::Heartbeat) {
            debug!("Ignoring {:?} envelope on discovery socket", envelope.kind);
            return None;
        }

        let address = envelope
            .sender_address
            .parse::<IpAddr>()
            .ok()
            .filter(|a| !a.is_unspecified())
            .unwrap_or_else(|| src.ip());

        let (sighting, peer) = self.peers.upsert(
            &envelope.sender_id,
            &envelope.sender_name,
            address,
            envelope.sender_port,
            Utc::now(),
        );

        match sighting {
            Sighting::New => {
                info!("Discovered peer '{}' at {}", peer.name, peer.transfer_addr());
                self.publish(DiscoveryEvent::PeerDiscovered(peer.clone()));
            }
            Sighting::Known => {
                trace!("Peer '{}' refreshed", peer.name);
                self.publish(DiscoveryEvent::PeerUpdated(peer.clone()));
            }
        }

        Some(Observation {
            reply: envelope.kind == MessageKind::Discovery && sighting == Sighting::New,
            peer,
            sighting,
        })
    }

    fn sweep(&self) {
        for peer in self.peers.evict_stale(self.config.peer_timeout, Utc::now()) {
            info!("Peer '{}' ({}) timed out", peer.name, peer.id.short());
            self.publish(DiscoveryEvent::PeerLost(peer));
        }
    }

    async fn broadcast(&self, socket: &UdpSocket, kind: MessageKind) {
        let bytes = wire::encode(&self.envelope(kind));
        let broadcast = if self.config.use_broadcast {
            net::broadcast_addresses()
        } else {
            Vec::new()
        };
        let targets = net::announcement_targets(
            &broadcast,
            &self.config.static_targets,
            self.config.port,
            self.config.port_window,
        );

        let mut sent = 0usize;
        for target in &targets {
            match socket.send_to(&bytes, target).await {
                Ok(_) => sent += 1,
                Err(e) => trace!("{kind:?} to {target} failed: {e}"),
            }
        }
        trace!("{kind:?} sent to {sent}/{} targets", targets.len());
    }

    /// Several Discovery broadcasts in a row to ride out lost datagrams.
    async fn announce_burst(&self, socket: &UdpSocket, cancel: &CancellationToken) {
        let repeats = self.config.announce_repeats.max(1);
        for i in 0..repeats {
            if cancel.is_cancelled() {
                return;
            }
            self.broadcast(socket, MessageKind::Discovery).await;
            if i + 1 < repeats {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(self.config.announce_delay) => {}
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
