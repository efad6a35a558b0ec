//! Failure detector: per-backup probing and stale-directory detection.
//!
//! Runs on its own thread, sharing no mutex with the replica manager;
//! it only touches the rest of the system through its own
//! [`ChangeTracker`] (thread-safe `enqueue`) and a best-effort
//! coordinator client. Grounded on the injected-collaborator shape of
//! `kimberlite-kernel/src/runtime.rs`'s `Clock`/`Network` traits: probing
//! is driven through [`PingTransport`]/[`CoordinatorTransport`] rather
//! than a concrete socket, so a test can drive a full probe round
//! synchronously with a fake transport.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use embervault_config::ReplicaManagerConfig;
use embervault_directory::ChangeTracker;
use embervault_rpc::{CoordinatorTransport, PingTransport, RpcError, RpcHandle, RpcResult};
use embervault_types::{ServerId, ServiceMask};
use parking_lot::Mutex;
use tracing::{debug, warn};

/// A read-only view of the local directory's version counter: a number
/// that advances on every authoritative change.
pub trait DirectoryVersion: Send + Sync {
    /// The locally-held directory's current version.
    fn version(&self) -> u64;
}

/// A `DirectoryVersion` backed by a single atomic, used standalone and
/// in tests; a real process wires this to its `ServerDirectory`.
#[derive(Default)]
pub struct AtomicDirectoryVersion(AtomicU64);

impl AtomicDirectoryVersion {
    /// Creates a version tracker starting at `version`.
    #[must_use]
    pub fn new(version: u64) -> Self {
        Self(AtomicU64::new(version))
    }

    /// Records a new local directory version.
    pub fn set(&self, version: u64) {
        self.0.store(version, Ordering::Release);
    }
}

impl DirectoryVersion for AtomicDirectoryVersion {
    fn version(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }
}

struct Suspicion {
    recorded_local_version: u64,
    since: Instant,
}

/// Periodic per-backup prober.
pub struct FailureDetector {
    self_id: ServerId,
    tracker: Arc<Mutex<ChangeTracker<()>>>,
    ping: Arc<dyn PingTransport>,
    coordinator: Arc<dyn CoordinatorTransport>,
    directory_version: Arc<dyn DirectoryVersion>,
    probe_interval: Duration,
    probe_timeout: Duration,
    stale_timeout: Duration,
    suspicion: Mutex<Option<Suspicion>>,
    next_nonce: AtomicU64,
}

impl FailureDetector {
    /// Builds a detector for `self_id`, probing peers visible through
    /// `tracker` (typically `directory.subscribe::<()>()`).
    #[must_use]
    pub fn new(
        self_id: ServerId,
        tracker: Arc<Mutex<ChangeTracker<()>>>,
        ping: Arc<dyn PingTransport>,
        coordinator: Arc<dyn CoordinatorTransport>,
        directory_version: Arc<dyn DirectoryVersion>,
        config: &ReplicaManagerConfig,
    ) -> Self {
        Self {
            self_id,
            tracker,
            ping,
            coordinator,
            directory_version,
            probe_interval: Duration::from_micros(config.probe_interval_us),
            probe_timeout: Duration::from_micros(config.probe_timeout_us),
            stale_timeout: Duration::from_micros(config.stale_server_list_us),
            suspicion: Mutex::new(None),
            next_nonce: AtomicU64::new(1),
        }
    }

    /// Runs one probe round: pick a random `PING`-capable peer (excluding
    /// self), ping it, and react to the outcome. A no-op if no eligible
    /// peer exists.
    pub fn probe_once(&self) {
        {
            let mut tracker = self.tracker.lock();
            while tracker.get_change().is_some() {}
        }

        let peer = {
            let tracker = self.tracker.lock();
            loop {
                let candidate = tracker.random_with_service(ServiceMask::PING);
                if !candidate.is_valid() {
                    return;
                }
                if candidate != self.self_id {
                    break candidate;
                }
                // Only self is eligible; nothing useful to probe.
                if tracker.present_with_service(ServiceMask::PING).all(|id| id == self.self_id) {
                    return;
                }
            }
        };

        let nonce = self.next_nonce.fetch_add(1, Ordering::Relaxed);
        let handle = self.ping.ping(peer, nonce, self.probe_timeout);
        match self.block_until_resolved(&handle, self.probe_timeout) {
            Some(Ok(reply)) => self.on_ping_success(reply),
            Some(Err(RpcError::StaleIdentity(_))) => {
                debug!(%peer, "probe target raced with a membership update, skipping round");
            }
            Some(Err(err)) => {
                debug!(%peer, %err, "probe failed, hinting server down");
                self.hint_down(peer);
            }
            None => {
                debug!(%peer, "probe timed out, hinting server down");
                self.hint_down(peer);
            }
        }
    }

    /// Runs [`probe_once`](Self::probe_once) on a fixed cadence, on a
    /// dedicated thread, until `shutdown` is set.
    ///
    /// Mirrors `embervault::spawn_directory_version_bridge`'s shape: the
    /// detector shares no mutex with the rest of the system, so the loop
    /// needs nothing beyond `self` and a shutdown flag to run
    /// independently of whatever drives the replica manager.
    #[must_use]
    pub fn spawn_probe_loop(self: Arc<Self>, shutdown: Arc<AtomicBool>) -> JoinHandle<()> {
        std::thread::Builder::new()
            .name("embervault-failure-detector".to_string())
            .spawn(move || {
                while !shutdown.load(Ordering::Acquire) {
                    self.probe_once();
                    std::thread::sleep(self.probe_interval);
                }
            })
            .expect("failed to spawn failure-detector probe thread")
    }

    fn block_until_resolved<T>(&self, handle: &RpcHandle<T>, timeout: Duration) -> Option<RpcResult<T>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(result) = handle.poll() {
                return Some(result);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::yield_now();
        }
    }

    fn hint_down(&self, peer: ServerId) {
        // Fire-and-forget: transport errors on the hint itself are
        // swallowed, so there is nothing useful to do with the handle's
        // eventual result.
        let _ = self.coordinator.hint_server_down(peer);
    }

    fn on_ping_success(&self, reply: embervault_rpc::PingReply) {
        let local = self.directory_version.version();
        let mut suspicion = self.suspicion.lock();
        match suspicion.as_ref() {
            None => {
                if reply.server_list_version > local {
                    debug!(local, peer_version = reply.server_list_version, "entering SUSPECTING_STALE");
                    *suspicion = Some(Suspicion {
                        recorded_local_version: local,
                        since: Instant::now(),
                    });
                }
            }
            Some(current) => {
                if local > current.recorded_local_version {
                    debug!(local, "local directory caught up, dropping suspicion");
                    *suspicion = None;
                } else if current.since.elapsed() >= self.stale_timeout {
                    warn!(local, "directory view stayed stale past timeout, requesting a fresh push");
                    *suspicion = None;
                    drop(suspicion);
                    let _ = self.coordinator.request_server_list(self.self_id);
                }
            }
        }
    }

    /// True while a stale-directory suspicion is currently recorded
    /// (test/observability hook).
    #[must_use]
    pub fn is_suspecting_stale(&self) -> bool {
        self.suspicion.lock().is_some()
    }
}
