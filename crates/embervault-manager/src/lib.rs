//! Replica Manager: the log's single point of contact for replication.
//!
//! Owns the segment list, the backup selector, the task scheduler, and
//! the in-flight-write-RPC admission counter. Grounded on the
//! thin-coordinator shape of `kimberlite-cluster/src/supervisor.rs`: a
//! struct that owns its collaborators outright and exposes a small,
//! handle-based surface rather than handing out the collaborators
//! themselves.
//!
//! A single coarse mutex over the segment list, the scheduler, the
//! selector, and the counter would make a long-running `sync()` block
//! every other manager operation. This crate instead gives each shared
//! collaborator ([`TaskScheduler`], [`BackupSelector`], the counter) its
//! own `parking_lot::Mutex`, with one further mutex here for the manager's
//! own bookkeeping (the segment list and directory). `sync()`/`close()`
//! only ever touch the scheduler's own lock in their suspension loop
//! (see `embervault_replica::ReplicatedSegment::sync`), so a long-running
//! sync never blocks unrelated manager operations, reached by composing
//! several fine-grained locks (the idiomatic Rust shape) instead of
//! holding one coarse lock open across an arbitrarily long suspension.

use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::Arc;

use bytes::Bytes;
use embervault_config::ReplicaManagerConfig;
use embervault_directory::{ChangeEvent, ServerDirectory};
use embervault_placement::{BackupSelector, BackupStats};
use embervault_replica::ReplicatedSegment;
use embervault_rpc::BackupTransport;
use embervault_scheduler::TaskScheduler;
use embervault_types::{ServerEntry, ServerId};
use parking_lot::Mutex;
use tracing::{debug, info};

/// The transport's maximum single-write payload, absent a more specific
/// transport-level negotiation: writes are capped at the transport's
/// max payload.
pub const DEFAULT_MAX_WRITE_CHUNK_BYTES: usize = 1 << 20;

/// An opaque, non-owning reference to a live segment: the log holds
/// this handle only until it calls `free`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentHandle(usize);

struct Bookkeeping {
    config: ReplicaManagerConfig,
    master_id: ServerId,
    directory: ServerDirectory,
    membership_tracker: Arc<Mutex<embervault_directory::ChangeTracker<()>>>,
    segments: Vec<Option<Arc<ReplicatedSegment>>>,
    last_segment: Option<Arc<ReplicatedSegment>>,
}

/// Owns everything a storage master's replication needs: the segment
/// list, the backup selector, the task scheduler, and the admission
/// counter.
pub struct ReplicaManager {
    bookkeeping: Mutex<Bookkeeping>,
    scheduler: Arc<Mutex<TaskScheduler>>,
    selector: Arc<Mutex<BackupSelector>>,
    transport: Arc<dyn BackupTransport>,
    write_rpcs_in_flight: Arc<AtomicUsize>,
    max_write_chunk: usize,
    shutdown: Arc<AtomicBool>,
}

impl ReplicaManager {
    /// Builds a manager for `master_id`, using `transport` for backup
    /// RPCs, with the transport's max write chunk set to
    /// [`DEFAULT_MAX_WRITE_CHUNK_BYTES`].
    #[must_use]
    pub fn new(master_id: ServerId, config: ReplicaManagerConfig, transport: Arc<dyn BackupTransport>) -> Self {
        Self::with_max_write_chunk(master_id, config, transport, DEFAULT_MAX_WRITE_CHUNK_BYTES)
    }

    /// Like [`new`](Self::new), but with an explicit max write chunk
    /// (tests use a small value to exercise multi-chunk writes
    /// deterministically).
    #[must_use]
    pub fn with_max_write_chunk(
        master_id: ServerId,
        config: ReplicaManagerConfig,
        transport: Arc<dyn BackupTransport>,
        max_write_chunk: usize,
    ) -> Self {
        let mut directory = ServerDirectory::new();
        let stats_tracker = directory.subscribe::<BackupStats>();
        let membership_tracker = directory.subscribe::<()>();
        Self {
            bookkeeping: Mutex::new(Bookkeeping {
                config: config.clone(),
                master_id,
                directory,
                membership_tracker,
                segments: Vec::new(),
                last_segment: None,
            }),
            scheduler: Arc::new(Mutex::new(TaskScheduler::new())),
            selector: Arc::new(Mutex::new(BackupSelector::new(stats_tracker, &config))),
            transport,
            write_rpcs_in_flight: Arc::new(AtomicUsize::new(0)),
            max_write_chunk,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Authoritatively adds a server to this process's directory view
    /// (stands in for a coordinator push in these tests/embeddings; a
    /// real deployment feeds this from `CoordinatorTransport`-driven
    /// membership updates).
    pub fn apply_server_added(&self, entry: ServerEntry) {
        self.bookkeeping.lock().directory.apply_added(entry);
    }

    /// Authoritatively removes a server from this process's directory
    /// view. Any live segment with a replica on `id` regresses to
    /// UNASSIGNED on the next `proceed()`.
    pub fn apply_server_removed(&self, id: ServerId) {
        self.bookkeeping.lock().directory.apply_removed(id);
    }

    /// Allocates a segment for `segment_id`, carrying `open_len` bytes of
    /// `data`, linked after the previously-opened segment for this
    /// master, and schedules it. Never suspends.
    pub fn open_segment(&self, segment_id: embervault_types::SegmentId, data: Bytes, open_len: u64) -> SegmentHandle {
        let mut bookkeeping = self.bookkeeping.lock();
        let predecessor = bookkeeping.last_segment.clone();
        let num_replicas = bookkeeping.config.num_replicas as usize;
        let max_write_rpcs_in_flight = bookkeeping.config.max_write_rpcs_in_flight;
        let master_id = bookkeeping.master_id;

        let segment = ReplicatedSegment::new(
            segment_id,
            master_id,
            data,
            open_len,
            num_replicas,
            predecessor,
            self.scheduler.clone(),
            self.selector.clone(),
            self.transport.clone(),
            self.write_rpcs_in_flight.clone(),
            max_write_rpcs_in_flight,
            self.max_write_chunk,
            self.shutdown.clone(),
        );
        let task_handle = self.scheduler.lock().register(segment.clone());
        segment.set_self_handle(task_handle);

        let index = bookkeeping.segments.len();
        bookkeeping.segments.push(Some(segment.clone()));
        bookkeeping.last_segment = Some(segment);
        info!(%segment_id, index, "segment opened");
        SegmentHandle(index)
    }

    fn segment(&self, handle: SegmentHandle) -> Arc<ReplicatedSegment> {
        self.bookkeeping
            .lock()
            .segments
            .get(handle.0)
            .and_then(Option::clone)
            .expect("segment handle used after free or never allocated")
    }

    /// Informs the segment of newly-appended data.
    pub fn append(&self, handle: SegmentHandle, data: Bytes, committed_length: u64) {
        self.segment(handle).append(data, committed_length);
    }

    /// Sets the segment's close flag.
    pub fn close(&self, handle: SegmentHandle) {
        self.segment(handle).close();
    }

    /// Cooperatively blocks until every replica's cursor reaches `length`.
    /// Runs the manager's own `proceed()` in the same loop so
    /// membership-driven invalidations and selector bookkeeping keep
    /// advancing alongside the segment's own scheduling rounds.
    pub fn sync(&self, handle: SegmentHandle, length: u64) {
        let segment = self.segment(handle);
        loop {
            self.proceed();
            if segment.snapshot().iter().all(|r| r.cursor >= length) {
                return;
            }
            if self.shutdown.load(std::sync::atomic::Ordering::Acquire) {
                return;
            }
            self.scheduler.lock().proceed();
            std::thread::yield_now();
        }
    }

    /// Cooperatively blocks until every replica reaches CLOSED. Intended
    /// to follow [`close`](Self::close).
    pub fn sync_closed(&self, handle: SegmentHandle) {
        let segment = self.segment(handle);
        loop {
            self.proceed();
            if segment
                .snapshot()
                .iter()
                .all(|r| r.state == embervault_replica::ReplicaSubState::Closed)
            {
                return;
            }
            if self.shutdown.load(std::sync::atomic::Ordering::Acquire) {
                return;
            }
            self.scheduler.lock().proceed();
            std::thread::yield_now();
        }
    }

    /// Marks the segment freed; permitted mid-write.
    pub fn free(&self, handle: SegmentHandle) {
        self.segment(handle).free();
    }

    /// Drains pending membership events, runs the selector's own
    /// tracker-change drain, advances the scheduler one round, and
    /// destroys any segment that has reached full-FREED.
    pub fn proceed(&self) {
        let mut bookkeeping = self.bookkeeping.lock();
        while let Some((id, event)) = bookkeeping.membership_tracker.lock().get_change() {
            if event == ChangeEvent::Removed {
                for segment in bookkeeping.segments.iter().flatten() {
                    segment.invalidate_backup(id);
                }
            }
        }
        drop(bookkeeping);

        self.selector.lock().apply_tracker_changes();
        self.scheduler.lock().proceed();
        self.destroy_freed_segments();
    }

    /// Calls [`proceed`](Self::proceed) repeatedly until the scheduler is
    /// idle and no further destruction sweep finds new FREED segments.
    pub fn proceed_all(&self) {
        loop {
            self.proceed();
            let idle = self.scheduler.lock().is_idle();
            let none_freed = self
                .bookkeeping
                .lock()
                .segments
                .iter()
                .flatten()
                .all(|s| !s.is_fully_freed());
            if idle && none_freed {
                return;
            }
        }
    }

    fn destroy_freed_segments(&self) {
        let mut bookkeeping = self.bookkeeping.lock();
        for slot in &mut bookkeeping.segments {
            let Some(segment) = slot else { continue };
            if segment.is_fully_freed() {
                debug!(segment_id = %segment.segment_id(), "segment fully freed, destroying");
                if let Some(task_handle) = segment.task_handle() {
                    self.scheduler.lock().unregister(task_handle);
                }
                *slot = None;
            }
        }
    }

    /// Number of segments still tracked (freed segments are removed by
    /// [`proceed`](Self::proceed) once fully FREED).
    #[must_use]
    pub fn live_segment_count(&self) -> usize {
        self.bookkeeping.lock().segments.iter().flatten().count()
    }

    /// Requests process-wide shutdown: every in-progress `sync` call
    /// returns immediately rather than continuing to wait.
    pub fn shutdown(&self) {
        self.shutdown.store(true, std::sync::atomic::Ordering::Release);
    }

    /// Current count of outstanding write RPCs across every segment this
    /// manager owns (`writeRpcsInFlight`), for observability.
    #[must_use]
    pub fn write_rpcs_in_flight(&self) -> usize {
        self.write_rpcs_in_flight.load(std::sync::atomic::Ordering::Acquire)
    }

    /// The local directory's current version, for a failure detector
    /// running on its own thread to compare against a peer's reported
    /// view.
    #[must_use]
    pub fn directory_version(&self) -> u64 {
        self.bookkeeping.lock().directory.version()
    }
}
