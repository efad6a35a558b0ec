//! The replicated-segment state machine.
//!
//! One [`ReplicatedSegment`] per open log segment, driven as a single
//! [`embervault_scheduler::Task`]: `perform()` polls each replica's
//! in-flight RPC, applies the transition it resolves to, and issues the
//! next RPC a replica slot needs, mirroring the FCIS step function shape
//! of `kimberlite-vsr/src/replica/mod.rs` (compute the next action from
//! current state, then hand it to the transport) without ever blocking
//! on I/O inline.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use embervault_placement::BackupSelector;
use embervault_rpc::{BackupTransport, RpcError};
use embervault_scheduler::{Task, TaskHandle, TaskScheduler};
use embervault_types::{SegmentId, ServerId};
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::state::{Replica, ReplicaSnapshot, ReplicaSubState, RpcKind};

struct Inner {
    segment_id: SegmentId,
    master_id: ServerId,
    data: Bytes,
    /// Bytes carried with the initial `open` RPC, fixed at construction
    /// ("first-open-bytes"); later growth travels only
    /// through `write` RPCs.
    initial_open_len: u64,
    committed_length: u64,
    close: bool,
    freed: bool,
    replicas: Vec<Replica>,
    predecessor: Option<Arc<ReplicatedSegment>>,
}

impl Inner {
    fn other_backups(&self, idx: usize) -> HashSet<ServerId> {
        self.replicas
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != idx)
            .map(|(_, r)| r.backup)
            .filter(|id| id.is_valid())
            .collect()
    }

    /// A successor's final write (the one carrying `close_flag`) must
    /// wait until its predecessor has closed on at least `num_replicas`
    /// backups. The head segment of a log has no predecessor and is
    /// always ready.
    fn predecessor_closed_enough(&self, num_replicas: usize) -> bool {
        match &self.predecessor {
            None => true,
            Some(predecessor) => predecessor.closed_replica_count() >= num_replicas,
        }
    }

    fn is_quiescent(&self) -> bool {
        if self.freed {
            return self.replicas.iter().all(|r| r.state == ReplicaSubState::Freed);
        }
        self.replicas.iter().all(|r| {
            r.in_flight.is_none()
                && r.state != ReplicaSubState::Unassigned
                && r.cursor == self.committed_length
                && (!self.close || r.state == ReplicaSubState::Closed)
        })
    }
}

/// Drives one log segment's replicas through open/write/close/free.
///
/// Registered with a [`TaskScheduler`] as a [`Task`]; the manager owning
/// it calls `set_self_handle` once after registration so `perform()` can
/// reschedule itself while work remains.
pub struct ReplicatedSegment {
    inner: Mutex<Inner>,
    scheduler: Arc<Mutex<TaskScheduler>>,
    selector: Arc<Mutex<BackupSelector>>,
    transport: Arc<dyn BackupTransport>,
    write_rpcs_in_flight: Arc<AtomicUsize>,
    max_write_rpcs_in_flight: u32,
    max_write_chunk: usize,
    num_replicas: usize,
    self_handle: Mutex<Option<TaskHandle>>,
    shutdown: Arc<AtomicBool>,
}

impl ReplicatedSegment {
    /// Creates a segment with `num_replicas` unassigned slots (slot 0 is
    /// the primary), carrying `open_len` bytes of `data` with the initial
    /// open RPC once backups are found.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        segment_id: SegmentId,
        master_id: ServerId,
        data: Bytes,
        open_len: u64,
        num_replicas: usize,
        predecessor: Option<Arc<ReplicatedSegment>>,
        scheduler: Arc<Mutex<TaskScheduler>>,
        selector: Arc<Mutex<BackupSelector>>,
        transport: Arc<dyn BackupTransport>,
        write_rpcs_in_flight: Arc<AtomicUsize>,
        max_write_rpcs_in_flight: u32,
        max_write_chunk: usize,
        shutdown: Arc<AtomicBool>,
    ) -> Arc<Self> {
        let replicas = (0..num_replicas).map(|i| Replica::new(i == 0)).collect();
        Arc::new(Self {
            inner: Mutex::new(Inner {
                segment_id,
                master_id,
                data,
                initial_open_len: open_len,
                committed_length: open_len,
                close: false,
                freed: false,
                replicas,
                predecessor,
            }),
            scheduler,
            selector,
            transport,
            write_rpcs_in_flight,
            max_write_rpcs_in_flight,
            max_write_chunk,
            num_replicas,
            self_handle: Mutex::new(None),
            shutdown,
        })
    }

    /// Must be called once, immediately after `scheduler.register(self)`,
    /// so `perform()` can reschedule itself.
    pub fn set_self_handle(&self, handle: TaskHandle) {
        *self.self_handle.lock() = Some(handle);
        self.scheduler.lock().schedule(handle);
    }

    /// The segment id this instance replicates.
    #[must_use]
    pub fn segment_id(&self) -> SegmentId {
        self.inner.lock().segment_id
    }

    /// This segment's registered scheduler handle, once
    /// [`set_self_handle`](Self::set_self_handle) has been called.
    #[must_use]
    pub fn task_handle(&self) -> Option<TaskHandle> {
        *self.self_handle.lock()
    }

    /// Informs the segment of newly-appended data. `committed_length`
    /// must be monotonically non-decreasing; callers violating this have
    /// a bug, not a recoverable error.
    pub fn append(&self, data: Bytes, committed_length: u64) {
        {
            let mut inner = self.inner.lock();
            assert!(
                committed_length >= inner.committed_length,
                "committed_length must not recede: {} -> {}",
                inner.committed_length,
                committed_length
            );
            inner.data = data;
            inner.committed_length = committed_length;
        }
        self.wake();
    }

    /// Marks the segment closed. Idempotent: never un-sets once true.
    /// Writes up to the current `committed_length` still need to land
    /// before any replica reaches CLOSED.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock();
            inner.close = true;
        }
        self.wake();
    }

    /// Marks the segment freed. Permitted at any point, including with
    /// replicas mid-write: any RPC in flight at the time is left to
    /// resolve on its own, but its result is discarded in favor of the
    /// free transition.
    pub fn free(&self) {
        {
            let mut inner = self.inner.lock();
            inner.freed = true;
        }
        self.wake();
    }

    /// Blocks the calling thread, cooperatively driving the scheduler,
    /// until every replica's cursor has reached at least `length`.
    /// Returns early on shutdown without that guarantee.
    pub fn sync(&self, length: u64) {
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return;
            }
            {
                let inner = self.inner.lock();
                if inner.replicas.iter().all(|r| r.cursor >= length) {
                    return;
                }
            }
            self.scheduler.lock().proceed();
            std::thread::yield_now();
        }
    }

    /// Like [`sync`](Self::sync), but waits for every replica to reach
    /// CLOSED (or beyond) rather than a byte offset. Intended to be
    /// called after [`close`](Self::close).
    pub fn sync_closed(&self) {
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return;
            }
            {
                let inner = self.inner.lock();
                if inner.replicas.iter().all(Replica::is_closed_or_later) {
                    return;
                }
            }
            self.scheduler.lock().proceed();
            std::thread::yield_now();
        }
    }

    /// Number of replicas that have reached CLOSED or beyond, for a
    /// successor segment's predecessor-ordering check.
    #[must_use]
    pub fn closed_replica_count(&self) -> usize {
        self.inner
            .lock()
            .replicas
            .iter()
            .filter(|r| r.is_closed_or_later())
            .count()
    }

    /// True once every replica has been freed.
    #[must_use]
    pub fn is_fully_freed(&self) -> bool {
        let inner = self.inner.lock();
        inner.freed && inner.replicas.iter().all(|r| r.state == ReplicaSubState::Freed)
    }

    /// A point-in-time snapshot of every replica slot, for logging/tests.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ReplicaSnapshot> {
        self.inner.lock().replicas.iter().map(ReplicaSnapshot::from).collect()
    }

    /// Invalidates every replica slot currently pointing at `backup`: a
    /// backup reported removed regresses its slot to UNASSIGNED even if
    /// its RPCs had already succeeded.
    pub fn invalidate_backup(&self, backup: ServerId) {
        let mut regressed = false;
        {
            let mut inner = self.inner.lock();
            for idx in 0..inner.replicas.len() {
                if inner.replicas[idx].backup == backup && inner.replicas[idx].state != ReplicaSubState::Freed {
                    let is_primary_slot = inner.replicas[idx].is_primary_slot;
                    inner.replicas[idx].in_flight = None;
                    inner.replicas[idx].backup = ServerId::INVALID;
                    inner.replicas[idx].cursor = 0;
                    inner.replicas[idx].state = ReplicaSubState::Unassigned;
                    if is_primary_slot {
                        self.selector.lock().release_primary(backup);
                    }
                    regressed = true;
                }
            }
        }
        if regressed {
            self.wake();
        }
    }

    fn wake(&self) {
        if let Some(handle) = *self.self_handle.lock() {
            self.scheduler.lock().schedule(handle);
        }
    }

    fn try_acquire_write_admission(&self) -> bool {
        let mut current = self.write_rpcs_in_flight.load(Ordering::Acquire);
        loop {
            if current >= self.max_write_rpcs_in_flight as usize {
                return false;
            }
            match self.write_rpcs_in_flight.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    fn release_write_admission(&self) {
        self.write_rpcs_in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    fn step_replica(&self, inner: &mut Inner, idx: usize) {
        if inner.freed && !matches!(inner.replicas[idx].state, ReplicaSubState::Freeing | ReplicaSubState::Freed) {
            self.force_free(inner, idx);
            return;
        }

        let outcome = match &inner.replicas[idx].in_flight {
            Some((kind, handle)) => handle.poll().map(|result| (*kind, result)),
            None => None,
        };
        if let Some((kind, result)) = outcome {
            inner.replicas[idx].in_flight = None;
            match result {
                Ok(()) => self.on_rpc_success(inner, idx, kind),
                Err(err) => self.on_rpc_failure(inner, idx, kind, err),
            }
        }

        self.maybe_issue(inner, idx);
    }

    fn force_free(&self, inner: &mut Inner, idx: usize) {
        let backup = inner.replicas[idx].backup;
        let is_primary_slot = inner.replicas[idx].is_primary_slot;
        inner.replicas[idx].in_flight = None;

        if !backup.is_valid() {
            inner.replicas[idx].state = ReplicaSubState::Freed;
            return;
        }
        if is_primary_slot {
            self.selector.lock().release_primary(backup);
        }
        inner.replicas[idx].state = ReplicaSubState::Freeing;
        let handle = self.transport.free(backup, inner.master_id, inner.segment_id);
        inner.replicas[idx].in_flight = Some((RpcKind::Free, handle));
    }

    fn on_rpc_success(&self, inner: &mut Inner, idx: usize, kind: RpcKind) {
        match kind {
            RpcKind::Open { open_len } => {
                inner.replicas[idx].cursor = open_len;
                inner.replicas[idx].state = ReplicaSubState::OpenAcked;
            }
            RpcKind::Write { new_cursor, was_close } => {
                self.release_write_admission();
                inner.replicas[idx].cursor = new_cursor;
                inner.replicas[idx].state = if was_close {
                    ReplicaSubState::Closed
                } else {
                    ReplicaSubState::WriteAcked
                };
            }
            RpcKind::Free => {
                inner.replicas[idx].state = ReplicaSubState::Freed;
            }
        }
    }

    fn on_rpc_failure(&self, inner: &mut Inner, idx: usize, kind: RpcKind, err: RpcError) {
        if matches!(kind, RpcKind::Write { .. }) {
            self.release_write_admission();
        }
        match err {
            RpcError::SegmentAlreadyOpen | RpcError::SegmentOutOfOrder | RpcError::SegmentNotOpen => {
                error!(
                    segment = %inner.segment_id,
                    backup = %inner.replicas[idx].backup,
                    %err,
                    "backup protocol violation: indicates a state-machine bug; recovering by reopening"
                );
            }
            _ => {
                debug!(segment = %inner.segment_id, backup = %inner.replicas[idx].backup, %err, "replica RPC failed, regressing to UNASSIGNED");
            }
        }

        let backup = inner.replicas[idx].backup;
        let is_primary_slot = inner.replicas[idx].is_primary_slot;
        inner.replicas[idx].backup = ServerId::INVALID;
        inner.replicas[idx].cursor = 0;
        inner.replicas[idx].state = ReplicaSubState::Unassigned;
        if is_primary_slot && backup.is_valid() {
            self.selector.lock().release_primary(backup);
        }
    }

    fn maybe_issue(&self, inner: &mut Inner, idx: usize) {
        if inner.replicas[idx].in_flight.is_some() {
            return;
        }
        match inner.replicas[idx].state {
            ReplicaSubState::Unassigned => self.issue_open(inner, idx),
            ReplicaSubState::OpenAcked | ReplicaSubState::WriteAcked => self.issue_write_or_close(inner, idx),
            ReplicaSubState::Opening
            | ReplicaSubState::Writing
            | ReplicaSubState::Closing
            | ReplicaSubState::Closed
            | ReplicaSubState::Freeing
            | ReplicaSubState::Freed => {}
        }
    }

    fn issue_open(&self, inner: &mut Inner, idx: usize) {
        let exclude = inner.other_backups(idx);
        let is_primary_slot = inner.replicas[idx].is_primary_slot;
        let chosen = {
            let mut selector = self.selector.lock();
            if is_primary_slot {
                selector.choose_primary(&exclude, inner.data.len() as u64)
            } else {
                selector.choose_secondary(&exclude)
            }
        };
        if !chosen.is_valid() {
            warn!(segment = %inner.segment_id, "no backup available for replica slot, will retry");
            return;
        }

        let open_len = inner.initial_open_len.min(inner.data.len() as u64);
        let bytes = inner.data.slice(0..open_len as usize);
        let handle = self.transport.open(chosen, inner.master_id, inner.segment_id, bytes, is_primary_slot);
        inner.replicas[idx].backup = chosen;
        inner.replicas[idx].state = ReplicaSubState::Opening;
        inner.replicas[idx].in_flight = Some((RpcKind::Open { open_len }, handle));
    }

    fn issue_write_or_close(&self, inner: &mut Inner, idx: usize) {
        let cursor = inner.replicas[idx].cursor;
        let backup = inner.replicas[idx].backup;

        if cursor < inner.committed_length {
            if !self.try_acquire_write_admission() {
                return;
            }
            let remaining = inner.committed_length - cursor;
            let chunk = remaining.min(self.max_write_chunk as u64);
            let new_cursor = cursor + chunk;
            let close_flag =
                new_cursor == inner.committed_length && inner.close && inner.predecessor_closed_enough(self.num_replicas);
            let bytes = inner.data.slice(cursor as usize..new_cursor as usize);
            let handle = self.transport.write(backup, inner.master_id, inner.segment_id, cursor, bytes, close_flag);
            inner.replicas[idx].state = ReplicaSubState::Writing;
            inner.replicas[idx].in_flight = Some((RpcKind::Write { new_cursor, was_close: close_flag }, handle));
        } else if inner.close && inner.predecessor_closed_enough(self.num_replicas) {
            if !self.try_acquire_write_admission() {
                return;
            }
            let handle = self.transport.write(backup, inner.master_id, inner.segment_id, cursor, Bytes::new(), true);
            inner.replicas[idx].state = ReplicaSubState::Closing;
            inner.replicas[idx].in_flight = Some((RpcKind::Write { new_cursor: cursor, was_close: true }, handle));
        }
    }
}

impl Task for ReplicatedSegment {
    fn perform(&self) {
        let mut inner = self.inner.lock();
        let count = inner.replicas.len();
        for idx in 0..count {
            self.step_replica(&mut inner, idx);
        }
        let busy = !inner.is_quiescent();
        drop(inner);

        if busy {
            self.wake();
        }
    }
}
