//! External RPC interfaces.
//!
//! The replica state machine never blocks on these: every call returns
//! an [`RpcHandle`] immediately ("fire-and-track"), and the
//! caller polls it on a later scheduler round. The concrete transport
//! (real sockets) lives outside this crate; [`fake`] provides a
//! deterministic, manually-driven transport used by tests, in the same
//! spirit as `kimberlite-kernel::runtime`'s `NoOpNetwork`/simulation
//! fakes — completion order is controlled by the test, not by wall-clock
//! timing, so scenarios like "backup removed mid-write" are
//! reproducible.

pub mod fake;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use embervault_types::{SegmentId, ServerEntry, ServerId};
use parking_lot::Mutex;
use thiserror::Error;

/// Errors an RPC call can resolve to.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// The RPC's transport-level deadline expired. Treated identically
    /// to a transport failure.
    #[error("RPC timed out")]
    Timeout,

    /// A transport-layer failure (connection reset, peer unreachable).
    #[error("transport error: {0}")]
    Transport(String),

    /// `open` was sent for a segment the backup already has open.
    #[error("segment already open on backup")]
    SegmentAlreadyOpen,

    /// `write` was sent for a segment the backup doesn't have open.
    #[error("segment not open on backup")]
    SegmentNotOpen,

    /// `write` arrived with a byte offset the backup didn't expect.
    #[error("write arrived out of order")]
    SegmentOutOfOrder,

    /// The targeted peer is not presently known (a stale-id race with a
    /// concurrent membership update). Treated as a non-error, to be
    /// skipped rather than retried.
    #[error("stale server id: {0}")]
    StaleIdentity(ServerId),

    /// The coordinator could not be reached at all.
    #[error("coordinator unavailable")]
    CoordinatorUnavailable,
}

/// Result type for RPC calls.
pub type RpcResult<T> = std::result::Result<T, RpcError>;

type Slot<T> = Arc<Mutex<Option<RpcResult<T>>>>;

/// A non-blocking handle to an in-flight RPC.
///
/// `poll` never blocks; it returns `None` until the transport resolves
/// the call, then the resolution exactly once.
pub struct RpcHandle<T> {
    slot: Slot<T>,
}

impl<T> RpcHandle<T> {
    fn new() -> (Self, Slot<T>) {
        let slot = Arc::new(Mutex::new(None));
        (
            Self {
                slot: slot.clone(),
            },
            slot,
        )
    }

    /// Takes the result if the RPC has resolved, without blocking.
    pub fn poll(&self) -> Option<RpcResult<T>> {
        self.slot.lock().take()
    }

    /// True if a result is ready to be taken.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.slot.lock().is_some()
    }
}

/// The three RPC verbs a replica manager sends to a backup, each
/// implicitly scoped to `(master_id, segment_id)`.
pub trait BackupTransport: Send + Sync {
    /// Opens a segment on `backup`, carrying its first `bytes`.
    fn open(
        &self,
        backup: ServerId,
        master: ServerId,
        segment: SegmentId,
        bytes: Bytes,
        is_primary: bool,
    ) -> RpcHandle<()>;

    /// Writes the next chunk of a segment already open on `backup`.
    fn write(
        &self,
        backup: ServerId,
        master: ServerId,
        segment: SegmentId,
        offset: u64,
        bytes: Bytes,
        close_flag: bool,
    ) -> RpcHandle<()>;

    /// Frees a segment on `backup`. Idempotent on the backup side.
    fn free(&self, backup: ServerId, master: ServerId, segment: SegmentId) -> RpcHandle<()>;
}

/// The RPCs a replica manager sends to the coordinator.
pub trait CoordinatorTransport: Send + Sync {
    /// Registers this process with the coordinator, returning its
    /// assigned [`ServerId`].
    fn enlist(
        &self,
        services: embervault_types::ServiceMask,
        locator: String,
        read_speed_mb: f64,
        write_speed_mb: f64,
    ) -> RpcHandle<ServerId>;

    /// Hints that `id` may be down (on probe timeout).
    fn hint_server_down(&self, id: ServerId) -> RpcHandle<()>;

    /// Requests a fresh full server list push, on sustained directory
    /// staleness.
    fn request_server_list(&self, id: ServerId) -> RpcHandle<Vec<ServerEntry>>;
}

/// A successful ping round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingReply {
    /// The nonce sent, echoed back, used to guard against stale replies.
    pub echoed_nonce: u64,
    /// The peer's view of the directory version.
    pub server_list_version: u64,
}

/// The membership/ping RPC.
pub trait PingTransport: Send + Sync {
    /// Pings `peer`, returning its echoed nonce and directory version.
    fn ping(&self, peer: ServerId, nonce: u64, timeout: Duration) -> RpcHandle<PingReply>;
}
