//! Deterministic, manually-driven transport implementations for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use embervault_types::{SegmentId, ServerEntry, ServerId, ServiceMask};
use parking_lot::Mutex;

use crate::{BackupTransport, CoordinatorTransport, PingReply, PingTransport, RpcError, RpcHandle, RpcResult};

/// A backup RPC as observed by the fake transport, for assertions.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCall {
    /// An `open` RPC.
    Open {
        backup: ServerId,
        segment: SegmentId,
        bytes: Bytes,
        is_primary: bool,
    },
    /// A `write` RPC.
    Write {
        backup: ServerId,
        segment: SegmentId,
        offset: u64,
        bytes: Bytes,
        close_flag: bool,
    },
    /// A `free` RPC.
    Free { backup: ServerId, segment: SegmentId },
}

impl RecordedCall {
    /// The backup this call targeted.
    #[must_use]
    pub fn backup(&self) -> ServerId {
        match self {
            RecordedCall::Open { backup, .. }
            | RecordedCall::Write { backup, .. }
            | RecordedCall::Free { backup, .. } => *backup,
        }
    }
}

type PendingSlot = Arc<Mutex<Option<RpcResult<()>>>>;

#[derive(Default)]
struct Inner {
    next_id: u64,
    pending: VecDeque<(u64, PendingSlot)>,
    log: Vec<RecordedCall>,
}

/// A fake backup transport whose calls complete only when the test
/// explicitly drives them with [`complete_next`](Self::complete_next) or
/// [`fail_next`](Self::fail_next). This lets tests reproduce exact
/// interleavings like "a backup acks one write, then is reported removed
/// before acking `close`".
#[derive(Default)]
pub struct FakeBackupTransport {
    inner: Mutex<Inner>,
}

impl FakeBackupTransport {
    /// Creates a transport with no recorded calls.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn issue(&self, call: RecordedCall) -> RpcHandle<()> {
        let (handle, slot) = RpcHandle::new();
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.log.push(call);
        inner.pending.push_back((id, slot));
        handle
    }

    /// Number of RPCs issued that have not yet been completed.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Resolves the oldest outstanding RPC with `Ok(())`.
    pub fn complete_next(&self) {
        self.resolve_next(Ok(()));
    }

    /// Resolves the oldest outstanding RPC with `err`.
    pub fn fail_next(&self, err: RpcError) {
        self.resolve_next(Err(err));
    }

    fn resolve_next(&self, result: RpcResult<()>) {
        let entry = self.inner.lock().pending.pop_front();
        if let Some((_, slot)) = entry {
            *slot.lock() = Some(result);
        }
    }

    /// A snapshot of every call issued so far, in issue order.
    #[must_use]
    pub fn log(&self) -> Vec<RecordedCall> {
        self.inner.lock().log.clone()
    }

    /// Every call issued so far targeting `backup`.
    #[must_use]
    pub fn log_for(&self, backup: ServerId) -> Vec<RecordedCall> {
        self.log().into_iter().filter(|c| c.backup() == backup).collect()
    }
}

impl BackupTransport for FakeBackupTransport {
    fn open(
        &self,
        backup: ServerId,
        _master: ServerId,
        segment: SegmentId,
        bytes: Bytes,
        is_primary: bool,
    ) -> RpcHandle<()> {
        self.issue(RecordedCall::Open {
            backup,
            segment,
            bytes,
            is_primary,
        })
    }

    fn write(
        &self,
        backup: ServerId,
        _master: ServerId,
        segment: SegmentId,
        offset: u64,
        bytes: Bytes,
        close_flag: bool,
    ) -> RpcHandle<()> {
        self.issue(RecordedCall::Write {
            backup,
            segment,
            offset,
            bytes,
            close_flag,
        })
    }

    fn free(&self, backup: ServerId, _master: ServerId, segment: SegmentId) -> RpcHandle<()> {
        self.issue(RecordedCall::Free { backup, segment })
    }
}

/// A fake coordinator transport: `enlist`/`hint_server_down` resolve
/// immediately; `request_server_list` returns whatever roster the test
/// last configured with [`set_server_list`](Self::set_server_list).
#[derive(Default)]
pub struct FakeCoordinatorTransport {
    next_enlist_id: Mutex<ServerId>,
    server_list: Mutex<Vec<ServerEntry>>,
    hints_received: Mutex<Vec<ServerId>>,
}

impl FakeCoordinatorTransport {
    /// Creates a transport that enlists as an invalid id until
    /// configured, with an empty server list.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_enlist_id: Mutex::new(ServerId::INVALID),
            server_list: Mutex::new(Vec::new()),
            hints_received: Mutex::new(Vec::new()),
        }
    }

    /// Sets the id `enlist` will hand back next.
    pub fn set_next_enlist_id(&self, id: ServerId) {
        *self.next_enlist_id.lock() = id;
    }

    /// Sets the roster `request_server_list` will hand back.
    pub fn set_server_list(&self, entries: Vec<ServerEntry>) {
        *self.server_list.lock() = entries;
    }

    /// Every id ever passed to `hint_server_down`, in order.
    #[must_use]
    pub fn hints_received(&self) -> Vec<ServerId> {
        self.hints_received.lock().clone()
    }
}

impl CoordinatorTransport for FakeCoordinatorTransport {
    fn enlist(
        &self,
        _services: ServiceMask,
        _locator: String,
        _read_speed_mb: f64,
        _write_speed_mb: f64,
    ) -> RpcHandle<ServerId> {
        let (handle, slot) = RpcHandle::new();
        *slot.lock() = Some(Ok(*self.next_enlist_id.lock()));
        handle
    }

    fn hint_server_down(&self, id: ServerId) -> RpcHandle<()> {
        self.hints_received.lock().push(id);
        let (handle, slot) = RpcHandle::new();
        *slot.lock() = Some(Ok(()));
        handle
    }

    fn request_server_list(&self, _id: ServerId) -> RpcHandle<Vec<ServerEntry>> {
        let (handle, slot) = RpcHandle::new();
        *slot.lock() = Some(Ok(self.server_list.lock().clone()));
        handle
    }
}

/// A fake ping transport whose replies are configured per-peer.
#[derive(Default)]
pub struct FakePingTransport {
    replies: Mutex<HashMap<ServerId, RpcResult<PingReply>>>,
}

impl FakePingTransport {
    /// Creates a transport with no configured peers (every ping is a
    /// stale-identity failure until configured).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures the reply (or failure) `peer` will return.
    pub fn set_reply(&self, peer: ServerId, reply: RpcResult<PingReply>) {
        self.replies.lock().insert(peer, reply);
    }
}

impl PingTransport for FakePingTransport {
    fn ping(&self, peer: ServerId, nonce: u64, _timeout: Duration) -> RpcHandle<PingReply> {
        let (handle, slot) = RpcHandle::new();
        let reply = self
            .replies
            .lock()
            .get(&peer)
            .cloned()
            .unwrap_or(Err(RpcError::StaleIdentity(peer)))
            .map(|mut reply| {
                reply.echoed_nonce = nonce;
                reply
            });
        *slot.lock() = Some(reply);
        handle
    }
}
