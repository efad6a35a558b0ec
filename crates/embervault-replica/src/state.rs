//! Per-replica sub-state machine.

use embervault_rpc::RpcHandle;
use embervault_types::ServerId;
use serde::Serialize;

/// The lifecycle of a single replica slot.
///
/// `UNASSIGNED` is reachable from every other state: an RPC failure, or
/// the current backup being reported removed, regresses the slot here
/// unconditionally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReplicaSubState {
    Unassigned,
    Opening,
    OpenAcked,
    Writing,
    WriteAcked,
    Closing,
    Closed,
    Freeing,
    Freed,
}

/// What an in-flight RPC will do to the replica's bookkeeping on success.
#[derive(Debug, Clone, Copy)]
pub enum RpcKind {
    Open { open_len: u64 },
    Write { new_cursor: u64, was_close: bool },
    Free,
}

/// One replica slot of a [`super::ReplicatedSegment`].
pub struct Replica {
    pub backup: ServerId,
    pub cursor: u64,
    pub state: ReplicaSubState,
    /// Slot 0 is always the primary; the role travels with the slot
    /// index, not with whichever backup currently fills it.
    pub is_primary_slot: bool,
    pub in_flight: Option<(RpcKind, RpcHandle<()>)>,
}

impl Replica {
    pub fn new(is_primary_slot: bool) -> Self {
        Self {
            backup: ServerId::INVALID,
            cursor: 0,
            state: ReplicaSubState::Unassigned,
            is_primary_slot,
            in_flight: None,
        }
    }

    /// Whether this slot has reached or passed CLOSED (used by a
    /// successor segment's predecessor-ordering check).
    pub fn is_closed_or_later(&self) -> bool {
        matches!(
            self.state,
            ReplicaSubState::Closed | ReplicaSubState::Freeing | ReplicaSubState::Freed
        )
    }
}

/// A point-in-time view of one replica slot, for logging and tests.
#[derive(Debug, Clone, Serialize)]
pub struct ReplicaSnapshot {
    pub backup: ServerId,
    pub cursor: u64,
    pub state: ReplicaSubState,
    pub is_primary_slot: bool,
}

impl From<&Replica> for ReplicaSnapshot {
    fn from(replica: &Replica) -> Self {
        Self {
            backup: replica.backup,
            cursor: replica.cursor,
            state: replica.state,
            is_primary_slot: replica.is_primary_slot,
        }
    }
}
