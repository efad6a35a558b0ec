//! The replicated-segment state machine.
//!
//! A [`ReplicatedSegment`] drives its replicas' `open`/`write`/`free`
//! RPCs to ground truth: the master's log tells it about new committed
//! bytes via [`ReplicatedSegment::append`], and the segment pushes those
//! bytes out to its backups as a [`embervault_scheduler::Task`], without
//! ever blocking the caller on network I/O. Grounded on the per-replica
//! step function of `kimberlite-vsr/src/replica/{mod.rs,state.rs,normal.rs}`.

mod segment;
mod state;

pub use segment::ReplicatedSegment;
pub use state::{Replica, ReplicaSnapshot, ReplicaSubState};
