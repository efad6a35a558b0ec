//! Embervault: segment replication for an in-memory storage master.
//!
//! This crate is the assembly point, mirroring the role `kimberlite`
//! plays for its own subsystem crates: it re-exports the public surface
//! of [`embervault_manager`], [`embervault_replica`], [`embervault_rpc`],
//! [`embervault_placement`], [`embervault_scheduler`], [`embervault_directory`],
//! [`embervault_config`], [`embervault_types`], and [`embervault_detector`]
//! so a caller depends on one crate, and adds the small amount of glue a
//! real process needs to run a [`ReplicaManager`] and a [`FailureDetector`]
//! side by side without sharing a lock.

pub use embervault_config::{Error as ConfigError, ReplicaManagerConfig};
pub use embervault_detector::{AtomicDirectoryVersion, DirectoryVersion, FailureDetector};
pub use embervault_directory::{ChangeEvent, ChangeTracker, Error as DirectoryError, ServerDirectory};
pub use embervault_manager::{ReplicaManager, SegmentHandle, DEFAULT_MAX_WRITE_CHUNK_BYTES};
pub use embervault_placement::{BackupSelector, BackupStats};
pub use embervault_replica::{Replica, ReplicaSnapshot, ReplicaSubState, ReplicatedSegment};
pub use embervault_rpc::{
    fake, BackupTransport, CoordinatorTransport, PingReply, PingTransport, RpcError, RpcHandle, RpcResult,
};
pub use embervault_scheduler::{Task, TaskHandle, TaskScheduler};
pub use embervault_types::{SegmentId, ServerEntry, ServerId, ServiceMask};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Copies a [`ReplicaManager`]'s directory version into an
/// [`AtomicDirectoryVersion`] on a fixed interval, on a dedicated thread.
///
/// A [`FailureDetector`] needs to read the local directory version, but
/// the manager's bookkeeping lock must never be shared with the
/// detector's thread. This bridge is the cheapest glue that satisfies
/// both: it takes the manager's lock only for the instant of the read,
/// the same way any other `proceed()` caller would.
pub fn spawn_directory_version_bridge(
    manager: Arc<ReplicaManager>,
    version: Arc<AtomicDirectoryVersion>,
    poll_interval: Duration,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("embervault-directory-version-bridge".to_string())
        .spawn(move || {
            while !shutdown.load(Ordering::Acquire) {
                version.set(manager.directory_version());
                std::thread::sleep(poll_interval);
            }
        })
        .expect("failed to spawn directory-version bridge thread")
}
