//! Backup selector: placement policy for replica slots.
//!
//! Consumes [`embervault_directory::ChangeTracker`] events, maintains
//! per-backup load statistics, and answers `choose_primary`/
//! `choose_secondary` under the load-balancing and uniqueness
//! constraints a replica placer must respect. Candidate ranking follows
//! the per-peer stats-map
//! style of `kimberlite-vsr/src/repair_budget.rs` (route to the
//! least-loaded peer, bounded retries, fall back rather than stall
//! forever).

use std::collections::HashSet;
use std::sync::Arc;

use embervault_config::ReplicaManagerConfig;
use embervault_directory::ChangeTracker;
use embervault_types::{ServerId, ServiceMask};
use parking_lot::Mutex;
use rand::seq::IteratorRandom;
use tracing::warn;

/// Default assumed read throughput for a backup that hasn't advertised
/// one yet.
const DEFAULT_READ_MBYTES_PER_SEC: f64 = 100.0;

/// Number of candidate-resample rounds attempted before the
/// primary-uniqueness constraint is relaxed.
const MAX_RESAMPLE_ROUNDS: u32 = 4;

/// Per-backup load statistics.
///
/// Owned exclusively by the [`BackupSelector`] as the annotation attached
/// to each backup's change-tracker slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackupStats {
    /// Number of primary replicas currently placed on this backup.
    pub primary_replica_count: u32,
    /// Expected sustained read throughput, in MB/s, used to rank
    /// candidates by expected recovery-read latency.
    pub expected_read_mbytes_per_sec: f64,
}

impl BackupStats {
    fn new(expected_read_mbytes_per_sec: f64) -> Self {
        Self {
            primary_replica_count: 0,
            expected_read_mbytes_per_sec,
        }
    }

    /// `primaryReplicaCount * segmentBytes / expectedReadMBytesPerSec`:
    /// the expected wall-clock time to recover every primary currently
    /// hosted here, used to rank candidates least-loaded first.
    fn expected_read_time(&self, segment_bytes: u64) -> f64 {
        let bytes = segment_bytes as f64;
        (f64::from(self.primary_replica_count) * bytes) / self.expected_read_mbytes_per_sec.max(f64::EPSILON)
    }
}

/// Decodes the advertised read throughput carried in a directory entry's
/// opaque `user_data` payload: thousandths of a MB/s, or the default if
/// unset. The core directory/tracker never interprets this field; only
/// the placement layer does.
fn read_mbytes_per_sec(user_data: u64) -> f64 {
    if user_data == 0 {
        DEFAULT_READ_MBYTES_PER_SEC
    } else {
        user_data as f64 / 1000.0
    }
}

/// Picks backups for replica slots, balancing load and respecting
/// placement constraints.
///
/// One instance per master/log: `primaries_in_use` tracks which backups
/// currently host *this* master's primaries, enforcing primary
/// uniqueness without needing a cluster-wide view.
pub struct BackupSelector {
    tracker: Arc<Mutex<ChangeTracker<BackupStats>>>,
    primaries_in_use: HashSet<ServerId>,
    power_of_k_choices: u32,
}

impl BackupSelector {
    /// Builds a selector over the given tracker (typically
    /// `directory.subscribe::<BackupStats>()`).
    #[must_use]
    pub fn new(tracker: Arc<Mutex<ChangeTracker<BackupStats>>>, config: &ReplicaManagerConfig) -> Self {
        Self {
            tracker,
            primaries_in_use: HashSet::new(),
            power_of_k_choices: config.power_of_k_choices.max(1),
        }
    }

    /// Drains pending tracker changes, annotating newly-added backups
    /// with fresh stats and letting the tracker clear annotations for
    /// removed ones.
    pub fn apply_tracker_changes(&mut self) {
        let mut tracker = self.tracker.lock();
        while let Some((id, event)) = tracker.get_change() {
            match event {
                embervault_directory::ChangeEvent::Added => {
                    let read_mbps = tracker
                        .details(id)
                        .map(|entry| read_mbytes_per_sec(entry.user_data))
                        .unwrap_or(DEFAULT_READ_MBYTES_PER_SEC);
                    if let Ok(slot) = tracker.annotation_mut(id) {
                        *slot = Some(BackupStats::new(read_mbps));
                    }
                }
                embervault_directory::ChangeEvent::Removed => {
                    self.primaries_in_use.remove(&id);
                }
            }
        }
    }

    /// Releases bookkeeping for a primary replica that regressed away
    /// from `backup` (on RPC failure or backup removal), so a future
    /// placement decision doesn't treat `backup` as still hosting it.
    /// Without this, `primary_replica_count` and `primaries_in_use` would
    /// grow unboundedly under churn.
    pub fn release_primary(&mut self, backup: ServerId) {
        self.primaries_in_use.remove(&backup);
        let mut tracker = self.tracker.lock();
        if let Ok(Some(stats)) = tracker.annotation_mut(backup) {
            stats.primary_replica_count = stats.primary_replica_count.saturating_sub(1);
        }
    }

    /// Chooses a backup for a primary replica slot.
    ///
    /// Returns [`ServerId::INVALID`] only when the directory currently
    /// has no `BACKUP`-service entry at all; a caller treats that as "no
    /// candidate yet" and polls again from the scheduler on a later
    /// turn, rather than busy-looping inline.
    pub fn choose_primary(&mut self, exclude: &HashSet<ServerId>, segment_bytes: u64) -> ServerId {
        self.apply_tracker_changes();
        let tracker = self.tracker.lock();
        let candidates: Vec<ServerId> = tracker.present_with_service(ServiceMask::BACKUP).collect();
        drop(tracker);
        if candidates.is_empty() {
            return ServerId::INVALID;
        }

        let mut rng = rand::thread_rng();
        for round in 0..MAX_RESAMPLE_ROUNDS {
            let enforce_uniqueness = round + 1 < MAX_RESAMPLE_ROUNDS;
            let sample: Vec<ServerId> = candidates
                .iter()
                .copied()
                .filter(|id| !exclude.contains(id))
                .filter(|id| !enforce_uniqueness || !self.primaries_in_use.contains(id))
                .choose_multiple(&mut rng, self.power_of_k_choices as usize);

            if let Some(chosen) = self.best_by_read_time(&sample, segment_bytes) {
                if !enforce_uniqueness {
                    warn!(
                        backup = %chosen,
                        "relaxed primary-uniqueness constraint after exhausting resamples"
                    );
                }
                self.primaries_in_use.insert(chosen);
                let mut tracker = self.tracker.lock();
                if let Ok(Some(stats)) = tracker.annotation_mut(chosen) {
                    stats.primary_replica_count += 1;
                }
                return chosen;
            }
        }

        // Every backup is either excluded or already in use, and relaxing
        // the constraint didn't help either: give the scheduler something
        // to retry against on the next round rather than stalling.
        ServerId::INVALID
    }

    fn best_by_read_time(&self, sample: &[ServerId], segment_bytes: u64) -> Option<ServerId> {
        let tracker = self.tracker.lock();
        sample
            .iter()
            .copied()
            .filter_map(|id| {
                let stats = tracker.annotation(id).ok().and_then(|a| *a)?;
                Some((id, stats.expected_read_time(segment_bytes)))
            })
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(id, _)| id)
    }

    /// Chooses a backup for a secondary replica slot: uniform-random
    /// over eligible backups, rejecting `exclude`. Does not update load
    /// statistics: only primaries count toward `primaryReplicaCount`.
    pub fn choose_secondary(&mut self, exclude: &HashSet<ServerId>) -> ServerId {
        self.apply_tracker_changes();
        let tracker = self.tracker.lock();
        let mut rng = rand::thread_rng();
        tracker
            .present_with_service(ServiceMask::BACKUP)
            .filter(|id| !exclude.contains(id))
            .choose(&mut rng)
            .unwrap_or(ServerId::INVALID)
    }
}
