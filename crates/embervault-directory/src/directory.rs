//! The local, eventually-consistent mirror of the coordinator's
//! authoritative server list.

use std::sync::Arc;

use embervault_types::{ServerEntry, ServerId};
use parking_lot::Mutex;
use tracing::debug;

use crate::tracker::{ChangeEvent, ChangeTracker};

/// Anything that can receive directory mutation notifications.
///
/// Implemented for `Mutex<ChangeTracker<A>>` so a [`ServerDirectory`] can
/// hold a homogeneous list of subscribers despite each tracker carrying a
/// different annotation type. `enqueue` on the tracker is safe to call
/// from any thread ("thread-safe enqueue"), since the mutex
/// serializes access.
trait Subscriber: Send + Sync {
    fn notify(&self, entry: &ServerEntry, event: ChangeEvent);
}

impl<A: Send> Subscriber for Mutex<ChangeTracker<A>> {
    fn notify(&self, entry: &ServerEntry, event: ChangeEvent) {
        self.lock().enqueue(entry, event);
    }
}

/// The cluster-wide roster of server entries.
///
/// Dense-indexed by [`ServerId::index`] with generation tags so that a
/// reused slot can never be confused with a server that previously
/// occupied it. `version()` advances on every authoritative change,
/// feeding the failure detector's staleness check.
pub struct ServerDirectory {
    slots: Vec<Option<ServerEntry>>,
    version: u64,
    subscribers: Vec<Arc<dyn Subscriber>>,
}

impl Default for ServerDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerDirectory {
    /// Creates an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            version: 0,
            subscribers: Vec::new(),
        }
    }

    /// The directory's version; advances by one on every `apply_added`
    /// or `apply_removed`.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The entry currently occupying `id`'s slot, if any and if the
    /// generation still matches.
    #[must_use]
    pub fn get(&self, id: ServerId) -> Option<&ServerEntry> {
        self.slots
            .get(id.index() as usize)
            .and_then(|s| s.as_ref())
            .filter(|entry| entry.id() == id)
    }

    /// Registers a new subscriber tracker and replays the current roster
    /// into it as a burst of `Added` events, so a late subscriber
    /// observes the same eventual state as one registered at startup.
    #[must_use]
    pub fn subscribe<A: Send + 'static>(&mut self) -> Arc<Mutex<ChangeTracker<A>>> {
        let tracker = Arc::new(Mutex::new(ChangeTracker::<A>::new()));
        {
            let mut guard = tracker.lock();
            for entry in self.slots.iter().flatten() {
                guard.enqueue(entry, ChangeEvent::Added);
            }
        }
        self.subscribers.push(tracker.clone());
        tracker
    }

    /// Applies an authoritative `ADDED` push from the coordinator.
    pub fn apply_added(&mut self, entry: ServerEntry) {
        let id = entry.id();
        let index = id.index() as usize;
        if self.slots.len() <= index {
            self.slots.resize_with(index + 1, || None);
        }
        self.slots[index] = Some(entry.clone());
        self.version += 1;
        debug!(server = %id, version = self.version, "server added");
        for subscriber in &self.subscribers {
            subscriber.notify(&entry, ChangeEvent::Added);
        }
    }

    /// Applies an authoritative `REMOVED` push from the coordinator.
    ///
    /// A stale id (already gone, or a generation mismatch) is a no-op:
    /// membership races are expected, not errors.
    pub fn apply_removed(&mut self, id: ServerId) {
        let index = id.index() as usize;
        let Some(slot) = self.slots.get_mut(index) else {
            return;
        };
        let Some(entry) = slot.take_if(|e| e.id() == id) else {
            return;
        };
        self.version += 1;
        debug!(server = %id, version = self.version, "server removed");
        for subscriber in &self.subscribers {
            subscriber.notify(&entry, ChangeEvent::Removed);
        }
    }

    /// Replaces the roster wholesale, as happens after a fresh
    /// `request_server_list` push. Diffs against the current roster so
    /// subscribers still see individual `Added`/`Removed` events rather
    /// than a reset.
    pub fn apply_full_list(&mut self, entries: Vec<ServerEntry>) {
        let incoming_ids: std::collections::HashSet<ServerId> =
            entries.iter().map(ServerEntry::id).collect();
        let stale: Vec<ServerId> = self
            .slots
            .iter()
            .flatten()
            .map(ServerEntry::id)
            .filter(|id| !incoming_ids.contains(id))
            .collect();
        for id in stale {
            self.apply_removed(id);
        }
        for entry in entries {
            if self.get(entry.id()) != Some(&entry) {
                self.apply_added(entry);
            }
        }
    }
}
