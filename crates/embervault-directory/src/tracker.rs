//! Per-subscriber view over directory mutations.

use std::collections::VecDeque;

use embervault_types::{ServerEntry, ServerId, ServiceMask};
use rand::seq::IteratorRandom;
use tracing::warn;

use crate::{Error, Result};

/// A directory mutation, as observed by a single subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeEvent {
    /// A server entry became visible.
    Added,
    /// A server entry is departing. The entry's identity and annotation
    /// remain queryable until the *next* [`ChangeTracker::get_change`]
    /// call after this event is drained.
    Removed,
}

struct Slot<A> {
    id: ServerId,
    entry: ServerEntry,
    annotation: Option<A>,
    /// False as soon as a `Removed` event has been enqueued for this
    /// slot, even though the slot data survives until consumption.
    present: bool,
}

/// A serialized, per-subscriber stream of [`ChangeEvent`]s plus a stable
/// dense index space for one opaque annotation per entry.
///
/// `size()` reflects only the portion of the stream the subscriber has
/// actually drained via [`get_change`](Self::get_change): it grows when an
/// `Added` event is popped and shrinks when a `Removed` event is popped,
/// never at `enqueue` time.
pub struct ChangeTracker<A> {
    slots: Vec<Option<Slot<A>>>,
    pending: VecDeque<(ServerId, ChangeEvent)>,
    /// Index whose slot must be cleared on the *next* `get_change`, left
    /// over from handing out a `Removed` event last call.
    clear_on_next: Option<usize>,
    size: usize,
    on_pending: Option<Box<dyn FnMut() + Send>>,
}

impl<A> Default for ChangeTracker<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> ChangeTracker<A> {
    /// Creates an empty tracker with no pending events.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            pending: VecDeque::new(),
            clear_on_next: None,
            size: 0,
            on_pending: None,
        }
    }

    /// Registers a callback invoked every time [`enqueue`](Self::enqueue)
    /// adds a new pending event.
    pub fn set_on_pending<F>(&mut self, callback: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.on_pending = Some(Box::new(callback));
    }

    /// Number of entries currently reflected in this subscriber's drained
    /// view (see the type-level semantic note on post-consumption size).
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Records a directory mutation for this subscriber.
    ///
    /// For `Added`, reserves (and immediately populates) the entry's dense
    /// slot so that lookups succeed even before the subscriber drains the
    /// event. For `Removed`, the slot is marked not-present for selection
    /// purposes but its data is retained until drained.
    pub fn enqueue(&mut self, entry: &ServerEntry, event: ChangeEvent) {
        let id = entry.id();
        let index = id.index() as usize;
        if self.slots.len() <= index {
            self.slots.resize_with(index + 1, || None);
        }
        match event {
            ChangeEvent::Added => {
                self.slots[index] = Some(Slot {
                    id,
                    entry: entry.clone(),
                    annotation: None,
                    present: true,
                });
            }
            ChangeEvent::Removed => {
                if let Some(slot) = self.slots[index].as_mut() {
                    if slot.id == id {
                        slot.present = false;
                    }
                }
            }
        }
        self.pending.push_back((id, event));
        if let Some(callback) = self.on_pending.as_mut() {
            callback();
        }
    }

    /// Pops the oldest pending event, if any.
    ///
    /// Handling a `Removed` event defers clearing its slot to the
    /// *following* call, so the event's own id/entry are still valid to
    /// inspect via [`details`](Self::details) immediately after this call
    /// returns it.
    pub fn get_change(&mut self) -> Option<(ServerId, ChangeEvent)> {
        if let Some(index) = self.clear_on_next.take() {
            if let Some(slot) = self.slots[index].as_ref() {
                if slot.annotation.is_some() {
                    warn!(
                        server_index = index,
                        "subscriber left a non-null annotation past REMOVED; clearing"
                    );
                }
            }
            self.slots[index] = None;
        }

        let (id, event) = self.pending.pop_front()?;
        match event {
            ChangeEvent::Added => self.size += 1,
            ChangeEvent::Removed => {
                self.size = self.size.saturating_sub(1);
                self.clear_on_next = Some(id.index() as usize);
            }
        }
        Some((id, event))
    }

    fn slot(&self, id: ServerId) -> Result<&Slot<A>> {
        self.slots
            .get(id.index() as usize)
            .and_then(|s| s.as_ref())
            .filter(|slot| slot.id == id)
            .ok_or(Error::UnknownServer(id))
    }

    fn slot_mut(&mut self, id: ServerId) -> Result<&mut Slot<A>> {
        self.slots
            .get_mut(id.index() as usize)
            .and_then(|s| s.as_mut())
            .filter(|slot| slot.id == id)
            .ok_or(Error::UnknownServer(id))
    }

    /// Mutable access to the annotation attached to `id`'s slot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownServer`] if `id` does not currently occupy
    /// a slot (including a generation mismatch against a reused index).
    pub fn annotation_mut(&mut self, id: ServerId) -> Result<&mut Option<A>> {
        Ok(&mut self.slot_mut(id)?.annotation)
    }

    /// Shared access to the annotation attached to `id`'s slot.
    pub fn annotation(&self, id: ServerId) -> Result<&Option<A>> {
        Ok(&self.slot(id)?.annotation)
    }

    /// The locator string for `id`.
    pub fn locator(&self, id: ServerId) -> Result<&str> {
        Ok(self.slot(id)?.entry.locator.as_str())
    }

    /// The full wire entry for `id`.
    pub fn details(&self, id: ServerId) -> Result<&ServerEntry> {
        Ok(&self.slot(id)?.entry)
    }

    /// Uniform-random selection among currently-present entries whose
    /// service mask is a superset of `mask`. Returns
    /// [`ServerId::INVALID`] if no entry matches — callers must not treat
    /// that as an error, only as "nothing eligible right now" and poll
    /// again later.
    #[must_use]
    pub fn random_with_service(&self, mask: ServiceMask) -> ServerId {
        let mut rng = rand::thread_rng();
        self.slots
            .iter()
            .flatten()
            .filter(|slot| slot.present && slot.entry.service_mask.contains(mask))
            .map(|slot| slot.id)
            .choose(&mut rng)
            .unwrap_or(ServerId::INVALID)
    }

    /// Iterates every currently-present entry matching `mask`, in slot
    /// order. Used by the backup selector's power-of-k sampling.
    pub fn present_with_service(&self, mask: ServiceMask) -> impl Iterator<Item = ServerId> + '_ {
        self.slots
            .iter()
            .flatten()
            .filter(move |slot| slot.present && slot.entry.service_mask.contains(mask))
            .map(|slot| slot.id)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use proptest::prelude::*;

    use super::*;

    fn entry(index: u32, generation: u32, mask: ServiceMask) -> ServerEntry {
        ServerEntry {
            service_mask: mask,
            server_id: ServerId::new(index, generation).to_u64(),
            segment_id: 0,
            locator: format!("host-{index}:0"),
            user_data: 0,
            is_in_cluster: true,
        }
    }

    #[test]
    fn size_reflects_only_drained_events() {
        let mut tracker: ChangeTracker<()> = ChangeTracker::new();
        let e = entry(1, 0, ServiceMask::BACKUP);
        tracker.enqueue(&e, ChangeEvent::Added);
        assert_eq!(tracker.size(), 0, "size must not grow before draining");

        let (id, event) = tracker.get_change().unwrap();
        assert_eq!(event, ChangeEvent::Added);
        assert_eq!(tracker.size(), 1);

        tracker.enqueue(&e, ChangeEvent::Removed);
        assert_eq!(tracker.size(), 1, "size must not shrink before draining");
        let (_, event) = tracker.get_change().unwrap();
        assert_eq!(event, ChangeEvent::Removed);
        assert_eq!(tracker.size(), 0);
        let _ = id;
    }

    #[test]
    fn removed_slot_clears_on_next_get_change() {
        let mut tracker: ChangeTracker<u32> = ChangeTracker::new();
        let e = entry(1, 0, ServiceMask::BACKUP);
        tracker.enqueue(&e, ChangeEvent::Added);
        let (id, _) = tracker.get_change().unwrap();
        *tracker.annotation_mut(id).unwrap() = Some(42);

        tracker.enqueue(&e, ChangeEvent::Removed);
        tracker.get_change().unwrap();
        // Slot still readable immediately after the Removed event drains.
        assert!(tracker.details(id).is_ok());

        // Next get_change (even with nothing pending) finally clears it.
        tracker.enqueue(&entry(2, 0, ServiceMask::BACKUP), ChangeEvent::Added);
        tracker.get_change().unwrap();
        assert!(matches!(tracker.details(id), Err(Error::UnknownServer(_))));
    }

    #[test]
    fn unconsumed_annotation_past_removal_is_cleared_with_warning() {
        let mut tracker: ChangeTracker<u32> = ChangeTracker::new();
        let e = entry(3, 0, ServiceMask::BACKUP);
        tracker.enqueue(&e, ChangeEvent::Added);
        let (id, _) = tracker.get_change().unwrap();
        *tracker.annotation_mut(id).unwrap() = Some(7); // left dangling

        tracker.enqueue(&e, ChangeEvent::Removed);
        tracker.get_change().unwrap();
        tracker.enqueue(&entry(4, 0, ServiceMask::BACKUP), ChangeEvent::Added);
        tracker.get_change().unwrap(); // triggers the deferred clear + warning
        assert!(matches!(tracker.details(id), Err(Error::UnknownServer(_))));
    }

    #[test]
    fn random_with_service_excludes_removed_and_mismatched_mask() {
        let mut tracker: ChangeTracker<()> = ChangeTracker::new();
        let backup = entry(1, 0, ServiceMask::BACKUP);
        let master = entry(2, 0, ServiceMask::MASTER);
        tracker.enqueue(&backup, ChangeEvent::Added);
        tracker.enqueue(&master, ChangeEvent::Added);
        tracker.get_change();
        tracker.get_change();

        for _ in 0..20 {
            let id = tracker.random_with_service(ServiceMask::BACKUP);
            assert_eq!(id, ServerId::new(1, 0));
        }

        tracker.enqueue(&backup, ChangeEvent::Removed);
        tracker.get_change();
        assert_eq!(
            tracker.random_with_service(ServiceMask::BACKUP),
            ServerId::INVALID
        );
    }

    #[test]
    fn empty_tracker_returns_invalid_id() {
        let tracker: ChangeTracker<()> = ChangeTracker::new();
        assert_eq!(
            tracker.random_with_service(ServiceMask::BACKUP),
            ServerId::INVALID
        );
    }

    proptest! {
        /// After any sequence of Added/Removed churn, drained immediately
        /// after each mutation, `size()` and `present_with_service` agree
        /// with an independently-kept model of which slots are live.
        #[test]
        fn size_and_presence_match_a_model_under_random_churn(
            ops in prop::collection::vec((0u32..8, any::<bool>()), 1..200)
        ) {
            let mut tracker: ChangeTracker<()> = ChangeTracker::new();
            let mut present: HashSet<u32> = HashSet::new();

            for (slot, want_add) in ops {
                let e = entry(slot + 1, 0, ServiceMask::BACKUP);
                if want_add && !present.contains(&slot) {
                    tracker.enqueue(&e, ChangeEvent::Added);
                    present.insert(slot);
                } else if !want_add && present.contains(&slot) {
                    tracker.enqueue(&e, ChangeEvent::Removed);
                    present.remove(&slot);
                }
                while tracker.get_change().is_some() {}
            }

            prop_assert_eq!(tracker.size(), present.len());
            let live: HashSet<u32> = tracker
                .present_with_service(ServiceMask::BACKUP)
                .map(|id| id.index() - 1)
                .collect();
            prop_assert_eq!(live, present);
        }
    }
}
