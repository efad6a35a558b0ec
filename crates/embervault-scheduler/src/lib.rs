//! Cooperative task scheduler.
//!
//! A single-threaded FIFO work queue: `perform()` may reschedule its own
//! task or schedule others, but those run on a *later* `proceed()`, never
//! the current one — the effect-driven runtime loop in
//! `kimberlite-kernel/src/runtime.rs` follows the same "produce more work,
//! drain it next round" discipline for its own effect queue.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::trace;

/// Anything the scheduler can drive forward.
///
/// One [`ReplicatedSegment`](../embervault_replica/struct.ReplicatedSegment.html)
/// per task, in the replica manager's usage.
pub trait Task: Send + Sync {
    /// Advances this task's state by one scheduling round.
    ///
    /// May call [`TaskScheduler::schedule`] to request another round,
    /// either for itself or for other tasks; such requests are only
    /// honored starting with the scheduler's *next* `proceed()` call.
    fn perform(&self);
}

/// Opaque handle to a task registered with a [`TaskScheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle(u64);

struct Slot {
    task: Arc<dyn Task>,
    /// True while this task has a pending entry in `queue`, so a repeat
    /// `schedule()` call is idempotent rather than double-queuing.
    scheduled: bool,
}

/// A single-threaded cooperative work queue.
///
/// At most one `perform()` call for a given task is ever in flight,
/// since the scheduler only calls out synchronously from `proceed()`.
#[derive(Default)]
pub struct TaskScheduler {
    slots: Vec<Option<Slot>>,
    free: Vec<u64>,
    queue: VecDeque<u64>,
}

impl TaskScheduler {
    /// Creates an empty scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a task, returning a handle usable with
    /// [`schedule`](Self::schedule) and [`unregister`](Self::unregister).
    /// The task is not scheduled until `schedule` is called for it.
    pub fn register(&mut self, task: Arc<dyn Task>) -> TaskHandle {
        let slot = Slot {
            task,
            scheduled: false,
        };
        let index = if let Some(index) = self.free.pop() {
            self.slots[index as usize] = Some(slot);
            index
        } else {
            self.slots.push(Some(slot));
            (self.slots.len() - 1) as u64
        };
        TaskHandle(index)
    }

    /// Removes a task permanently (used once a segment reaches FREED and
    /// is destroyed). Any stale queue entry for it is skipped in
    /// `proceed()` rather than eagerly scrubbed from the queue.
    pub fn unregister(&mut self, handle: TaskHandle) {
        if let Some(slot) = self.slots.get_mut(handle.0 as usize) {
            *slot = None;
            self.free.push(handle.0);
        }
    }

    /// Enqueues `handle` for the next `proceed()` round, unless it is
    /// already pending.
    pub fn schedule(&mut self, handle: TaskHandle) {
        if let Some(Some(slot)) = self.slots.get_mut(handle.0 as usize) {
            if !slot.scheduled {
                slot.scheduled = true;
                self.queue.push_back(handle.0);
            }
        }
    }

    /// True if no task is currently pending.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
    }

    /// Calls `perform()` on every task pending *as of entry* to this
    /// call, in FIFO order. Tasks scheduled during those calls land in
    /// the queue behind the original tail and are left for the next
    /// `proceed()`, giving fair round-robin progress across many
    /// segments instead of starving later ones on a busy task.
    pub fn proceed(&mut self) {
        let rounds = self.queue.len();
        for _ in 0..rounds {
            let Some(index) = self.queue.pop_front() else {
                break;
            };
            let task = {
                let Some(Some(slot)) = self.slots.get_mut(index as usize) else {
                    continue; // unregistered since it was scheduled
                };
                slot.scheduled = false;
                slot.task.clone()
            };
            trace!(task = index, "performing scheduled task");
            task.perform();
        }
    }

    /// Repeatedly calls `proceed()` until the queue is empty.
    ///
    /// Used by `sync()`/`close()` to cooperatively drain all outstanding
    /// replication work rather than suspending on I/O.
    pub fn proceed_all(&mut self) {
        while !self.is_idle() {
            self.proceed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use proptest::prelude::*;

    struct CountingTask(Arc<AtomicUsize>);
    impl Task for CountingTask {
        fn perform(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn schedule_is_idempotent() {
        let mut scheduler = TaskScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = scheduler.register(Arc::new(CountingTask(counter.clone())));
        scheduler.schedule(handle);
        scheduler.schedule(handle);
        scheduler.schedule(handle);
        scheduler.proceed();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn newly_scheduled_tasks_wait_for_next_proceed() {
        // A task that, on its first run, schedules a second task. The
        // second task must not run until the *next* proceed() call.
        // Wrapping in an Arc<Mutex<TaskScheduler>> is the realistic shape
        // used by the replica manager; model it directly.
        struct TaskScheduler_(std::sync::Mutex<TaskScheduler>);

        struct First(Arc<AtomicUsize>, Arc<TaskScheduler_>, TaskHandle);
        impl Task for First {
            fn perform(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
                self.1 .0.lock().unwrap().schedule(self.2);
            }
        }
        struct Second(Arc<AtomicUsize>);
        impl Task for Second {
            fn perform(&self) {
                self.0.fetch_add(100, Ordering::SeqCst);
            }
        }

        let runs = Arc::new(AtomicUsize::new(0));
        let holder = Arc::new(TaskScheduler_(std::sync::Mutex::new(TaskScheduler::new())));
        let second_handle = holder
            .0
            .lock()
            .unwrap()
            .register(Arc::new(Second(runs.clone())));
        let first_handle = holder.0.lock().unwrap().register(Arc::new(First(
            runs.clone(),
            holder.clone(),
            second_handle,
        )));
        holder.0.lock().unwrap().schedule(first_handle);

        holder.0.lock().unwrap().proceed();
        assert_eq!(runs.load(Ordering::SeqCst), 1, "only First ran this round");

        holder.0.lock().unwrap().proceed();
        assert_eq!(
            runs.load(Ordering::SeqCst),
            101,
            "Second ran only on the following round"
        );
    }

    #[test]
    fn proceed_all_drains_until_idle() {
        struct SelfScheduling {
            remaining: AtomicUsize,
            holder: std::sync::OnceLock<(Arc<std::sync::Mutex<TaskScheduler>>, TaskHandle)>,
        }
        impl Task for SelfScheduling {
            fn perform(&self) {
                if self.remaining.fetch_sub(1, Ordering::SeqCst) > 1 {
                    if let Some((scheduler, handle)) = self.holder.get() {
                        scheduler.lock().unwrap().schedule(*handle);
                    }
                }
            }
        }

        let scheduler = Arc::new(std::sync::Mutex::new(TaskScheduler::new()));
        let task = Arc::new(SelfScheduling {
            remaining: AtomicUsize::new(5),
            holder: std::sync::OnceLock::new(),
        });
        let handle = scheduler.lock().unwrap().register(task.clone());
        let _ = task.holder.set((scheduler.clone(), handle));
        scheduler.lock().unwrap().schedule(handle);
        scheduler.lock().unwrap().proceed_all();
        assert!(scheduler.lock().unwrap().is_idle());
        assert_eq!(task.remaining.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unregistered_task_is_skipped() {
        let mut scheduler = TaskScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = scheduler.register(Arc::new(CountingTask(counter.clone())));
        scheduler.schedule(handle);
        scheduler.unregister(handle);
        scheduler.proceed();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    proptest! {
        /// However many times each task is scheduled before a `proceed()`
        /// call, it performs exactly once that round, and a task never
        /// scheduled this round does not perform at all.
        #[test]
        fn each_task_runs_at_most_once_per_round_regardless_of_schedule_count(
            schedule_counts in prop::collection::vec(0u32..4, 1..12)
        ) {
            let mut scheduler = TaskScheduler::new();
            let counters: Vec<_> = schedule_counts.iter().map(|_| Arc::new(AtomicUsize::new(0))).collect();
            let handles: Vec<_> = counters
                .iter()
                .map(|c| scheduler.register(Arc::new(CountingTask(c.clone()))))
                .collect();

            for (handle, &times) in handles.iter().zip(&schedule_counts) {
                for _ in 0..times {
                    scheduler.schedule(*handle);
                }
            }

            scheduler.proceed();

            for (counter, &times) in counters.iter().zip(&schedule_counts) {
                let expected = u64::from(times > 0);
                prop_assert_eq!(counter.load(Ordering::SeqCst) as u64, expected);
            }
            prop_assert!(scheduler.is_idle());
        }
    }
}
