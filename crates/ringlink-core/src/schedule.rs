//! Fork-join completion counter

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

/// Number of tasks still pending for one batch of work
///
/// Every scheduled task holds a [`CompletionGuard`]; the guard that brings
/// the count to zero wakes all waiters.
#[derive(Default)]
pub struct Schedule {
    pending: AtomicI32,
    lock: Mutex<()>,
    drained: Condvar,
}

impl Schedule {
    /// Create an empty schedule
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Tasks scheduled but not yet finished or cancelled
    pub fn pending(&self) -> i32 {
        self.pending.load(Ordering::Acquire)
    }

    /// Whether every task has finished or been cancelled
    pub fn is_complete(&self) -> bool {
        self.pending() <= 0
    }

    /// Block until the pending count reaches zero
    ///
    /// The scheduler's waiter calls this only after finding the queues
    /// empty; see [`crate::Scheduler::wait_for_schedule_completion`].
    pub(crate) fn wait_until_drained(&self) {
        let mut guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        while self.pending() > 0 {
            guard = self
                .drained
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn complete_one(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.drained.notify_all();
        }
    }
}

/// RAII handle for one unit of pending work
///
/// Counts the task on creation and releases it on drop, whether the task
/// ran, panicked, was cancelled, or was dropped with the scheduler.
pub(crate) struct CompletionGuard {
    schedule: Arc<Schedule>,
}

impl CompletionGuard {
    pub(crate) fn new(schedule: &Arc<Schedule>) -> Self {
        schedule.pending.fetch_add(1, Ordering::AcqRel);
        Self {
            schedule: Arc::clone(schedule),
        }
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.schedule.complete_one();
    }
}
