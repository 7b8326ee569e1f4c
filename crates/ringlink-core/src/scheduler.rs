//! Work-stealing task scheduler
//!
//! A fixed pool of worker threads drains two priority deques. A thread
//! waiting on a [`Schedule`] runs queued tasks itself instead of idling.

use crate::schedule::{CompletionGuard, Schedule};
use crate::Result;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

/// Grouping key for bulk cancellation
pub type TaskTag = u64;

/// Identity of the thread running a task
pub type WorkerId = u16;

/// Worker id reported to tasks run by a thread waiting on its schedule
pub const MAIN_THREAD_WORKER_ID: WorkerId = 0;

/// Queue a task is placed on; `High` is always drained first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    High,
    #[default]
    Normal,
}

type Work = Box<dyn FnOnce(WorkerId) + Send + 'static>;

struct ScheduledTask {
    tag: TaskTag,
    work: Work,
    completion: CompletionGuard,
}

impl ScheduledTask {
    fn run(self, worker: WorkerId) {
        let Self {
            tag,
            work,
            completion,
        } = self;
        if panic::catch_unwind(AssertUnwindSafe(|| work(worker))).is_err() {
            tracing::error!(tag, worker, "scheduled task panicked");
        }
        drop(completion);
    }
}

#[derive(Default)]
struct Queues {
    high: VecDeque<ScheduledTask>,
    normal: VecDeque<ScheduledTask>,
    stop: bool,
}

impl Queues {
    fn pop(&mut self) -> Option<ScheduledTask> {
        self.high.pop_front().or_else(|| self.normal.pop_front())
    }

    fn is_empty(&self) -> bool {
        self.high.is_empty() && self.normal.is_empty()
    }
}

#[derive(Default)]
struct Shared {
    queues: Mutex<Queues>,
    wake: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queues> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to a running worker pool; dropping it stops the workers
pub struct Scheduler {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Start a scheduler with the default worker count
    pub fn new() -> Result<Self> {
        Self::with_workers(0)
    }

    /// Start a scheduler with `worker_count` threads; 0 picks the default
    pub fn with_workers(worker_count: usize) -> Result<Self> {
        let count = if worker_count == 0 {
            default_worker_count()
        } else {
            worker_count
        };

        let mut scheduler = Self {
            shared: Arc::new(Shared::default()),
            workers: Vec::with_capacity(count),
        };
        for i in 0..count {
            let id = (i + 1) as WorkerId;
            let shared = Arc::clone(&scheduler.shared);
            // On failure the partially built scheduler is dropped, which stops started workers
            let handle = thread::Builder::new()
                .name(format!("ringlink-worker-{}", id))
                .spawn(move || worker_loop(&shared, id))?;
            scheduler.workers.push(handle);
        }

        tracing::debug!(workers = count, "scheduler started");
        Ok(scheduler)
    }

    /// Number of threads that execute tasks, counting the waiting thread
    pub fn worker_count(&self) -> usize {
        self.workers.len() + 1
    }

    /// Queue `work` under `tag`, counted against `schedule`
    pub fn schedule_task<F>(&self, work: F, tag: TaskTag, schedule: &Arc<Schedule>, priority: Priority)
    where
        F: FnOnce(WorkerId) + Send + 'static,
    {
        let task = ScheduledTask {
            tag,
            work: Box::new(work),
            completion: CompletionGuard::new(schedule),
        };
        {
            let mut queues = self.shared.lock();
            match priority {
                Priority::High => queues.high.push_back(task),
                Priority::Normal => queues.normal.push_back(task),
            }
        }
        self.shared.wake.notify_one();
    }

    /// Drop every queued task carrying `tag`; returns how many were removed
    ///
    /// Tasks already running are not affected. Each removed task still
    /// counts as finished for its schedule.
    pub fn cancel_tasks_of_tag(&self, tag: TaskTag) -> usize {
        let cancelled: Vec<ScheduledTask> = {
            let mut guard = self.shared.lock();
            let queues = &mut *guard;
            let mut cancelled = Vec::new();
            for queue in [&mut queues.high, &mut queues.normal] {
                let (matching, kept): (VecDeque<_>, VecDeque<_>) =
                    queue.drain(..).partition(|task| task.tag == tag);
                *queue = kept;
                cancelled.extend(matching);
            }
            cancelled
        };
        // Guards are released outside the queue lock
        let count = cancelled.len();
        drop(cancelled);
        count
    }

    /// Help run queued tasks until `schedule` has no pending work
    pub fn wait_for_schedule_completion(&self, schedule: &Schedule) {
        while !schedule.is_complete() {
            let task = self.shared.lock().pop();
            match task {
                Some(task) => task.run(MAIN_THREAD_WORKER_ID),
                None => schedule.wait_until_drained(),
            }
        }
    }

    /// Stop and join every worker; tasks still queued are dropped unrun
    pub fn terminate(self) {
        drop(self);
    }

    fn shutdown(&mut self) {
        self.shared.lock().stop = true;
        self.shared.wake.notify_all();

        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!("scheduler worker panicked");
            }
        }

        let abandoned = {
            let mut queues = self.shared.lock();
            (std::mem::take(&mut queues.high), std::mem::take(&mut queues.normal))
        };
        let count = abandoned.0.len() + abandoned.1.len();
        if count > 0 {
            tracing::debug!(count, "dropping queued tasks at shutdown");
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
        tracing::debug!("scheduler stopped");
    }
}

/// Run `f` on its own detached thread
pub fn run_detached<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    drop(thread::spawn(f));
}

fn default_worker_count() -> usize {
    let cores = thread::available_parallelism().map_or(1, |n| n.get());
    cores.saturating_sub(2).max(2)
}

fn worker_loop(shared: &Shared, id: WorkerId) {
    loop {
        let task = {
            let mut queues = shared.lock();
            while queues.is_empty() && !queues.stop {
                queues = shared
                    .wake
                    .wait(queues)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            // Queued tasks are abandoned once stop is requested
            if queues.stop {
                return;
            }
            queues.pop()
        };
        if let Some(task) = task {
            task.run(id);
        }
    }
}
