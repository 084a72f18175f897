// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Scheduler: a fixed group of worker threads sharing a pool of tasks.
//!
//! New tasks are handed to workers round-robin and stay pinned there for
//! life. The scheduler tracks how many tasks and worker threads are still
//! live: when the task count drops to zero every worker is told to drain,
//! and when the last worker exits the scheduler deregisters itself from
//! the kernel. That deregistration is the kernel's only quiescence signal.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};

use log::debug;

use crate::kernel::Kernel;
use crate::sched::worker::Worker;
use crate::task::{self, Task, TaskId};

/// Scheduler identifier. Never reused within a kernel's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SchedId(pub(crate) u32);

impl fmt::Display for SchedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sched({})", self.0)
    }
}

pub struct Scheduler {
    id: SchedId,
    kernel: Weak<Kernel>,
    workers: Vec<Arc<Worker>>,
    counts: Mutex<Counts>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

struct Counts {
    live_threads: usize,
    live_tasks: usize,
    cur_thread: usize,
}

impl Scheduler {
    pub(crate) fn new(
        kernel: &Arc<Kernel>,
        id: SchedId,
        num_threads: usize,
        stack_size: usize,
    ) -> Arc<Scheduler> {
        assert!(num_threads > 0, "a scheduler needs at least one worker");
        Arc::new_cyclic(|sched: &Weak<Scheduler>| {
            let workers = (0..num_threads)
                .map(|i| Worker::new(i, id, sched.clone(), Arc::downgrade(kernel), stack_size))
                .collect();
            Scheduler {
                id,
                kernel: Arc::downgrade(kernel),
                workers,
                counts: Mutex::new(Counts {
                    live_threads: num_threads,
                    live_tasks: 0,
                    cur_thread: 0,
                }),
                handles: Mutex::new(Vec::new()),
            }
        })
    }

    pub fn id(&self) -> SchedId {
        self.id
    }

    pub fn num_threads(&self) -> usize {
        self.workers.len()
    }

    /// Create a newborn task, placed round-robin across the workers.
    pub(crate) fn create_task(&self, spawner: Option<TaskId>, name: &str) -> Arc<Task> {
        let index = {
            let mut counts = self.counts.lock().unwrap();
            counts.live_tasks += 1;
            let index = counts.cur_thread;
            counts.cur_thread = (counts.cur_thread + 1) % self.workers.len();
            index
        };
        self.workers[index].create_task(spawner, name)
    }

    /// Create and immediately start a task running `f`.
    pub fn spawn(&self, name: &str, f: impl FnOnce() + Send + 'static) -> TaskId {
        let spawner = task::try_current().map(|t| t.id());
        let task = self.create_task(spawner, name);
        task.start(Box::new(f));
        task.id()
    }

    /// A task of this scheduler was reaped. The last one out turns off the
    /// lights: every worker is told to drain.
    pub(crate) fn release_task(&self) {
        let drained = {
            let mut counts = self.counts.lock().unwrap();
            counts.live_tasks -= 1;
            counts.live_tasks == 0
        };
        if drained {
            self.exit();
        }
    }

    fn exit(&self) {
        debug!("{}: draining workers", self.id);
        for worker in &self.workers {
            worker.exit();
        }
    }

    /// A worker thread exited. The last one deregisters the scheduler.
    pub(crate) fn release_worker(&self) {
        let last = {
            let mut counts = self.counts.lock().unwrap();
            counts.live_threads -= 1;
            counts.live_threads == 0
        };
        if last {
            if let Some(kernel) = self.kernel.upgrade() {
                kernel.release_scheduler_id(self.id);
            }
        }
    }

    pub(crate) fn kill_all_tasks(&self) {
        for worker in &self.workers {
            worker.kill_all_tasks();
        }
    }

    /// Start every worker thread.
    pub(crate) fn start(self: &Arc<Self>) {
        let mut handles = self.handles.lock().unwrap();
        for worker in &self.workers {
            let worker = worker.clone();
            let sched = self.clone();
            let name = format!("skein-worker-{}-{}", self.id.0, worker.index());
            handles.push(
                thread::Builder::new()
                    .name(name)
                    .spawn(move || {
                        worker.run();
                        sched.release_worker();
                    })
                    .expect("failed to spawn worker thread"),
            );
        }
    }

    /// Join every worker thread. Callable only from outside the workers.
    pub(crate) fn join(&self) {
        let handles: Vec<_> = self.handles.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts = self.counts.lock().unwrap();
        f.debug_struct("Scheduler")
            .field("id", &self.id)
            .field("threads", &self.workers.len())
            .field("live_threads", &counts.live_threads)
            .field("live_tasks", &counts.live_tasks)
            .finish()
    }
}
