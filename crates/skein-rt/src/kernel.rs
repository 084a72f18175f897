// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Kernel: the top-level runtime object.
//!
//! Owns the scheduler registry and the task id table, allocates ids (never
//! reused within a run), holds the exit status and the failure flag, and is
//! the only entity that observes global quiescence. Workers and schedulers
//! never look at each other directly; everything goes through here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use log::debug;

use crate::config::Config;
use crate::error::RuntimeError;
use crate::port::Chan;
use crate::sched::{SchedId, Scheduler};
use crate::task::{Task, TaskId};

/// Exit status forced by a kernel-level failure.
pub const FAILURE_EXIT_STATUS: i32 = 101;

pub struct Kernel {
    config: Config,
    /// Live schedulers. Guards the quiescence condvar.
    scheds: Mutex<HashMap<SchedId, Arc<Scheduler>>>,
    /// Schedulers whose last worker has exited, awaiting join.
    reaped: Mutex<Vec<Arc<Scheduler>>>,
    /// Counted references to every live task.
    tasks: Mutex<HashMap<TaskId, Arc<Task>>>,
    next_sched_id: AtomicU32,
    next_task_id: AtomicU64,
    exit_status: AtomicI32,
    failed: AtomicBool,
    quiescent: Condvar,
}

impl Kernel {
    pub fn new() -> Arc<Kernel> {
        Self::with_config(Config::from_env())
    }

    pub fn with_config(config: Config) -> Arc<Kernel> {
        Arc::new(Kernel {
            config,
            scheds: Mutex::new(HashMap::new()),
            reaped: Mutex::new(Vec::new()),
            tasks: Mutex::new(HashMap::new()),
            next_sched_id: AtomicU32::new(1),
            next_task_id: AtomicU64::new(1),
            exit_status: AtomicI32::new(0),
            failed: AtomicBool::new(false),
            quiescent: Condvar::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Create a scheduler with `num_threads` workers and start them.
    pub fn new_scheduler(self: &Arc<Self>, num_threads: usize) -> Result<SchedId, RuntimeError> {
        if num_threads == 0 {
            return Err(RuntimeError::InvalidArg(
                "a scheduler needs at least one worker thread",
            ));
        }
        let id = SchedId(self.next_sched_id.fetch_add(1, Ordering::Relaxed));
        let sched = Scheduler::new(self, id, num_threads, self.config.stack_size);
        self.scheds.lock().unwrap().insert(id, sched.clone());
        sched.start();
        debug!("created {} with {} workers", id, num_threads);
        Ok(id)
    }

    pub fn get_scheduler(&self, id: SchedId) -> Option<Arc<Scheduler>> {
        self.scheds.lock().unwrap().get(&id).cloned()
    }

    pub fn sched_count(&self) -> usize {
        self.scheds.lock().unwrap().len()
    }

    /// Called by a scheduler's last worker on exit. When the registry
    /// empties, anyone parked in `run_until_quiescent` is released.
    pub(crate) fn release_scheduler_id(&self, id: SchedId) {
        let mut scheds = self.scheds.lock().unwrap();
        let Some(sched) = scheds.remove(&id) else {
            return;
        };
        debug!("released {}", id);
        self.reaped.lock().unwrap().push(sched);
        if scheds.is_empty() {
            self.quiescent.notify_all();
        }
    }

    pub(crate) fn alloc_task_id(&self) -> TaskId {
        TaskId(self.next_task_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn register_task(&self, task: Arc<Task>) {
        self.tasks.lock().unwrap().insert(task.id(), task);
    }

    /// Counted lookup; the returned clone keeps the task alive while the
    /// caller uses it.
    pub fn get_task(&self, id: TaskId) -> Option<Arc<Task>> {
        self.tasks.lock().unwrap().get(&id).cloned()
    }

    pub(crate) fn release_task_id(&self, id: TaskId) {
        self.tasks.lock().unwrap().remove(&id);
        debug!("released {}", id);
    }

    pub fn task_count(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    /// Record the process exit status; the last writer wins. Only
    /// meaningful before `run_until_quiescent` returns.
    pub fn set_exit_status(&self, code: i32) {
        self.exit_status.store(code, Ordering::Release);
    }

    pub fn exit_status(&self) -> i32 {
        self.exit_status.load(Ordering::Acquire)
    }

    pub fn failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Kernel-level failure: force a non-zero exit status and kill every
    /// task of every scheduler.
    pub fn fail(&self) {
        if self.failed.swap(true, Ordering::AcqRel) {
            return;
        }
        log::error!("kernel failure: killing all tasks");
        self.set_exit_status(FAILURE_EXIT_STATUS);
        let scheds: Vec<_> = self.scheds.lock().unwrap().values().cloned().collect();
        for sched in scheds {
            sched.kill_all_tasks();
        }
    }

    /// Send `data` on the channel. Looks up the destination task and port
    /// with counted references; a gone destination drops the message and
    /// reports `false`, never an error. Callable from any thread.
    pub fn chan_send(&self, chan: Chan, data: &[u8]) -> bool {
        let Some(task) = self.get_task(chan.task) else {
            return false;
        };
        let Some(port) = task.get_port(chan.port) else {
            return false;
        };
        port.send(data)
    }

    /// Create a newborn task on the given scheduler, without starting it.
    pub fn new_task_in(&self, sched: SchedId, name: &str) -> Result<TaskId, RuntimeError> {
        let sched = self
            .get_scheduler(sched)
            .ok_or(RuntimeError::SchedulerNotFound(sched))?;
        let spawner = crate::task::try_current().map(|t| t.id());
        Ok(sched.create_task(spawner, name).id())
    }

    /// Start a newborn task with its entry point.
    pub fn start_task(
        &self,
        id: TaskId,
        f: impl FnOnce() + Send + 'static,
    ) -> Result<(), RuntimeError> {
        let task = self.get_task(id).ok_or(RuntimeError::TaskNotFound(id))?;
        task.start(Box::new(f));
        Ok(())
    }

    /// Create and start a task on the given scheduler.
    pub fn spawn_in(
        &self,
        sched: SchedId,
        name: &str,
        f: impl FnOnce() + Send + 'static,
    ) -> Result<TaskId, RuntimeError> {
        let sched = self
            .get_scheduler(sched)
            .ok_or(RuntimeError::SchedulerNotFound(sched))?;
        Ok(sched.spawn(name, f))
    }

    /// Request asynchronous cancellation of a task. Reports whether the
    /// task was still registered.
    pub fn kill_task(&self, id: TaskId) -> bool {
        match self.get_task(id) {
            Some(task) => {
                task.kill();
                true
            }
            None => false,
        }
    }

    /// Block until every scheduler has deregistered, join their worker
    /// threads, and return the exit status.
    pub fn run_until_quiescent(&self) -> i32 {
        {
            let mut scheds = self.scheds.lock().unwrap();
            while !scheds.is_empty() {
                scheds = self.quiescent.wait(scheds).unwrap();
            }
        }
        let reaped: Vec<_> = self.reaped.lock().unwrap().drain(..).collect();
        for sched in reaped {
            sched.join();
        }
        debug!("kernel quiescent, exit status {}", self.exit_status());
        self.exit_status()
    }

    /// Convenience entry point: one scheduler, one root task, run to
    /// quiescence.
    pub fn run_main(
        self: &Arc<Self>,
        num_threads: usize,
        f: impl FnOnce() + Send + 'static,
    ) -> Result<i32, RuntimeError> {
        let sched = self.new_scheduler(num_threads)?;
        self.spawn_in(sched, "main", f)?;
        Ok(self.run_until_quiescent())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{fail_all, spawn, yield_now};
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn zero_threads_is_invalid() {
        let kernel = Kernel::new();
        assert!(matches!(
            kernel.new_scheduler(0),
            Err(RuntimeError::InvalidArg(_))
        ));
    }

    #[test]
    fn quiescent_run_returns_default_status() {
        let kernel = Kernel::new();
        let status = kernel.run_main(2, || {}).unwrap();
        assert_eq!(status, 0);
        assert_eq!(kernel.sched_count(), 0);
        assert_eq!(kernel.task_count(), 0);
    }

    #[test]
    fn task_ids_are_unique() {
        let kernel = Kernel::new();
        let ids = Arc::new(Mutex::new(Vec::new()));
        let collected = ids.clone();
        kernel
            .run_main(2, move || {
                collected.lock().unwrap().push(crate::task::current_task_id());
                for i in 0..32 {
                    let id = spawn(&format!("t{i}"), || {});
                    collected.lock().unwrap().push(id);
                }
            })
            .unwrap();
        let ids = ids.lock().unwrap();
        let unique: std::collections::HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());
    }

    #[test]
    fn fail_kills_everything_and_sets_status() {
        let kernel = Kernel::new();
        let survivors = Arc::new(AtomicUsize::new(0));
        let s = survivors.clone();
        let status = kernel
            .run_main(2, move || {
                for i in 0..4 {
                    let s = s.clone();
                    spawn(&format!("looper{i}"), move || loop {
                        yield_now();
                        s.fetch_add(1, Ordering::Relaxed);
                    });
                }
                fail_all();
            })
            .unwrap();
        assert_eq!(status, FAILURE_EXIT_STATUS);
        assert!(kernel.failed());
        assert_eq!(kernel.task_count(), 0);
    }

    #[test]
    fn start_task_separately_from_creation() {
        let kernel = Kernel::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let sched = kernel.new_scheduler(1).unwrap();
        let task = kernel.new_task_in(sched, "late-start").unwrap();
        let r = ran.clone();
        kernel
            .start_task(task, move || {
                r.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
        assert_eq!(kernel.run_until_quiescent(), 0);
        assert_eq!(ran.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn start_of_unknown_task_is_an_error() {
        let kernel = Kernel::new();
        assert!(matches!(
            kernel.start_task(TaskId(9999), || {}),
            Err(RuntimeError::TaskNotFound(_))
        ));
    }
}
