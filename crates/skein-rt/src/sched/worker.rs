// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Worker: one OS thread cooperatively multiplexing the tasks pinned to it.
//!
//! The worker owns four task lists (newborn, running, blocked, dead) plus
//! the exit flag, all under one mutex with a condvar. Every task state
//! change in the runtime funnels through `transition_locked` under that
//! lock, which is what makes block/wakeup races impossible to lose.
//!
//! Task coroutines are `!Send` and live in a map owned by the loop itself;
//! the shared `Task` object never holds its own stack.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, Weak};

use corosensei::stack::DefaultStack;
use corosensei::CoroutineResult;
use log::{debug, error, trace};

use crate::context::{self, TaskCoroutine, TaskOutcome};
use crate::kernel::Kernel;
use crate::rng::XorShift64;
use crate::sched::{SchedId, Scheduler};
use crate::task::{self, BlockedOn, BlockedSite, Task, TaskId, TaskState};

pub(crate) struct Worker {
    id: usize,
    sched_id: SchedId,
    sched: Weak<Scheduler>,
    kernel: Weak<Kernel>,
    stack_size: usize,
    state: Mutex<WorkerState>,
    cond: Condvar,
}

struct WorkerState {
    newborn: Vec<Arc<Task>>,
    running: Vec<Arc<Task>>,
    blocked: Vec<Arc<Task>>,
    dead: Vec<Arc<Task>>,
    should_exit: bool,
}

impl WorkerState {
    fn list_mut(&mut self, state: TaskState) -> &mut Vec<Arc<Task>> {
        match state {
            TaskState::Newborn => &mut self.newborn,
            TaskState::Running => &mut self.running,
            TaskState::Blocked => &mut self.blocked,
            TaskState::Dead => &mut self.dead,
        }
    }
}

impl Worker {
    pub(crate) fn new(
        id: usize,
        sched_id: SchedId,
        sched: Weak<Scheduler>,
        kernel: Weak<Kernel>,
        stack_size: usize,
    ) -> Arc<Worker> {
        Arc::new(Worker {
            id,
            sched_id,
            sched,
            kernel,
            stack_size,
            state: Mutex::new(WorkerState {
                newborn: Vec::new(),
                running: Vec::new(),
                blocked: Vec::new(),
                dead: Vec::new(),
                should_exit: false,
            }),
            cond: Condvar::new(),
        })
    }

    pub(crate) fn index(&self) -> usize {
        self.id
    }

    /// Create a task pinned to this worker, in the newborn list, and
    /// register it with the kernel.
    pub(crate) fn create_task(
        self: &Arc<Self>,
        spawner: Option<TaskId>,
        name: &str,
    ) -> Arc<Task> {
        let kernel = self
            .kernel
            .upgrade()
            .expect("creating a task on a dead kernel");
        let task = Arc::new(Task::new(
            kernel.alloc_task_id(),
            name,
            &kernel,
            self,
            self.sched_id,
            spawner,
        ));
        self.state.lock().unwrap().newborn.push(task.clone());
        kernel.register_task(task.clone());
        debug!(
            "worker {}.{}: created {} ({}), spawner {:?}",
            self.sched_id,
            self.id,
            task.id(),
            name,
            spawner
        );
        task
    }

    /// The scheduling loop. Runs until the scheduler drains this worker.
    pub(crate) fn run(self: &Arc<Self>) {
        let mut rng = XorShift64::new(((self.sched_id.0 as u64) << 32) | self.id as u64);
        let mut coros: HashMap<TaskId, TaskCoroutine> = HashMap::new();
        let mut cached_stack: Option<DefaultStack> = None;
        debug!("worker {}.{}: entering scheduling loop", self.sched_id, self.id);

        let mut st = self.state.lock().unwrap();
        loop {
            if st.should_exit {
                break;
            }
            let task = match st.running.len() {
                0 => None,
                n => Some(st.running[rng.next() as usize % n].clone()),
            };
            let Some(task) = task else {
                debug_assert!(st.dead.is_empty(), "tasks should only die after running");
                trace!("worker {}.{}: all tasks blocked, parking", self.sched_id, self.id);
                st = self.cond.wait(st).unwrap();
                continue;
            };
            drop(st);

            // Keep one spare stack on hand, allocated here while we are
            // still on the worker's own stack; a first activation below
            // consumes it and the next turn replaces it.
            if cached_stack.is_none() {
                match DefaultStack::new(self.stack_size) {
                    Ok(stack) => cached_stack = Some(stack),
                    Err(e) => error!(
                        "worker {}.{}: stack allocation failed: {}",
                        self.sched_id, self.id, e
                    ),
                }
            }

            let coro = match coros.remove(&task.id()) {
                Some(coro) => Some(coro),
                None => cached_stack
                    .take()
                    .map(|stack| context::task_coroutine(task.clone(), stack)),
            };
            let Some(mut coro) = coro else {
                // Allocation failure is a failure of this task, not of the
                // worker.
                self.transition(&task, TaskState::Running, TaskState::Dead, None);
                self.reap_one(Some((
                    task,
                    TaskOutcome::Failed("stack allocation failed".to_string()),
                )));
                st = self.state.lock().unwrap();
                continue;
            };

            trace!(
                "worker {}.{}: activating {} ({})",
                self.sched_id,
                self.id,
                task.id(),
                task.name()
            );
            task::set_current(Some(task.clone()));
            let result = coro.resume(());
            task::set_current(None);
            context::clear_yielder();

            let mut finished = None;
            {
                let mut inner = self.state.lock().unwrap();
                match result {
                    CoroutineResult::Yield(()) => {
                        // Suspended: either still runnable (yield) or
                        // already moved to blocked by its own block().
                        coros.insert(task.id(), coro);
                    }
                    CoroutineResult::Return(outcome) => {
                        drop(coro);
                        self.transition_locked(
                            &mut inner,
                            &task,
                            TaskState::Running,
                            TaskState::Dead,
                            None,
                        );
                        finished = Some((task, outcome));
                    }
                }
            }
            self.reap_one(finished);
            st = self.state.lock().unwrap();
        }

        assert!(st.newborn.is_empty(), "newborn tasks left at worker exit");
        assert!(st.running.is_empty(), "running tasks left at worker exit");
        assert!(st.blocked.is_empty(), "blocked tasks left at worker exit");
        assert!(st.dead.is_empty(), "dead tasks left at worker exit");
        drop(st);
        assert!(coros.is_empty(), "live coroutines left at worker exit");
        drop(cached_stack);
        debug!("worker {}.{}: finished scheduling loop", self.sched_id, self.id);
    }

    /// Destroy at most one dead task: release its id from the kernel,
    /// drop its ports, propagate a supervised failure, and give its slot
    /// back to the scheduler. The worker lock is not held across the
    /// kernel and scheduler calls.
    fn reap_one(&self, finished: Option<(Arc<Task>, TaskOutcome)>) {
        let dead = {
            let mut st = self.state.lock().unwrap();
            if st.dead.is_empty() {
                debug_assert!(finished.is_none());
                return;
            }
            assert_eq!(
                st.dead.len(),
                1,
                "only one task may die during a single scheduling turn"
            );
            st.dead.pop().expect("dead list emptied under lock")
        };
        let outcome = finished.map(|(task, outcome)| {
            debug_assert_eq!(task.id(), dead.id());
            outcome
        });

        if let Some(kernel) = self.kernel.upgrade() {
            kernel.release_task_id(dead.id());
            match &outcome {
                Some(TaskOutcome::Failed(msg)) => {
                    error!("{} ({}) failed: {}", dead.id(), dead.name(), msg);
                    if dead.supervised() {
                        if let Some(parent) = dead.parent() {
                            if let Some(parent) = kernel.get_task(parent) {
                                debug!(
                                    "propagating failure of {} to parent {}",
                                    dead.id(),
                                    parent.id()
                                );
                                parent.kill();
                            }
                        }
                    }
                }
                Some(TaskOutcome::Killed) => debug!("{} ({}) killed", dead.id(), dead.name()),
                _ => trace!("{} ({}) exited", dead.id(), dead.name()),
            }
        }
        dead.clear_ports();
        if let Some(sched) = self.sched.upgrade() {
            sched.release_task();
        }
    }

    /// The sole task state-change primitive.
    pub(crate) fn transition(
        &self,
        task: &Arc<Task>,
        from: TaskState,
        to: TaskState,
        site: Option<BlockedSite>,
    ) {
        let mut st = self.state.lock().unwrap();
        self.transition_locked(&mut st, task, from, to, site);
    }

    fn transition_locked(
        &self,
        st: &mut WorkerState,
        task: &Arc<Task>,
        from: TaskState,
        to: TaskState,
        site: Option<BlockedSite>,
    ) {
        assert_eq!(
            task.state(),
            from,
            "{} state change {:?} -> {:?} from the wrong state",
            task.id(),
            from,
            to
        );
        let src = st.list_mut(from);
        let pos = src
            .iter()
            .position(|t| t.id() == task.id())
            .unwrap_or_else(|| panic!("{} missing from its {:?} list", task.id(), from));
        let task = src.swap_remove(pos);
        trace!(
            "worker {}.{}: {} {:?} -> {:?}{}",
            self.sched_id,
            self.id,
            task.id(),
            from,
            to,
            site.map(|s| format!(" ({})", s.reason)).unwrap_or_default()
        );
        task.set_state(to);
        task.set_blocked_site(site);
        st.list_mut(to).push(task);
        self.cond.notify_all();
    }

    /// Block a running task. Refuses when the task was already killed; the
    /// kill check and the transition are one critical section, so a racing
    /// `kill` cannot slip between them.
    pub(crate) fn block_task(&self, task: &Arc<Task>, site: BlockedSite) -> bool {
        let mut st = self.state.lock().unwrap();
        if task.killed() {
            return false;
        }
        self.transition_locked(&mut st, task, TaskState::Running, TaskState::Blocked, Some(site));
        true
    }

    /// Wake a blocked task. With `expected` set, only wakes a task blocked
    /// on that condition; returns whether this caller won the wake.
    pub(crate) fn wake_blocked(&self, task: &Arc<Task>, expected: Option<BlockedOn>) -> bool {
        let mut st = self.state.lock().unwrap();
        if task.state() != TaskState::Blocked {
            return false;
        }
        if let Some(expected) = expected {
            match task.blocked_site() {
                Some(site) if site.on == expected => {}
                _ => return false,
            }
        }
        self.transition_locked(&mut st, task, TaskState::Blocked, TaskState::Running, None);
        true
    }

    /// Kill every task on this worker. Collected under the lock, killed
    /// outside it; the victims are unsupervised first so the failure does
    /// not bounce back up to the kernel.
    pub(crate) fn kill_all_tasks(&self) {
        let mut victims = Vec::new();
        {
            let st = self.state.lock().unwrap();
            victims.extend(st.running.iter().cloned());
            victims.extend(st.blocked.iter().cloned());
        }
        while let Some(task) = victims.pop() {
            task.unsupervise();
            task.kill();
        }
    }

    /// Ask the scheduling loop to exit once control returns to it.
    pub(crate) fn exit(&self) {
        let mut st = self.state.lock().unwrap();
        st.should_exit = true;
        self.cond.notify_all();
    }
}
