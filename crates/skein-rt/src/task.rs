// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Tasks: the schedulable unit.
//!
//! A task's shared state lives behind an `Arc` (kernel table, channels and
//! senders all hold counted references); its stack and saved context are the
//! coroutine resident on its worker's thread. State changes go through the
//! owning worker's `transition` primitive, under the worker lock.
//!
//! Kill is advisory and asynchronous: `kill` sets a flag and wakes a blocked
//! target; the target observes the flag at its next suspension point and
//! unwinds its own stack.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::debug;

use crate::context;
use crate::kernel::Kernel;
use crate::port::{Port, PortId};
use crate::sched::worker::Worker;
use crate::sched::SchedId;
use crate::select::Selector;

/// Unique task identifier. Never reused within a kernel's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u64);

impl TaskId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task({})", self.0)
    }
}

/// Task lifecycle states. The four states partition the owning worker's
/// task lists.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Created, not yet started.
    Newborn = 0,
    /// Runnable (possibly currently activated).
    Running = 1,
    /// Waiting on a port or selector.
    Blocked = 2,
    /// Exited, unwound or killed; awaiting reap.
    Dead = 3,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Newborn,
            1 => Self::Running,
            2 => Self::Blocked,
            _ => Self::Dead,
        }
    }
}

/// Identity of the object a blocked task is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockedOn {
    Port(PortId),
    /// The task's own selector, during an n-way receive.
    Selector,
}

/// What a task is blocked on, with a human-readable reason for diagnostics.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BlockedSite {
    pub(crate) on: BlockedOn,
    pub(crate) reason: &'static str,
}

pub(crate) type TaskEntry = Box<dyn FnOnce() + Send + 'static>;

pub struct Task {
    id: TaskId,
    name: String,
    kernel: Weak<Kernel>,
    worker: Weak<Worker>,
    sched_id: SchedId,
    parent: Option<TaskId>,
    supervised: AtomicBool,
    killed: AtomicBool,
    /// Written only under the owning worker's lock.
    state: AtomicU8,
    /// Written only under the owning worker's lock.
    blocked: Mutex<Option<BlockedSite>>,
    /// Pending entry closure, consumed at first activation.
    entry: Mutex<Option<TaskEntry>>,
    /// Ports owned by this task, dropped exactly once at reap.
    ports: Mutex<HashMap<PortId, Arc<Port>>>,
    next_port: AtomicU64,
    pub(crate) selector: Selector,
}

impl Task {
    pub(crate) fn new(
        id: TaskId,
        name: &str,
        kernel: &Arc<Kernel>,
        worker: &Arc<Worker>,
        sched_id: SchedId,
        parent: Option<TaskId>,
    ) -> Self {
        Self {
            id,
            name: name.to_string(),
            kernel: Arc::downgrade(kernel),
            worker: Arc::downgrade(worker),
            sched_id,
            parent,
            supervised: AtomicBool::new(parent.is_some()),
            killed: AtomicBool::new(false),
            state: AtomicU8::new(TaskState::Newborn as u8),
            blocked: Mutex::new(None),
            entry: Mutex::new(None),
            ports: Mutex::new(HashMap::new()),
            next_port: AtomicU64::new(1),
            selector: Selector::new(id.0),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    pub fn parent(&self) -> Option<TaskId> {
        self.parent
    }

    pub fn supervised(&self) -> bool {
        self.supervised.load(Ordering::Acquire)
    }

    /// Stop failure propagation to the parent.
    pub fn unsupervise(&self) {
        self.supervised.store(false, Ordering::Release);
    }

    pub(crate) fn sched_id(&self) -> SchedId {
        self.sched_id
    }

    pub(crate) fn kernel(&self) -> Option<Arc<Kernel>> {
        self.kernel.upgrade()
    }

    pub(crate) fn worker(&self) -> Option<Arc<Worker>> {
        self.worker.upgrade()
    }

    /// Request asynchronous cancellation. A blocked target is woken so it
    /// can observe the flag at its next suspension point.
    pub fn kill(self: &Arc<Self>) {
        debug!("killing {} ({})", self.id, self.name);
        self.killed.store(true, Ordering::Release);
        if let Some(worker) = self.worker.upgrade() {
            worker.wake_blocked(self, None);
        }
    }

    /// Move the task from newborn to running with its entry closure set.
    pub(crate) fn start(self: &Arc<Self>, entry: TaskEntry) {
        let worker = self
            .worker
            .upgrade()
            .expect("starting a task whose worker is gone");
        *self.entry.lock().unwrap() = Some(entry);
        worker.transition(self, TaskState::Newborn, TaskState::Running, None);
    }

    pub(crate) fn take_entry(&self) -> Option<TaskEntry> {
        self.entry.lock().unwrap().take()
    }

    /// Block the running task on `on`. Refuses when the kill flag is
    /// already set, in which case the caller must unwind instead of
    /// suspending. The check and the transition are atomic under the worker
    /// lock, so a racing `kill` either sees us blocked (and wakes us) or is
    /// seen here.
    pub(crate) fn block(self: &Arc<Self>, on: BlockedOn, reason: &'static str) -> bool {
        let worker = self
            .worker
            .upgrade()
            .expect("blocking a task whose worker is gone");
        worker.block_task(self, BlockedSite { on, reason })
    }

    /// Wake the task if it is currently blocked on `from`. Returns whether
    /// the caller won the wake; a `false` means the task was concurrently
    /// killed awake or never blocked, and the caller falls back to the
    /// buffered path.
    pub(crate) fn wakeup(self: &Arc<Self>, from: BlockedOn) -> bool {
        match self.worker.upgrade() {
            Some(worker) => worker.wake_blocked(self, Some(from)),
            None => false,
        }
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn set_blocked_site(&self, site: Option<BlockedSite>) {
        *self.blocked.lock().unwrap() = site;
    }

    pub(crate) fn blocked_site(&self) -> Option<BlockedSite> {
        *self.blocked.lock().unwrap()
    }

    pub(crate) fn alloc_port_id(&self) -> PortId {
        PortId(self.next_port.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn add_port(&self, port: Arc<Port>) {
        self.ports.lock().unwrap().insert(port.id(), port);
    }

    /// Counted lookup: the clone is the sender's reference, taken before
    /// the port is used, which is what lets `detach` wait out in-flight
    /// senders.
    pub(crate) fn get_port(&self, id: PortId) -> Option<Arc<Port>> {
        self.ports.lock().unwrap().get(&id).cloned()
    }

    pub(crate) fn remove_port(&self, id: PortId) -> Option<Arc<Port>> {
        self.ports.lock().unwrap().remove(&id)
    }

    /// Drop all owned ports. Called once, at reap.
    pub(crate) fn clear_ports(&self) {
        self.ports.lock().unwrap().clear();
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("killed", &self.killed())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Current-task thread-local and the in-task operations
// ---------------------------------------------------------------------------

thread_local! {
    static CURRENT: std::cell::RefCell<Option<Arc<Task>>> =
        const { std::cell::RefCell::new(None) };
}

pub(crate) fn set_current(task: Option<Arc<Task>>) {
    CURRENT.with(|c| *c.borrow_mut() = task);
}

pub(crate) fn try_current() -> Option<Arc<Task>> {
    CURRENT.with(|c| c.borrow().clone())
}

pub(crate) fn current() -> Arc<Task> {
    try_current().expect("not running inside a skein task")
}

/// Id of the calling task.
pub fn current_task_id() -> TaskId {
    current().id()
}

/// Cooperative suspension point. Lets other tasks on this worker run; a
/// killed task unwinds here instead of continuing.
pub fn yield_now() {
    let task = current();
    if task.killed() {
        context::unwind_killed();
    }
    context::suspend_current();
    if task.killed() {
        context::unwind_killed();
    }
}

/// Spawn a task on the calling task's scheduler.
pub fn spawn(name: &str, f: impl FnOnce() + Send + 'static) -> TaskId {
    let task = current();
    let kernel = task.kernel().expect("kernel gone");
    let sched = kernel
        .get_scheduler(task.sched_id())
        .expect("current task's scheduler gone");
    sched.spawn(name, f)
}

/// Create a newborn task on the calling task's scheduler without starting
/// it. Pair with [`start_task`].
pub fn new_task(name: &str) -> TaskId {
    let task = current();
    let kernel = task.kernel().expect("kernel gone");
    let sched = kernel
        .get_scheduler(task.sched_id())
        .expect("current task's scheduler gone");
    sched.create_task(Some(task.id()), name).id()
}

/// Create a newborn task on the given scheduler.
pub fn new_task_in(sched: SchedId, name: &str) -> Result<TaskId, crate::error::RuntimeError> {
    current().kernel().expect("kernel gone").new_task_in(sched, name)
}

/// Start a newborn task with its entry point.
pub fn start_task(
    id: TaskId,
    f: impl FnOnce() + Send + 'static,
) -> Result<(), crate::error::RuntimeError> {
    current().kernel().expect("kernel gone").start_task(id, f)
}

/// Number of worker threads on the calling task's scheduler.
pub fn sched_threads() -> usize {
    let task = current();
    let kernel = task.kernel().expect("kernel gone");
    kernel
        .get_scheduler(task.sched_id())
        .expect("current task's scheduler gone")
        .num_threads()
}

/// Scheduler the calling task is pinned to.
pub fn current_sched_id() -> SchedId {
    current().sched_id()
}

/// Index of the worker the calling task is pinned to.
pub fn current_worker() -> usize {
    current().worker().expect("worker gone").index()
}

/// Record the process exit status; the last writer wins.
pub fn set_exit_status(code: i32) {
    current().kernel().expect("kernel gone").set_exit_status(code);
}

/// Declare a kernel-level failure: kills every task of every scheduler.
pub fn fail_all() {
    current().kernel().expect("kernel gone").fail();
}

/// Detach the calling task from its parent's failure propagation.
pub fn unsupervise() {
    current().unsupervise();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::Kernel;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn spawn_and_run_to_completion() {
        let kernel = Kernel::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let status = kernel
            .run_main(1, move || {
                h.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(status, 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn yield_interleaves_siblings() {
        let kernel = Kernel::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o = order.clone();
        kernel
            .run_main(1, move || {
                let o2 = o.clone();
                spawn("second", move || {
                    o2.lock().unwrap().push("second");
                });
                // One worker: the sibling cannot have run yet.
                o.lock().unwrap().push("first");
                yield_now();
                o.lock().unwrap().push("third");
            })
            .unwrap();
        // The sibling ran at some point after "first".
        let order = order.lock().unwrap();
        assert_eq!(order[0], "first");
        assert!(order.contains(&"second"));
        assert!(order.contains(&"third"));
    }

    #[test]
    fn nested_spawn_uses_same_scheduler() {
        let kernel = Kernel::new();
        let ok = Arc::new(AtomicBool::new(false));
        let ok2 = ok.clone();
        kernel
            .run_main(2, move || {
                let outer = current_sched_id();
                let ok3 = ok2.clone();
                spawn("child", move || {
                    ok3.store(current_sched_id() == outer, Ordering::SeqCst);
                });
            })
            .unwrap();
        assert!(ok.load(Ordering::SeqCst));
    }

    #[test]
    fn exit_status_last_writer_wins() {
        let kernel = Kernel::new();
        let status = kernel
            .run_main(1, || {
                set_exit_status(3);
                set_exit_status(7);
            })
            .unwrap();
        assert_eq!(status, 7);
    }

    #[test]
    fn failed_task_is_contained() {
        let kernel = Kernel::new();
        let ran = Arc::new(AtomicBool::new(false));
        let r = ran.clone();
        let status = kernel
            .run_main(1, move || {
                let child = spawn("bomb", || {
                    unsupervise();
                    panic!("boom");
                });
                while current().kernel().unwrap().get_task(child).is_some() {
                    yield_now();
                }
                r.store(true, Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(status, 0);
        assert!(ran.load(Ordering::SeqCst));
    }
}
