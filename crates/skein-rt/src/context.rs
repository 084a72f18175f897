// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The stack-switch seam.
//!
//! Each task owns one stackful coroutine; the worker's `resume` and the
//! task's `suspend` form the symmetric swap. Coroutines are `!Send`, so they
//! never live in the shared task object: the worker's scheduling loop keeps
//! them in a map on its own thread, which is what pins tasks to their worker
//! for life. Suspension always lands back on the worker's own OS stack.

use std::cell::Cell;
use std::ptr::NonNull;
use std::sync::Arc;

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, Yielder};
use log::trace;

use crate::task::Task;

/// What a task's stack unwound to. Produced by the entry wrapper, consumed
/// by the worker when it reaps.
#[derive(Debug)]
pub(crate) enum TaskOutcome {
    Completed,
    Failed(String),
    Killed,
}

/// Unwind payload for a task that observed its kill flag at a suspension
/// point. Carried via `resume_unwind` so the panic hook stays quiet.
pub(crate) struct KilledToken;

pub(crate) type TaskCoroutine = Coroutine<(), (), TaskOutcome>;

thread_local! {
    /// Yielder of the coroutine currently executing on this thread.
    /// Valid only between a worker's resume and the matching return.
    static YIELDER: Cell<Option<NonNull<Yielder<(), ()>>>> = const { Cell::new(None) };
}

/// Build the coroutine for a task from its pending entry closure.
///
/// The wrapper converts every way out of user code into a `TaskOutcome`:
/// a plain return, a panic, or the kill-token unwind from a suspension
/// point.
pub(crate) fn task_coroutine(task: Arc<Task>, stack: DefaultStack) -> TaskCoroutine {
    Coroutine::with_stack(stack, move |yielder, ()| {
        YIELDER.set(Some(NonNull::from(yielder)));
        let entry = task
            .take_entry()
            .expect("task activated without an entry point");
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(entry));
        YIELDER.set(None);
        match result {
            Ok(()) => TaskOutcome::Completed,
            Err(payload) if payload.is::<KilledToken>() => TaskOutcome::Killed,
            Err(payload) => TaskOutcome::Failed(panic_message(&payload)),
        }
    })
}

/// Swap from the running task back to its worker. Returns when the worker
/// next resumes the task.
pub(crate) fn suspend_current() {
    let yielder = YIELDER
        .get()
        .expect("suspension point reached outside a running task");
    // The yielder stays valid for the whole life of the coroutine, and this
    // thread is inside that coroutine right now.
    unsafe { yielder.as_ref().suspend(()) };
    // The worker clears the slot between activations; restore it for the
    // next suspension point on this stack.
    YIELDER.set(Some(yielder));
}

/// Clear the yielder slot after a resume returns to the worker.
pub(crate) fn clear_yielder() {
    YIELDER.set(None);
}

/// Unwind the current task's stack because its kill flag was observed.
pub(crate) fn unwind_killed() -> ! {
    trace!("unwinding killed task");
    std::panic::resume_unwind(Box::new(KilledToken))
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
