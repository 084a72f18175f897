// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime error types.
//!
//! Only construction-time failures surface as errors. Lookup misses on the
//! message paths (`chan_send`, `get_task`, `get_scheduler`) report as
//! `bool`/`Option` and are never fatal; invariant violations are assertions.

use thiserror::Error;

use crate::sched::SchedId;
use crate::task::TaskId;

#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A caller-supplied argument was out of range.
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),

    /// The scheduler id is not registered with this kernel.
    #[error("scheduler {0} not found")]
    SchedulerNotFound(SchedId),

    /// The task id is not registered with this kernel.
    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    /// A task stack could not be allocated.
    #[error("stack allocation failed: {0}")]
    StackAlloc(#[from] std::io::Error),
}
