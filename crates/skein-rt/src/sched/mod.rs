// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Two-level scheduling: schedulers own workers, workers own tasks.

pub mod scheduler;
pub(crate) mod worker;

pub use scheduler::{SchedId, Scheduler};
