// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! skein: a userspace M:N task runtime.
//!
//! A kernel owns a dynamic set of schedulers; each scheduler owns a fixed
//! number of worker threads; each worker cooperatively multiplexes many
//! stackful tasks, pinned to it for life. Tasks communicate only through
//! ports (task-owned unbounded FIFOs of fixed-size units) and channels
//! (copyable `(task, port)` handles).
//!
//! Components:
//! - kernel — id tables, exit status, quiescence
//! - sched — schedulers and their worker scheduling loops
//! - task — the schedulable unit: spawn, yield, kill/unwind
//! - port / select — message passing, blocking receive, n-way select
//! - reactor — event-loop collaborator delivering I/O and timer
//!   completions onto ports
//!
//! ```no_run
//! use skein_rt::{Kernel, Port};
//!
//! let kernel = Kernel::new();
//! let status = kernel
//!     .run_main(2, || {
//!         let port = Port::new(8);
//!         let chan = port.chan();
//!         skein_rt::spawn("sender", move || {
//!             skein_rt::chan_send(chan, &7u64.to_ne_bytes());
//!         });
//!         let mut buf = [0u8; 8];
//!         port.recv(&mut buf);
//!         assert_eq!(u64::from_ne_bytes(buf), 7);
//!     })
//!     .unwrap();
//! assert_eq!(status, 0);
//! ```

pub mod config;
pub mod error;
pub mod kernel;
pub mod port;
pub mod reactor;
pub mod sched;
pub mod select;
pub mod task;

mod context;
mod rng;

pub use config::Config;
pub use error::RuntimeError;
pub use kernel::Kernel;
pub use port::{Chan, Port, PortId};
pub use reactor::{EventLoop, IoMsg, IoTag, IO_UNIT};
pub use sched::{SchedId, Scheduler};
pub use select::select;
pub use task::{
    current_sched_id, current_task_id, current_worker, fail_all, new_task, new_task_in,
    sched_threads, set_exit_status, spawn, start_task, unsupervise, yield_now, Task, TaskId,
    TaskState,
};

/// Send on a channel from within a task. See [`Kernel::chan_send`] for the
/// any-thread variant.
pub fn chan_send(chan: Chan, data: &[u8]) -> bool {
    task::current()
        .kernel()
        .expect("kernel gone")
        .chan_send(chan, data)
}
