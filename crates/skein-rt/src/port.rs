// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Ports and channels.
//!
//! A port is an unbounded FIFO of fixed-unit-size messages owned by a single
//! task; only the owner receives, anyone with a channel may send. A channel
//! is a copyable `(task, port)` id pair; sending through a stale channel is
//! silently dropped, never an error.
//!
//! A blocked receiver takes messages through the rendezvous slot: the sender
//! fills the slot and wakes the owner under the port lock, bypassing the
//! buffer, so the data is in place before the receiver next runs.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use log::trace;

use crate::context;
use crate::task::{self, BlockedOn, Task, TaskId};

/// Port identifier, unique within its owning task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId(pub(crate) u64);

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port({})", self.0)
    }
}

/// Copyable handle addressing a port: `(task, port)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Chan {
    pub task: TaskId,
    pub port: PortId,
}

impl Chan {
    /// Encode as a 16-byte handle, so channels themselves can travel
    /// through ports.
    pub fn to_bytes(self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0..8].copy_from_slice(&self.task.0.to_ne_bytes());
        out[8..16].copy_from_slice(&self.port.0.to_ne_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Chan {
        assert_eq!(bytes.len(), 16, "channel handle size mismatch");
        Chan {
            task: TaskId(u64::from_ne_bytes(bytes[0..8].try_into().unwrap())),
            port: PortId(u64::from_ne_bytes(bytes[8..16].try_into().unwrap())),
        }
    }
}

pub(crate) struct PortInner {
    pub(crate) buffer: VecDeque<Box<[u8]>>,
    /// Direct hand-off slot for a blocked receiver.
    rendezvous: Option<Box<[u8]>>,
    detached: bool,
}

pub struct Port {
    id: PortId,
    unit_sz: usize,
    owner_id: TaskId,
    owner: Weak<Task>,
    inner: Mutex<PortInner>,
}

impl Port {
    /// Create a port owned by the calling task.
    pub fn new(unit_sz: usize) -> Arc<Port> {
        let owner = task::current();
        let port = Arc::new(Port {
            id: owner.alloc_port_id(),
            unit_sz,
            owner_id: owner.id(),
            owner: Arc::downgrade(&owner),
            inner: Mutex::new(PortInner {
                buffer: VecDeque::new(),
                rendezvous: None,
                detached: false,
            }),
        });
        owner.add_port(port.clone());
        trace!("{}: new {} (unit_sz={})", owner.id(), port.id, unit_sz);
        port
    }

    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn unit_size(&self) -> usize {
        self.unit_sz
    }

    /// Channel addressing this port.
    pub fn chan(&self) -> Chan {
        Chan {
            task: self.owner_id,
            port: self.id,
        }
    }

    /// Number of buffered messages.
    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().buffer.len()
    }

    pub(crate) fn owner_id(&self) -> TaskId {
        self.owner_id
    }

    pub(crate) fn lock_inner(&self) -> MutexGuard<'_, PortInner> {
        self.inner.lock().unwrap()
    }

    /// Deliver one message. Returns whether the message was accepted;
    /// detached or orphaned ports drop it.
    pub(crate) fn send(&self, data: &[u8]) -> bool {
        assert_eq!(
            data.len(),
            self.unit_sz,
            "send of {} bytes on a port with unit size {}",
            data.len(),
            self.unit_sz
        );
        let mut inner = self.inner.lock().unwrap();
        if inner.detached {
            return false;
        }
        let Some(owner) = self.owner.upgrade() else {
            return false;
        };
        if owner.wakeup(BlockedOn::Port(self.id)) {
            // We won the wake while holding the port lock: the receiver
            // cannot re-acquire it to look at the slot until we are done.
            inner.rendezvous = Some(data.into());
            trace!("{}: rendezvous hand-off to {}", self.id, owner.id());
            return true;
        }
        inner.buffer.push_back(data.into());
        drop(inner);
        // The owner may be parked in a select over this port; the selector
        // rendezvous lock is taken without the port lock held.
        owner.selector.msg_sent_on(&owner, self.id);
        true
    }

    /// Non-blocking receive into `dst`. Owner only.
    pub fn try_recv(&self, dst: &mut [u8]) -> bool {
        self.check_receiver(dst);
        match self.inner.lock().unwrap().buffer.pop_front() {
            Some(msg) => {
                dst.copy_from_slice(&msg);
                true
            }
            None => false,
        }
    }

    /// Blocking receive into `dst`. Owner only; suspends the calling task
    /// until a message arrives. A killed receiver unwinds without
    /// dequeuing.
    pub fn recv(&self, dst: &mut [u8]) {
        let receiver = self.check_receiver(dst);
        loop {
            let mut inner = self.inner.lock().unwrap();
            if let Some(msg) = inner.buffer.pop_front() {
                dst.copy_from_slice(&msg);
                return;
            }
            if receiver.killed() {
                drop(inner);
                context::unwind_killed();
            }
            trace!("{}: {} waiting for rendezvous data", receiver.id(), self.id);
            if !receiver.block(BlockedOn::Port(self.id), "waiting for rendezvous data") {
                drop(inner);
                context::unwind_killed();
            }
            drop(inner);
            context::suspend_current();

            let mut inner = self.inner.lock().unwrap();
            if let Some(msg) = inner.rendezvous.take() {
                dst.copy_from_slice(&msg);
                return;
            }
            drop(inner);
            if receiver.killed() {
                context::unwind_killed();
            }
            // Woken without a hand-off: retry the buffer.
        }
    }

    /// Signal that the port is going away and wait until the caller holds
    /// the only reference, so no in-flight sender still uses it. After
    /// `detach`, dropping the last handle deletes the port; calling it
    /// again is a no-op.
    pub fn detach(self: &Arc<Self>) {
        let owner = task::current();
        assert_eq!(
            owner.id(),
            self.owner_id,
            "only the owning task may detach a port"
        );
        self.inner.lock().unwrap().detached = true;
        owner.remove_port(self.id);
        // In-flight senders hold lookup references; wait them out.
        while Arc::strong_count(self) > 1 {
            std::hint::spin_loop();
        }
    }

    fn check_receiver(&self, dst: &mut [u8]) -> Arc<Task> {
        assert_eq!(
            dst.len(),
            self.unit_sz,
            "receive of {} bytes on a port with unit size {}",
            dst.len(),
            self.unit_sz
        );
        let receiver = task::current();
        assert_eq!(
            receiver.id(),
            self.owner_id,
            "only the owning task may receive from a port"
        );
        receiver
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("id", &self.id)
            .field("owner", &self.owner_id)
            .field("unit_sz", &self.unit_sz)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::Kernel;
    use crate::task::spawn;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    #[test]
    fn buffered_send_then_recv() {
        let kernel = Kernel::new();
        kernel
            .run_main(1, || {
                let port = Port::new(8);
                assert!(kernel_send(port.chan(), 42));
                assert_eq!(port.size(), 1);
                let mut buf = [0u8; 8];
                port.recv(&mut buf);
                assert_eq!(u64::from_ne_bytes(buf), 42);
            })
            .unwrap();

        fn kernel_send(chan: Chan, v: u64) -> bool {
            crate::task::current()
                .kernel()
                .unwrap()
                .chan_send(chan, &v.to_ne_bytes())
        }
    }

    #[test]
    fn try_recv_on_empty_port() {
        let kernel = Kernel::new();
        kernel
            .run_main(1, || {
                let port = Port::new(4);
                let mut buf = [0u8; 4];
                assert!(!port.try_recv(&mut buf));
            })
            .unwrap();
    }

    #[test]
    fn rendezvous_wakes_blocked_receiver() {
        let kernel = Kernel::new();
        let got = Arc::new(AtomicU64::new(0));
        let g = got.clone();
        kernel
            .run_main(2, move || {
                let port = Port::new(8);
                let chan = port.chan();
                spawn("sender", move || {
                    let kernel = crate::task::current().kernel().unwrap();
                    // The receiver may not be blocked yet; either path
                    // (buffer or rendezvous) must deliver.
                    assert!(kernel.chan_send(chan, &7u64.to_ne_bytes()));
                });
                let mut buf = [0u8; 8];
                port.recv(&mut buf);
                g.store(u64::from_ne_bytes(buf), Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(got.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn send_to_missing_destination_is_dropped() {
        let kernel = Kernel::new();
        let ok = Arc::new(AtomicBool::new(true));
        let o = ok.clone();
        kernel
            .run_main(1, move || {
                let kernel = crate::task::current().kernel().unwrap();
                let stale = Chan {
                    task: TaskId(u64::MAX),
                    port: PortId(1),
                };
                o.store(!kernel.chan_send(stale, &[0u8; 8]), Ordering::SeqCst);
            })
            .unwrap();
        assert!(ok.load(Ordering::SeqCst));
    }

    #[test]
    fn detach_then_send_is_dropped() {
        let kernel = Kernel::new();
        kernel
            .run_main(1, || {
                let port = Port::new(1);
                let chan = port.chan();
                port.detach();
                let kernel = crate::task::current().kernel().unwrap();
                assert!(!kernel.chan_send(chan, &[9u8]));
                assert_eq!(Arc::strong_count(&port), 1);
            })
            .unwrap();
    }

    #[test]
    fn detach_twice_is_idempotent() {
        let kernel = Kernel::new();
        kernel
            .run_main(1, || {
                let port = Port::new(1);
                port.detach();
                port.detach();
            })
            .unwrap();
    }

    #[test]
    fn fifo_order_is_preserved() {
        let kernel = Kernel::new();
        kernel
            .run_main(1, || {
                let port = Port::new(8);
                let kernel = crate::task::current().kernel().unwrap();
                for i in 0..16u64 {
                    assert!(kernel.chan_send(port.chan(), &i.to_ne_bytes()));
                }
                let mut buf = [0u8; 8];
                for i in 0..16u64 {
                    port.recv(&mut buf);
                    assert_eq!(u64::from_ne_bytes(buf), i);
                }
            })
            .unwrap();
    }
}
