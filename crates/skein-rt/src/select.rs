// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! N-way blocking receive across ports.
//!
//! The scan holds every port's lock from a random starting index, so a
//! sender cannot slip in between "nothing is ready" and "blocked": it
//! either lands in a buffer we are about to see, or it observes us blocked
//! and goes through the selector rendezvous. The selector's own lock is
//! distinct from the port locks so the sender side can settle the race
//! without holding any port lock.

use std::sync::{Arc, Mutex};

use log::trace;

use crate::context;
use crate::port::{Port, PortId};
use crate::rng::XorShift64;
use crate::task::{self, BlockedOn, Task};

/// Per-task selector: the transient state of a task blocked in an n-way
/// receive. At most one select is active per task.
pub(crate) struct Selector {
    state: Mutex<SelectorState>,
}

struct SelectorState {
    /// Ports published by a blocked select; empty otherwise.
    published: Vec<PortId>,
    /// The port the winning sender reached, for the woken task.
    chosen: Option<PortId>,
    rng: XorShift64,
}

impl Selector {
    pub(crate) fn new(seed: u64) -> Self {
        Self {
            state: Mutex::new(SelectorState {
                published: Vec::new(),
                chosen: None,
                rng: XorShift64::new(seed),
            }),
        }
    }

    /// Sender side: a message was just buffered on `port`. If the owner is
    /// blocked in a select over that port, settle the rendezvous and wake
    /// it. Two racing senders serialize here; the loser finds the task no
    /// longer blocked and its message simply stays buffered.
    ///
    /// The caller must not hold the port's lock.
    pub(crate) fn msg_sent_on(&self, owner: &Arc<Task>, port: PortId) {
        let mut state = self.state.lock().unwrap();
        if !state.published.contains(&port) {
            return;
        }
        if owner.wakeup(BlockedOn::Selector) {
            trace!("{}: select rendezvous settled on {}", owner.id(), port);
            state.chosen = Some(port);
            state.published.clear();
        }
    }
}

/// Block until one of `ports` has a message; returns the index of the
/// ready port. The message itself stays buffered for a subsequent receive.
/// All ports must belong to the calling task. With several ports ready,
/// the rotated scan start gives each a nonzero chance of being picked.
pub fn select(ports: &[&Port]) -> usize {
    assert!(!ports.is_empty(), "select over an empty port set");
    let task = task::current();
    for port in ports {
        assert_eq!(
            port.owner_id(),
            task.id(),
            "select over a port owned by another task"
        );
    }

    let n = ports.len();
    let j = {
        let mut state = task.selector.state.lock().unwrap();
        assert!(
            state.published.is_empty() && state.chosen.is_none(),
            "one select at a time per task"
        );
        state.rng.next() as usize
    };

    // Scan with every visited port's lock held; release happens in the
    // same rotated order when the guards drop.
    let mut guards = Vec::with_capacity(n);
    for i in 0..n {
        let k = (i + j) % n;
        let inner = ports[k].lock_inner();
        if !inner.buffer.is_empty() {
            trace!("{}: select found {} ready", task.id(), ports[k].id());
            return k;
        }
        guards.push(inner);
    }

    {
        let mut state = task.selector.state.lock().unwrap();
        state.published = ports.iter().map(|p| p.id()).collect();
        if !task.block(BlockedOn::Selector, "waiting for select rendezvous") {
            state.published.clear();
            drop(state);
            drop(guards);
            context::unwind_killed();
        }
    }
    drop(guards);
    context::suspend_current();

    let chosen = {
        let mut state = task.selector.state.lock().unwrap();
        state.published.clear();
        state.chosen.take()
    };
    // A rendezvous that already committed wins over a concurrent kill;
    // the flag is observed at the next suspension point instead.
    if let Some(chosen) = chosen {
        return ports
            .iter()
            .position(|p| p.id() == chosen)
            .expect("selected port not in the polled set");
    }
    if task.killed() {
        context::unwind_killed();
    }
    panic!("select woken without a chosen port");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::Kernel;
    use crate::task::spawn;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn ready_port_is_found_without_blocking() {
        let kernel = Kernel::new();
        kernel
            .run_main(1, || {
                let a = Port::new(8);
                let b = Port::new(8);
                let kernel = task::current().kernel().unwrap();
                assert!(kernel.chan_send(b.chan(), &5u64.to_ne_bytes()));
                let idx = select(&[&a, &b]);
                assert_eq!(idx, 1);
                // The message is still buffered for the receive.
                let mut buf = [0u8; 8];
                assert!(b.try_recv(&mut buf));
                assert_eq!(u64::from_ne_bytes(buf), 5);
            })
            .unwrap();
    }

    #[test]
    fn blocked_select_woken_by_sender() {
        let kernel = Kernel::new();
        let got = Arc::new(AtomicUsize::new(usize::MAX));
        let g = got.clone();
        kernel
            .run_main(1, move || {
                let a = Port::new(8);
                let b = Port::new(8);
                let chan = b.chan();
                spawn("sender", move || {
                    let kernel = task::current().kernel().unwrap();
                    assert!(kernel.chan_send(chan, &9u64.to_ne_bytes()));
                });
                let idx = select(&[&a, &b]);
                g.store(idx, Ordering::SeqCst);
                let mut buf = [0u8; 8];
                assert!(b.try_recv(&mut buf));
            })
            .unwrap();
        assert_eq!(got.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn always_ready_ports_all_get_picked() {
        // Weak fairness: over many rounds with every port ready, each port
        // is chosen at least once.
        let kernel = Kernel::new();
        let seen = Arc::new(Mutex::new(HashSet::new()));
        let s = seen.clone();
        kernel
            .run_main(1, move || {
                let ports: Vec<_> = (0..4).map(|_| Port::new(8)).collect();
                let kernel = task::current().kernel().unwrap();
                for port in &ports {
                    for v in 0..64u64 {
                        assert!(kernel.chan_send(port.chan(), &v.to_ne_bytes()));
                    }
                }
                let refs: Vec<&Port> = ports.iter().map(|p| &**p).collect();
                let mut buf = [0u8; 8];
                for _ in 0..64 {
                    let idx = select(&refs);
                    assert!(ports[idx].try_recv(&mut buf));
                    s.lock().unwrap().insert(idx);
                }
            })
            .unwrap();
        assert_eq!(seen.lock().unwrap().len(), 4);
    }
}
