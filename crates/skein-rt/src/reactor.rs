// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Event-loop collaborator: epoll-backed I/O and timers for tasks.
//!
//! One dedicated loop thread per pool at most. Workers never block on I/O:
//! they enqueue commands here and receive fixed-size completion messages
//! (`connected`, `wrote`, `read`, `timer`, `exit`) on ordinary ports via
//! `Kernel::chan_send`. Only the loop thread touches loop state; the
//! eventfd write is the sole cross-thread wake primitive.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::kernel::Kernel;
use crate::port::Chan;

/// Unit size of completion messages; ports receiving them are created with
/// this unit size.
pub const IO_UNIT: usize = 16;

/// epoll token reserved for the wake eventfd.
const WAKE_TOKEN: u64 = u64::MAX;

const READ_CHUNK: usize = 4096;

/// Completion message tags.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoTag {
    None = 0,
    Connected = 1,
    Wrote = 2,
    Read = 3,
    Timer = 4,
    Exit = 5,
}

impl IoTag {
    fn from_u32(v: u32) -> IoTag {
        match v {
            1 => IoTag::Connected,
            2 => IoTag::Wrote,
            3 => IoTag::Read,
            4 => IoTag::Timer,
            5 => IoTag::Exit,
            _ => IoTag::None,
        }
    }
}

/// A completion message: exactly [`IO_UNIT`] bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoMsg {
    pub tag: IoTag,
    pub req_id: u32,
    /// Byte count for `wrote`/`read`; zero otherwise.
    pub len: u64,
}

impl IoMsg {
    pub fn to_bytes(self) -> [u8; IO_UNIT] {
        let mut out = [0u8; IO_UNIT];
        out[0..4].copy_from_slice(&(self.tag as u32).to_ne_bytes());
        out[4..8].copy_from_slice(&self.req_id.to_ne_bytes());
        out[8..16].copy_from_slice(&self.len.to_ne_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> IoMsg {
        assert_eq!(bytes.len(), IO_UNIT, "completion message size mismatch");
        IoMsg {
            tag: IoTag::from_u32(u32::from_ne_bytes(bytes[0..4].try_into().unwrap())),
            req_id: u32::from_ne_bytes(bytes[4..8].try_into().unwrap()),
            len: u64::from_ne_bytes(bytes[8..16].try_into().unwrap()),
        }
    }
}

enum Cmd {
    Connect { req_id: u32, addr: SocketAddr, chan: Chan },
    Write { req_id: u32, buf: Vec<u8>, chan: Chan },
    ReadStart { req_id: u32, chan: Chan },
    Close { req_id: u32 },
    Timer { req_id: u32, delay: Duration, chan: Chan },
    Stop { chan: Option<Chan> },
}

struct LoopShared {
    kernel: Arc<Kernel>,
    epoll_fd: RawFd,
    wake_fd: RawFd,
    cmds: Mutex<VecDeque<Cmd>>,
    /// Read payloads by request id, retrievable with `take_read`.
    reads: Mutex<HashMap<u32, Vec<u8>>>,
}

impl LoopShared {
    fn send_msg(&self, chan: Chan, msg: IoMsg) {
        if !self.kernel.chan_send(chan, &msg.to_bytes()) {
            trace!("completion {:?} dropped, destination gone", msg.tag);
        }
    }

    /// The wake primitive: makes a pending `epoll_wait` return.
    fn wake(&self) {
        let val: u64 = 1;
        unsafe {
            libc::write(self.wake_fd, &val as *const u64 as *const libc::c_void, 8);
        }
    }
}

impl Drop for LoopShared {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wake_fd);
            libc::close(self.epoll_fd);
        }
    }
}

pub struct EventLoop {
    shared: Arc<LoopShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl EventLoop {
    /// Create the loop and start its thread.
    pub fn new(kernel: Arc<Kernel>) -> io::Result<EventLoop> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wake_fd < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epoll_fd) };
            return Err(err);
        }
        if let Err(e) = epoll_add(epoll_fd, wake_fd, libc::EPOLLIN as u32, WAKE_TOKEN) {
            unsafe {
                libc::close(wake_fd);
                libc::close(epoll_fd);
            }
            return Err(e);
        }

        let shared = Arc::new(LoopShared {
            kernel,
            epoll_fd,
            wake_fd,
            cmds: Mutex::new(VecDeque::new()),
            reads: Mutex::new(HashMap::new()),
        });
        let thread_shared = shared.clone();
        let thread = thread::Builder::new()
            .name("skein-reactor".to_string())
            .spawn(move || run_loop(&thread_shared))
            .expect("failed to spawn reactor thread");

        Ok(EventLoop {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Open a TCP connection; a `connected` completion lands on `chan`.
    pub fn connect(&self, req_id: u32, addr: SocketAddr, chan: Chan) {
        self.push(Cmd::Connect { req_id, addr, chan });
    }

    /// Write to a connection; a `wrote` completion lands on `chan`.
    pub fn write(&self, req_id: u32, buf: Vec<u8>, chan: Chan) {
        self.push(Cmd::Write { req_id, buf, chan });
    }

    /// Start reading from a connection; each chunk produces a `read`
    /// completion on `chan` and the payload is held for `take_read`.
    pub fn read_start(&self, req_id: u32, chan: Chan) {
        self.push(Cmd::ReadStart { req_id, chan });
    }

    pub fn close_connection(&self, req_id: u32) {
        self.push(Cmd::Close { req_id });
    }

    /// One-shot timer: a `timer` completion lands on `chan` after `delay`.
    pub fn timer(&self, req_id: u32, delay: Duration, chan: Chan) {
        self.push(Cmd::Timer { req_id, delay, chan });
    }

    /// Stop the loop and join its thread. With a channel, an `exit`
    /// completion is delivered right before the thread winds down.
    pub fn stop(&self, chan: Option<Chan>) {
        let handle = self.thread.lock().unwrap().take();
        if let Some(handle) = handle {
            self.push(Cmd::Stop { chan });
            let _ = handle.join();
        }
    }

    /// Drain the accumulated read payload for a request.
    pub fn take_read(&self, req_id: u32) -> Option<Vec<u8>> {
        self.shared.reads.lock().unwrap().remove(&req_id)
    }

    fn push(&self, cmd: Cmd) {
        self.shared.cmds.lock().unwrap().push_back(cmd);
        self.shared.wake();
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.stop(None);
    }
}

// ---------------------------------------------------------------------------
// Loop thread
// ---------------------------------------------------------------------------

struct Conn {
    stream: TcpStream,
    reading: Option<Chan>,
    writes: VecDeque<PendingWrite>,
}

struct PendingWrite {
    buf: Vec<u8>,
    pos: usize,
    chan: Chan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TimerDeadline {
    at: Instant,
    req_id: u32,
}

fn run_loop(shared: &LoopShared) {
    let mut conns: HashMap<u32, Conn> = HashMap::new();
    let mut timers: BinaryHeap<Reverse<TimerDeadline>> = BinaryHeap::new();
    let mut timer_chans: HashMap<u32, Chan> = HashMap::new();
    debug!("reactor loop started");

    loop {
        if let Some(exit_chan) = drain_cmds(shared, &mut conns, &mut timers, &mut timer_chans) {
            if let Some(chan) = exit_chan {
                shared.send_msg(
                    chan,
                    IoMsg { tag: IoTag::Exit, req_id: 0, len: 0 },
                );
            }
            break;
        }

        let now = Instant::now();
        while let Some(Reverse(deadline)) = timers.peek().copied() {
            if deadline.at > now {
                break;
            }
            timers.pop();
            if let Some(chan) = timer_chans.remove(&deadline.req_id) {
                trace!("timer {} fired", deadline.req_id);
                shared.send_msg(
                    chan,
                    IoMsg { tag: IoTag::Timer, req_id: deadline.req_id, len: 0 },
                );
            }
        }

        let timeout_ms: i32 = match timers.peek() {
            Some(Reverse(deadline)) => {
                let remaining = deadline.at.saturating_duration_since(Instant::now());
                (remaining.as_millis().min(i32::MAX as u128 - 1) as i32) + 1
            }
            None => -1,
        };

        const MAX_EVENTS: usize = 64;
        let mut events: [libc::epoll_event; MAX_EVENTS] =
            [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        let n = unsafe {
            libc::epoll_wait(
                shared.epoll_fd,
                events.as_mut_ptr(),
                MAX_EVENTS as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            warn!("epoll_wait failed: {}", err);
            break;
        }

        for event in events.iter().take(n as usize) {
            if event.u64 == WAKE_TOKEN {
                let mut buf = [0u8; 8];
                unsafe {
                    libc::read(shared.wake_fd, buf.as_mut_ptr() as *mut libc::c_void, 8);
                }
                continue;
            }
            let req_id = event.u64 as u32;
            let Some(conn) = conns.get_mut(&req_id) else {
                continue;
            };
            if event.events & libc::EPOLLOUT as u32 != 0 {
                flush_writes(shared, req_id, conn);
            }
            if event.events & (libc::EPOLLIN | libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0 {
                drain_reads(shared, req_id, conn);
            }
        }
    }
    debug!("reactor loop finished");
}

/// Process queued commands. Returns `Some` when a stop was requested.
fn drain_cmds(
    shared: &LoopShared,
    conns: &mut HashMap<u32, Conn>,
    timers: &mut BinaryHeap<Reverse<TimerDeadline>>,
    timer_chans: &mut HashMap<u32, Chan>,
) -> Option<Option<Chan>> {
    loop {
        let cmd = shared.cmds.lock().unwrap().pop_front();
        match cmd {
            None => return None,
            Some(Cmd::Connect { req_id, addr, chan }) => {
                if conns.contains_key(&req_id) {
                    warn!("connect: request id {} already in use", req_id);
                    continue;
                }
                match TcpStream::connect(addr) {
                    Ok(stream) => {
                        if let Err(e) = stream.set_nonblocking(true) {
                            warn!("connect {}: {}", req_id, e);
                            continue;
                        }
                        if let Err(e) = epoll_add(
                            shared.epoll_fd,
                            stream.as_raw_fd(),
                            libc::EPOLLIN as u32,
                            req_id as u64,
                        ) {
                            warn!("connect {}: register failed: {}", req_id, e);
                            continue;
                        }
                        conns.insert(
                            req_id,
                            Conn { stream, reading: None, writes: VecDeque::new() },
                        );
                        shared.send_msg(
                            chan,
                            IoMsg { tag: IoTag::Connected, req_id, len: 0 },
                        );
                    }
                    Err(e) => warn!("connect {} to {}: {}", req_id, addr, e),
                }
            }
            Some(Cmd::Write { req_id, buf, chan }) => {
                if let Some(conn) = conns.get_mut(&req_id) {
                    conn.writes.push_back(PendingWrite { buf, pos: 0, chan });
                    flush_writes(shared, req_id, conn);
                }
            }
            Some(Cmd::ReadStart { req_id, chan }) => {
                if let Some(conn) = conns.get_mut(&req_id) {
                    conn.reading = Some(chan);
                    drain_reads(shared, req_id, conn);
                }
            }
            Some(Cmd::Close { req_id }) => {
                if let Some(conn) = conns.remove(&req_id) {
                    let _ = epoll_del(shared.epoll_fd, conn.stream.as_raw_fd());
                }
            }
            Some(Cmd::Timer { req_id, delay, chan }) => {
                timers.push(Reverse(TimerDeadline { at: Instant::now() + delay, req_id }));
                timer_chans.insert(req_id, chan);
            }
            Some(Cmd::Stop { chan }) => return Some(chan),
        }
    }
}

fn flush_writes(shared: &LoopShared, req_id: u32, conn: &mut Conn) {
    while let Some(front) = conn.writes.front_mut() {
        match conn.stream.write(&front.buf[front.pos..]) {
            Ok(n) => {
                front.pos += n;
                if front.pos == front.buf.len() {
                    let done = conn.writes.pop_front().expect("front checked above");
                    shared.send_msg(
                        done.chan,
                        IoMsg { tag: IoTag::Wrote, req_id, len: done.buf.len() as u64 },
                    );
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                warn!("write {}: {}", req_id, e);
                conn.writes.pop_front();
            }
        }
    }
    let interest = if conn.writes.is_empty() {
        libc::EPOLLIN as u32
    } else {
        (libc::EPOLLIN | libc::EPOLLOUT) as u32
    };
    let _ = epoll_mod(shared.epoll_fd, conn.stream.as_raw_fd(), interest, req_id as u64);
}

fn drain_reads(shared: &LoopShared, req_id: u32, conn: &mut Conn) {
    let Some(chan) = conn.reading else {
        return;
    };
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match conn.stream.read(&mut buf) {
            Ok(0) => {
                shared.send_msg(chan, IoMsg { tag: IoTag::Read, req_id, len: 0 });
                conn.reading = None;
                break;
            }
            Ok(n) => {
                shared
                    .reads
                    .lock()
                    .unwrap()
                    .entry(req_id)
                    .or_default()
                    .extend_from_slice(&buf[..n]);
                shared.send_msg(
                    chan,
                    IoMsg { tag: IoTag::Read, req_id, len: n as u64 },
                );
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                warn!("read {}: {}", req_id, e);
                conn.reading = None;
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// epoll helpers
// ---------------------------------------------------------------------------

fn epoll_add(epoll_fd: RawFd, fd: RawFd, events: u32, token: u64) -> io::Result<()> {
    let mut ev = libc::epoll_event { events, u64: token };
    let ret = unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn epoll_mod(epoll_fd: RawFd, fd: RawFd, events: u32, token: u64) -> io::Result<()> {
    let mut ev = libc::epoll_event { events, u64: token };
    let ret = unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_MOD, fd, &mut ev) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn epoll_del(epoll_fd: RawFd, fd: RawFd) -> io::Result<()> {
    let ret = unsafe {
        libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
    };
    if ret < 0 {
        let err = io::Error::last_os_error();
        // Already-closed fds are fine here.
        if err.raw_os_error() != Some(libc::ENOENT) && err.raw_os_error() != Some(libc::EBADF) {
            return Err(err);
        }
    }
    Ok(())
}
