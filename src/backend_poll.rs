//! Readiness backend: `poll(2)` plus inline non-blocking syscalls.
//!
//! For platforms with neither a completion ring nor an overlapped port. Each
//! readiness-based operation is attempted once at submission; `WouldBlock`
//! registers the descriptor in the interest set, and once it polls ready the
//! non-blocking syscall runs inline and the result is reported. Filesystem
//! operations always route to the thread pool here. Timers live in a local
//! deadline list that bounds the poll timeout.
//!
//! Cross-thread wake is a self-pipe that is always part of the poll set.

#![cfg(unix)]

use core::ptr::NonNull;
use std::time::{Duration, Instant};

use crate::backend::{ReadyQueue, Waker, complete_now};
use crate::completion::{Completion, Op, OpKind, OpValue, OsFd};
use crate::errors::{Error, Result};
use crate::os;

struct Interest {
    c: NonNull<Completion>,
    fd: OsFd,
    events: i16,
}

struct TimerEntry {
    c: NonNull<Completion>,
    deadline: Instant,
}

pub(crate) struct PollBackend {
    interests: Vec<Interest>,
    timers: Vec<TimerEntry>,
    pipe_r: OsFd,
    pipe_w: OsFd,
    /// Rebuilt on every poll call; index 0 is the self-pipe.
    pollfds: Vec<libc::pollfd>,
}

impl PollBackend {
    pub(crate) fn new() -> Result<Self> {
        let (pipe_r, pipe_w) = os::pipe_pair()?;

        log::debug!("readiness backend initialized (self-pipe wake)");
        Ok(Self {
            interests: Vec::new(),
            timers: Vec::new(),
            pipe_r,
            pipe_w,
            pollfds: Vec::new(),
        })
    }

    pub(crate) fn waker(&self) -> Waker {
        Waker::Pipe(self.pipe_w)
    }

    /// Filesystem operations have no readiness notion; they run blocking on
    /// a pool worker.
    pub(crate) fn routes_to_pool(&self, op: &Op) -> bool {
        matches!(
            op.kind(),
            OpKind::FileOpen
                | OpKind::FileRead
                | OpKind::FileWrite
                | OpKind::FileSync
                | OpKind::FileRename
                | OpKind::FileDelete
        )
    }

    pub(crate) fn submit(&mut self, c: &mut Completion, ready: &mut ReadyQueue) {
        let outcome = match c.op {
            Op::NetOpen {
                domain,
                socket_type,
                protocol,
            } => os::socket(domain, socket_type, protocol).map(OpValue::Fd),
            Op::NetBind { fd, addr, addr_len } => {
                os::bind(fd, addr, addr_len).map(|()| OpValue::Void)
            }
            Op::NetListen { fd, backlog } => os::listen(fd, backlog).map(|()| OpValue::Void),
            Op::NetShutdown { fd, how } => os::shutdown(fd, how).map(|()| OpValue::Void),
            Op::NetClose { fd } | Op::FileClose { fd } => {
                os::close_fd(fd).map(|()| OpValue::Void)
            }
            Op::Timer { deadline } => {
                self.timers.push(TimerEntry {
                    c: NonNull::from(&mut *c),
                    deadline,
                });
                return;
            }
            Op::NetAccept { .. }
            | Op::NetConnect { .. }
            | Op::NetRecv { .. }
            | Op::NetSend { .. }
            | Op::NetRecvFrom { .. }
            | Op::NetSendTo { .. } => {
                // Optimistic first attempt; register interest on WouldBlock.
                let fd = readiness_fd(&c.op);
                if let Err(e) = os::set_nonblocking(fd) {
                    c.set_error(e);
                    complete_now(c, ready);
                    return;
                }
                match first_attempt(c) {
                    Err(Error::WouldBlock) => {
                        self.interests.push(Interest {
                            c: NonNull::from(&mut *c),
                            fd,
                            events: readiness_events(&c.op),
                        });
                        return;
                    }
                    outcome => outcome,
                }
            }
            Op::AsyncWake
            | Op::Work { .. }
            | Op::Cancel { .. }
            | Op::NetGetAddrInfo { .. }
            | Op::NetGetNameInfo { .. }
            | Op::FileOpen { .. }
            | Op::FileRead { .. }
            | Op::FileWrite { .. }
            | Op::FileSync { .. }
            | Op::FileRename { .. }
            | Op::FileDelete { .. } => {
                unreachable!("operation never reaches the readiness backend")
            }
        };

        match outcome {
            Ok(value) => c.set_value(value),
            Err(e) => c.set_error(e),
        }
        complete_now(c, ready);
    }

    pub(crate) fn cancel(
        &mut self,
        cancel_c: &mut Completion,
        target: &mut Completion,
        ready: &mut ReadyQueue,
    ) {
        let target_ptr = NonNull::from(&mut *target);

        if let Some(i) = self.interests.iter().position(|e| e.c == target_ptr) {
            self.interests.swap_remove(i);
            target.set_error(Error::Canceled);
            complete_now(target, ready);
        } else if let Some(i) = self.timers.iter().position(|e| e.c == target_ptr) {
            self.timers.swap_remove(i);
            target.set_error(Error::Canceled);
            complete_now(target, ready);
        }
        // Not registered: the target completed in this same iteration and is
        // already queued for dispatch.

        cancel_c.set_value(OpValue::Void);
        complete_now(cancel_c, ready);
    }

    pub(crate) fn poll(
        &mut self,
        timeout: Option<Duration>,
        ready: &mut ReadyQueue,
    ) -> Result<bool> {
        let now = Instant::now();

        // Clamp the wait by the nearest armed timer.
        let next_timer = self.timers.iter().map(|t| t.deadline).min();
        let mut effective = timeout;
        if let Some(deadline) = next_timer {
            let until = deadline.saturating_duration_since(now);
            effective = Some(match effective {
                Some(t) => t.min(until),
                None => until,
            });
        }
        let timeout_ms = match effective {
            None => -1i32,
            Some(d) if d.is_zero() => 0,
            Some(d) => {
                let ms = d.as_millis();
                // Round a sub-millisecond wait up so we do not spin.
                (ms.clamp(1, i32::MAX as u128)) as i32
            }
        };

        self.pollfds.clear();
        self.pollfds.push(libc::pollfd {
            fd: self.pipe_r,
            events: libc::POLLIN,
            revents: 0,
        });
        for interest in &self.interests {
            self.pollfds.push(libc::pollfd {
                fd: interest.fd,
                events: interest.events,
                revents: 0,
            });
        }

        let n = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        if n < 0 {
            let errno = os::last_errno();
            if errno == libc::EINTR {
                return Ok(false);
            }
            return Err(os::map_errno(errno));
        }

        if self.pollfds[0].revents != 0 {
            os::wake_drain(self.pipe_r);
        }

        // Ready descriptors: run the non-blocking syscall inline. A spurious
        // wakeup (WouldBlock again) stays registered.
        let mut finished: Vec<(usize, NonNull<Completion>, Result<OpValue>)> = Vec::new();
        for (i, interest) in self.interests.iter().enumerate() {
            let revents = self.pollfds[i + 1].revents;
            if revents == 0 {
                continue;
            }

            // SAFETY: registered completions are pinned while in flight.
            let c = unsafe { &mut *interest.c.as_ptr() };
            match ready_attempt(c) {
                Err(Error::WouldBlock) => {}
                outcome => finished.push((i, interest.c, outcome)),
            }
        }

        // Reverse index order keeps earlier indices stable across swap_remove.
        for &(i, _, _) in finished.iter().rev() {
            self.interests.swap_remove(i);
        }
        let fired = !finished.is_empty();
        for (_, ptr, outcome) in finished {
            // SAFETY: just unregistered; the completion is still pinned.
            let c = unsafe { &mut *ptr.as_ptr() };
            match outcome {
                Ok(value) => c.set_value(value),
                Err(e) => c.set_error(e),
            }
            complete_now(c, ready);
        }

        let timers_fired = self.expire_timers(ready);
        Ok(n == 0 && !fired && !timers_fired)
    }

    fn expire_timers(&mut self, ready: &mut ReadyQueue) -> bool {
        let now = Instant::now();
        let mut fired = false;

        let mut i = 0;
        while i < self.timers.len() {
            if self.timers[i].deadline <= now {
                let entry = self.timers.swap_remove(i);
                // SAFETY: armed timers are pinned while in flight.
                let c = unsafe { &mut *entry.c.as_ptr() };
                c.set_value(OpValue::Void);
                complete_now(c, ready);
                fired = true;
            } else {
                i += 1;
            }
        }
        fired
    }
}

impl Drop for PollBackend {
    fn drop(&mut self) {
        let _ = os::close_fd(self.pipe_r);
        let _ = os::close_fd(self.pipe_w);
    }
}

fn readiness_fd(op: &Op) -> OsFd {
    match *op {
        Op::NetAccept { fd }
        | Op::NetConnect { fd, .. }
        | Op::NetRecv { fd, .. }
        | Op::NetSend { fd, .. }
        | Op::NetRecvFrom { fd, .. }
        | Op::NetSendTo { fd, .. } => fd,
        _ => unreachable!("not a readiness operation"),
    }
}

fn readiness_events(op: &Op) -> i16 {
    match op.kind() {
        OpKind::NetAccept | OpKind::NetRecv | OpKind::NetRecvFrom => libc::POLLIN,
        OpKind::NetConnect | OpKind::NetSend | OpKind::NetSendTo => libc::POLLOUT,
        _ => unreachable!("not a readiness operation"),
    }
}

/// First (optimistic) attempt, performed inside `submit`.
fn first_attempt(c: &mut Completion) -> Result<OpValue> {
    match c.op {
        Op::NetAccept { fd } => os::accept(fd).map(OpValue::Fd),
        Op::NetConnect { fd, addr, addr_len } => {
            os::connect(fd, addr, addr_len).map(|()| OpValue::Void)
        }
        Op::NetRecv { fd, buf, len } => os::recv(fd, buf, len).map(OpValue::Bytes),
        Op::NetSend { fd, buf, len } => os::send(fd, buf, len).map(OpValue::Bytes),
        Op::NetRecvFrom {
            fd,
            buf,
            len,
            addr,
            addr_len,
        } => os::recvfrom(fd, buf, len, addr, addr_len).map(OpValue::Bytes),
        Op::NetSendTo {
            fd,
            buf,
            len,
            addr,
            addr_len,
        } => os::sendto(fd, buf, len, addr, addr_len).map(OpValue::Bytes),
        _ => unreachable!("not a readiness operation"),
    }
}

/// Attempt once the descriptor polled ready. Identical to the first attempt
/// except for connect, whose outcome is read from `SO_ERROR`.
fn ready_attempt(c: &mut Completion) -> Result<OpValue> {
    match c.op {
        Op::NetConnect { fd, .. } => os::connect_result(fd).map(|()| OpValue::Void),
        _ => first_attempt(c),
    }
}
