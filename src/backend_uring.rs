//! Linux completion-ring backend (io_uring).
//!
//! Every ring-bound operation becomes one SQE whose `user_data` is the
//! completion's address; reaping a CQE therefore maps directly back to the
//! completion record. Synchronous operations (open/bind/listen/close/
//! shutdown) run inline in `submit`. Timers are in-kernel timeout SQEs, so
//! `poll` never needs a computed timer deadline of its own.
//!
//! Cross-thread wake is an eventfd with a `POLL_ADD` SQE armed on it: a
//! foreign thread writes the counter, the ring reports a CQE with the wake
//! sentinel, and the blocked `submit_and_wait` returns. The poll entry is
//! re-armed after every firing.

#![cfg(target_os = "linux")]

use std::mem;
use std::time::{Duration, Instant};

use io_uring::{IoUring, opcode, squeue, types};

use crate::backend::{ReadyQueue, Waker, complete_now};
use crate::completion::{
    AcceptScratch, Completion, MsgScratch, Op, OpKind, OpValue, OsFd, Scratch,
};
use crate::errors::{Error, Result};
use crate::os;
use crate::stdx::Queue;

/// CQE identity of the wake eventfd's poll entry. Never a valid completion
/// address.
const WAKE_TOKEN: u64 = u64::MAX;

/// Ring-depth bounds; `LoopOptions::entries` is validated against these.
pub(crate) const ENTRIES_MIN: u32 = 4;
pub(crate) const ENTRIES_MAX: u32 = 4096;

pub(crate) struct UringBackend {
    ring: IoUring,
    /// Ring-bound completions that did not fit the submission queue.
    overflow: Queue<Completion, crate::completion::CompletionTag>,
    /// SQEs submitted to the kernel and not yet reaped (excludes the wake
    /// poll entry).
    inflight: u32,
    /// Reaped-CQE staging buffer, reused across polls.
    cqe_buf: Vec<(u64, i32)>,
    wake_fd: OsFd,
    wake_armed: bool,
}

impl UringBackend {
    pub(crate) fn new(entries: u32) -> Result<Self> {
        assert!(entries >= ENTRIES_MIN);
        assert!(entries <= ENTRIES_MAX);
        assert!(entries.is_power_of_two());

        let ring = IoUring::builder()
            .build(entries)
            .map_err(|e| os::map_errno(e.raw_os_error().unwrap_or(0)))?;
        let wake_fd = os::eventfd()?;

        log::debug!("completion ring initialized: {entries} entries");
        Ok(Self {
            ring,
            overflow: Queue::init(),
            inflight: 0,
            cqe_buf: Vec::with_capacity(entries as usize),
            wake_fd,
            wake_armed: false,
        })
    }

    pub(crate) fn waker(&self) -> Waker {
        Waker::EventFd(self.wake_fd)
    }

    pub(crate) fn submit(&mut self, c: &mut Completion, ready: &mut ReadyQueue) {
        // Synchronous operations complete before submit returns.
        let sync_outcome = match c.op {
            Op::NetOpen {
                domain,
                socket_type,
                protocol,
            } => Some(os::socket(domain, socket_type, protocol).map(OpValue::Fd)),
            Op::NetBind { fd, addr, addr_len } => {
                Some(os::bind(fd, addr, addr_len).map(|()| OpValue::Void))
            }
            Op::NetListen { fd, backlog } => {
                Some(os::listen(fd, backlog).map(|()| OpValue::Void))
            }
            Op::NetShutdown { fd, how } => Some(os::shutdown(fd, how).map(|()| OpValue::Void)),
            Op::NetClose { fd } | Op::FileClose { fd } => {
                Some(os::close_fd(fd).map(|()| OpValue::Void))
            }
            _ => None,
        };
        if let Some(outcome) = sync_outcome {
            match outcome {
                Ok(value) => c.set_value(value),
                Err(e) => c.set_error(e),
            }
            complete_now(c, ready);
            return;
        }

        self.enqueue_ring_op(c, ready);
    }

    pub(crate) fn cancel(
        &mut self,
        cancel_c: &mut Completion,
        target: &mut Completion,
        ready: &mut ReadyQueue,
    ) {
        // Decide the opcode now, while the target is guaranteed alive; the
        // canceled original completes through its own CQE with ECANCELED.
        cancel_c.scratch = Scratch::Cancel {
            timer: matches!(target.op, Op::Timer { .. }),
        };
        self.enqueue_ring_op(cancel_c, ready);
    }

    pub(crate) fn poll(
        &mut self,
        timeout: Option<Duration>,
        ready: &mut ReadyQueue,
    ) -> Result<bool> {
        self.fill_from_overflow(ready);
        self.ensure_wake_armed();

        let timed_out = self.wait(timeout)?;
        self.drain(ready);
        self.ensure_wake_armed();

        Ok(timed_out)
    }

    // ── Submission path ──────────────────────────────────────────────

    /// Build and push one ring SQE. Falls back to the overflow queue when
    /// the submission queue stays full even after a flush. Parameter errors
    /// (bad path) complete synchronously instead.
    fn enqueue_ring_op(&mut self, c: &mut Completion, ready: &mut ReadyQueue) {
        let entry = match self.build_sqe(c) {
            Ok(entry) => entry,
            Err(e) => {
                c.set_error(e);
                complete_now(c, ready);
                return;
            }
        };

        if self.push_entry(&entry) {
            self.inflight += 1;
        } else {
            log::trace!("submission queue full, queueing locally");
            self.overflow.push(c);
        }
    }

    fn push_entry(&mut self, entry: &squeue::Entry) -> bool {
        // SAFETY: the entry's buffers live in the completion, which is
        // pinned for the whole in-flight period (I2).
        if unsafe { self.ring.submission().push(entry) }.is_ok() {
            return true;
        }
        let _ = self.ring.submit();
        unsafe { self.ring.submission().push(entry) }.is_ok()
    }

    fn fill_from_overflow(&mut self, ready: &mut ReadyQueue) {
        while let Some(node) = self.overflow.pop() {
            // SAFETY: overflow holds only live, pinned completions.
            let c = unsafe { &mut *node.as_ptr() };

            let entry = match self.build_sqe(c) {
                Ok(entry) => entry,
                Err(e) => {
                    c.set_error(e);
                    complete_now(c, ready);
                    continue;
                }
            };
            if self.push_entry(&entry) {
                self.inflight += 1;
            } else {
                // Still full; keep FIFO order and stop.
                self.overflow.push_front(c);
                break;
            }
        }
    }

    /// Prepare per-op scratch and build the SQE, with the completion's
    /// address as user_data.
    fn build_sqe(&mut self, c: &mut Completion) -> Result<squeue::Entry> {
        let user_data = c.as_u64();
        assert!(user_data != WAKE_TOKEN);

        let entry = match c.op {
            Op::Timer { deadline } => {
                let rel = deadline.saturating_duration_since(Instant::now());
                c.scratch = Scratch::Timespec(
                    types::Timespec::new()
                        .sec(rel.as_secs())
                        .nsec(rel.subsec_nanos()),
                );
                let Scratch::Timespec(ts) = &c.scratch else {
                    unreachable!()
                };
                opcode::Timeout::new(ts as *const types::Timespec).build()
            }
            Op::Cancel { target } => {
                let Scratch::Cancel { timer } = c.scratch else {
                    unreachable!("cancel scratch set in cancel()")
                };
                let target_data = target.as_ptr() as u64;
                if timer {
                    opcode::TimeoutRemove::new(target_data).build()
                } else {
                    opcode::AsyncCancel::new(target_data).build()
                }
            }
            Op::NetAccept { fd } => {
                c.scratch = Scratch::Accept(AcceptScratch {
                    // SAFETY: sockaddr_storage is plain old data.
                    storage: unsafe { mem::zeroed() },
                    len: size_of::<libc::sockaddr_storage>() as libc::socklen_t,
                });
                let Scratch::Accept(a) = &mut c.scratch else {
                    unreachable!()
                };
                opcode::Accept::new(
                    types::Fd(fd),
                    (&raw mut a.storage).cast(),
                    &raw mut a.len,
                )
                .flags(libc::SOCK_CLOEXEC)
                .build()
            }
            Op::NetConnect { fd, addr, addr_len } => {
                opcode::Connect::new(types::Fd(fd), addr, addr_len).build()
            }
            Op::NetRecv { fd, buf, len } => {
                opcode::Recv::new(types::Fd(fd), buf, len as u32).build()
            }
            Op::NetSend { fd, buf, len } => {
                opcode::Send::new(types::Fd(fd), buf, len as u32)
                    .flags(libc::MSG_NOSIGNAL)
                    .build()
            }
            Op::NetRecvFrom {
                fd,
                buf,
                len,
                addr,
                addr_len: _,
            } => {
                // SAFETY: msghdr is plain old data.
                let mut msg: libc::msghdr = unsafe { mem::zeroed() };
                msg.msg_name = addr.cast();
                msg.msg_namelen = if addr.is_null() {
                    0
                } else {
                    size_of::<libc::sockaddr_storage>() as libc::socklen_t
                };
                c.scratch = Scratch::Msg(Box::new(MsgScratch {
                    iov: libc::iovec {
                        iov_base: buf.cast(),
                        iov_len: len,
                    },
                    msg,
                }));
                let Scratch::Msg(m) = &mut c.scratch else {
                    unreachable!()
                };
                m.msg.msg_iov = &raw mut m.iov;
                m.msg.msg_iovlen = 1;
                opcode::RecvMsg::new(types::Fd(fd), &raw mut m.msg).build()
            }
            Op::NetSendTo {
                fd,
                buf,
                len,
                addr,
                addr_len,
            } => {
                // SAFETY: msghdr is plain old data.
                let mut msg: libc::msghdr = unsafe { mem::zeroed() };
                msg.msg_name = addr.cast_mut().cast();
                msg.msg_namelen = addr_len;
                c.scratch = Scratch::Msg(Box::new(MsgScratch {
                    iov: libc::iovec {
                        iov_base: buf.cast_mut().cast(),
                        iov_len: len,
                    },
                    msg,
                }));
                let Scratch::Msg(m) = &mut c.scratch else {
                    unreachable!()
                };
                m.msg.msg_iov = &raw mut m.iov;
                m.msg.msg_iovlen = 1;
                opcode::SendMsg::new(types::Fd(fd), &raw const m.msg)
                    .flags(libc::MSG_NOSIGNAL as u32)
                    .build()
            }
            Op::FileOpen {
                path,
                path_len,
                flags,
                mode,
            } => {
                // SAFETY: the path is caller-owned and valid until callback.
                let bytes = unsafe { std::slice::from_raw_parts(path, path_len) };
                c.scratch = Scratch::Path(os::cstring(bytes)?);
                let Scratch::Path(p) = &c.scratch else {
                    unreachable!()
                };
                opcode::OpenAt::new(types::Fd(libc::AT_FDCWD), p.as_ptr())
                    .flags(flags | libc::O_CLOEXEC)
                    .mode(mode)
                    .build()
            }
            Op::FileRead {
                fd,
                buf,
                len,
                offset,
            } => opcode::Read::new(types::Fd(fd), buf, len as u32)
                .offset(offset)
                .build(),
            Op::FileWrite {
                fd,
                buf,
                len,
                offset,
            } => opcode::Write::new(types::Fd(fd), buf, len as u32)
                .offset(offset)
                .build(),
            Op::FileSync { fd } => opcode::Fsync::new(types::Fd(fd)).build(),
            Op::FileRename {
                old_path,
                old_len,
                new_path,
                new_len,
            } => {
                // SAFETY: paths are caller-owned and valid until callback.
                let old = unsafe { std::slice::from_raw_parts(old_path, old_len) };
                let new = unsafe { std::slice::from_raw_parts(new_path, new_len) };
                c.scratch = Scratch::Path2(os::cstring(old)?, os::cstring(new)?);
                let Scratch::Path2(old, new) = &c.scratch else {
                    unreachable!()
                };
                opcode::RenameAt::new(
                    types::Fd(libc::AT_FDCWD),
                    old.as_ptr(),
                    types::Fd(libc::AT_FDCWD),
                    new.as_ptr(),
                )
                .build()
            }
            Op::FileDelete { path, path_len } => {
                // SAFETY: the path is caller-owned and valid until callback.
                let bytes = unsafe { std::slice::from_raw_parts(path, path_len) };
                c.scratch = Scratch::Path(os::cstring(bytes)?);
                let Scratch::Path(p) = &c.scratch else {
                    unreachable!()
                };
                opcode::UnlinkAt::new(types::Fd(libc::AT_FDCWD), p.as_ptr()).build()
            }
            Op::AsyncWake
            | Op::Work { .. }
            | Op::NetGetAddrInfo { .. }
            | Op::NetGetNameInfo { .. }
            | Op::NetOpen { .. }
            | Op::NetBind { .. }
            | Op::NetListen { .. }
            | Op::NetShutdown { .. }
            | Op::NetClose { .. }
            | Op::FileClose { .. } => unreachable!("operation never reaches the ring"),
        };

        Ok(entry.user_data(user_data))
    }

    // ── Wait and reap ────────────────────────────────────────────────

    fn wait(&mut self, timeout: Option<Duration>) -> Result<bool> {
        let outcome = match timeout {
            Some(t) if t.is_zero() => self.ring.submit().map(|_| false),
            Some(t) => {
                let ts = types::Timespec::new()
                    .sec(t.as_secs())
                    .nsec(t.subsec_nanos());
                let args = types::SubmitArgs::new().timespec(&ts);
                self.ring
                    .submitter()
                    .submit_with_args(1, &args)
                    .map(|_| false)
            }
            None => self.ring.submit_and_wait(1).map(|_| false),
        };

        match outcome {
            Ok(timed_out) => Ok(timed_out),
            Err(e) => match e.raw_os_error() {
                Some(libc::ETIME) => Ok(true),
                // Interrupted or CQ pressure: drain what is there.
                Some(libc::EINTR) | Some(libc::EBUSY) => Ok(false),
                Some(errno) => Err(os::map_errno(errno)),
                None => Err(Error::Unexpected),
            },
        }
    }

    fn drain(&mut self, ready: &mut ReadyQueue) {
        loop {
            self.cqe_buf.clear();
            for cqe in self.ring.completion() {
                self.cqe_buf.push((cqe.user_data(), cqe.result()));
            }
            if self.cqe_buf.is_empty() {
                break;
            }

            let batch = mem::take(&mut self.cqe_buf);
            for &(user_data, result) in &batch {
                if user_data == WAKE_TOKEN {
                    os::wake_drain(self.wake_fd);
                    self.wake_armed = false;
                    continue;
                }

                // SAFETY: user_data was a pinned completion's address set in
                // build_sqe.
                let c = unsafe { Completion::from_u64(user_data) };
                self.finish(c, result, ready);
            }
            self.cqe_buf = batch;
        }
    }

    fn finish(&mut self, c: &mut Completion, result: i32, ready: &mut ReadyQueue) {
        assert!(self.inflight > 0);
        self.inflight -= 1;

        match cqe_outcome(c, result) {
            Ok(value) => c.set_value(value),
            Err(e) => c.set_error(e),
        }
        complete_now(c, ready);
    }

    /// Re-arm the eventfd poll entry so a cross-thread wake can interrupt
    /// the next blocking wait.
    fn ensure_wake_armed(&mut self) {
        if self.wake_armed {
            return;
        }
        let entry = opcode::PollAdd::new(types::Fd(self.wake_fd), libc::POLLIN as u32)
            .build()
            .user_data(WAKE_TOKEN);
        if self.push_entry(&entry) {
            self.wake_armed = true;
        } else {
            log::warn!("could not arm wake poll entry; cross-thread wake deferred");
        }
    }
}

impl Drop for UringBackend {
    fn drop(&mut self) {
        let _ = os::close_fd(self.wake_fd);
    }
}

/// Translate one CQE result into the completion's tagged value.
fn cqe_outcome(c: &mut Completion, result: i32) -> Result<OpValue> {
    if result < 0 {
        let errno = -result;
        return Err(match (c.op.kind(), errno) {
            // Normal timer expiry is reported as ETIME.
            (OpKind::Timer, libc::ETIME) => return Ok(OpValue::Void),
            // "Nothing to cancel" still means the cancel was accepted.
            (OpKind::Cancel, libc::ENOENT) | (OpKind::Cancel, libc::EALREADY) => {
                return Ok(OpValue::Void);
            }
            (OpKind::NetRecv | OpKind::NetRecvFrom | OpKind::FileRead, libc::EBADF) => {
                Error::NotOpenForReading
            }
            (OpKind::NetSend | OpKind::NetSendTo | OpKind::FileWrite, libc::EBADF) => {
                Error::NotOpenForWriting
            }
            _ => os::map_errno(errno),
        });
    }

    Ok(match c.op {
        Op::Timer { .. } | Op::Cancel { .. } | Op::NetConnect { .. } => OpValue::Void,
        Op::NetAccept { .. } | Op::FileOpen { .. } => OpValue::Fd(result as OsFd),
        Op::NetRecv { .. }
        | Op::NetSend { .. }
        | Op::NetSendTo { .. }
        | Op::FileRead { .. }
        | Op::FileWrite { .. } => OpValue::Bytes(result as usize),
        Op::NetRecvFrom { addr_len, .. } => {
            // Copy the kernel-reported address length back to the caller.
            if let (Scratch::Msg(m), false) = (&c.scratch, addr_len.is_null()) {
                // SAFETY: addr_len is caller-owned for the in-flight period.
                unsafe { *addr_len = m.msg.msg_namelen };
            }
            OpValue::Bytes(result as usize)
        }
        Op::FileSync { .. } | Op::FileRename { .. } | Op::FileDelete { .. } => OpValue::Void,
        _ => unreachable!("operation never reaches the ring"),
    })
}
