//! Platform backend selection and the submission/poll/cancel contract.
//!
//! A backend is one variant of a closed sum type, not a trait object: every
//! call site dispatches through a small finite match. Backends must
//!
//! 1. complete operations only by pushing onto the ready queue they are
//!    handed; callbacks are invoked by the loop alone;
//! 2. perform synchronous operations (open/bind/listen/close/shutdown)
//!    inline in `submit`, marking the completion before `submit` returns;
//! 3. tie every kernel-side identity (SQE user_data, OVERLAPPED pointer,
//!    interest-set slot) back to the owning completion record;
//! 4. fail operations they cannot express with [`Error::Unsupported`].

use std::time::Duration;

use crate::completion::{Completion, CompletionTag, OsFd};
use crate::errors::{Error, Result};
use crate::stdx::Queue;

#[cfg(target_os = "linux")]
use crate::backend_uring::UringBackend;

#[cfg(unix)]
use crate::backend_poll::PollBackend;

#[cfg(windows)]
use crate::backend_iocp::IocpBackend;

/// Queue of completions awaiting callback dispatch by the loop.
pub(crate) type ReadyQueue = Queue<Completion, CompletionTag>;

/// Which platform mechanism a loop runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Kernel completion ring (io_uring). Linux only.
    Uring,
    /// Readiness polling (`poll(2)`) with inline non-blocking syscalls.
    Poll,
    /// Overlapped I/O completion port. Windows only.
    Iocp,
}

impl BackendKind {
    /// The preferred mechanism for the host platform.
    pub fn default_for_host() -> Self {
        #[cfg(target_os = "linux")]
        {
            Self::Uring
        }
        #[cfg(all(unix, not(target_os = "linux")))]
        {
            Self::Poll
        }
        #[cfg(windows)]
        {
            Self::Iocp
        }
    }
}

/// Cross-thread unblocking primitive for a backend's `poll`.
///
/// Cheap to clone; carried by pool-offloaded completions so a worker can make
/// a blocked `poll` return promptly. Calling `wake` on a waker whose loop has
/// been torn down is a caller error (the loop owner must drain in-flight work
/// before deinit).
#[derive(Clone)]
pub(crate) enum Waker {
    #[cfg(target_os = "linux")]
    EventFd(OsFd),
    #[cfg(unix)]
    Pipe(OsFd),
    #[cfg(windows)]
    Port(isize),
}

impl Waker {
    pub(crate) fn wake(&self) {
        match self {
            #[cfg(target_os = "linux")]
            Waker::EventFd(fd) => crate::os::wake_write(*fd, 1),
            #[cfg(unix)]
            Waker::Pipe(fd) => crate::os::wake_write_byte(*fd),
            #[cfg(windows)]
            Waker::Port(port) => crate::backend_iocp::post_wake(*port),
        }
    }
}

/// Platform backend instance owned by one loop.
pub(crate) enum Backend {
    #[cfg(target_os = "linux")]
    Uring(UringBackend),
    #[cfg(unix)]
    Poll(PollBackend),
    #[cfg(windows)]
    Iocp(IocpBackend),
}

impl Backend {
    pub(crate) fn new(kind: BackendKind, entries: u32) -> Result<Self> {
        match kind {
            #[cfg(target_os = "linux")]
            BackendKind::Uring => Ok(Self::Uring(UringBackend::new(entries)?)),
            #[cfg(unix)]
            BackendKind::Poll => Ok(Self::Poll(PollBackend::new()?)),
            #[cfg(windows)]
            BackendKind::Iocp => Ok(Self::Iocp(IocpBackend::new(entries)?)),
            #[allow(unreachable_patterns)]
            _ => Err(Error::Unsupported),
        }
    }

    /// Whether this backend executes `op` on a pool worker rather than in
    /// the kernel. Resolution and user work are pooled everywhere; the
    /// readiness and completion-port backends also pool filesystem ops.
    pub(crate) fn routes_to_pool(&self, c: &Completion) -> bool {
        if c.op.is_always_pooled() {
            return true;
        }
        match self {
            #[cfg(target_os = "linux")]
            Backend::Uring(_) => false,
            #[cfg(unix)]
            Backend::Poll(b) => b.routes_to_pool(&c.op),
            #[cfg(windows)]
            Backend::Iocp(b) => b.routes_to_pool(&c.op),
        }
    }

    /// Hand one running completion to the kernel. Synchronous outcomes are
    /// pushed onto `ready` before this returns. `ret` identifies the owning
    /// loop's return queue for backends whose kernel object is shared
    /// process-wide (the overlapped port).
    pub(crate) fn submit(
        &mut self,
        c: &mut Completion,
        ready: &mut ReadyQueue,
        ret: &crate::completion::ReturnHandle,
    ) {
        match self {
            #[cfg(target_os = "linux")]
            Backend::Uring(b) => {
                let _ = ret;
                b.submit(c, ready)
            }
            #[cfg(unix)]
            Backend::Poll(b) => {
                let _ = ret;
                b.submit(c, ready)
            }
            #[cfg(windows)]
            Backend::Iocp(b) => b.submit(c, ready, ret),
        }
    }

    /// Block for completions, bounded by `timeout` (`None` = until the next
    /// armed timer or a wake). Returns whether the wait timed out. Signaled
    /// completions are marked completed and pushed onto `ready`.
    pub(crate) fn poll(
        &mut self,
        timeout: Option<Duration>,
        ready: &mut ReadyQueue,
    ) -> Result<bool> {
        match self {
            #[cfg(target_os = "linux")]
            Backend::Uring(b) => b.poll(timeout, ready),
            #[cfg(unix)]
            Backend::Poll(b) => b.poll(timeout, ready),
            #[cfg(windows)]
            Backend::Iocp(b) => b.poll(timeout, ready),
        }
    }

    /// Cancel a target the backend currently owns (state `running`). The
    /// backend completes `cancel_c` either synchronously or through its own
    /// completion path; the target always surfaces through `ready`.
    pub(crate) fn cancel(
        &mut self,
        cancel_c: &mut Completion,
        target: &mut Completion,
        ready: &mut ReadyQueue,
    ) {
        match self {
            #[cfg(target_os = "linux")]
            Backend::Uring(b) => b.cancel(cancel_c, target, ready),
            #[cfg(unix)]
            Backend::Poll(b) => b.cancel(cancel_c, target, ready),
            #[cfg(windows)]
            Backend::Iocp(b) => b.cancel(cancel_c, target, ready),
        }
    }

    pub(crate) fn waker(&self) -> Waker {
        match self {
            #[cfg(target_os = "linux")]
            Backend::Uring(b) => b.waker(),
            #[cfg(unix)]
            Backend::Poll(b) => b.waker(),
            #[cfg(windows)]
            Backend::Iocp(b) => b.waker(),
        }
    }
}

/// Mark a completion finished with the result already stored and queue it
/// for dispatch. The shared tail of every synchronous completion path.
pub(crate) fn complete_now(c: &mut Completion, ready: &mut ReadyQueue) {
    assert!(c.has_result());
    c.set_completed();
    ready.push(c);
}
