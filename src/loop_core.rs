//! The event loop: owns one backend instance, tracks the submission and
//! dispatch queues, and runs until a chosen stop condition.
//!
//! The loop is single-threaded and cooperative: all callbacks run serially
//! on the thread that calls [`Loop::run`], and the only blocking call inside
//! an iteration is the backend's poll. Exactly two channels cross threads:
//! the return queue that pool workers (and async-wake notifiers) push
//! finished completions onto, and the backend's wake primitive.
//!
//! One iteration:
//! 1. drain the submission queue into the backend (synchronous submissions
//!    complete within the same call);
//! 2. drain the return queue;
//! 3. poll the backend, with a zero timeout whenever dispatchable work or a
//!    wake request is already present;
//! 4. dispatch: pop finished completions one at a time and invoke each
//!    callback. Submissions made inside a callback are not processed until
//!    the next iteration.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_queue::SegQueue;

use crate::backend::{Backend, BackendKind, ReadyQueue, complete_now};
use crate::completion::{
    AsyncHandle, Completion, CompletionState, Op, OpValue, ReturnHandle, Scratch,
};
use crate::errors::{Error, Result};
use crate::thread_pool::ThreadPool;

/// Loop construction options.
#[derive(Clone)]
pub struct LoopOptions {
    /// Backend override; `None` picks the host default.
    pub backend: Option<BackendKind>,
    /// Kernel queue depth (ring entries / reap batch). Power of two.
    pub entries: u32,
    /// Pool for blocking operations. Without one, pool-requiring
    /// submissions fail with `NoThreadPool`.
    pub pool: Option<Arc<ThreadPool>>,
    /// Upper bound for one blocking poll. `None` waits until the next armed
    /// timer or a wake.
    pub poll_budget: Option<Duration>,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            backend: None,
            entries: 256,
            pool: None,
            poll_budget: None,
        }
    }
}

/// How long [`Loop::run`] keeps iterating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Poll with a zero timeout, dispatch what is ready, return.
    NoWait,
    /// One full iteration, blocking in poll if nothing is ready.
    Once,
    /// Iterate until no operations remain in flight or `stop` is called.
    UntilDone,
}

/// Single-threaded completion dispatcher owning one platform backend.
pub struct Loop {
    backend: Backend,
    pool: Option<Arc<ThreadPool>>,
    poll_budget: Option<Duration>,

    /// Completions accepted by `add` and not yet handed to the backend.
    submissions: ReadyQueue,
    /// Completions finished and awaiting callback dispatch.
    ready: ReadyQueue,
    /// Cross-thread channel: pool workers and async notifiers push finished
    /// completion addresses here.
    returned: Arc<SegQueue<u64>>,
    ret_proto: ReturnHandle,

    /// In-flight operations (accepted and not yet dispatched).
    active: u32,
    stopped: bool,
    wake_requested: AtomicBool,

    // Metrics.
    total_submitted: u64,
    total_completed: u64,
}

impl Loop {
    pub fn new(options: LoopOptions) -> Result<Self> {
        let kind = options.backend.unwrap_or_else(BackendKind::default_for_host);
        let backend = Backend::new(kind, options.entries)?;

        let returned = Arc::new(SegQueue::new());
        let ret_proto = ReturnHandle {
            queue: returned.clone(),
            waker: backend.waker(),
        };

        log::debug!("loop initialized on {kind:?}");
        Ok(Self {
            backend,
            pool: options.pool,
            poll_budget: options.poll_budget,
            submissions: ReadyQueue::init(),
            ready: ReadyQueue::init(),
            returned,
            ret_proto,
            active: 0,
            stopped: false,
            wake_requested: AtomicBool::new(false),
            total_submitted: 0,
            total_completed: 0,
        })
    }

    /// Operations currently in flight (accepted and not yet dispatched).
    #[inline]
    pub fn active(&self) -> u32 {
        self.active
    }

    /// Submit a pending completion.
    ///
    /// # Caller obligations
    ///
    /// The completion, and every buffer its operation references, must
    /// stay valid and immovable until the callback fires (or, for a
    /// completion canceled before pickup, until the cancel's callback
    /// fires). A completion is submitted to at most one loop at a time.
    pub fn add(&mut self, c: &mut Completion) {
        assert!(
            c.state() == CompletionState::Pending,
            "add requires a pending completion"
        );
        assert!(!c.link.is_linked());

        // Async-wake arms its notifier at add time so the handle can cross
        // threads before the first run iteration.
        if matches!(c.op, Op::AsyncWake) {
            let _ = c.arm_async(self.ret_proto.clone());
        }

        self.submissions.push(c);
        self.active += 1;
        self.total_submitted += 1;
    }

    /// The cross-thread notifier for a submitted `async-wake` completion.
    pub fn async_handle(&self, c: &Completion) -> Option<AsyncHandle> {
        c.async_shared()
    }

    /// Run the loop in the given mode. Returns the number of callbacks
    /// dispatched; a backend poll failure is fatal and returned as the
    /// error.
    pub fn run(&mut self, mode: RunMode) -> Result<u32> {
        match mode {
            RunMode::NoWait => self.tick(Some(Duration::ZERO)),
            RunMode::Once => self.tick(None),
            RunMode::UntilDone => {
                let mut dispatched: u32 = 0;
                while !self.done() {
                    dispatched = dispatched.saturating_add(self.tick(None)?);
                }
                Ok(dispatched)
            }
        }
    }

    /// Request exit: the next iteration check returns without polling.
    /// Idempotent; callable from inside callbacks. The flag is sticky;
    /// in-flight operations stay queued and the caller remains responsible
    /// for them.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    /// Loop-thread wake: the next poll uses a zero timeout.
    pub fn wake(&self) {
        self.wake_requested.store(true, Ordering::Release);
    }

    /// Cross-thread wake: a blocked poll returns promptly.
    pub fn wake_from_anywhere(&self) {
        self.ret_proto.waker.wake();
    }

    fn done(&self) -> bool {
        self.stopped || self.active == 0
    }

    /// One loop iteration. `mode_timeout` is `Some(ZERO)` for no-wait polls
    /// and `None` for a blocking poll bounded by budget/timers/wakes.
    fn tick(&mut self, mode_timeout: Option<Duration>) -> Result<u32> {
        self.drain_submissions();
        self.drain_returned();

        let timeout = if !self.ready.is_empty()
            || self.wake_requested.swap(false, Ordering::AcqRel)
            || self.active == 0
        {
            Some(Duration::ZERO)
        } else {
            match mode_timeout {
                Some(t) => Some(t),
                None => self.poll_budget,
            }
        };

        self.backend.poll(timeout, &mut self.ready)?;

        // Work the pool finished while poll was blocked: dispatch it in this
        // iteration, after backend completions (stable group order).
        self.drain_returned();

        Ok(self.dispatch())
    }

    fn drain_submissions(&mut self) {
        while let Some(node) = self.submissions.pop() {
            // SAFETY: queued completions are pinned for the in-flight period.
            let c = unsafe { &mut *node.as_ptr() };
            log::trace!("submitting {:?}", c.op_kind());

            if matches!(c.op, Op::Cancel { .. }) {
                self.handle_cancel(c);
                continue;
            }
            if matches!(c.op, Op::AsyncWake) {
                // Parked until notified; nothing to hand the backend.
                c.set_running();
                continue;
            }
            if self.backend.routes_to_pool(c) {
                self.offload(c);
                continue;
            }

            c.set_running();
            self.backend.submit(c, &mut self.ready, &self.ret_proto);
        }
    }

    /// Hand a blocking operation to the pool, or fail it right away when no
    /// pool is attached. The completion keeps its `Pending` state so the
    /// worker-side claim protocol works.
    fn offload(&mut self, c: &mut Completion) {
        match &self.pool {
            None => {
                log::debug!("{:?} requires a pool but none is attached", c.op_kind());
                c.set_running();
                c.set_error(Error::NoThreadPool);
                complete_now(c, &mut self.ready);
            }
            Some(pool) => {
                c.scratch = Scratch::Return(self.ret_proto.clone());
                pool.submit(c);
            }
        }
    }

    /// Best-effort cancellation. The happy path transitions a still-queued
    /// target `pending → canceled` and drops it from the accounting without
    /// a callback; a running target is signaled to the backend and always
    /// delivers its own callback (success or `Canceled`).
    fn handle_cancel(&mut self, cancel_c: &mut Completion) {
        cancel_c.set_running();

        let Op::Cancel { target } = cancel_c.op else {
            unreachable!()
        };
        // SAFETY: the caller keeps the target alive until cancellation
        // resolves (I2).
        let target = unsafe { &mut *target.as_ptr() };

        match target.state() {
            CompletionState::Pending => {
                if self.submissions.remove(target) {
                    let won = target.try_cancel();
                    assert!(won);
                    assert!(self.active > 0);
                    self.active -= 1;
                    // Canceled before pickup: terminal, no callback.
                } else if target.return_handle().is_some() {
                    let pool = self
                        .pool
                        .as_ref()
                        .expect("offloaded completion without a pool")
                        .clone();
                    if pool.cancel(target) {
                        assert!(self.active > 0);
                        self.active -= 1;
                    }
                    // On a lost race the worker delivers Canceled itself.
                } else {
                    // Never reached this loop; just mark it.
                    let _ = target.try_cancel();
                }
                self.finish_cancel(cancel_c);
            }
            CompletionState::Running => {
                if target.return_handle().is_some() {
                    // A blocking syscall in progress cannot be interrupted;
                    // the operation completes normally.
                    self.finish_cancel(cancel_c);
                } else if let Some(handle) = target.async_shared() {
                    if handle.claim() {
                        target.set_error(Error::Canceled);
                        complete_now(target, &mut self.ready);
                    }
                    self.finish_cancel(cancel_c);
                } else {
                    // Backend-owned: it decides whether the cancel op
                    // resolves synchronously or through its own completion.
                    self.backend.cancel(cancel_c, target, &mut self.ready);
                }
            }
            CompletionState::Completed | CompletionState::Canceled => {
                // Already terminal; cancel is an accepted no-op.
                self.finish_cancel(cancel_c);
            }
        }
    }

    fn finish_cancel(&mut self, cancel_c: &mut Completion) {
        cancel_c.set_value(OpValue::Void);
        complete_now(cancel_c, &mut self.ready);
    }

    /// Pull completions the pool and async notifiers pushed from other
    /// threads.
    fn drain_returned(&mut self) {
        while let Some(raw) = self.returned.pop() {
            // SAFETY: only in-flight completion addresses enter the queue.
            let c = unsafe { Completion::from_u64(raw) };
            match c.state() {
                CompletionState::Running => {
                    // Async-wake notification (or a port packet routed
                    // home): result may still be missing.
                    if !c.has_result() {
                        c.set_value(OpValue::Void);
                    }
                    c.set_completed();
                }
                CompletionState::Completed => {
                    // Pool worker finished it.
                    assert!(c.has_result());
                }
                CompletionState::Canceled => {
                    // With a result: a worker lost the claim race and
                    // recorded Canceled; dispatch it. Without one: a notify
                    // raced a cancel-before-pickup; the completion was
                    // already dropped from the accounting.
                    if !c.has_result() {
                        continue;
                    }
                }
                CompletionState::Pending => {
                    unreachable!("returned completion never started")
                }
            }
            self.ready.push(c);
        }
    }

    /// Invoke callbacks for everything finished. Submissions made inside a
    /// callback land in the submission queue and wait for the next
    /// iteration.
    fn dispatch(&mut self) -> u32 {
        let mut dispatched: u32 = 0;

        while let Some(node) = self.ready.pop() {
            // SAFETY: ready completions are pinned until their callback.
            let c = unsafe { &mut *node.as_ptr() };
            assert!(c.is_dispatchable());

            assert!(self.active > 0);
            self.active -= 1;
            self.total_completed += 1;
            dispatched += 1;

            let cb = c.callback.expect("completion without a callback");
            // SAFETY: exactly-once delivery; the completion left every
            // queue and is terminal; the callback may reuse it.
            unsafe { cb(self, c) };
        }

        assert!(self.total_completed <= self.total_submitted);
        dispatched
    }
}
