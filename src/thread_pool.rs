//! Bounded worker pool for intrinsically blocking operations.
//!
//! The loop hands pool-destined completions here; workers execute the
//! blocking body, store the result, and push the finished completion back on
//! the owning loop's return queue before waking it. The pool itself is
//! loop-agnostic: a completion with no return handle is simply left in its
//! terminal state for the submitter to observe.
//!
//! The cancel ↔ claim race is settled by one atomic compare-exchange on the
//! completion state: a worker claims `pending → running`; cancellation takes
//! `pending → canceled`. Whoever wins decides whether the work function runs.

use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crate::completion::{Completion, CompletionState, CompletionTag};
use crate::errors::{Error, Result};
use crate::stdx::Queue;

#[cfg(unix)]
use crate::os::perform_blocking;

#[cfg(windows)]
use crate::backend_iocp::perform_blocking;

/// Worker-count bounds. The spawned count defaults to the CPU count clamped
/// into `[min_threads, max_threads]`.
#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    pub min_threads: u32,
    pub max_threads: u32,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            min_threads: 1,
            max_threads: 64,
        }
    }
}

/// Queue of pending work completions. The raw node pointers are valid for
/// the whole in-flight period (I2), so moving them across worker threads is
/// sound as long as access stays behind the mutex.
struct PendingQueue(Queue<Completion, CompletionTag>);

// SAFETY: the queue holds pointers to caller-pinned completions; all access
// happens under `Inner::state`.
unsafe impl Send for PendingQueue {}

struct PoolState {
    pending: PendingQueue,
    shutdown: bool,
}

struct Inner {
    state: Mutex<PoolState>,
    not_empty: Condvar,
}

/// Fixed set of worker threads executing blocking work items.
pub struct ThreadPool {
    inner: Arc<Inner>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    threads: u32,
}

impl ThreadPool {
    /// Spawns the workers. A spawn failure is fatal: already-started workers
    /// are torn down and the error is returned.
    pub fn new(options: PoolOptions) -> Result<Self> {
        assert!(options.min_threads >= 1);
        assert!(options.min_threads <= options.max_threads);

        let threads = thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1)
            .clamp(options.min_threads, options.max_threads);
        assert!(threads >= options.min_threads);
        assert!(threads <= options.max_threads);

        let inner = Arc::new(Inner {
            state: Mutex::new(PoolState {
                pending: PendingQueue(Queue::init()),
                shutdown: false,
            }),
            not_empty: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(threads as usize);
        for index in 0..threads {
            let worker_inner = inner.clone();
            let spawned = thread::Builder::new()
                .name(format!("evio-pool-{index}"))
                .spawn(move || worker_main(&worker_inner));

            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    log::warn!("pool worker spawn failed: {e}");
                    let pool = Self {
                        inner,
                        workers: Mutex::new(workers),
                        threads: index,
                    };
                    pool.stop();
                    pool.join();
                    return Err(Error::SystemResources);
                }
            }
        }

        log::debug!("thread pool started with {threads} workers");
        Ok(Self {
            inner,
            workers: Mutex::new(workers),
            threads,
        })
    }

    /// Number of workers actually running.
    pub fn threads(&self) -> u32 {
        self.threads
    }

    /// Enqueue a pending work completion and wake exactly one worker.
    ///
    /// # Caller obligations
    ///
    /// The completion must stay valid and immovable until it reaches a
    /// terminal state.
    pub fn submit(&self, c: &mut Completion) {
        assert!(c.state() == CompletionState::Pending);
        assert!(!c.link.is_linked());

        let mut state = self.inner.state.lock().unwrap();
        assert!(!state.shutdown, "submit to a stopped pool");
        state.pending.0.push(c);
        drop(state);

        self.inner.not_empty.notify_one();
    }

    /// Best-effort cancellation of a queued work item.
    ///
    /// Returns `true` only when the `pending → canceled` transition wins AND
    /// the item is still in the queue: the work function will never run and
    /// no callback is delivered. Returns `false` when the item already runs,
    /// already finished, or a worker popped it between queue and claim; in
    /// that last case the worker observes the canceled state and delivers the
    /// completion with a `Canceled` error.
    pub fn cancel(&self, c: &mut Completion) -> bool {
        let mut state = self.inner.state.lock().unwrap();

        if !c.try_cancel() {
            // Already running or terminal; the worker owns it now.
            return false;
        }
        state.pending.0.remove(c)
    }

    /// Sets the shutdown flag and wakes every waiting worker. Idempotent.
    pub fn stop(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.shutdown = true;
        drop(state);

        self.inner.not_empty.notify_all();
    }

    fn join(&self) {
        let handles = std::mem::take(&mut *self.workers.lock().unwrap());
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

fn worker_main(inner: &Inner) {
    let mut state = inner.state.lock().unwrap();
    loop {
        if state.shutdown {
            break;
        }

        match state.pending.0.pop() {
            Some(node) => {
                // Run outside the lock; other workers keep draining.
                drop(state);

                // SAFETY: queued completions are pinned for their in-flight
                // period (I2); the pop removed the only queue reference.
                let c = unsafe { &mut *node.as_ptr() };
                run_one(c);

                state = inner.state.lock().unwrap();
            }
            None => {
                state = inner.not_empty.wait(state).unwrap();
            }
        }
    }
}

/// Claim and execute a single work item, then hand it back to its loop.
fn run_one(c: &mut Completion) {
    let raw = c.as_u64();

    if c.try_claim() {
        perform_blocking(c);
        assert!(c.has_result());
        c.set_completed();
    } else {
        // Lost the claim race: canceled between pop and claim. Record the
        // outcome without running the work function.
        assert!(c.state() == CompletionState::Canceled);
        c.set_error(Error::Canceled);
    }

    // Clone the handle before the push: the owning loop may dispatch and
    // invalidate the completion the moment the pointer is visible.
    if let Some(ret) = c.return_handle().cloned() {
        ret.queue.push(raw);
        ret.waker.wake();
    }
}
