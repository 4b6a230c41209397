//! Loop semantics: run modes, timers, async wake, pool offload, and
//! cancellation, exercised on every backend the host can run.

use core::ffi::c_void;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use evio::{
    BackendKind, Completion, CompletionState, Error, Loop, LoopOptions, OpKind, OpValue,
    PoolOptions, RunMode, ThreadPool,
};

fn host_backends() -> Vec<BackendKind> {
    #[cfg(target_os = "linux")]
    {
        vec![BackendKind::Uring, BackendKind::Poll]
    }
    #[cfg(all(unix, not(target_os = "linux")))]
    {
        vec![BackendKind::Poll]
    }
    #[cfg(windows)]
    {
        vec![BackendKind::Iocp]
    }
}

fn new_loop(kind: BackendKind, pool: Option<Arc<ThreadPool>>) -> Option<Loop> {
    match Loop::new(LoopOptions {
        backend: Some(kind),
        pool,
        ..Default::default()
    }) {
        Ok(l) => Some(l),
        Err(e) => {
            // Kernel without io_uring support (or seccomp-filtered CI).
            eprintln!("skipping {kind:?}: {e}");
            None
        }
    }
}

unsafe fn nop_cb(_l: &mut Loop, _c: &mut Completion) {}

unsafe fn count_cb(_l: &mut Loop, c: &mut Completion) {
    let counter = unsafe { &*(c.userdata as *const AtomicU32) };
    counter.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn timer_fires_once_after_deadline() {
    for kind in host_backends() {
        let Some(mut l) = new_loop(kind, None) else {
            continue;
        };

        let fired = AtomicU32::new(0);
        let mut c = Completion::init_timer(
            Duration::from_millis(50),
            &fired as *const AtomicU32 as *mut c_void,
            count_cb,
        );

        let start = Instant::now();
        l.add(&mut c);
        let dispatched = l.run(RunMode::UntilDone).unwrap();

        assert!(start.elapsed() >= Duration::from_millis(45), "{kind:?}");
        assert_eq!(dispatched, 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1, "exactly one delivery");
        assert_eq!(c.state(), CompletionState::Completed);
        assert_eq!(c.result(OpKind::Timer), Ok(OpValue::Void));
        assert_eq!(l.active(), 0);
    }
}

#[test]
fn two_timers_both_fire() {
    for kind in host_backends() {
        let Some(mut l) = new_loop(kind, None) else {
            continue;
        };

        let fired = AtomicU32::new(0);
        let ud = &fired as *const AtomicU32 as *mut c_void;
        let mut a = Completion::init_timer(Duration::from_millis(10), ud, count_cb);
        let mut b = Completion::init_timer(Duration::from_millis(30), ud, count_cb);

        l.add(&mut a);
        l.add(&mut b);
        l.run(RunMode::UntilDone).unwrap();

        assert_eq!(fired.load(Ordering::SeqCst), 2, "{kind:?}");
        assert_eq!(l.active(), 0);
    }
}

#[test]
fn no_wait_does_not_block() {
    for kind in host_backends() {
        let Some(mut l) = new_loop(kind, None) else {
            continue;
        };

        let mut c = Completion::init_timer(
            Duration::from_secs(60),
            core::ptr::null_mut(),
            nop_cb,
        );
        l.add(&mut c);

        let start = Instant::now();
        let dispatched = l.run(RunMode::NoWait).unwrap();
        assert!(start.elapsed() < Duration::from_secs(5), "{kind:?}");
        assert_eq!(dispatched, 0);
        assert_eq!(l.active(), 1);

        // Clean up the armed timer so drop order stays sane.
        let mut cancel = Completion::init_cancel(&mut c, core::ptr::null_mut(), nop_cb);
        l.add(&mut cancel);
        l.run(RunMode::UntilDone).unwrap();
        assert_eq!(l.active(), 0);
    }
}

#[test]
fn cancel_of_armed_timer_delivers_canceled() {
    for kind in host_backends() {
        let Some(mut l) = new_loop(kind, None) else {
            continue;
        };

        let mut timer = Completion::init_timer(
            Duration::from_secs(60),
            core::ptr::null_mut(),
            nop_cb,
        );
        l.add(&mut timer);
        // Arm it in the backend without blocking.
        l.run(RunMode::NoWait).unwrap();
        assert_eq!(timer.state(), CompletionState::Running);

        let start = Instant::now();
        let mut cancel = Completion::init_cancel(&mut timer, core::ptr::null_mut(), nop_cb);
        l.add(&mut cancel);
        l.run(RunMode::UntilDone).unwrap();

        assert!(start.elapsed() < Duration::from_secs(10), "{kind:?}");
        assert_eq!(cancel.result(OpKind::Cancel), Ok(OpValue::Void));
        assert_eq!(timer.result(OpKind::Timer), Err(Error::Canceled));
        assert_eq!(l.active(), 0);
    }
}

#[test]
fn cancel_before_pickup_suppresses_callback() {
    for kind in host_backends() {
        let Some(mut l) = new_loop(kind, None) else {
            continue;
        };

        let fired = AtomicU32::new(0);
        let mut target = Completion::init_timer(
            Duration::from_secs(60),
            &fired as *const AtomicU32 as *mut c_void,
            count_cb,
        );

        // The cancel drains ahead of its target, catching it still queued.
        let mut cancel = Completion::init_cancel(&mut target, core::ptr::null_mut(), nop_cb);
        l.add(&mut cancel);
        l.add(&mut target);
        l.run(RunMode::UntilDone).unwrap();

        assert_eq!(target.state(), CompletionState::Canceled, "{kind:?}");
        assert_eq!(fired.load(Ordering::SeqCst), 0, "callback never fires");
        assert!(!target.has_result());
        assert_eq!(cancel.result(OpKind::Cancel), Ok(OpValue::Void));
        assert_eq!(l.active(), 0);
    }
}

#[test]
fn work_runs_on_pool_and_completes_loop() {
    unsafe fn work_body(ud: *mut c_void, _c: &mut Completion) {
        let counter = unsafe { &*(ud as *const AtomicU32) };
        counter.fetch_add(10, Ordering::SeqCst);
    }

    for kind in host_backends() {
        let pool = Arc::new(ThreadPool::new(PoolOptions::default()).unwrap());
        let Some(mut l) = new_loop(kind, Some(pool)) else {
            continue;
        };

        let state = AtomicU32::new(0);
        let mut c = Completion::init_work(
            work_body,
            &state as *const AtomicU32 as *mut c_void,
            nop_cb,
        );

        l.add(&mut c);
        l.run(RunMode::UntilDone).unwrap();

        assert_eq!(state.load(Ordering::SeqCst), 10, "{kind:?}");
        assert_eq!(c.result(OpKind::Work), Ok(OpValue::Void));
        assert_eq!(l.active(), 0);
    }
}

#[test]
fn async_wake_crosses_threads() {
    for kind in host_backends() {
        let Some(mut l) = new_loop(kind, None) else {
            continue;
        };

        let fired = AtomicU32::new(0);
        let mut c = Completion::init_async(&fired as *const AtomicU32 as *mut c_void, count_cb);
        l.add(&mut c);

        let handle = l.async_handle(&c).expect("armed at add");
        let notifier = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            handle.notify();
            // Coalesces with the first notification.
            handle.notify();
        });

        let start = Instant::now();
        l.run(RunMode::UntilDone).unwrap();
        notifier.join().unwrap();

        assert!(start.elapsed() >= Duration::from_millis(40), "{kind:?}");
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(c.result(OpKind::AsyncWake), Ok(OpValue::Void));
    }
}

#[test]
fn getaddrinfo_without_pool_fails_fast() {
    for kind in host_backends() {
        let Some(mut l) = new_loop(kind, None) else {
            continue;
        };

        let node = b"localhost";
        let service = b"80";
        let mut results = [evio::AddrInfo::zeroed(); 4];
        let mut c = Completion::init_net_getaddrinfo(
            node.as_ptr(),
            node.len(),
            service.as_ptr(),
            service.len(),
            0,
            0,
            0,
            results.as_mut_ptr(),
            results.len(),
            core::ptr::null_mut(),
            nop_cb,
        );

        l.add(&mut c);
        l.run(RunMode::UntilDone).unwrap();

        assert_eq!(
            c.result(OpKind::NetGetAddrInfo),
            Err(Error::NoThreadPool),
            "{kind:?}"
        );
    }
}

struct ChainCtx {
    next: *mut Completion,
    dispatched_first: AtomicU32,
}

#[test]
fn callback_submissions_wait_for_next_iteration() {
    unsafe fn chain_cb(l: &mut Loop, c: &mut Completion) {
        let ctx = unsafe { &*(c.userdata as *const ChainCtx) };
        ctx.dispatched_first.fetch_add(1, Ordering::SeqCst);
        // SAFETY: the chained completion outlives the test body.
        l.add(unsafe { &mut *ctx.next });
    }

    for kind in host_backends() {
        let Some(mut l) = new_loop(kind, None) else {
            continue;
        };

        let fired = AtomicU32::new(0);
        let mut second = Completion::init_timer(
            Duration::ZERO,
            &fired as *const AtomicU32 as *mut c_void,
            count_cb,
        );
        let ctx = ChainCtx {
            next: &mut second,
            dispatched_first: AtomicU32::new(0),
        };
        let mut first = Completion::init_timer(
            Duration::ZERO,
            &ctx as *const ChainCtx as *mut c_void,
            chain_cb,
        );

        l.add(&mut first);

        // The first full iteration dispatches only the first timer; the
        // submission made inside its callback waits its turn.
        let dispatched = l.run(RunMode::Once).unwrap();
        assert_eq!(dispatched, 1, "{kind:?}");
        assert_eq!(ctx.dispatched_first.load(Ordering::SeqCst), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        l.run(RunMode::UntilDone).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(l.active(), 0);
    }
}

struct StopCtx {
    stopped_at: AtomicU32,
    seen: AtomicU32,
}

#[test]
fn stop_from_callback_exits_promptly() {
    unsafe fn stop_cb(l: &mut Loop, c: &mut Completion) {
        let ctx = unsafe { &*(c.userdata as *const StopCtx) };
        ctx.seen.fetch_add(1, Ordering::SeqCst);
        ctx.stopped_at.store(1, Ordering::SeqCst);
        l.stop();
        // Repeated stops are safe.
        l.stop();
    }

    for kind in host_backends() {
        let Some(mut l) = new_loop(kind, None) else {
            continue;
        };

        let ctx = StopCtx {
            stopped_at: AtomicU32::new(0),
            seen: AtomicU32::new(0),
        };
        let ud = &ctx as *const StopCtx as *mut c_void;

        let mut quick = Completion::init_timer(Duration::ZERO, ud, stop_cb);
        let mut slow = Completion::init_timer(Duration::from_secs(60), core::ptr::null_mut(), nop_cb);

        l.add(&mut quick);
        l.add(&mut slow);

        let start = Instant::now();
        l.run(RunMode::UntilDone).unwrap();

        assert!(start.elapsed() < Duration::from_secs(10), "{kind:?}");
        assert_eq!(ctx.seen.load(Ordering::SeqCst), 1);
        // The slow timer is still in flight; stopping does not cancel it.
        assert_eq!(l.active(), 1);

        let mut cancel = Completion::init_cancel(&mut slow, core::ptr::null_mut(), nop_cb);
        l.add(&mut cancel);
        // A stopped loop stays stopped; drain with explicit iterations.
        l.run(RunMode::NoWait).unwrap();
        l.run(RunMode::NoWait).unwrap();
    }
}
