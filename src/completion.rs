//! The completion record: a caller-owned descriptor of one asynchronous
//! operation, from submission through callback delivery.
//!
//! # Ownership
//!
//! A `Completion` is exclusively owned by the caller. From `Loop::add` until
//! the callback fires it is borrowed by the loop and its backend: it must not
//! move and must outlive the in-flight period. Buffers, addresses, and paths
//! referenced by the [`Op`] are likewise borrowed and must stay valid and
//! immovable until the callback.
//!
//! # State machine
//!
//! `Pending → Running → Completed`, or `Pending → Canceled` (terminal).
//! An operation is never canceled once it starts running; late cancellation
//! surfaces as a `Completed` state carrying a `Canceled` error result. The
//! state is atomic because pool workers race submitter-side cancellation.

use core::ffi::c_void;
use core::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;

use crate::backend::Waker;
use crate::errors::{Error, Result};
use crate::loop_core::Loop;
use crate::stdx::{QueueLink, QueueNode};

/// Platform descriptor/handle for sockets and files.
#[cfg(unix)]
pub type OsFd = std::os::unix::io::RawFd;
#[cfg(windows)]
pub type OsFd = usize;

#[cfg(unix)]
pub type RawSockAddr = libc::sockaddr;
#[cfg(unix)]
pub type RawSockAddrStorage = libc::sockaddr_storage;
#[cfg(unix)]
pub type SockLen = libc::socklen_t;

#[cfg(windows)]
pub type RawSockAddr = windows_sys::Win32::Networking::WinSock::SOCKADDR;
#[cfg(windows)]
pub type RawSockAddrStorage = windows_sys::Win32::Networking::WinSock::SOCKADDR_STORAGE;
#[cfg(windows)]
pub type SockLen = i32;

/// One forward-resolution record, copied into a caller-sized buffer.
/// The address follows the platform sockaddr layout verbatim.
#[derive(Clone, Copy)]
pub struct AddrInfo {
    pub family: i32,
    pub socket_type: i32,
    pub protocol: i32,
    pub addr_len: SockLen,
    pub addr: RawSockAddrStorage,
}

impl AddrInfo {
    pub fn zeroed() -> Self {
        // SAFETY: AddrInfo is plain old data; all-zero is a valid value.
        unsafe { core::mem::zeroed() }
    }
}

/// Callback invoked exactly once when the operation terminates, on the
/// thread running `Loop::run`.
///
/// # Safety
///
/// The callback may call `Loop::add`, `Loop::stop`, and other reentrant loop
/// operations, but must not block. `userdata` is returned verbatim through
/// the completion.
pub type Callback = unsafe fn(&mut Loop, &mut Completion);

/// Blocking function body of a `work` operation, executed on a pool worker.
pub type WorkFn = unsafe fn(*mut c_void, &mut Completion);

/// Intrusive-queue tag. A completion is in at most one loop/pool queue at a
/// time (submission, pool pending, dispatch).
pub enum CompletionTag {}

/// Lifecycle state. Monotonic; see module docs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompletionState {
    Pending = 0,
    Running = 1,
    Completed = 2,
    Canceled = 3,
}

impl CompletionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Pending,
            1 => Self::Running,
            2 => Self::Completed,
            3 => Self::Canceled,
            _ => unreachable!("invalid completion state"),
        }
    }
}

/// Describes one operation and its borrowed parameters.
///
/// # Buffer ownership
///
/// Raw pointers reference caller-owned memory that must remain valid and
/// immovable until the callback fires. Paths are duplicated into
/// null-terminated buffers by the filesystem shim for the duration of the
/// syscall; everything else is used in place.
#[derive(Debug, Clone, Copy)]
pub enum Op {
    Timer {
        deadline: Instant,
    },
    AsyncWake,
    Work {
        func: WorkFn,
    },
    Cancel {
        target: NonNull<Completion>,
    },
    NetOpen {
        domain: i32,
        socket_type: i32,
        protocol: i32,
    },
    NetBind {
        fd: OsFd,
        addr: *const RawSockAddr,
        addr_len: SockLen,
    },
    NetListen {
        fd: OsFd,
        backlog: i32,
    },
    NetAccept {
        fd: OsFd,
    },
    NetConnect {
        fd: OsFd,
        addr: *const RawSockAddr,
        addr_len: SockLen,
    },
    NetRecv {
        fd: OsFd,
        buf: *mut u8,
        len: usize,
    },
    NetSend {
        fd: OsFd,
        buf: *const u8,
        len: usize,
    },
    NetRecvFrom {
        fd: OsFd,
        buf: *mut u8,
        len: usize,
        addr: *mut RawSockAddrStorage,
        addr_len: *mut SockLen,
    },
    NetSendTo {
        fd: OsFd,
        buf: *const u8,
        len: usize,
        addr: *const RawSockAddr,
        addr_len: SockLen,
    },
    NetClose {
        fd: OsFd,
    },
    NetShutdown {
        fd: OsFd,
        how: i32,
    },
    NetGetAddrInfo {
        node: *const u8,
        node_len: usize,
        service: *const u8,
        service_len: usize,
        family: i32,
        socket_type: i32,
        protocol: i32,
        results: *mut AddrInfo,
        results_cap: usize,
    },
    NetGetNameInfo {
        addr: *const RawSockAddr,
        addr_len: SockLen,
        host: *mut u8,
        host_cap: usize,
        service: *mut u8,
        service_cap: usize,
        flags: i32,
    },
    FileOpen {
        path: *const u8,
        path_len: usize,
        flags: i32,
        mode: u32,
    },
    FileClose {
        fd: OsFd,
    },
    FileRead {
        fd: OsFd,
        buf: *mut u8,
        len: usize,
        offset: u64,
    },
    FileWrite {
        fd: OsFd,
        buf: *const u8,
        len: usize,
        offset: u64,
    },
    FileSync {
        fd: OsFd,
    },
    FileRename {
        old_path: *const u8,
        old_len: usize,
        new_path: *const u8,
        new_len: usize,
    },
    FileDelete {
        path: *const u8,
        path_len: usize,
    },
}

/// Fieldless mirror of [`Op`], used for result-tag checking and dispatch
/// tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Timer,
    AsyncWake,
    Work,
    Cancel,
    NetOpen,
    NetBind,
    NetListen,
    NetAccept,
    NetConnect,
    NetRecv,
    NetSend,
    NetRecvFrom,
    NetSendTo,
    NetClose,
    NetShutdown,
    NetGetAddrInfo,
    NetGetNameInfo,
    FileOpen,
    FileClose,
    FileRead,
    FileWrite,
    FileSync,
    FileRename,
    FileDelete,
}

impl Op {
    pub fn kind(&self) -> OpKind {
        match self {
            Op::Timer { .. } => OpKind::Timer,
            Op::AsyncWake => OpKind::AsyncWake,
            Op::Work { .. } => OpKind::Work,
            Op::Cancel { .. } => OpKind::Cancel,
            Op::NetOpen { .. } => OpKind::NetOpen,
            Op::NetBind { .. } => OpKind::NetBind,
            Op::NetListen { .. } => OpKind::NetListen,
            Op::NetAccept { .. } => OpKind::NetAccept,
            Op::NetConnect { .. } => OpKind::NetConnect,
            Op::NetRecv { .. } => OpKind::NetRecv,
            Op::NetSend { .. } => OpKind::NetSend,
            Op::NetRecvFrom { .. } => OpKind::NetRecvFrom,
            Op::NetSendTo { .. } => OpKind::NetSendTo,
            Op::NetClose { .. } => OpKind::NetClose,
            Op::NetShutdown { .. } => OpKind::NetShutdown,
            Op::NetGetAddrInfo { .. } => OpKind::NetGetAddrInfo,
            Op::NetGetNameInfo { .. } => OpKind::NetGetNameInfo,
            Op::FileOpen { .. } => OpKind::FileOpen,
            Op::FileClose { .. } => OpKind::FileClose,
            Op::FileRead { .. } => OpKind::FileRead,
            Op::FileWrite { .. } => OpKind::FileWrite,
            Op::FileSync { .. } => OpKind::FileSync,
            Op::FileRename { .. } => OpKind::FileRename,
            Op::FileDelete { .. } => OpKind::FileDelete,
        }
    }

    /// Operations whose execution is a blocking syscall and therefore runs
    /// on a pool worker on every backend.
    pub(crate) fn is_always_pooled(&self) -> bool {
        matches!(
            self.kind(),
            OpKind::Work | OpKind::NetGetAddrInfo | OpKind::NetGetNameInfo
        )
    }
}

/// Success value of a completed operation, keyed by [`OpKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpValue {
    /// A socket or file handle (`net-open`, `net-accept`, `file-open`).
    Fd(OsFd),
    /// A byte count (recv/send/read/write and their variants).
    Bytes(usize),
    /// Number of `AddrInfo` records written (`net-getaddrinfo`).
    AddrCount(usize),
    /// Written lengths for host and service buffers (`net-getnameinfo`).
    NameLengths { host: usize, service: usize },
    /// Operations with no payload.
    Void,
}

impl OpValue {
    #[track_caller]
    pub fn fd(self) -> OsFd {
        match self {
            OpValue::Fd(fd) => fd,
            other => panic!("expected handle result, got {other:?}"),
        }
    }

    #[track_caller]
    pub fn bytes(self) -> usize {
        match self {
            OpValue::Bytes(n) => n,
            other => panic!("expected byte-count result, got {other:?}"),
        }
    }

    #[track_caller]
    pub fn addr_count(self) -> usize {
        match self {
            OpValue::AddrCount(n) => n,
            other => panic!("expected record-count result, got {other:?}"),
        }
    }

    #[track_caller]
    pub fn name_lengths(self) -> (usize, usize) {
        match self {
            OpValue::NameLengths { host, service } => (host, service),
            other => panic!("expected name-length result, got {other:?}"),
        }
    }
}

/// Handle back to the owning loop, stored on a completion when its execution
/// leaves the loop thread (pool offload, async-wake). Workers push the
/// finished completion's address and wake the loop; they never touch loop
/// state directly.
#[derive(Clone)]
pub(crate) struct ReturnHandle {
    pub(crate) queue: Arc<SegQueue<u64>>,
    pub(crate) waker: Waker,
}

/// Shared state behind an [`AsyncHandle`].
pub struct AsyncShared {
    notified: AtomicBool,
    completion: u64,
    ret: ReturnHandle,
}

/// Cross-thread notifier for a submitted `async-wake` completion.
///
/// Cloneable and `Send`; `notify` is at-most-once per submission; duplicate
/// notifications before the callback fires coalesce.
#[derive(Clone)]
pub struct AsyncHandle {
    shared: Arc<AsyncShared>,
}

impl AsyncHandle {
    pub fn notify(&self) {
        if !self.shared.notified.swap(true, Ordering::AcqRel) {
            self.shared.ret.queue.push(self.shared.completion);
            self.shared.ret.waker.wake();
        }
    }

    /// Cancellation-side claim of the notification slot. Winning means the
    /// parked completion can be finished directly; losing means a notify
    /// already queued it.
    pub(crate) fn claim(&self) -> bool {
        !self.shared.notified.swap(true, Ordering::AcqRel)
    }
}

/// Sockaddr storage for operations where the kernel writes the peer address
/// into backend-owned memory (completion-ring accept).
pub(crate) struct AcceptScratch {
    pub(crate) storage: RawSockAddrStorage,
    pub(crate) len: SockLen,
}

/// msghdr + iovec for ring recvfrom/sendto. Self-referential: `msg.msg_iov`
/// points at `iov`, which is valid because the completion is immovable while
/// in flight.
#[cfg(target_os = "linux")]
pub(crate) struct MsgScratch {
    pub(crate) iov: libc::iovec,
    pub(crate) msg: libc::msghdr,
}

/// Per-backend scratch. Lifetime coincides with the completion; contents are
/// meaningful only to the backend that populated them.
pub(crate) enum Scratch {
    None,
    /// Pool offload: where the worker returns the finished completion.
    Return(ReturnHandle),
    /// Async-wake registration.
    Async(Arc<AsyncShared>),
    /// Armed timeout for the completion ring.
    #[cfg(target_os = "linux")]
    Timespec(io_uring::types::Timespec),
    /// Peer-address buffer for in-kernel accept.
    Accept(AcceptScratch),
    /// Which cancel opcode a ring cancellation uses, decided while the
    /// target is still guaranteed alive.
    #[cfg(target_os = "linux")]
    Cancel { timer: bool },
    /// Message header for ring recvfrom/sendto.
    #[cfg(target_os = "linux")]
    Msg(Box<MsgScratch>),
    /// Duplicated null-terminated path(s) for ring filesystem ops.
    Path(std::ffi::CString),
    Path2(std::ffi::CString, std::ffi::CString),
    /// Overlapped-I/O state for the completion-port backend.
    #[cfg(windows)]
    Overlapped(Box<crate::backend_iocp::OverlappedScratch>),
}

/// Caller-owned descriptor of one pending operation.
///
/// Construct with one of the `init_*` constructors, submit with `Loop::add`,
/// and read the outcome inside the callback with [`Completion::result`].
pub struct Completion {
    pub(crate) link: QueueLink<Completion, CompletionTag>,
    state: AtomicU8,
    pub(crate) op: Op,
    result: Option<Result<OpValue>>,
    /// Opaque pointer returned to the callback verbatim.
    pub userdata: *mut c_void,
    pub(crate) callback: Option<Callback>,
    pub(crate) scratch: Scratch,
}

impl Completion {
    fn init(op: Op, userdata: *mut c_void, callback: Callback) -> Self {
        Self {
            link: QueueLink::new(),
            state: AtomicU8::new(CompletionState::Pending as u8),
            op,
            result: None,
            userdata,
            callback: Some(callback),
            scratch: Scratch::None,
        }
    }

    // ── Constructors, one per operation kind ─────────────────────────

    /// Fires once, `after` from now.
    pub fn init_timer(after: Duration, userdata: *mut c_void, callback: Callback) -> Self {
        let deadline = Instant::now()
            .checked_add(after)
            .expect("timer deadline overflow");
        Self::init(Op::Timer { deadline }, userdata, callback)
    }

    /// Completes when notified through the [`AsyncHandle`] obtained from
    /// `Loop::async_handle` after submission.
    pub fn init_async(userdata: *mut c_void, callback: Callback) -> Self {
        Self::init(Op::AsyncWake, userdata, callback)
    }

    /// Runs `func` on a pool worker; requires a pool attached to the loop.
    pub fn init_work(func: WorkFn, userdata: *mut c_void, callback: Callback) -> Self {
        Self::init(Op::Work { func }, userdata, callback)
    }

    /// Best-effort cancellation of `target`. See `Loop` docs for the races.
    pub fn init_cancel(
        target: &mut Completion,
        userdata: *mut c_void,
        callback: Callback,
    ) -> Self {
        Self::init(
            Op::Cancel {
                target: NonNull::from(target),
            },
            userdata,
            callback,
        )
    }

    pub fn init_net_open(
        domain: i32,
        socket_type: i32,
        protocol: i32,
        userdata: *mut c_void,
        callback: Callback,
    ) -> Self {
        Self::init(
            Op::NetOpen {
                domain,
                socket_type,
                protocol,
            },
            userdata,
            callback,
        )
    }

    /// # Caller obligations
    ///
    /// `addr` must point at `addr_len` valid bytes that outlive the operation.
    pub fn init_net_bind(
        fd: OsFd,
        addr: *const RawSockAddr,
        addr_len: SockLen,
        userdata: *mut c_void,
        callback: Callback,
    ) -> Self {
        assert!(!addr.is_null());
        Self::init(Op::NetBind { fd, addr, addr_len }, userdata, callback)
    }

    pub fn init_net_listen(
        fd: OsFd,
        backlog: i32,
        userdata: *mut c_void,
        callback: Callback,
    ) -> Self {
        Self::init(Op::NetListen { fd, backlog }, userdata, callback)
    }

    pub fn init_net_accept(fd: OsFd, userdata: *mut c_void, callback: Callback) -> Self {
        Self::init(Op::NetAccept { fd }, userdata, callback)
    }

    /// # Caller obligations
    ///
    /// `addr` must point at `addr_len` valid bytes that outlive the operation.
    /// On the overlapped-port backend the socket must already be bound.
    pub fn init_net_connect(
        fd: OsFd,
        addr: *const RawSockAddr,
        addr_len: SockLen,
        userdata: *mut c_void,
        callback: Callback,
    ) -> Self {
        assert!(!addr.is_null());
        Self::init(Op::NetConnect { fd, addr, addr_len }, userdata, callback)
    }

    /// # Caller obligations
    ///
    /// `buf[0..len]` must be valid for writes and outlive the operation.
    pub fn init_net_recv(
        fd: OsFd,
        buf: *mut u8,
        len: usize,
        userdata: *mut c_void,
        callback: Callback,
    ) -> Self {
        assert!(!buf.is_null());
        Self::init(Op::NetRecv { fd, buf, len }, userdata, callback)
    }

    /// # Caller obligations
    ///
    /// `buf[0..len]` must be valid for reads and outlive the operation.
    pub fn init_net_send(
        fd: OsFd,
        buf: *const u8,
        len: usize,
        userdata: *mut c_void,
        callback: Callback,
    ) -> Self {
        assert!(!buf.is_null());
        Self::init(Op::NetSend { fd, buf, len }, userdata, callback)
    }

    /// # Caller obligations
    ///
    /// All pointers reference caller-owned storage that outlives the
    /// operation; `addr_len` is in/out (capacity in, written length out).
    pub fn init_net_recvfrom(
        fd: OsFd,
        buf: *mut u8,
        len: usize,
        addr: *mut RawSockAddrStorage,
        addr_len: *mut SockLen,
        userdata: *mut c_void,
        callback: Callback,
    ) -> Self {
        assert!(!buf.is_null());
        Self::init(
            Op::NetRecvFrom {
                fd,
                buf,
                len,
                addr,
                addr_len,
            },
            userdata,
            callback,
        )
    }

    pub fn init_net_sendto(
        fd: OsFd,
        buf: *const u8,
        len: usize,
        addr: *const RawSockAddr,
        addr_len: SockLen,
        userdata: *mut c_void,
        callback: Callback,
    ) -> Self {
        assert!(!buf.is_null());
        assert!(!addr.is_null());
        Self::init(
            Op::NetSendTo {
                fd,
                buf,
                len,
                addr,
                addr_len,
            },
            userdata,
            callback,
        )
    }

    pub fn init_net_close(fd: OsFd, userdata: *mut c_void, callback: Callback) -> Self {
        Self::init(Op::NetClose { fd }, userdata, callback)
    }

    /// `how` follows the platform constants (`SHUT_RD`/`SHUT_WR`/`SHUT_RDWR`).
    pub fn init_net_shutdown(
        fd: OsFd,
        how: i32,
        userdata: *mut c_void,
        callback: Callback,
    ) -> Self {
        Self::init(Op::NetShutdown { fd, how }, userdata, callback)
    }

    /// Forward name resolution. `node`/`service` may be null (with zero
    /// length) for wildcard lookups; results are copied into the
    /// caller-sized `results` buffer.
    #[allow(clippy::too_many_arguments)] // Matches the resolver API surface.
    pub fn init_net_getaddrinfo(
        node: *const u8,
        node_len: usize,
        service: *const u8,
        service_len: usize,
        family: i32,
        socket_type: i32,
        protocol: i32,
        results: *mut AddrInfo,
        results_cap: usize,
        userdata: *mut c_void,
        callback: Callback,
    ) -> Self {
        assert!(!results.is_null());
        assert!(results_cap > 0);
        Self::init(
            Op::NetGetAddrInfo {
                node,
                node_len,
                service,
                service_len,
                family,
                socket_type,
                protocol,
                results,
                results_cap,
            },
            userdata,
            callback,
        )
    }

    /// Reverse name lookup into caller-supplied host and service buffers.
    #[allow(clippy::too_many_arguments)] // Matches the resolver API surface.
    pub fn init_net_getnameinfo(
        addr: *const RawSockAddr,
        addr_len: SockLen,
        host: *mut u8,
        host_cap: usize,
        service: *mut u8,
        service_cap: usize,
        flags: i32,
        userdata: *mut c_void,
        callback: Callback,
    ) -> Self {
        assert!(!addr.is_null());
        assert!(!host.is_null() && host_cap > 0);
        assert!(!service.is_null() && service_cap > 0);
        Self::init(
            Op::NetGetNameInfo {
                addr,
                addr_len,
                host,
                host_cap,
                service,
                service_cap,
                flags,
            },
            userdata,
            callback,
        )
    }

    /// `flags`/`mode` follow the platform `open(2)` constants verbatim.
    pub fn init_file_open(
        path: &[u8],
        flags: i32,
        mode: u32,
        userdata: *mut c_void,
        callback: Callback,
    ) -> Self {
        Self::init(
            Op::FileOpen {
                path: path.as_ptr(),
                path_len: path.len(),
                flags,
                mode,
            },
            userdata,
            callback,
        )
    }

    pub fn init_file_close(fd: OsFd, userdata: *mut c_void, callback: Callback) -> Self {
        Self::init(Op::FileClose { fd }, userdata, callback)
    }

    /// `offset` of [`crate::os::OFFSET_CURRENT`] reads at the current file
    /// position.
    pub fn init_file_read(
        fd: OsFd,
        buf: *mut u8,
        len: usize,
        offset: u64,
        userdata: *mut c_void,
        callback: Callback,
    ) -> Self {
        assert!(!buf.is_null());
        Self::init(
            Op::FileRead {
                fd,
                buf,
                len,
                offset,
            },
            userdata,
            callback,
        )
    }

    pub fn init_file_write(
        fd: OsFd,
        buf: *const u8,
        len: usize,
        offset: u64,
        userdata: *mut c_void,
        callback: Callback,
    ) -> Self {
        assert!(!buf.is_null());
        Self::init(
            Op::FileWrite {
                fd,
                buf,
                len,
                offset,
            },
            userdata,
            callback,
        )
    }

    pub fn init_file_sync(fd: OsFd, userdata: *mut c_void, callback: Callback) -> Self {
        Self::init(Op::FileSync { fd }, userdata, callback)
    }

    pub fn init_file_rename(
        old_path: &[u8],
        new_path: &[u8],
        userdata: *mut c_void,
        callback: Callback,
    ) -> Self {
        Self::init(
            Op::FileRename {
                old_path: old_path.as_ptr(),
                old_len: old_path.len(),
                new_path: new_path.as_ptr(),
                new_len: new_path.len(),
            },
            userdata,
            callback,
        )
    }

    pub fn init_file_delete(path: &[u8], userdata: *mut c_void, callback: Callback) -> Self {
        Self::init(
            Op::FileDelete {
                path: path.as_ptr(),
                path_len: path.len(),
            },
            userdata,
            callback,
        )
    }

    // ── Introspection ────────────────────────────────────────────────

    #[inline]
    pub fn state(&self) -> CompletionState {
        CompletionState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn op_kind(&self) -> OpKind {
        self.op.kind()
    }

    #[inline]
    pub fn has_result(&self) -> bool {
        self.result.is_some()
    }

    /// Returns the stored result, checking the expected operation tag.
    ///
    /// # Panics
    ///
    /// Panics if no result has been delivered yet or if `expected` does not
    /// match the completion's operation; both indicate call-site misuse.
    #[track_caller]
    pub fn result(&self, expected: OpKind) -> Result<OpValue> {
        assert!(
            self.has_result(),
            "result read before the operation completed"
        );
        assert!(
            self.op.kind() == expected,
            "result tag mismatch: completion is {:?}, caller expected {:?}",
            self.op.kind(),
            expected,
        );
        self.result.unwrap()
    }

    // ── Backend-facing result slot ───────────────────────────────────

    pub(crate) fn set_value(&mut self, value: OpValue) {
        self.result = Some(Ok(value));
    }

    pub(crate) fn set_error(&mut self, error: Error) {
        self.result = Some(Err(error));
    }

    // ── State transitions ────────────────────────────────────────────

    /// Loop-side `Pending → Running`, taken when the submission queue is
    /// drained. The loop thread is the only possible writer at this point.
    pub(crate) fn set_running(&self) {
        let prev = self.state.compare_exchange(
            CompletionState::Pending as u8,
            CompletionState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        assert!(prev.is_ok(), "completion was not pending at submission");
    }

    /// Worker-side claim; loses to a concurrent cancel.
    pub(crate) fn try_claim(&self) -> bool {
        self.state
            .compare_exchange(
                CompletionState::Pending as u8,
                CompletionState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Cancel-side `Pending → Canceled`; loses to a worker that already
    /// claimed the item.
    pub(crate) fn try_cancel(&self) -> bool {
        self.state
            .compare_exchange(
                CompletionState::Pending as u8,
                CompletionState::Canceled as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn set_completed(&self) {
        let prev = self.state.swap(CompletionState::Completed as u8, Ordering::AcqRel);
        assert!(
            prev == CompletionState::Running as u8,
            "completed a completion that was not running"
        );
    }

    /// A completion is dispatchable once it carries a result: either it ran
    /// to completion, or a worker observed a lost cancel race and recorded
    /// `Canceled` without running it.
    pub(crate) fn is_dispatchable(&self) -> bool {
        match self.state() {
            CompletionState::Completed => self.has_result(),
            CompletionState::Canceled => self.has_result(),
            _ => false,
        }
    }

    // ── Pointer identity ─────────────────────────────────────────────

    #[inline]
    pub(crate) fn as_u64(&mut self) -> u64 {
        self as *mut Completion as u64
    }

    /// # Safety
    ///
    /// `raw` must be a pointer previously produced by [`Self::as_u64`] on a
    /// completion that is still in flight (I2: storage outlives the
    /// operation).
    #[inline]
    pub(crate) unsafe fn from_u64<'a>(raw: u64) -> &'a mut Completion {
        assert!(raw != 0);
        unsafe { &mut *(raw as *mut Completion) }
    }

    pub(crate) fn return_handle(&self) -> Option<&ReturnHandle> {
        match &self.scratch {
            Scratch::Return(ret) => Some(ret),
            _ => None,
        }
    }

    /// Registers the async-wake shared state at submission time and hands
    /// back the clone the loop stores nothing of.
    pub(crate) fn arm_async(&mut self, ret: ReturnHandle) -> AsyncHandle {
        assert!(matches!(self.op, Op::AsyncWake));

        let shared = Arc::new(AsyncShared {
            notified: AtomicBool::new(false),
            completion: self.as_u64(),
            ret,
        });
        self.scratch = Scratch::Async(shared.clone());
        AsyncHandle { shared }
    }

    pub(crate) fn async_shared(&self) -> Option<AsyncHandle> {
        match &self.scratch {
            Scratch::Async(shared) => Some(AsyncHandle {
                shared: shared.clone(),
            }),
            _ => None,
        }
    }
}

impl QueueNode<CompletionTag> for Completion {
    fn queue_link(&mut self) -> &mut QueueLink<Self, CompletionTag> {
        &mut self.link
    }

    fn queue_link_ref(&self) -> &QueueLink<Self, CompletionTag> {
        &self.link
    }
}
