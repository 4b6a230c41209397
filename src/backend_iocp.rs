//! Windows overlapped-port backend (I/O completion port).
//!
//! One completion port is shared, reference-counted, across every loop in
//! the process; extension function pointers (`AcceptEx`/`ConnectEx`) are
//! loaded lazily per address family into a process-wide cache. Each
//! operation embeds an `OVERLAPPED` in the completion's scratch; the packet
//! reaped from the port is mapped back to the completion through a back
//! pointer stored directly after the `OVERLAPPED`.
//!
//! Because the port is shared, a loop may reap packets that belong to a
//! sibling loop. Every overlapped operation therefore carries its owner's
//! return handle, and reaped completions are routed through that queue (the
//! same channel pool workers use) rather than straight into the reaping
//! loop's dispatch queue.
//!
//! Filesystem operations are not expressed as overlapped I/O here and fail
//! with `Unsupported`; name resolution and user work run on the thread pool.

#![cfg(windows)]

use core::ffi::c_void;
use std::collections::{HashMap, HashSet};
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use windows_sys::Win32::Foundation::{
    CloseHandle, ERROR_IO_PENDING, GetLastError, HANDLE, INVALID_HANDLE_VALUE, WAIT_TIMEOUT,
};
use windows_sys::Win32::Networking::WinSock::{
    ADDRINFOA, INVALID_SOCKET, SIO_GET_EXTENSION_FUNCTION_POINTER, SO_UPDATE_ACCEPT_CONTEXT,
    SO_UPDATE_CONNECT_CONTEXT, SOCKADDR, SOCKADDR_STORAGE, SOCKET, SOCKET_ERROR, SOL_SOCKET,
    WSA_FLAG_OVERLAPPED, WSABUF, WSAEAFNOSUPPORT, WSAGetLastError, WSAHOST_NOT_FOUND, WSAIoctl,
    WSANO_DATA, WSANO_RECOVERY, WSARecv, WSASend, WSASocketW, WSATRY_AGAIN, WSATYPE_NOT_FOUND,
    bind as ws_bind, closesocket, freeaddrinfo, getaddrinfo, getnameinfo, getsockname,
    listen as ws_listen, setsockopt, shutdown as ws_shutdown,
};
use windows_sys::Win32::System::IO::{
    CancelIoEx, CreateIoCompletionPort, GetQueuedCompletionStatusEx, OVERLAPPED, OVERLAPPED_ENTRY,
    PostQueuedCompletionStatus,
};

use crate::backend::{ReadyQueue, Waker, complete_now};
use crate::completion::{
    Completion, Op, OpKind, OpValue, OsFd, ReturnHandle, Scratch,
};
use crate::errors::{Error, Result};

/// Completion key of synthetic wake packets.
const WAKE_KEY: usize = usize::MAX;

/// AcceptEx wants local+remote address slots, each sockaddr + 16 bytes.
const ACCEPT_ADDR_SPACE: usize = size_of::<SOCKADDR_STORAGE>() + 16;

// GUIDs for SIO_GET_EXTENSION_FUNCTION_POINTER.
const WSAID_ACCEPTEX: windows_sys::core::GUID = windows_sys::core::GUID {
    data1: 0xb5367df1,
    data2: 0xcbac,
    data3: 0x11cf,
    data4: [0x95, 0xca, 0x00, 0x80, 0x5f, 0x48, 0xa1, 0x92],
};
const WSAID_CONNECTEX: windows_sys::core::GUID = windows_sys::core::GUID {
    data1: 0x25a207b9,
    data2: 0xddf3,
    data3: 0x4660,
    data4: [0x8e, 0xe9, 0x76, 0xe5, 0x8c, 0x74, 0x06, 0x3e],
};

type AcceptExFn = unsafe extern "system" fn(
    SOCKET,
    SOCKET,
    *mut c_void,
    u32,
    u32,
    u32,
    *mut u32,
    *mut OVERLAPPED,
) -> i32;

type ConnectExFn = unsafe extern "system" fn(
    SOCKET,
    *const SOCKADDR,
    i32,
    *const c_void,
    u32,
    *mut u32,
    *mut OVERLAPPED,
) -> i32;

#[derive(Clone, Copy)]
struct ExtFns {
    accept_ex: AcceptExFn,
    connect_ex: ConnectExFn,
}

/// Process-wide shared state: the refcounted port plus the per-family
/// extension-function cache.
struct PortShared {
    port: HANDLE,
    refcount: u32,
    ext_fns: HashMap<i32, ExtFns>,
}

static SHARED: Mutex<Option<PortShared>> = Mutex::new(None);

fn acquire_port() -> Result<HANDLE> {
    let mut guard = SHARED.lock().unwrap();
    match guard.as_mut() {
        Some(shared) => {
            shared.refcount += 1;
            Ok(shared.port)
        }
        None => {
            // SAFETY: creating a fresh port; no handles involved yet.
            let port = unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, 0, 0, 0) };
            if port == 0 {
                return Err(Error::SystemResources);
            }
            *guard = Some(PortShared {
                port,
                refcount: 1,
                ext_fns: HashMap::new(),
            });
            Ok(port)
        }
    }
}

fn release_port() {
    let mut guard = SHARED.lock().unwrap();
    let Some(shared) = guard.as_mut() else {
        unreachable!("release without acquire");
    };
    assert!(shared.refcount > 0);
    shared.refcount -= 1;
    if shared.refcount == 0 {
        // SAFETY: no loop references the port anymore.
        unsafe { CloseHandle(shared.port) };
        *guard = None;
    }
}

/// Load (or fetch cached) AcceptEx/ConnectEx for one address family. The
/// ioctl needs a live socket of that family to resolve the pointers.
fn ext_fns_for(family: i32) -> Result<ExtFns> {
    {
        let guard = SHARED.lock().unwrap();
        if let Some(shared) = guard.as_ref()
            && let Some(fns) = shared.ext_fns.get(&family)
        {
            return Ok(*fns);
        }
    }

    // SAFETY: probe socket exists only for the ioctl below.
    let probe = unsafe { WSASocketW(family, 1, 0, ptr::null(), 0, WSA_FLAG_OVERLAPPED) };
    if probe == INVALID_SOCKET {
        return Err(map_wsa(unsafe { WSAGetLastError() }));
    }

    let load = |guid: &windows_sys::core::GUID| -> Result<*mut c_void> {
        let mut func: *mut c_void = ptr::null_mut();
        let mut returned = 0u32;
        // SAFETY: standard extension-function lookup ioctl.
        let rc = unsafe {
            WSAIoctl(
                probe,
                SIO_GET_EXTENSION_FUNCTION_POINTER,
                (guid as *const windows_sys::core::GUID).cast_mut().cast(),
                size_of::<windows_sys::core::GUID>() as u32,
                (&raw mut func).cast(),
                size_of::<*mut c_void>() as u32,
                &raw mut returned,
                ptr::null_mut(),
                None,
            )
        };
        if rc == SOCKET_ERROR {
            return Err(map_wsa(unsafe { WSAGetLastError() }));
        }
        assert!(!func.is_null());
        Ok(func)
    };

    let result = (|| {
        let accept_ex = load(&WSAID_ACCEPTEX)?;
        let connect_ex = load(&WSAID_CONNECTEX)?;
        // SAFETY: the ioctl returned these exact signatures.
        Ok(ExtFns {
            accept_ex: unsafe { mem::transmute::<*mut c_void, AcceptExFn>(accept_ex) },
            connect_ex: unsafe { mem::transmute::<*mut c_void, ConnectExFn>(connect_ex) },
        })
    })();

    // SAFETY: probe socket owned by this function.
    unsafe { closesocket(probe) };

    let fns = result?;
    let mut guard = SHARED.lock().unwrap();
    if let Some(shared) = guard.as_mut() {
        shared.ext_fns.insert(family, fns);
    }
    Ok(fns)
}

/// Overlapped-operation scratch, embedded in the completion. `overlapped`
/// must stay the first field so a reaped `OVERLAPPED *` is also a
/// `OverlappedScratch *`.
#[repr(C)]
pub(crate) struct OverlappedScratch {
    overlapped: OVERLAPPED,
    /// Parent pointer back to the owning completion.
    back: *mut Completion,
    /// Return channel of the loop that owns the completion.
    ret: ReturnHandle,
    /// Accept only: the pre-created socket and its address slots.
    accept_socket: SOCKET,
    accept_buf: [u8; 2 * ACCEPT_ADDR_SPACE],
}

struct TimerEntry {
    c: NonNull<Completion>,
    deadline: Instant,
}

pub(crate) struct IocpBackend {
    port: HANDLE,
    /// Handles already associated with the port; re-association fails.
    associated: HashSet<usize>,
    timers: Vec<TimerEntry>,
    /// Reap buffer size per poll call.
    entries: u32,
}

impl IocpBackend {
    pub(crate) fn new(entries: u32) -> Result<Self> {
        assert!(entries >= 1);
        let port = acquire_port()?;

        log::debug!("overlapped port acquired ({entries} reap entries)");
        Ok(Self {
            port,
            associated: HashSet::new(),
            timers: Vec::new(),
            entries,
        })
    }

    pub(crate) fn waker(&self) -> Waker {
        Waker::Port(self.port as isize)
    }

    pub(crate) fn routes_to_pool(&self, _op: &Op) -> bool {
        false
    }

    fn associate(&mut self, handle: usize) -> Result<()> {
        if self.associated.contains(&handle) {
            return Ok(());
        }
        // SAFETY: associating a live handle with our live port; key unused
        // because identity travels through the OVERLAPPED pointer.
        let rc = unsafe { CreateIoCompletionPort(handle as HANDLE, self.port, 0, 0) };
        if rc == 0 {
            return Err(Error::Unexpected);
        }
        self.associated.insert(handle);
        Ok(())
    }

    fn arm_scratch(c: &mut Completion, ret: &ReturnHandle) -> *mut OverlappedScratch {
        c.scratch = Scratch::Overlapped(Box::new(OverlappedScratch {
            // SAFETY: OVERLAPPED is plain old data.
            overlapped: unsafe { mem::zeroed() },
            back: c as *mut Completion,
            ret: ret.clone(),
            accept_socket: INVALID_SOCKET,
            accept_buf: [0; 2 * ACCEPT_ADDR_SPACE],
        }));
        let Scratch::Overlapped(s) = &mut c.scratch else {
            unreachable!()
        };
        &mut **s
    }

    pub(crate) fn submit(
        &mut self,
        c: &mut Completion,
        ready: &mut ReadyQueue,
        ret: &ReturnHandle,
    ) {
        let outcome: Option<Result<OpValue>> = match c.op {
            Op::NetOpen {
                domain,
                socket_type,
                protocol,
            } => {
                // SAFETY: plain socket creation.
                let sock = unsafe {
                    WSASocketW(domain, socket_type, protocol, ptr::null(), 0, WSA_FLAG_OVERLAPPED)
                };
                Some(if sock == INVALID_SOCKET {
                    Err(map_wsa(unsafe { WSAGetLastError() }))
                } else {
                    Ok(OpValue::Fd(sock as OsFd))
                })
            }
            Op::NetBind { fd, addr, addr_len } => {
                // SAFETY: caller guarantees addr validity.
                let rc = unsafe { ws_bind(fd as SOCKET, addr, addr_len) };
                Some(wsa_unit(rc))
            }
            Op::NetListen { fd, backlog } => {
                // SAFETY: fd is a caller-owned socket.
                let rc = unsafe { ws_listen(fd as SOCKET, backlog) };
                Some(wsa_unit(rc))
            }
            Op::NetShutdown { fd, how } => {
                // SAFETY: fd is a caller-owned socket.
                let rc = unsafe { ws_shutdown(fd as SOCKET, how) };
                Some(wsa_unit(rc))
            }
            Op::NetClose { fd } => {
                // SAFETY: fd is a caller-owned socket.
                let rc = unsafe { closesocket(fd as SOCKET) };
                Some(wsa_unit(rc))
            }
            Op::FileClose { fd } => {
                // SAFETY: fd is a caller-owned handle.
                let ok = unsafe { CloseHandle(fd as HANDLE) };
                Some(if ok == 0 {
                    Err(Error::Unexpected)
                } else {
                    Ok(OpValue::Void)
                })
            }
            Op::Timer { deadline } => {
                self.timers.push(TimerEntry {
                    c: NonNull::from(&mut *c),
                    deadline,
                });
                None
            }
            Op::NetAccept { fd } => Some(self.submit_accept(c, fd, ret)),
            Op::NetConnect { fd, addr, addr_len } => {
                Some(self.submit_connect(c, fd, addr, addr_len, ret))
            }
            Op::NetRecv { fd, buf, len } => Some(self.submit_recv(c, fd, buf, len, ret)),
            Op::NetSend { fd, buf, len } => Some(self.submit_send(c, fd, buf, len, ret)),
            // Not expressed on this backend today; same pattern as
            // recv/send if filled in.
            Op::NetRecvFrom { .. } | Op::NetSendTo { .. } => Some(Err(Error::Unsupported)),
            Op::FileOpen { .. }
            | Op::FileRead { .. }
            | Op::FileWrite { .. }
            | Op::FileSync { .. }
            | Op::FileRename { .. }
            | Op::FileDelete { .. } => Some(Err(Error::Unsupported)),
            Op::AsyncWake
            | Op::Work { .. }
            | Op::Cancel { .. }
            | Op::NetGetAddrInfo { .. }
            | Op::NetGetNameInfo { .. } => {
                unreachable!("operation never reaches the overlapped port")
            }
        };

        match outcome {
            None => {}
            Some(Ok(value)) => {
                c.set_value(value);
                complete_now(c, ready);
            }
            Some(Err(Error::WouldBlock)) => {
                // Overlapped operation in flight; the packet completes it.
            }
            Some(Err(e)) => {
                c.set_error(e);
                complete_now(c, ready);
            }
        }
    }

    /// AcceptEx: pre-create the accepted socket, hand both sockets plus an
    /// address buffer to the kernel.
    fn submit_accept(&mut self, c: &mut Completion, fd: OsFd, ret: &ReturnHandle) -> Result<OpValue> {
        self.associate(fd as usize)?;

        let family = socket_family(fd as SOCKET)?;
        let fns = ext_fns_for(family)?;

        // SAFETY: accepted socket matches the listener's family.
        let accepted =
            unsafe { WSASocketW(family, 1, 0, ptr::null(), 0, WSA_FLAG_OVERLAPPED) };
        if accepted == INVALID_SOCKET {
            return Err(map_wsa(unsafe { WSAGetLastError() }));
        }

        let scratch = Self::arm_scratch(c, ret);
        // SAFETY: scratch outlives the operation (pinned completion).
        unsafe {
            (*scratch).accept_socket = accepted;
            let mut received = 0u32;
            let ok = (fns.accept_ex)(
                fd as SOCKET,
                accepted,
                (*scratch).accept_buf.as_mut_ptr().cast(),
                0,
                ACCEPT_ADDR_SPACE as u32,
                ACCEPT_ADDR_SPACE as u32,
                &raw mut received,
                &raw mut (*scratch).overlapped,
            );
            if ok == 0 {
                let err = WSAGetLastError();
                if err != ERROR_IO_PENDING as i32 {
                    closesocket(accepted);
                    return Err(map_wsa(err));
                }
            }
        }
        // Success and PENDING both surface through a queued packet.
        Err(Error::WouldBlock)
    }

    /// ConnectEx requires the socket to be bound before the call.
    fn submit_connect(
        &mut self,
        c: &mut Completion,
        fd: OsFd,
        addr: *const SOCKADDR,
        addr_len: i32,
        ret: &ReturnHandle,
    ) -> Result<OpValue> {
        self.associate(fd as usize)?;

        let family = socket_family(fd as SOCKET)?;
        let fns = ext_fns_for(family)?;

        let scratch = Self::arm_scratch(c, ret);
        // SAFETY: scratch outlives the operation; addr is caller-owned.
        unsafe {
            let mut sent = 0u32;
            let ok = (fns.connect_ex)(
                fd as SOCKET,
                addr,
                addr_len,
                ptr::null(),
                0,
                &raw mut sent,
                &raw mut (*scratch).overlapped,
            );
            if ok == 0 {
                let err = WSAGetLastError();
                if err != ERROR_IO_PENDING as i32 {
                    return Err(map_wsa(err));
                }
            }
        }
        Err(Error::WouldBlock)
    }

    fn submit_recv(
        &mut self,
        c: &mut Completion,
        fd: OsFd,
        buf: *mut u8,
        len: usize,
        ret: &ReturnHandle,
    ) -> Result<OpValue> {
        self.associate(fd as usize)?;

        let scratch = Self::arm_scratch(c, ret);
        let mut wsabuf = WSABUF {
            len: len as u32,
            buf,
        };
        let mut flags = 0u32;
        let mut received = 0u32;
        // SAFETY: buffer is caller-owned; scratch pinned.
        let rc = unsafe {
            WSARecv(
                fd as SOCKET,
                &raw mut wsabuf,
                1,
                &raw mut received,
                &raw mut flags,
                &raw mut (*scratch).overlapped,
                None,
            )
        };
        if rc == SOCKET_ERROR {
            let err = unsafe { WSAGetLastError() };
            if err != ERROR_IO_PENDING as i32 {
                return Err(map_wsa(err));
            }
        }
        Err(Error::WouldBlock)
    }

    fn submit_send(
        &mut self,
        c: &mut Completion,
        fd: OsFd,
        buf: *const u8,
        len: usize,
        ret: &ReturnHandle,
    ) -> Result<OpValue> {
        self.associate(fd as usize)?;

        let scratch = Self::arm_scratch(c, ret);
        let mut wsabuf = WSABUF {
            len: len as u32,
            buf: buf.cast_mut(),
        };
        let mut sent = 0u32;
        // SAFETY: buffer is caller-owned; scratch pinned.
        let rc = unsafe {
            WSASend(
                fd as SOCKET,
                &raw mut wsabuf,
                1,
                &raw mut sent,
                0,
                &raw mut (*scratch).overlapped,
                None,
            )
        };
        if rc == SOCKET_ERROR {
            let err = unsafe { WSAGetLastError() };
            if err != ERROR_IO_PENDING as i32 {
                return Err(map_wsa(err));
            }
        }
        Err(Error::WouldBlock)
    }

    pub(crate) fn cancel(
        &mut self,
        cancel_c: &mut Completion,
        target: &mut Completion,
        ready: &mut ReadyQueue,
    ) {
        let target_ptr = NonNull::from(&mut *target);

        if let Some(i) = self.timers.iter().position(|t| t.c == target_ptr) {
            self.timers.swap_remove(i);
            target.set_error(Error::Canceled);
            complete_now(target, ready);
        } else if let Scratch::Overlapped(s) = &mut target.scratch {
            if let Some(handle) = overlapped_handle(&target.op) {
                // SAFETY: cancels only our own overlapped operation; the
                // canceled packet still arrives and completes the target.
                unsafe { CancelIoEx(handle as HANDLE, &raw mut s.overlapped) };
            }
        }

        cancel_c.set_value(OpValue::Void);
        complete_now(cancel_c, ready);
    }

    pub(crate) fn poll(
        &mut self,
        timeout: Option<Duration>,
        ready: &mut ReadyQueue,
    ) -> Result<bool> {
        let now = Instant::now();
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
            None => u32::MAX,
            Some(d) if d.is_zero() => 0,
            Some(d) => d.as_millis().clamp(1, (u32::MAX - 1) as u128) as u32,
        };

        let mut entries = vec![
            OVERLAPPED_ENTRY {
                lpCompletionKey: 0,
                lpOverlapped: ptr::null_mut(),
                Internal: 0,
                dwNumberOfBytesTransferred: 0,
            };
            self.entries as usize
        ];
        let mut count = 0u32;

        // SAFETY: valid port, valid entry buffer, non-alertable wait.
        let rc = unsafe {
            GetQueuedCompletionStatusEx(
                self.port,
                entries.as_mut_ptr(),
                entries.len() as u32,
                &raw mut count,
                timeout_ms,
                0,
            )
        };

        let mut timed_out = false;
        if rc == 0 {
            let err = unsafe { GetLastError() };
            if err == WAIT_TIMEOUT {
                timed_out = true;
                count = 0;
            } else {
                return Err(Error::Unexpected);
            }
        }

        for entry in &entries[..count as usize] {
            if entry.lpCompletionKey == WAKE_KEY {
                continue;
            }
            if entry.lpOverlapped.is_null() {
                continue;
            }

            // Parent-structure recovery: OVERLAPPED is the first field.
            let scratch = entry.lpOverlapped as *mut OverlappedScratch;
            // SAFETY: every overlapped we issue is embedded in a pinned
            // completion's scratch.
            unsafe {
                let c = &mut *(*scratch).back;
                finish_packet(c, scratch, entry);

                // Route through the owner's return queue: the packet may
                // belong to a sibling loop sharing the port.
                let ret = (*scratch).ret.clone();
                let raw = c as *mut Completion as u64;
                ret.queue.push(raw);
                if !matches!(ret.waker, Waker::Port(p) if p == self.port as isize) {
                    ret.waker.wake();
                }
            }
        }

        let timers_fired = self.expire_timers(ready);
        Ok(timed_out && !timers_fired)
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

impl Drop for IocpBackend {
    fn drop(&mut self) {
        release_port();
    }
}

/// Store the packet's outcome on the completion. The loop that owns it marks
/// it completed when draining its return queue.
unsafe fn finish_packet(
    c: &mut Completion,
    scratch: *mut OverlappedScratch,
    entry: &OVERLAPPED_ENTRY,
) {
    // Internal carries the NTSTATUS of the operation.
    let status = entry.Internal as u32;
    const STATUS_SUCCESS: u32 = 0;
    const STATUS_CANCELLED: u32 = 0xC000_0120;

    if status != STATUS_SUCCESS {
        c.set_error(if status == STATUS_CANCELLED {
            Error::Canceled
        } else {
            Error::Unexpected
        });
        if let Op::NetAccept { .. } = c.op {
            // SAFETY: the pre-created socket was never handed out.
            unsafe { closesocket((*scratch).accept_socket) };
        }
        return;
    }

    let bytes = entry.dwNumberOfBytesTransferred as usize;
    match c.op {
        Op::NetAccept { fd } => {
            // SAFETY: accept_socket is live; fix-up must run before use.
            let accepted = unsafe { (*scratch).accept_socket };
            let mut listener = fd as SOCKET;
            let rc = unsafe {
                setsockopt(
                    accepted,
                    SOL_SOCKET,
                    SO_UPDATE_ACCEPT_CONTEXT,
                    (&raw mut listener).cast(),
                    size_of::<SOCKET>() as i32,
                )
            };
            if rc == SOCKET_ERROR {
                unsafe { closesocket(accepted) };
                c.set_error(map_wsa(unsafe { WSAGetLastError() }));
            } else {
                c.set_value(OpValue::Fd(accepted as OsFd));
            }
        }
        Op::NetConnect { fd, .. } => {
            let rc = unsafe {
                setsockopt(fd as SOCKET, SOL_SOCKET, SO_UPDATE_CONNECT_CONTEXT, ptr::null(), 0)
            };
            if rc == SOCKET_ERROR {
                c.set_error(map_wsa(unsafe { WSAGetLastError() }));
            } else {
                c.set_value(OpValue::Void);
            }
        }
        Op::NetRecv { .. } | Op::NetSend { .. } => c.set_value(OpValue::Bytes(bytes)),
        _ => unreachable!("no other op produces overlapped packets"),
    }
}

/// Post a synthetic packet so a blocked `GetQueuedCompletionStatusEx`
/// returns promptly.
pub(crate) fn post_wake(port: isize) {
    // SAFETY: posting a sentinel packet to a live port.
    let ok = unsafe { PostQueuedCompletionStatus(port as HANDLE, 0, WAKE_KEY, ptr::null_mut()) };
    if ok == 0 {
        log::warn!("wake packet post failed");
    }
}

fn socket_family(sock: SOCKET) -> Result<i32> {
    // SAFETY: out-params sized to sockaddr_storage.
    let mut storage: SOCKADDR_STORAGE = unsafe { mem::zeroed() };
    let mut len = size_of::<SOCKADDR_STORAGE>() as i32;
    let rc = unsafe { getsockname(sock, (&raw mut storage).cast(), &raw mut len) };
    if rc == SOCKET_ERROR {
        return Err(map_wsa(unsafe { WSAGetLastError() }));
    }
    Ok(storage.ss_family as i32)
}

fn wsa_unit(rc: i32) -> Result<OpValue> {
    if rc == SOCKET_ERROR {
        Err(map_wsa(unsafe { WSAGetLastError() }))
    } else {
        Ok(OpValue::Void)
    }
}

/// Coarse WinSock error translation; everything unmapped is Unexpected.
fn map_wsa(err: i32) -> Error {
    use windows_sys::Win32::Networking::WinSock::{
        WSAEACCES, WSAEADDRINUSE, WSAECONNABORTED, WSAECONNRESET, WSAEMFILE, WSAENOBUFS,
        WSAENOTCONN, WSAETIMEDOUT, WSAEWOULDBLOCK,
    };
    match err {
        WSAEACCES => Error::AccessDenied,
        WSAEADDRINUSE => Error::PathAlreadyExists,
        WSAECONNABORTED => Error::OperationAborted,
        WSAECONNRESET => Error::ConnectionResetByPeer,
        WSAEMFILE => Error::ProcessFdQuotaExceeded,
        WSAENOBUFS => Error::SystemResources,
        WSAENOTCONN => Error::SocketNotConnected,
        WSAETIMEDOUT => Error::ConnectionTimedOut,
        WSAEWOULDBLOCK => Error::WouldBlock,
        WSAEAFNOSUPPORT => Error::AddressFamilyNotSupported,
        _ => Error::Unexpected,
    }
}

fn overlapped_handle(op: &Op) -> Option<OsFd> {
    match *op {
        Op::NetAccept { fd }
        | Op::NetConnect { fd, .. }
        | Op::NetRecv { fd, .. }
        | Op::NetSend { fd, .. } => Some(fd),
        _ => None,
    }
}

// ── Pool-side blocking work (Windows) ────────────────────────────────────

/// Execute the blocking body of a pool-offloaded completion. Name
/// resolution goes through WinSock; filesystem operations are not expressed
/// on this backend.
pub(crate) fn perform_blocking(c: &mut Completion) {
    let outcome = match c.op {
        Op::Work { func } => {
            // SAFETY: submitter guarantees userdata validity.
            unsafe { func(c.userdata, c) };
            if c.has_result() {
                return;
            }
            Ok(OpValue::Void)
        }
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
        } => blocking_getaddrinfo(
            node,
            node_len,
            service,
            service_len,
            family,
            socket_type,
            protocol,
            results,
            results_cap,
        ),
        Op::NetGetNameInfo {
            addr,
            addr_len,
            host,
            host_cap,
            service,
            service_cap,
            flags,
        } => {
            // SAFETY: caller-owned buffers are valid until the callback.
            let rc = unsafe {
                getnameinfo(
                    addr,
                    addr_len,
                    host.cast(),
                    host_cap as u32,
                    service.cast(),
                    service_cap as u32,
                    flags,
                )
            };
            if rc != 0 {
                Err(map_wsa(unsafe { WSAGetLastError() }))
            } else {
                // SAFETY: getnameinfo wrote NUL-terminated strings.
                let (host_len, service_len) = unsafe {
                    let h = std::slice::from_raw_parts(host, host_cap);
                    let s = std::slice::from_raw_parts(service, service_cap);
                    (
                        h.iter().position(|&b| b == 0).unwrap_or(host_cap),
                        s.iter().position(|&b| b == 0).unwrap_or(service_cap),
                    )
                };
                Ok(OpValue::NameLengths {
                    host: host_len,
                    service: service_len,
                })
            }
        }
        _ => Err(Error::Unsupported),
    };

    match outcome {
        Ok(value) => c.set_value(value),
        Err(e) => c.set_error(e),
    }
}

#[allow(clippy::too_many_arguments)] // Mirrors the resolver surface.
fn blocking_getaddrinfo(
    node: *const u8,
    node_len: usize,
    service: *const u8,
    service_len: usize,
    family: i32,
    socket_type: i32,
    protocol: i32,
    results: *mut crate::completion::AddrInfo,
    results_cap: usize,
) -> Result<OpValue> {
    let to_cstr = |ptr: *const u8, len: usize| -> Result<Option<Vec<u8>>> {
        if ptr.is_null() {
            return Ok(None);
        }
        // SAFETY: caller-owned string bytes.
        let bytes = unsafe { std::slice::from_raw_parts(ptr, len) };
        if bytes.contains(&0) {
            return Err(Error::BadPathName);
        }
        let mut owned = bytes.to_vec();
        owned.push(0);
        Ok(Some(owned))
    };

    let node = to_cstr(node, node_len)?;
    let service = to_cstr(service, service_len)?;

    // SAFETY: ADDRINFOA is plain old data.
    let mut hints: ADDRINFOA = unsafe { mem::zeroed() };
    hints.ai_family = family;
    hints.ai_socktype = socket_type;
    hints.ai_protocol = protocol;

    let mut list: *mut ADDRINFOA = ptr::null_mut();
    // SAFETY: hint and out-pointer are valid; strings NUL-terminated.
    let rc = unsafe {
        getaddrinfo(
            node.as_ref().map_or(ptr::null(), |v| v.as_ptr()),
            service.as_ref().map_or(ptr::null(), |v| v.as_ptr()),
            &hints,
            &mut list,
        )
    };
    if rc != 0 {
        return Err(match rc {
            WSAHOST_NOT_FOUND => Error::UnknownHostName,
            WSATRY_AGAIN => Error::TemporaryNameServerFailure,
            WSANO_RECOVERY => Error::PermanentNameServerFailure,
            WSANO_DATA => Error::NameHasNoUsableAddress,
            WSATYPE_NOT_FOUND => Error::ServiceNotAvailableForSocketType,
            WSAEAFNOSUPPORT => Error::AddressFamilyNotSupported,
            _ => Error::Unexpected,
        });
    }

    // SAFETY: caller-owned result buffer.
    let out = unsafe { std::slice::from_raw_parts_mut(results, results_cap) };
    let mut count = 0usize;
    let mut cursor = list;
    let result = loop {
        if cursor.is_null() {
            break Ok(OpValue::AddrCount(count));
        }
        if count == out.len() {
            break Err(Error::SystemResources);
        }

        // SAFETY: cursor walks the returned list.
        let entry = unsafe { &*cursor };
        let record = &mut out[count];
        record.family = entry.ai_family;
        record.socket_type = entry.ai_socktype;
        record.protocol = entry.ai_protocol;
        record.addr_len = entry.ai_addrlen as i32;
        // SAFETY: ai_addr points at ai_addrlen valid bytes.
        unsafe {
            record.addr = mem::zeroed();
            ptr::copy_nonoverlapping(
                entry.ai_addr.cast::<u8>(),
                (&raw mut record.addr).cast::<u8>(),
                entry.ai_addrlen.min(size_of::<SOCKADDR_STORAGE>()),
            );
        }
        count += 1;
        cursor = entry.ai_next;
    };

    // SAFETY: list came from getaddrinfo.
    unsafe { freeaddrinfo(list) };
    result
}
