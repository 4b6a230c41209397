//! OS shims: thin translation from raw syscall returns to the normalized
//! error taxonomy, plus the synchronous syscall wrappers the backends and the
//! thread pool execute.
//!
//! Every wrapper returns `Result<_, Error>`; unrecognized errno values become
//! [`Error::Unexpected`]. Nothing here blocks except the wrappers that are
//! documented as blocking (`getaddrinfo`, `getnameinfo`, the file shims);
//! those run only on pool workers or behind the completion ring.

#![cfg(unix)]

use std::ffi::CString;
use std::io;
use std::mem;
use std::ptr;

use crate::completion::{AddrInfo, Completion, Op, OpValue, OsFd};
use crate::errors::{Error, Result};

/// Offset sentinel: perform the read/write at the current file position.
pub const OFFSET_CURRENT: u64 = u64::MAX;

/// glibc extension, not exported by the `libc` crate on every target.
const EAI_NODATA: i32 = -5;

/// Suppress SIGPIPE on send where the platform supports it; BSDs use the
/// per-socket SO_NOSIGPIPE route instead.
#[cfg(not(any(target_os = "macos", target_os = "ios")))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(any(target_os = "macos", target_os = "ios"))]
const SEND_FLAGS: libc::c_int = 0;

#[inline]
pub(crate) fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Translate an errno value into the normalized taxonomy.
///
/// `EAGAIN`/`EWOULDBLOCK` share a value on every supported platform, so only
/// the former appears below.
pub(crate) fn map_errno(errno: i32) -> Error {
    match errno {
        libc::EACCES => Error::AccessDenied,
        libc::EPERM => Error::PermissionDenied,
        libc::ELOOP => Error::SymLinkLoop,
        libc::EMFILE => Error::ProcessFdQuotaExceeded,
        libc::ENFILE => Error::SystemFdQuotaExceeded,
        libc::ENODEV | libc::ENXIO => Error::NoDevice,
        libc::ENOENT => Error::FileNotFound,
        libc::ENAMETOOLONG => Error::NameTooLong,
        libc::ENOMEM | libc::ENOBUFS => Error::SystemResources,
        libc::EFBIG => Error::FileTooBig,
        libc::EISDIR => Error::IsDir,
        libc::ENOSPC => Error::NoSpaceLeft,
        libc::ENOTDIR => Error::NotDir,
        libc::EEXIST => Error::PathAlreadyExists,
        libc::EBUSY => Error::DeviceBusy,
        libc::ETXTBSY => Error::FileBusy,
        libc::EINVAL => Error::InvalidFlags,
        // EINPROGRESS is a non-blocking connect in flight; callers treat it
        // like WouldBlock and wait for writability.
        libc::EAGAIN | libc::EINPROGRESS => Error::WouldBlock,
        libc::ECONNRESET => Error::ConnectionResetByPeer,
        libc::ETIMEDOUT => Error::ConnectionTimedOut,
        libc::EIO => Error::InputOutput,
        libc::ECONNABORTED => Error::OperationAborted,
        libc::ECANCELED => Error::Canceled,
        libc::EPIPE => Error::BrokenPipe,
        libc::ENOTCONN => Error::SocketNotConnected,
        libc::EDQUOT => Error::DiskQuota,
        libc::EDEADLK => Error::LockViolation,
        libc::EAFNOSUPPORT => Error::AddressFamilyNotSupported,
        _ => Error::Unexpected,
    }
}

fn map_gai(code: i32) -> Error {
    match code {
        libc::EAI_AGAIN => Error::TemporaryNameServerFailure,
        libc::EAI_BADFLAGS => Error::InvalidFlags,
        libc::EAI_FAIL => Error::PermanentNameServerFailure,
        libc::EAI_FAMILY => Error::AddressFamilyNotSupported,
        libc::EAI_MEMORY => Error::SystemResources,
        libc::EAI_NONAME => Error::UnknownHostName,
        libc::EAI_SERVICE => Error::ServiceNotAvailableForSocketType,
        libc::EAI_SOCKTYPE => Error::ServiceNotAvailableForSocketType,
        EAI_NODATA => Error::NameHasNoUsableAddress,
        _ => Error::Unexpected,
    }
}

#[inline]
fn cvt(ret: isize) -> Result<isize> {
    if ret < 0 {
        Err(map_errno(last_errno()))
    } else {
        Ok(ret)
    }
}

/// Duplicate a borrowed path into a null-terminated buffer for the duration
/// of the syscall. An embedded NUL is a bad path, not an unexpected error.
pub(crate) fn cstring(bytes: &[u8]) -> Result<CString> {
    CString::new(bytes).map_err(|_| Error::BadPathName)
}

// ── Sockets ──────────────────────────────────────────────────────────────

pub(crate) fn socket(domain: i32, socket_type: i32, protocol: i32) -> Result<OsFd> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    let fd = cvt(unsafe { libc::socket(domain, socket_type | libc::SOCK_CLOEXEC, protocol) }
        as isize)? as OsFd;

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let fd = {
        let fd = cvt(unsafe { libc::socket(domain, socket_type, protocol) } as isize)? as OsFd;
        set_cloexec(fd)?;
        fd
    };

    assert!(fd >= 0);
    Ok(fd)
}

pub(crate) fn bind(fd: OsFd, addr: *const libc::sockaddr, addr_len: libc::socklen_t) -> Result<()> {
    assert!(!addr.is_null());
    cvt(unsafe { libc::bind(fd, addr, addr_len) } as isize)?;
    Ok(())
}

pub(crate) fn listen(fd: OsFd, backlog: i32) -> Result<()> {
    cvt(unsafe { libc::listen(fd, backlog) } as isize)?;
    Ok(())
}

/// Accept with `CLOEXEC` on the new socket. Used by the readiness backend,
/// which performs the syscall inline once the listener polls readable.
pub(crate) fn accept(fd: OsFd) -> Result<OsFd> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    let accepted = cvt(unsafe {
        libc::accept4(fd, ptr::null_mut(), ptr::null_mut(), libc::SOCK_CLOEXEC)
    } as isize)? as OsFd;

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let accepted = {
        let accepted =
            cvt(unsafe { libc::accept(fd, ptr::null_mut(), ptr::null_mut()) } as isize)? as OsFd;
        set_cloexec(accepted)?;
        accepted
    };

    assert!(accepted >= 0);
    Ok(accepted)
}

pub(crate) fn connect(
    fd: OsFd,
    addr: *const libc::sockaddr,
    addr_len: libc::socklen_t,
) -> Result<()> {
    assert!(!addr.is_null());
    cvt(unsafe { libc::connect(fd, addr, addr_len) } as isize)?;
    Ok(())
}

/// After a non-blocking connect polls writable, the outcome is read from
/// `SO_ERROR`.
pub(crate) fn connect_result(fd: OsFd) -> Result<()> {
    let mut err: libc::c_int = 0;
    let mut len = size_of::<libc::c_int>() as libc::socklen_t;
    cvt(unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            (&raw mut err).cast(),
            &raw mut len,
        )
    } as isize)?;

    if err == 0 { Ok(()) } else { Err(map_errno(err)) }
}

pub(crate) fn recv(fd: OsFd, buf: *mut u8, len: usize) -> Result<usize> {
    assert!(!buf.is_null() || len == 0);
    let n = cvt(unsafe { libc::recv(fd, buf.cast(), len, 0) })?;
    Ok(n as usize)
}

pub(crate) fn send(fd: OsFd, buf: *const u8, len: usize) -> Result<usize> {
    assert!(!buf.is_null() || len == 0);
    let n = cvt(unsafe { libc::send(fd, buf.cast(), len, SEND_FLAGS) })?;
    Ok(n as usize)
}

pub(crate) fn recvfrom(
    fd: OsFd,
    buf: *mut u8,
    len: usize,
    addr: *mut libc::sockaddr_storage,
    addr_len: *mut libc::socklen_t,
) -> Result<usize> {
    assert!(!buf.is_null() || len == 0);
    let n = cvt(unsafe { libc::recvfrom(fd, buf.cast(), len, 0, addr.cast(), addr_len) })?;
    Ok(n as usize)
}

pub(crate) fn sendto(
    fd: OsFd,
    buf: *const u8,
    len: usize,
    addr: *const libc::sockaddr,
    addr_len: libc::socklen_t,
) -> Result<usize> {
    assert!(!buf.is_null() || len == 0);
    let n = cvt(unsafe { libc::sendto(fd, buf.cast(), len, SEND_FLAGS, addr, addr_len) })?;
    Ok(n as usize)
}

pub(crate) fn shutdown(fd: OsFd, how: i32) -> Result<()> {
    cvt(unsafe { libc::shutdown(fd, how) } as isize)?;
    Ok(())
}

/// Close ignores `EINTR`: the descriptor is gone either way.
pub(crate) fn close_fd(fd: OsFd) -> Result<()> {
    let ret = unsafe { libc::close(fd) };
    if ret < 0 && last_errno() != libc::EINTR {
        return Err(map_errno(last_errno()));
    }
    Ok(())
}

pub fn getsockname(fd: OsFd, storage: &mut libc::sockaddr_storage) -> Result<libc::socklen_t> {
    let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    cvt(unsafe { libc::getsockname(fd, (storage as *mut libc::sockaddr_storage).cast(), &raw mut len) }
        as isize)?;
    Ok(len)
}

pub(crate) fn set_nonblocking(fd: OsFd) -> Result<()> {
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFL) } as isize)? as i32;
    if flags & libc::O_NONBLOCK == 0 {
        cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } as isize)?;
    }
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn set_cloexec(fd: OsFd) -> Result<()> {
    cvt(unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } as isize)?;
    Ok(())
}

// ── Files ────────────────────────────────────────────────────────────────

pub(crate) fn open(path: &[u8], flags: i32, mode: u32) -> Result<OsFd> {
    let path = cstring(path)?;
    let fd = cvt(unsafe { libc::open(path.as_ptr(), flags | libc::O_CLOEXEC, mode as libc::c_uint) }
        as isize)? as OsFd;

    assert!(fd >= 0);
    Ok(fd)
}

pub(crate) fn pread(fd: OsFd, buf: *mut u8, len: usize, offset: u64) -> Result<usize> {
    assert!(!buf.is_null() || len == 0);
    let n = if offset == OFFSET_CURRENT {
        unsafe { libc::read(fd, buf.cast(), len) }
    } else {
        unsafe { libc::pread(fd, buf.cast(), len, offset as libc::off_t) }
    };
    match cvt(n) {
        Ok(n) => Ok(n as usize),
        Err(Error::Unexpected) if last_errno() == libc::EBADF => Err(Error::NotOpenForReading),
        Err(e) => Err(e),
    }
}

pub(crate) fn pwrite(fd: OsFd, buf: *const u8, len: usize, offset: u64) -> Result<usize> {
    assert!(!buf.is_null() || len == 0);
    let n = if offset == OFFSET_CURRENT {
        unsafe { libc::write(fd, buf.cast(), len) }
    } else {
        unsafe { libc::pwrite(fd, buf.cast(), len, offset as libc::off_t) }
    };
    match cvt(n) {
        Ok(n) => Ok(n as usize),
        Err(Error::Unexpected) if last_errno() == libc::EBADF => Err(Error::NotOpenForWriting),
        Err(e) => Err(e),
    }
}

pub(crate) fn fsync(fd: OsFd) -> Result<()> {
    cvt(unsafe { libc::fsync(fd) } as isize)?;
    Ok(())
}

pub(crate) fn rename(old: &[u8], new: &[u8]) -> Result<()> {
    let old = cstring(old)?;
    let new = cstring(new)?;
    cvt(unsafe { libc::rename(old.as_ptr(), new.as_ptr()) } as isize)?;
    Ok(())
}

pub(crate) fn unlink(path: &[u8]) -> Result<()> {
    let path = cstring(path)?;
    cvt(unsafe { libc::unlink(path.as_ptr()) } as isize)?;
    Ok(())
}

// ── Wake primitives ──────────────────────────────────────────────────────

/// CLOEXEC + non-blocking pipe for the readiness backend's self-pipe wake.
pub(crate) fn pipe_pair() -> Result<(OsFd, OsFd)> {
    let mut fds = [0 as OsFd; 2];

    #[cfg(any(target_os = "linux", target_os = "android"))]
    cvt(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) } as isize)?;

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        cvt(unsafe { libc::pipe(fds.as_mut_ptr()) } as isize)?;
        for &fd in &fds {
            set_cloexec(fd)?;
            set_nonblocking(fd)?;
        }
    }

    Ok((fds[0], fds[1]))
}

#[cfg(target_os = "linux")]
pub(crate) fn eventfd() -> Result<OsFd> {
    let fd = cvt(unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) } as isize)?
        as OsFd;
    Ok(fd)
}

/// Write one token to a wake descriptor. `EAGAIN` means a wake is already
/// pending, which is the desired state.
#[cfg(target_os = "linux")]
pub(crate) fn wake_write(fd: OsFd, token: u64) {
    let ret = unsafe { libc::write(fd, (&raw const token).cast(), size_of::<u64>()) };
    if ret < 0 {
        let errno = last_errno();
        if errno != libc::EAGAIN && errno != libc::EINTR {
            log::warn!("wake write failed: errno {errno}");
        }
    }
}

/// Write a single byte to the self-pipe. Coalescing is handled at drain time.
pub(crate) fn wake_write_byte(fd: OsFd) {
    let byte = 1u8;
    let ret = unsafe { libc::write(fd, (&raw const byte).cast(), 1) };
    if ret < 0 {
        let errno = last_errno();
        if errno != libc::EAGAIN && errno != libc::EINTR {
            log::warn!("self-pipe write failed: errno {errno}");
        }
    }
}

/// Drain a non-blocking wake descriptor (eventfd counter or self-pipe bytes).
pub(crate) fn wake_drain(fd: OsFd) {
    let mut scratch = [0u8; 64];
    loop {
        let ret = unsafe { libc::read(fd, scratch.as_mut_ptr().cast(), scratch.len()) };
        if ret <= 0 {
            break;
        }
    }
}

// ── Name resolution ──────────────────────────────────────────────────────

/// Forward resolution into a caller-sized `AddrInfo` buffer.
///
/// Returns the number of records written. More results than `out` can hold is
/// reported as `SystemResources`.
pub(crate) fn getaddrinfo_into(
    node: Option<&[u8]>,
    service: Option<&[u8]>,
    family: i32,
    socket_type: i32,
    protocol: i32,
    out: &mut [AddrInfo],
) -> Result<usize> {
    let node = node.map(cstring).transpose()?;
    let service = service.map(cstring).transpose()?;

    let mut hints: libc::addrinfo = unsafe { mem::zeroed() };
    hints.ai_family = family;
    hints.ai_socktype = socket_type;
    hints.ai_protocol = protocol;

    let node_ptr = node.as_ref().map_or(ptr::null(), |s| s.as_ptr());
    let service_ptr = service.as_ref().map_or(ptr::null(), |s| s.as_ptr());

    let mut list: *mut libc::addrinfo = ptr::null_mut();
    let rc = unsafe { libc::getaddrinfo(node_ptr, service_ptr, &hints, &mut list) };
    if rc != 0 {
        if rc == libc::EAI_SYSTEM {
            return Err(map_errno(last_errno()));
        }
        return Err(map_gai(rc));
    }
    assert!(!list.is_null());

    let mut count = 0usize;
    let mut cursor = list;
    let result = loop {
        if cursor.is_null() {
            break Ok(count);
        }
        if count == out.len() {
            break Err(Error::SystemResources);
        }

        // SAFETY: cursor walks the list getaddrinfo returned.
        let entry = unsafe { &*cursor };
        let record = &mut out[count];

        record.family = entry.ai_family;
        record.socket_type = entry.ai_socktype;
        record.protocol = entry.ai_protocol;
        record.addr_len = entry.ai_addrlen;
        record.addr = unsafe { mem::zeroed() };

        let addr_len = entry.ai_addrlen as usize;
        assert!(addr_len <= size_of::<libc::sockaddr_storage>());
        // SAFETY: ai_addr points at ai_addrlen valid bytes.
        unsafe {
            ptr::copy_nonoverlapping(
                entry.ai_addr.cast::<u8>(),
                (&raw mut record.addr).cast::<u8>(),
                addr_len,
            );
        }

        count += 1;
        cursor = entry.ai_next;
    };

    unsafe { libc::freeaddrinfo(list) };
    result
}

/// Reverse resolution into caller-supplied host and service byte buffers.
///
/// Returns the written lengths, excluding the terminating NUL.
pub(crate) fn getnameinfo_into(
    addr: *const libc::sockaddr,
    addr_len: libc::socklen_t,
    host: &mut [u8],
    service: &mut [u8],
    flags: i32,
) -> Result<(usize, usize)> {
    assert!(!addr.is_null());
    assert!(!host.is_empty());
    assert!(!service.is_empty());

    let rc = unsafe {
        libc::getnameinfo(
            addr,
            addr_len,
            host.as_mut_ptr().cast(),
            host.len() as libc::socklen_t,
            service.as_mut_ptr().cast(),
            service.len() as libc::socklen_t,
            flags,
        )
    };
    if rc != 0 {
        if rc == libc::EAI_SYSTEM {
            return Err(map_errno(last_errno()));
        }
        return Err(map_gai(rc));
    }

    let host_len = host.iter().position(|&b| b == 0).unwrap_or(host.len());
    let service_len = service.iter().position(|&b| b == 0).unwrap_or(service.len());
    Ok((host_len, service_len))
}

// ── Blocking-work dispatch ───────────────────────────────────────────────

/// Execute the blocking body of a pool-offloaded completion and store its
/// result. Runs on a pool worker; must not touch any loop state.
pub(crate) fn perform_blocking(c: &mut Completion) {
    let outcome = match c.op {
        Op::Work { func } => {
            // SAFETY: the submitter guarantees userdata validity for the
            // duration of the operation.
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
        } => {
            // SAFETY: caller-owned buffers remain valid until the callback.
            let node = unsafe { opt_slice(node, node_len) };
            let service = unsafe { opt_slice(service, service_len) };
            let out = unsafe { std::slice::from_raw_parts_mut(results, results_cap) };
            getaddrinfo_into(node, service, family, socket_type, protocol, out)
                .map(OpValue::AddrCount)
        }
        Op::NetGetNameInfo {
            addr,
            addr_len,
            host,
            host_cap,
            service,
            service_cap,
            flags,
        } => {
            // SAFETY: caller-owned buffers remain valid until the callback.
            let host = unsafe { std::slice::from_raw_parts_mut(host, host_cap) };
            let service = unsafe { std::slice::from_raw_parts_mut(service, service_cap) };
            getnameinfo_into(addr, addr_len, host, service, flags)
                .map(|(host, service)| OpValue::NameLengths { host, service })
        }
        Op::FileOpen {
            path,
            path_len,
            flags,
            mode,
        } => {
            let path = unsafe { std::slice::from_raw_parts(path, path_len) };
            open(path, flags, mode).map(OpValue::Fd)
        }
        Op::FileRead {
            fd,
            buf,
            len,
            offset,
        } => pread(fd, buf, len, offset).map(OpValue::Bytes),
        Op::FileWrite {
            fd,
            buf,
            len,
            offset,
        } => pwrite(fd, buf, len, offset).map(OpValue::Bytes),
        Op::FileSync { fd } => fsync(fd).map(|()| OpValue::Void),
        Op::FileRename {
            old_path,
            old_len,
            new_path,
            new_len,
        } => {
            let old = unsafe { std::slice::from_raw_parts(old_path, old_len) };
            let new = unsafe { std::slice::from_raw_parts(new_path, new_len) };
            rename(old, new).map(|()| OpValue::Void)
        }
        Op::FileDelete { path, path_len } => {
            let path = unsafe { std::slice::from_raw_parts(path, path_len) };
            unlink(path).map(|()| OpValue::Void)
        }
        _ => unreachable!("operation is not pool-eligible"),
    };

    match outcome {
        Ok(value) => c.set_value(value),
        Err(e) => c.set_error(e),
    }
}

unsafe fn opt_slice<'a>(ptr: *const u8, len: usize) -> Option<&'a [u8]> {
    if ptr.is_null() {
        None
    } else {
        // SAFETY: caller passes a live buffer of `len` bytes.
        Some(unsafe { std::slice::from_raw_parts(ptr, len) })
    }
}
