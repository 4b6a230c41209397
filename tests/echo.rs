//! End-to-end scenarios: file lifecycle, TCP and UNIX echo, name
//! resolution, and bound-address round-trips, on every backend the host can
//! run.

#![cfg(unix)]

use core::ffi::c_void;
use std::mem;
use std::sync::Arc;

use evio::os::{self, OFFSET_CURRENT};
use evio::{
    AddrInfo, BackendKind, Completion, Error, Loop, LoopOptions, OpKind, OpValue, PoolOptions,
    Result, RunMode, ThreadPool,
};

fn host_backends() -> Vec<BackendKind> {
    #[cfg(target_os = "linux")]
    {
        vec![BackendKind::Uring, BackendKind::Poll]
    }
    #[cfg(not(target_os = "linux"))]
    {
        vec![BackendKind::Poll]
    }
}

fn new_loop(kind: BackendKind) -> Option<Loop> {
    let pool = Arc::new(ThreadPool::new(PoolOptions::default()).unwrap());
    match Loop::new(LoopOptions {
        backend: Some(kind),
        pool: Some(pool),
        ..Default::default()
    }) {
        Ok(l) => Some(l),
        Err(e) => {
            eprintln!("skipping {kind:?}: {e}");
            None
        }
    }
}

unsafe fn nop_cb(_l: &mut Loop, _c: &mut Completion) {}

/// Drive a single operation to completion and return its result.
fn run_op(l: &mut Loop, c: &mut Completion, kind: OpKind) -> Result<OpValue> {
    l.add(c);
    l.run(RunMode::UntilDone).unwrap();
    c.result(kind)
}

/// Drive two concurrently-submitted operations to completion.
fn run_pair(l: &mut Loop, a: &mut Completion, b: &mut Completion) {
    l.add(a);
    l.add(b);
    l.run(RunMode::UntilDone).unwrap();
}

fn ipv4_loopback(port: u16) -> libc::sockaddr_in {
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_port = port.to_be();
    addr.sin_addr = libc::in_addr {
        s_addr: u32::from_be_bytes([127, 0, 0, 1]).to_be(),
    };
    addr
}

fn unix_addr(path: &[u8]) -> (libc::sockaddr_un, libc::socklen_t) {
    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    assert!(path.len() < addr.sun_path.len(), "socket path too long");
    for (dst, &src) in addr.sun_path.iter_mut().zip(path) {
        *dst = src as libc::c_char;
    }
    let len = (mem::size_of::<libc::sa_family_t>() + path.len() + 1) as libc::socklen_t;
    (addr, len)
}

const ECHO_MSG: &[u8] = b"Hello, Echo Server!";

/// Shared echo flow once both sockets exist and the server is listening:
/// accept+connect concurrently, client→server, server→client, teardown.
fn echo_flow(l: &mut Loop, server_fd: i32, client_fd: i32, addr: *const libc::sockaddr, addr_len: libc::socklen_t) {
    assert_eq!(ECHO_MSG.len(), 19);

    let mut accept = Completion::init_net_accept(server_fd, core::ptr::null_mut(), nop_cb);
    let mut connect =
        Completion::init_net_connect(client_fd, addr, addr_len, core::ptr::null_mut(), nop_cb);
    run_pair(l, &mut accept, &mut connect);

    let conn_fd = accept.result(OpKind::NetAccept).unwrap().fd();
    assert!(conn_fd >= 0);
    assert_eq!(connect.result(OpKind::NetConnect), Ok(OpValue::Void));

    // Client sends; server receives byte-for-byte.
    let mut server_buf = [0u8; 64];
    let mut recv = Completion::init_net_recv(
        conn_fd,
        server_buf.as_mut_ptr(),
        server_buf.len(),
        core::ptr::null_mut(),
        nop_cb,
    );
    let mut send = Completion::init_net_send(
        client_fd,
        ECHO_MSG.as_ptr(),
        ECHO_MSG.len(),
        core::ptr::null_mut(),
        nop_cb,
    );
    run_pair(l, &mut recv, &mut send);

    assert_eq!(send.result(OpKind::NetSend).unwrap().bytes(), 19);
    let received = recv.result(OpKind::NetRecv).unwrap().bytes();
    assert_eq!(received, 19);
    assert_eq!(&server_buf[..received], ECHO_MSG);

    // Server echoes back; client receives byte-for-byte.
    let mut client_buf = [0u8; 64];
    let mut reply_recv = Completion::init_net_recv(
        client_fd,
        client_buf.as_mut_ptr(),
        client_buf.len(),
        core::ptr::null_mut(),
        nop_cb,
    );
    let mut reply_send = Completion::init_net_send(
        conn_fd,
        server_buf.as_ptr(),
        received,
        core::ptr::null_mut(),
        nop_cb,
    );
    run_pair(l, &mut reply_recv, &mut reply_send);

    assert_eq!(reply_send.result(OpKind::NetSend).unwrap().bytes(), 19);
    let echoed = reply_recv.result(OpKind::NetRecv).unwrap().bytes();
    assert_eq!(echoed, 19);
    assert_eq!(&client_buf[..echoed], ECHO_MSG);

    // Teardown: both sides shut down and close.
    let mut shut = Completion::init_net_shutdown(
        client_fd,
        libc::SHUT_RDWR,
        core::ptr::null_mut(),
        nop_cb,
    );
    assert_eq!(run_op(l, &mut shut, OpKind::NetShutdown), Ok(OpValue::Void));

    for fd in [conn_fd, client_fd, server_fd] {
        let mut close = Completion::init_net_close(fd, core::ptr::null_mut(), nop_cb);
        assert_eq!(run_op(l, &mut close, OpKind::NetClose), Ok(OpValue::Void));
    }

    assert_eq!(l.active(), 0);
}

#[test]
fn echo_ipv4() {
    for kind in host_backends() {
        let Some(mut l) = new_loop(kind) else { continue };

        let mut open = Completion::init_net_open(
            libc::AF_INET,
            libc::SOCK_STREAM,
            0,
            core::ptr::null_mut(),
            nop_cb,
        );
        let server_fd = run_op(&mut l, &mut open, OpKind::NetOpen).unwrap().fd();

        // Bind to an OS-assigned port.
        let bind_addr = ipv4_loopback(0);
        let mut bind = Completion::init_net_bind(
            server_fd,
            (&raw const bind_addr).cast(),
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            core::ptr::null_mut(),
            nop_cb,
        );
        assert_eq!(run_op(&mut l, &mut bind, OpKind::NetBind), Ok(OpValue::Void));

        let mut listen =
            Completion::init_net_listen(server_fd, 1, core::ptr::null_mut(), nop_cb);
        assert_eq!(
            run_op(&mut l, &mut listen, OpKind::NetListen),
            Ok(OpValue::Void)
        );

        // Round-trip the bound address: same address, OS-assigned port.
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let len = os::getsockname(server_fd, &mut storage).unwrap();
        assert_eq!(len as usize, mem::size_of::<libc::sockaddr_in>());
        let bound: &libc::sockaddr_in =
            unsafe { &*((&raw const storage).cast::<libc::sockaddr_in>()) };
        assert_eq!(bound.sin_family, libc::AF_INET as libc::sa_family_t);
        assert_eq!(bound.sin_addr.s_addr, bind_addr.sin_addr.s_addr);
        assert_ne!(bound.sin_port, 0, "OS fills in the port for bind(0)");

        let mut client = Completion::init_net_open(
            libc::AF_INET,
            libc::SOCK_STREAM,
            0,
            core::ptr::null_mut(),
            nop_cb,
        );
        let client_fd = run_op(&mut l, &mut client, OpKind::NetOpen).unwrap().fd();

        echo_flow(
            &mut l,
            server_fd,
            client_fd,
            (&raw const storage).cast(),
            len,
        );
    }
}

#[test]
fn echo_unix_socket() {
    for kind in host_backends() {
        let Some(mut l) = new_loop(kind) else { continue };

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("echo.sock");
        let path_bytes = path.as_os_str().as_encoded_bytes().to_vec();
        let (addr, addr_len) = unix_addr(&path_bytes);

        let mut open = Completion::init_net_open(
            libc::AF_UNIX,
            libc::SOCK_STREAM,
            0,
            core::ptr::null_mut(),
            nop_cb,
        );
        let server_fd = run_op(&mut l, &mut open, OpKind::NetOpen).unwrap().fd();

        let mut bind = Completion::init_net_bind(
            server_fd,
            (&raw const addr).cast(),
            addr_len,
            core::ptr::null_mut(),
            nop_cb,
        );
        assert_eq!(run_op(&mut l, &mut bind, OpKind::NetBind), Ok(OpValue::Void));

        let mut listen =
            Completion::init_net_listen(server_fd, 1, core::ptr::null_mut(), nop_cb);
        assert_eq!(
            run_op(&mut l, &mut listen, OpKind::NetListen),
            Ok(OpValue::Void)
        );

        let mut client = Completion::init_net_open(
            libc::AF_UNIX,
            libc::SOCK_STREAM,
            0,
            core::ptr::null_mut(),
            nop_cb,
        );
        let client_fd = run_op(&mut l, &mut client, OpKind::NetOpen).unwrap().fd();

        echo_flow(
            &mut l,
            server_fd,
            client_fd,
            (&raw const addr).cast(),
            addr_len,
        );

        // Unlink the socket path on teardown, through the runtime itself.
        let mut unlink =
            Completion::init_file_delete(&path_bytes, core::ptr::null_mut(), nop_cb);
        assert_eq!(
            run_op(&mut l, &mut unlink, OpKind::FileDelete),
            Ok(OpValue::Void)
        );
        assert!(!path.exists());
    }
}

#[test]
fn file_lifecycle() {
    for kind in host_backends() {
        let Some(mut l) = new_loop(kind) else { continue };

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test-file");
        let path_bytes = path.as_os_str().as_encoded_bytes().to_vec();

        // Create with {create, truncate} and mode 0o664.
        let mut open = Completion::init_file_open(
            &path_bytes,
            libc::O_CREAT | libc::O_TRUNC | libc::O_RDWR,
            0o664,
            core::ptr::null_mut(),
            nop_cb,
        );
        let fd = run_op(&mut l, &mut open, OpKind::FileOpen).unwrap().fd();
        assert!(fd > 0, "positive handle expected");

        let payload = b"hello, file";
        let mut write = Completion::init_file_write(
            fd,
            payload.as_ptr(),
            payload.len(),
            0,
            core::ptr::null_mut(),
            nop_cb,
        );
        assert_eq!(
            run_op(&mut l, &mut write, OpKind::FileWrite).unwrap().bytes(),
            payload.len(),
            "{kind:?}"
        );

        let mut sync = Completion::init_file_sync(fd, core::ptr::null_mut(), nop_cb);
        assert_eq!(run_op(&mut l, &mut sync, OpKind::FileSync), Ok(OpValue::Void));

        let mut buf = [0u8; 32];
        let mut read = Completion::init_file_read(
            fd,
            buf.as_mut_ptr(),
            buf.len(),
            0,
            core::ptr::null_mut(),
            nop_cb,
        );
        let n = run_op(&mut l, &mut read, OpKind::FileRead).unwrap().bytes();
        assert_eq!(&buf[..n], payload);

        let mut close = Completion::init_file_close(fd, core::ptr::null_mut(), nop_cb);
        assert_eq!(
            run_op(&mut l, &mut close, OpKind::FileClose),
            Ok(OpValue::Void)
        );

        // Rename, then delete through the runtime.
        let renamed = dir.path().join("test-file-renamed");
        let renamed_bytes = renamed.as_os_str().as_encoded_bytes().to_vec();
        let mut rename = Completion::init_file_rename(
            &path_bytes,
            &renamed_bytes,
            core::ptr::null_mut(),
            nop_cb,
        );
        assert_eq!(
            run_op(&mut l, &mut rename, OpKind::FileRename),
            Ok(OpValue::Void)
        );
        assert!(renamed.exists());
        assert!(!path.exists());

        let mut delete =
            Completion::init_file_delete(&renamed_bytes, core::ptr::null_mut(), nop_cb);
        assert_eq!(
            run_op(&mut l, &mut delete, OpKind::FileDelete),
            Ok(OpValue::Void)
        );
        assert!(!renamed.exists());
    }
}

#[test]
fn file_read_missing_is_not_found() {
    for kind in host_backends() {
        let Some(mut l) = new_loop(kind) else { continue };

        let mut open = Completion::init_file_open(
            b"/definitely/not/a/real/path/test-file",
            libc::O_RDONLY,
            0,
            core::ptr::null_mut(),
            nop_cb,
        );
        assert_eq!(
            run_op(&mut l, &mut open, OpKind::FileOpen),
            Err(Error::FileNotFound),
            "{kind:?}"
        );
    }
}

#[test]
fn file_write_at_current_position() {
    for kind in host_backends() {
        let Some(mut l) = new_loop(kind) else { continue };

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("append");
        let path_bytes = path.as_os_str().as_encoded_bytes().to_vec();

        let mut open = Completion::init_file_open(
            &path_bytes,
            libc::O_CREAT | libc::O_RDWR,
            0o600,
            core::ptr::null_mut(),
            nop_cb,
        );
        let fd = run_op(&mut l, &mut open, OpKind::FileOpen).unwrap().fd();

        for chunk in [b"ab".as_slice(), b"cd".as_slice()] {
            let mut write = Completion::init_file_write(
                fd,
                chunk.as_ptr(),
                chunk.len(),
                OFFSET_CURRENT,
                core::ptr::null_mut(),
                nop_cb,
            );
            assert_eq!(
                run_op(&mut l, &mut write, OpKind::FileWrite).unwrap().bytes(),
                2
            );
        }

        let mut close = Completion::init_file_close(fd, core::ptr::null_mut(), nop_cb);
        run_op(&mut l, &mut close, OpKind::FileClose).unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"abcd");
    }
}

#[test]
fn getaddrinfo_localhost_http() {
    for kind in host_backends() {
        let Some(mut l) = new_loop(kind) else { continue };

        let node = b"localhost";
        let service = b"80";
        let mut results = [AddrInfo::zeroed(); 8];
        let mut c = Completion::init_net_getaddrinfo(
            node.as_ptr(),
            node.len(),
            service.as_ptr(),
            service.len(),
            libc::AF_INET,
            libc::SOCK_STREAM,
            0,
            results.as_mut_ptr(),
            results.len(),
            core::ptr::null_mut(),
            nop_cb,
        );

        let count = run_op(&mut l, &mut c, OpKind::NetGetAddrInfo)
            .unwrap()
            .addr_count();
        assert!(count >= 1, "{kind:?}");

        let first = &results[0];
        assert_eq!(first.family, libc::AF_INET);
        let sin: &libc::sockaddr_in =
            unsafe { &*((&raw const first.addr).cast::<libc::sockaddr_in>()) };
        assert_eq!(sin.sin_port, 80u16.to_be(), "port in network byte order");
    }
}

#[test]
fn getaddrinfo_unknown_host() {
    for kind in host_backends() {
        let Some(mut l) = new_loop(kind) else { continue };

        let node = b"this-hostname-does-not-exist-12345.invalid";
        let mut results = [AddrInfo::zeroed(); 4];
        let mut c = Completion::init_net_getaddrinfo(
            node.as_ptr(),
            node.len(),
            core::ptr::null(),
            0,
            0,
            libc::SOCK_STREAM,
            0,
            results.as_mut_ptr(),
            results.len(),
            core::ptr::null_mut(),
            nop_cb,
        );

        assert_eq!(
            run_op(&mut l, &mut c, OpKind::NetGetAddrInfo),
            Err(Error::UnknownHostName),
            "{kind:?}"
        );
    }
}

#[test]
fn getnameinfo_numeric() {
    for kind in host_backends() {
        let Some(mut l) = new_loop(kind) else { continue };

        let addr = ipv4_loopback(8080);
        let mut host = [0u8; 64];
        let mut service = [0u8; 16];
        let mut c = Completion::init_net_getnameinfo(
            (&raw const addr).cast(),
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            host.as_mut_ptr(),
            host.len(),
            service.as_mut_ptr(),
            service.len(),
            libc::NI_NUMERICHOST | libc::NI_NUMERICSERV,
            core::ptr::null_mut(),
            nop_cb,
        );

        let (host_len, service_len) = run_op(&mut l, &mut c, OpKind::NetGetNameInfo)
            .unwrap()
            .name_lengths();
        assert_eq!(&host[..host_len], b"127.0.0.1", "{kind:?}");
        assert_eq!(&service[..service_len], b"8080");
    }
}

#[test]
fn udp_bound_address_round_trip() {
    for kind in host_backends() {
        let Some(mut l) = new_loop(kind) else { continue };

        let mut open = Completion::init_net_open(
            libc::AF_INET,
            libc::SOCK_DGRAM,
            0,
            core::ptr::null_mut(),
            nop_cb,
        );
        let fd = run_op(&mut l, &mut open, OpKind::NetOpen).unwrap().fd();

        let addr = ipv4_loopback(0);
        let mut bind = Completion::init_net_bind(
            fd,
            (&raw const addr).cast(),
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            core::ptr::null_mut(),
            nop_cb,
        );
        assert_eq!(run_op(&mut l, &mut bind, OpKind::NetBind), Ok(OpValue::Void));

        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let len = os::getsockname(fd, &mut storage).unwrap();
        assert_eq!(len as usize, mem::size_of::<libc::sockaddr_in>());

        let bound: &libc::sockaddr_in =
            unsafe { &*((&raw const storage).cast::<libc::sockaddr_in>()) };
        assert_eq!(bound.sin_family, libc::AF_INET as libc::sa_family_t, "{kind:?}");
        assert_eq!(bound.sin_addr.s_addr, addr.sin_addr.s_addr);
        assert_ne!(bound.sin_port, 0);

        let mut close = Completion::init_net_close(fd, core::ptr::null_mut(), nop_cb);
        assert_eq!(run_op(&mut l, &mut close, OpKind::NetClose), Ok(OpValue::Void));
    }
}

#[test]
fn udp_sendto_recvfrom() {
    for kind in host_backends() {
        let Some(mut l) = new_loop(kind) else { continue };

        // Two bound UDP sockets on loopback.
        let mut fds = [0; 2];
        let mut addrs: [libc::sockaddr_storage; 2] = unsafe { mem::zeroed() };
        let mut lens = [0 as libc::socklen_t; 2];
        for i in 0..2 {
            let mut open = Completion::init_net_open(
                libc::AF_INET,
                libc::SOCK_DGRAM,
                0,
                core::ptr::null_mut(),
                nop_cb,
            );
            fds[i] = run_op(&mut l, &mut open, OpKind::NetOpen).unwrap().fd();

            let addr = ipv4_loopback(0);
            let mut bind = Completion::init_net_bind(
                fds[i],
                (&raw const addr).cast(),
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                core::ptr::null_mut(),
                nop_cb,
            );
            run_op(&mut l, &mut bind, OpKind::NetBind).unwrap();
            lens[i] = os::getsockname(fds[i], &mut addrs[i]).unwrap();
        }

        let payload = b"datagram";
        let mut recv_buf = [0u8; 32];
        let mut peer: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut peer_len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

        let mut recvfrom = Completion::init_net_recvfrom(
            fds[1],
            recv_buf.as_mut_ptr(),
            recv_buf.len(),
            &raw mut peer,
            &raw mut peer_len,
            core::ptr::null_mut(),
            nop_cb,
        );
        let mut sendto = Completion::init_net_sendto(
            fds[0],
            payload.as_ptr(),
            payload.len(),
            (&raw const addrs[1]).cast(),
            lens[1],
            core::ptr::null_mut(),
            nop_cb,
        );
        run_pair(&mut l, &mut recvfrom, &mut sendto);

        assert_eq!(
            sendto.result(OpKind::NetSendTo).unwrap().bytes(),
            payload.len()
        );
        let n = recvfrom.result(OpKind::NetRecvFrom).unwrap().bytes();
        assert_eq!(&recv_buf[..n], payload, "{kind:?}");

        // The reported peer is the sender's bound address.
        let sender: &libc::sockaddr_in =
            unsafe { &*((&raw const addrs[0]).cast::<libc::sockaddr_in>()) };
        let reported: &libc::sockaddr_in =
            unsafe { &*((&raw const peer).cast::<libc::sockaddr_in>()) };
        assert_eq!(reported.sin_port, sender.sin_port);

        for fd in fds {
            let mut close = Completion::init_net_close(fd, core::ptr::null_mut(), nop_cb);
            run_op(&mut l, &mut close, OpKind::NetClose).unwrap();
        }
    }
}
