//! Low-level socket helpers: TCP, UDP, and UNIX-domain create/bind/accept/
//! connect/send/receive, plus multicast membership.
//!
//! IPv4-only (`AF_INET`). Exposed as raw fds rather than `std::net` types
//! since the scheduler and TCP service layer need to register/accept/connect
//! them non-blocking and hand the raw descriptor to `select(2)` directly —
//! `std::net::TcpListener` would just be unwrapped again at every call
//! site.

pub mod tcp;
pub mod udp;
pub mod unix_socket;

use std::io;
use std::os::unix::io::RawFd;

pub(crate) fn cvt(rv: libc::c_int) -> io::Result<libc::c_int> {
    if rv == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rv)
    }
}

pub(crate) fn cvt_fd(rv: RawFd) -> io::Result<RawFd> {
    if rv == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rv)
    }
}

/// Toggles `O_NONBLOCK` on `fd`.
pub fn set_nonblocking(fd: RawFd, on: bool) -> io::Result<()> {
    unsafe {
        let flags = cvt(libc::fcntl(fd, libc::F_GETFL))?;
        let flags = if on { flags | libc::O_NONBLOCK } else { flags & !libc::O_NONBLOCK };
        cvt(libc::fcntl(fd, libc::F_SETFL, flags))?;
    }
    Ok(())
}

fn set_reuseaddr(fd: RawFd, on: bool) -> io::Result<()> {
    setsockopt_bool(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, on)
}

fn set_keepalive(fd: RawFd, on: bool) -> io::Result<()> {
    setsockopt_bool(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, on)
}

fn setsockopt_bool(fd: RawFd, level: libc::c_int, name: libc::c_int, on: bool) -> io::Result<()> {
    let val: libc::c_int = if on { 1 } else { 0 };
    unsafe {
        cvt(libc::setsockopt(
            fd,
            level,
            name,
            &val as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        ))?;
    }
    Ok(())
}

pub(crate) fn sockaddr_in(ip: u32, port: u16) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: port.to_be(),
        sin_addr: libc::in_addr { s_addr: ip },
        sin_zero: [0; 8],
        #[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "ios"))]
        sin_len: std::mem::size_of::<libc::sockaddr_in>() as u8,
    }
}

pub(crate) fn close(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}
