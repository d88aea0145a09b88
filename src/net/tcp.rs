//! TCP socket helpers: bind/listen, non-blocking accept, non-blocking
//! connect, send/receive.

use super::{cvt, cvt_fd, close, set_keepalive, set_nonblocking, set_reuseaddr, sockaddr_in};
use std::io;
use std::mem::MaybeUninit;
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;

/// `listen(2)` backlog used by every bound socket this crate creates.
const LISTEN_BACKLOG: libc::c_int = 5;

/// Accepts a connection in non-blocking mode (temporarily flipping
/// `O_NONBLOCK` on `sockfd` and restoring it afterward) and disables
/// `SO_KEEPALIVE` on the accepted socket. Returns `Ok(None)` rather than an
/// error when there is nothing to accept yet.
pub fn accept_full(sockfd: RawFd) -> io::Result<Option<(RawFd, Ipv4Addr, u16)>> {
    let flags = unsafe { cvt(libc::fcntl(sockfd, libc::F_GETFL))? };
    unsafe {
        cvt(libc::fcntl(sockfd, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
    }

    let mut addr = MaybeUninit::<libc::sockaddr_in>::zeroed();
    let mut addr_len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let rv = unsafe {
        libc::accept(
            sockfd,
            addr.as_mut_ptr() as *mut libc::sockaddr,
            &mut addr_len,
        )
    };

    unsafe {
        libc::fcntl(sockfd, libc::F_SETFL, flags);
    }

    if rv == -1 {
        let err = io::Error::last_os_error();
        return match err.kind() {
            io::ErrorKind::WouldBlock => Ok(None),
            _ => Err(err),
        };
    }

    let _ = set_keepalive(rv, false);
    let addr = unsafe { addr.assume_init() };
    let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
    let port = u16::from_be(addr.sin_port);
    Ok(Some((rv, ip, port)))
}

/// Creates a TCP socket bound to `(local_ip, local_port)` and listening
/// with a backlog of 5. `SO_REUSEADDR=1`, `SO_KEEPALIVE=0`.
pub fn create_bound_socket(local_ip: Ipv4Addr, local_port: u16) -> io::Result<RawFd> {
    let fd = unsafe { cvt_fd(libc::socket(libc::PF_INET, libc::SOCK_STREAM, libc::IPPROTO_TCP))? };
    if let Err(e) = (|| -> io::Result<()> {
        set_keepalive(fd, false)?;
        set_reuseaddr(fd, true)?;
        let addr = sockaddr_in(u32::from(local_ip).to_be(), local_port);
        unsafe {
            cvt(libc::bind(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            ))?;
            cvt(libc::listen(fd, LISTEN_BACKLOG))?;
        }
        Ok(())
    })() {
        close(fd);
        return Err(e);
    }
    Ok(fd)
}

/// Creates a plain (unbound) TCP client socket with `SO_KEEPALIVE=0`.
pub fn create_client_socket() -> io::Result<RawFd> {
    let fd = unsafe { cvt_fd(libc::socket(libc::PF_INET, libc::SOCK_STREAM, libc::IPPROTO_TCP))? };
    let _ = set_keepalive(fd, false);
    Ok(fd)
}

/// Issues a non-blocking `connect(2)`. The caller is expected to have
/// already set `sockfd` non-blocking; returns the raw `connect` outcome so
/// the service layer can decide between "connected immediately", "failed
/// immediately", and "in progress" (`EINPROGRESS`).
pub fn connect(sockfd: RawFd, remote_ip: Ipv4Addr, remote_port: u16) -> io::Result<bool> {
    let addr = sockaddr_in(u32::from(remote_ip).to_be(), remote_port);
    let rv = unsafe {
        libc::connect(
            sockfd,
            &addr as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rv == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EINPROGRESS) {
        Ok(false)
    } else {
        Err(err)
    }
}

/// Reads the `SO_ERROR` socket option — the standard way to learn whether a
/// non-blocking connect succeeded or failed once its fd becomes writable.
pub fn take_socket_error(sockfd: RawFd) -> io::Result<i32> {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    unsafe {
        cvt(libc::getsockopt(
            sockfd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        ))?;
    }
    Ok(err)
}

/// Reads up to `buffer.len()` bytes.
pub fn receive(sockfd: RawFd, buffer: &mut [u8]) -> io::Result<usize> {
    let rv = unsafe { libc::read(sockfd, buffer.as_mut_ptr() as *mut libc::c_void, buffer.len()) };
    if rv < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rv as usize)
    }
}

/// Sends the full buffer, looping past `EINTR`, with `MSG_NOSIGNAL` so a
/// reset connection raises an error instead of `SIGPIPE`. Returns the
/// number of bytes sent, which is `0` only when the peer closed before any
/// byte was accepted.
pub fn send(sockfd: RawFd, data: &[u8]) -> io::Result<usize> {
    let mut sent_total = 0usize;
    while sent_total < data.len() {
        let rv = unsafe {
            libc::send(
                sockfd,
                data[sent_total..].as_ptr() as *const libc::c_void,
                data.len() - sent_total,
                libc::MSG_NOSIGNAL,
            )
        };
        if rv < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        } else if rv == 0 {
            return Ok(sent_total);
        }
        sent_total += rv as usize;
    }
    Ok(sent_total)
}

pub use super::set_nonblocking as set_socket_nonblocking;
