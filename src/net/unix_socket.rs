//! UNIX-domain socket helpers: stream and datagram bind/connect, with
//! stale-socket-file cleanup before binding.

use super::{cvt, cvt_fd, close};
use std::ffi::CString;
use std::io;
use std::os::unix::io::RawFd;

fn sockaddr_un(path: &str) -> io::Result<(libc::sockaddr_un, libc::socklen_t)> {
    let c_path = CString::new(path).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"))?;
    let bytes = c_path.as_bytes_with_nul();
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    if bytes.len() > addr.sun_path.len() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "path too long for sockaddr_un"));
    }
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes.iter()) {
        *dst = *src as libc::c_char;
    }
    let len = (std::mem::size_of::<libc::sa_family_t>() + bytes.len()) as libc::socklen_t;
    Ok((addr, len))
}

/// If `path` exists and is a socket, unlinks it first (matching the
/// original's `stat`+`S_ISSOCK` guard so a stale socket file from a
/// previous run doesn't make `bind` fail with `EADDRINUSE`).
fn unlink_stale_socket(path: &str) {
    let c_path = match CString::new(path) {
        Ok(p) => p,
        Err(_) => return,
    };
    unsafe {
        let mut st: libc::stat = std::mem::zeroed();
        if libc::stat(c_path.as_ptr(), &mut st) == 0 && (st.st_mode & libc::S_IFMT) == libc::S_IFSOCK {
            libc::unlink(c_path.as_ptr());
        }
    }
}

fn create_bound(path: &str, sock_type: libc::c_int) -> io::Result<RawFd> {
    unlink_stale_socket(path);
    let fd = unsafe { cvt_fd(libc::socket(libc::PF_UNIX, sock_type, 0))? };
    let (addr, len) = match sockaddr_un(path) {
        Ok(v) => v,
        Err(e) => {
            close(fd);
            return Err(e);
        }
    };
    let rv = unsafe { cvt(libc::bind(fd, &addr as *const _ as *const libc::sockaddr, len)) };
    if rv.is_err() {
        close(fd);
        return Err(rv.unwrap_err());
    }
    Ok(fd)
}

fn create_client(path: &str, sock_type: libc::c_int) -> io::Result<RawFd> {
    let fd = unsafe { cvt_fd(libc::socket(libc::PF_UNIX, sock_type, 0))? };
    let (addr, len) = match sockaddr_un(path) {
        Ok(v) => v,
        Err(e) => {
            close(fd);
            return Err(e);
        }
    };
    let rv = unsafe { cvt(libc::connect(fd, &addr as *const _ as *const libc::sockaddr, len)) };
    if rv.is_err() {
        close(fd);
        return Err(rv.unwrap_err());
    }
    Ok(fd)
}

pub fn create_bound_dgram_socket(path: &str) -> io::Result<RawFd> {
    create_bound(path, libc::SOCK_DGRAM)
}

pub fn create_bound_stream_socket(path: &str) -> io::Result<RawFd> {
    create_bound(path, libc::SOCK_STREAM)
}

pub fn create_client_dgram_socket(path: &str) -> io::Result<RawFd> {
    create_client(path, libc::SOCK_DGRAM)
}

pub fn create_client_stream_socket(path: &str) -> io::Result<RawFd> {
    create_client(path, libc::SOCK_STREAM)
}
