//! Per-protocol, port-keyed listening-socket cache with refcounting and
//! close-event subscribers.
//!
//! TCP and UDP each get their own `Vec` behind their own `Mutex`, so closing
//! a UDP socket never contends with looking up a TCP one. A `u32` handle
//! table buys nothing here — callers look sockets up by port, not by a
//! handle they were handed back.

use crate::net::{tcp, udp};
use std::io;
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;
use std::sync::Mutex;

type CloseHandler = Box<dyn Fn(RawFd) + Send + Sync>;

struct SockInfo {
    port: u16,
    fd: RawFd,
    connections: usize,
}

enum Proto {
    Tcp,
    Udp,
}

struct ProtoList {
    proto: Proto,
    sockets: Vec<SockInfo>,
}

impl ProtoList {
    const fn new(proto: Proto) -> Self {
        ProtoList { proto, sockets: Vec::new() }
    }

    fn create(&self, local_ip: Ipv4Addr, port: u16) -> io::Result<RawFd> {
        match self.proto {
            Proto::Tcp => tcp::create_bound_socket(local_ip, port),
            Proto::Udp => udp::create_bound_socket(local_ip, port),
        }
    }
}

/// Registry of listening sockets shared by every TCP/UDP service in the
/// process. One instance is enough for a whole process; construct it once
/// and hand out clones of an `Arc` (or keep it behind a `OnceLock`).
pub struct SocketRegistry {
    tcp: Mutex<ProtoList>,
    udp: Mutex<ProtoList>,
    on_closed: Mutex<Vec<CloseHandler>>,
}

impl Default for SocketRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SocketRegistry {
    pub fn new() -> Self {
        SocketRegistry {
            tcp: Mutex::new(ProtoList::new(Proto::Tcp)),
            udp: Mutex::new(ProtoList::new(Proto::Udp)),
            on_closed: Mutex::new(Vec::new()),
        }
    }

    /// Registers a callback invoked (on whatever thread calls
    /// [`close_tcp`](Self::close_tcp)/[`close_udp`](Self::close_udp) or
    /// [`shutdown`](Self::shutdown)) when a listening socket's refcount
    /// drops to zero and it is actually closed.
    pub fn add_socket_closed_handler<F>(&self, handler: F)
    where
        F: Fn(RawFd) + Send + Sync + 'static,
    {
        self.on_closed.lock().unwrap().push(Box::new(handler));
    }

    /// Returns the TCP socket listening on `port`, creating and binding one
    /// (`INADDR_ANY`, backlog 5) if none exists yet. Each call increments
    /// the port's reference count; balance with [`close_tcp`](Self::close_tcp).
    pub fn get_or_create_tcp(&self, port: u16) -> io::Result<RawFd> {
        Self::get_or_create(&self.tcp, Ipv4Addr::UNSPECIFIED, port)
    }

    /// Returns the UDP socket bound to `port`, creating one if none exists
    /// yet. Each call increments the port's reference count; balance with
    /// [`close_udp`](Self::close_udp).
    pub fn get_or_create_udp(&self, port: u16) -> io::Result<RawFd> {
        Self::get_or_create(&self.udp, Ipv4Addr::UNSPECIFIED, port)
    }

    fn get_or_create(list: &Mutex<ProtoList>, local_ip: Ipv4Addr, port: u16) -> io::Result<RawFd> {
        let mut guard = list.lock().unwrap();
        if let Some(info) = guard.sockets.iter_mut().find(|s| s.port == port) {
            info.connections += 1;
            return Ok(info.fd);
        }
        let fd = guard.create(local_ip, port)?;
        guard.sockets.push(SockInfo { port, fd, connections: 1 });
        Ok(fd)
    }

    /// Decrements `sockfd`'s reference count; once it reaches zero the
    /// socket is actually closed and close-event subscribers are notified.
    pub fn close_tcp(&self, sockfd: RawFd) {
        self.close(&self.tcp, sockfd);
    }

    /// UDP counterpart of [`close_tcp`](Self::close_tcp).
    pub fn close_udp(&self, sockfd: RawFd) {
        self.close(&self.udp, sockfd);
    }

    fn close(&self, list: &Mutex<ProtoList>, sockfd: RawFd) {
        let closed = {
            let mut guard = list.lock().unwrap();
            match guard.sockets.iter().position(|s| s.fd == sockfd) {
                None => return,
                Some(idx) => {
                    guard.sockets[idx].connections -= 1;
                    if guard.sockets[idx].connections > 0 {
                        return;
                    }
                    guard.sockets.remove(idx);
                    true
                }
            }
        };
        if closed {
            unsafe {
                libc::close(sockfd);
            }
            self.notify_closed(sockfd);
        }
    }

    fn notify_closed(&self, sockfd: RawFd) {
        for handler in self.on_closed.lock().unwrap().iter() {
            handler(sockfd);
        }
    }

    /// Closes every listening socket unconditionally, ignoring reference
    /// counts. Only meant to be called during process shutdown.
    pub fn shutdown(&self) {
        log::debug!(target: "socket-registry", "shutting down TCP sockets");
        for info in self.tcp.lock().unwrap().sockets.drain(..) {
            log::trace!(target: "socket-registry", "closing port: {}", info.port);
            unsafe {
                libc::close(info.fd);
            }
        }
        log::debug!(target: "socket-registry", "shutting down UDP sockets");
        for info in self.udp.lock().unwrap().sockets.drain(..) {
            log::trace!(target: "socket-registry", "closing port: {}", info.port);
            unsafe {
                libc::close(info.fd);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn refcounts_share_one_listener_per_port() {
        let reg = SocketRegistry::new();
        let fd1 = reg.get_or_create_tcp(0).unwrap();
        // port 0 means "any free port" to the OS, so a second call for the
        // *same* literal port argument of 0 would bind a second ephemeral
        // port rather than reuse fd1 — use the bound port instead.
        let bound_port = local_port(fd1);
        let fd2 = reg.get_or_create_tcp(bound_port).unwrap();
        assert_eq!(fd1, fd2);
        reg.close_tcp(fd1);
        reg.close_tcp(fd2);
    }

    #[test]
    fn close_notifies_subscribers_once_refcount_hits_zero() {
        let reg = SocketRegistry::new();
        let closed = Arc::new(AtomicUsize::new(0));
        let closed2 = closed.clone();
        reg.add_socket_closed_handler(move |_fd| {
            closed2.fetch_add(1, Ordering::SeqCst);
        });
        let fd = reg.get_or_create_tcp(0).unwrap();
        let port = local_port(fd);
        let _fd2 = reg.get_or_create_tcp(port).unwrap();
        reg.close_tcp(fd);
        assert_eq!(closed.load(Ordering::SeqCst), 0, "refcount still 1, must not close yet");
        reg.close_tcp(fd);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    fn local_port(fd: RawFd) -> u16 {
        unsafe {
            let mut addr: libc::sockaddr_in = std::mem::zeroed();
            let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
            assert_eq!(libc::getsockname(fd, &mut addr as *mut _ as *mut libc::sockaddr, &mut len), 0);
            u16::from_be(addr.sin_port)
        }
    }
}
