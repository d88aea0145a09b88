//! The process-wide pending-connection list behind an asynchronous,
//! deadline-bound TCP connect.
//!
//! Connects in flight live in one process-wide slab reached through a
//! `Mutex`-guarded `OnceLock`, so multiple schedulers (or threads) can issue
//! connects concurrently without racing on a bare global list.
//!
//! A Rust closure already captures whatever state it needs, so there is
//! just the one [`ConnectCallback`] shape here, rather than a split between
//! a bare function pointer and one carrying an extra userdata slot.

use crate::error::{ErrorCode, CONNECT_TIMEOUT_ERRCODE};
use crate::net::tcp as tcp_net;
use crate::scheduler::Scheduler;
use crate::util::{Index, Slab};

use std::io;
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

/// Upper bound on connects in flight at once; backpressure beyond this point
/// is reported as an immediate connect failure, matching the admission
/// behavior the rest of this crate uses for its other fixed-capacity pools.
const MAX_PENDING_CONNECTS: usize = 4096;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
struct PendingHandle(u32);

impl Index for PendingHandle {
    fn from_usize(i: usize) -> Self {
        PendingHandle(i as u32)
    }
    fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

/// Invoked exactly once per connect attempt: with `errcode == 0` on success,
/// a raw `errno` on immediate or asynchronous failure, or
/// [`CONNECT_TIMEOUT_ERRCODE`] if the deadline passed first.
pub type ConnectCallback = Box<dyn FnMut(&Scheduler, RawFd, i32) + Send>;

struct PendingConnect {
    fd: RawFd,
    remote_ip: Ipv4Addr,
    remote_port: u16,
    on_connect: ConnectCallback,
}

fn pending() -> &'static Mutex<Slab<PendingConnect, PendingHandle>> {
    static PENDING: OnceLock<Mutex<Slab<PendingConnect, PendingHandle>>> = OnceLock::new();
    PENDING.get_or_init(|| Mutex::new(Slab::new(MAX_PENDING_CONNECTS)))
}

/// Issues a non-blocking `connect(2)` against `remote_ip:remote_port` on
/// `fd`, with a deadline of `timeout`.
///
/// - Connect completes immediately: `on_connect` is invoked with `errcode =
///   0` before this function returns, and `true` is returned.
/// - Connect fails immediately (any errno but `EINPROGRESS`): `on_connect`
///   is never called; `false` is returned.
/// - Connect is in progress: a [`PendingConnect`] is linked into the
///   process-wide list and a writer task is scheduled on `fd` with
///   `timeout`; `on_connect` fires later, from the scheduler's pump, exactly
///   once.
pub fn connect_timeout(
    scheduler: &Scheduler,
    fd: RawFd,
    remote_ip: Ipv4Addr,
    remote_port: u16,
    timeout: Duration,
    on_connect: ConnectCallback,
) -> bool {
    if fd < 0 {
        log::trace!(target: "tcp-client", "connect_timeout(): received bad file descriptor");
        return false;
    }

    if let Err(e) = tcp_net::set_socket_nonblocking(fd, true) {
        log::error!(target: "tcp-client", "connect_timeout(): unable to set non-blocking mode: {}", e);
    }

    let mut on_connect = on_connect;
    match tcp_net::connect(fd, remote_ip, remote_port) {
        Ok(true) => {
            log::trace!(target: "tcp-client", "connect_timeout(): connect() completed immediately");
            on_connect(scheduler, fd, 0);
            true
        }
        Ok(false) => {
            let handle = {
                let mut guard = pending().lock().unwrap();
                let pconn = PendingConnect { fd, remote_ip, remote_port, on_connect };
                match guard.insert(pconn) {
                    Ok(h) => h,
                    Err(_) => {
                        log::error!(target: "tcp-client", "connect_timeout(): pending-connection pool exhausted");
                        return false;
                    }
                }
            };

            log::trace!(target: "tcp-client", "connect_timeout(): adding a task to watch for connection completion");
            let task = scheduler.create_writer_task(
                fd,
                Some(timeout),
                Box::new(handle),
                Box::new(move |s: &Scheduler, id, err| connect_completion(s, id, err, handle)),
            );
            match task {
                Some(id) => scheduler.schedule_task(id),
                None => {
                    pending().lock().unwrap().remove(handle);
                    false
                }
            }
        }
        Err(e) => {
            log::trace!(target: "tcp-client", "connect_timeout(): connect() failed immediately: {}", e);
            false
        }
    }
}

fn connect_completion(
    scheduler: &Scheduler,
    _id: crate::scheduler::TaskHandle,
    err: ErrorCode,
    handle: PendingHandle,
) -> bool {
    let pconn = match pending().lock().unwrap().remove(handle) {
        Some(p) => p,
        None => {
            log::warn!(target: "tcp-client", "received I/O scheduler callback for untracked pending TCP connection");
            return true;
        }
    };
    let PendingConnect { fd, remote_ip, remote_port, mut on_connect } = pconn;

    if err == ErrorCode::OpTimeout {
        log::trace!(target: "tcp-client", "connect_timeout(): timed out connecting to {}:{}", remote_ip, remote_port);
        on_connect(scheduler, fd, CONNECT_TIMEOUT_ERRCODE);
        crate::net::close(fd);
        return true;
    }

    match tcp_net::take_socket_error(fd) {
        Ok(0) => {
            log::trace!(target: "tcp-client", "connect_timeout(): connection successful");
            let _ = tcp_net::set_socket_nonblocking(fd, false);
            on_connect(scheduler, fd, 0);
        }
        Ok(sockerr) => {
            log::trace!(target: "tcp-client", "connect_timeout(): connection errored - {}", io::Error::from_raw_os_error(sockerr));
            on_connect(scheduler, fd, sockerr);
            crate::net::close(fd);
        }
        Err(e) => {
            let errno = e.raw_os_error().unwrap_or(-1);
            on_connect(scheduler, fd, errno);
            crate::net::close(fd);
        }
    }
    true
}
