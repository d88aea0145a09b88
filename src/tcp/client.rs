//! A single outbound TCP connection driven by the scheduler: connect with a
//! deadline, then a read loop that hands each inbound chunk to a callback
//! until the connection is torn down.
//!
//! `U` is the caller's connection-scoped state, held by the client for the
//! lifetime of one connection attempt.

use crate::error::ErrorCode;
use crate::net::tcp as tcp_net;
use crate::scheduler::{Scheduler, TaskHandle};
use crate::tcp::connect::connect_timeout;

use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Why a [`TcpClient`]'s connection was torn down, passed to [`OnClosed`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ClosedReason {
    /// The caller itself invoked [`TcpClient::disconnect`].
    Local,
    /// The peer closed its side (zero-byte read) or a hard I/O error was
    /// observed on the connection.
    Remote,
}

/// Invoked once, after a [`TcpClient::connect`] attempt settles.
///
/// `errcode` is `0` on success, [`crate::error::CONNECT_TIMEOUT_ERRCODE`] if
/// the deadline elapsed first, or a raw `errno` for any other connect
/// failure.
pub type OnConnected<U> = Box<dyn FnMut(&TcpClient<U>, &mut U, i32) + Send>;

/// Invoked each time a read completes with at least one byte. Orderly or
/// abrupt peer shutdown is reported through [`OnClosed`] instead, never as an
/// empty read here.
pub type OnResponse<U> = Box<dyn FnMut(&TcpClient<U>, &mut U, &[u8]) -> bool + Send>;

/// Invoked exactly once, when the connection is torn down, local or remote.
pub type OnClosed<U> = Box<dyn FnMut(&TcpClient<U>, &mut U, ClosedReason) + Send>;

struct IoState<U> {
    fd: RawFd,
    buffer_size: usize,
    io_task: Option<TaskHandle>,
    on_response: Option<OnResponse<U>>,
    on_closed: Option<OnClosed<U>>,
}

struct Inner<U> {
    scheduler: Scheduler,
    io: Mutex<IoState<U>>,
    // Kept behind its own lock, separate from `io`, so a callback holding
    // `&mut U` can freely call back into `send`/`disconnect`/`connect`
    // without re-entering a lock it (or its caller) already holds.
    user: Mutex<U>,
}

/// A cheaply cloneable handle to one TCP client connection.
pub struct TcpClient<U> {
    inner: Arc<Inner<U>>,
}

impl<U> Clone for TcpClient<U> {
    fn clone(&self) -> Self {
        TcpClient { inner: self.inner.clone() }
    }
}

impl<U: Send + 'static> TcpClient<U> {
    /// Allocates a plain TCP client socket and wraps it with `user` as the
    /// connection-scoped state. Nothing is connected yet. `buffer_size` sets
    /// the size of the read buffer used once the connection is established.
    pub fn init(scheduler: &Scheduler, buffer_size: usize, user: U) -> std::io::Result<TcpClient<U>> {
        let fd = tcp_net::create_client_socket()?;
        Ok(TcpClient {
            inner: Arc::new(Inner {
                scheduler: scheduler.clone(),
                io: Mutex::new(IoState { fd, buffer_size, io_task: None, on_response: None, on_closed: None }),
                user: Mutex::new(user),
            }),
        })
    }

    /// Connects to `remote_ip:remote_port`, failing the attempt if it has
    /// not settled within `timeout`.
    ///
    /// Returns `false` if the attempt could not even be started — an
    /// immediate failure with any errno but `EINPROGRESS` — in which case
    /// `on_connected` is never invoked at all. Returns `true` once the
    /// attempt is either completed synchronously or handed off to the
    /// scheduler; in both of those cases `on_connected` fires exactly once,
    /// with `self` already usable for `send`/`disconnect` from inside it
    /// (the callback runs with no lock held). On a successful connect the
    /// read loop is armed before `on_connected` runs.
    pub fn connect(
        &self,
        remote_ip: Ipv4Addr,
        remote_port: u16,
        timeout: Duration,
        mut on_connected: OnConnected<U>,
        on_response: OnResponse<U>,
        on_closed: OnClosed<U>,
    ) -> bool {
        let fd = {
            let mut io = self.inner.io.lock().unwrap();
            io.on_response = Some(on_response);
            io.on_closed = Some(on_closed);
            io.fd
        };

        let client = self.clone();
        connect_timeout(
            &self.inner.scheduler,
            fd,
            remote_ip,
            remote_port,
            timeout,
            Box::new(move |scheduler, fd, errcode| {
                let mut errcode = errcode;
                {
                    let mut io = client.inner.io.lock().unwrap();
                    if errcode == 0 {
                        if !client.start_read_loop(scheduler, &mut io, fd) {
                            errcode = -1;
                        }
                    } else {
                        // A non-zero errcode here (timeout or a post-connect
                        // SO_ERROR) means `connect_completion` already closed
                        // this fd itself; forget it so a later `disconnect()`
                        // does not close it a second time.
                        io.fd = -1;
                    }
                }
                let mut user = client.inner.user.lock().unwrap();
                on_connected(&client, &mut user, errcode);
            }),
        )
    }

    fn start_read_loop(&self, scheduler: &Scheduler, io: &mut IoState<U>, fd: RawFd) -> bool {
        let client = self.clone();
        let task = scheduler.create_reader_task(
            fd,
            None,
            Box::new(()),
            Box::new(move |scheduler, id, err| client.handle_readable(scheduler, id, err)),
        );
        match task {
            Some(id) => {
                scheduler.schedule_task(id);
                io.io_task = Some(id);
                true
            }
            None => {
                log::error!(target: "tcp-client", "connect(): scheduler task pool exhausted, dropping new connection");
                false
            }
        }
    }

    fn handle_readable(&self, scheduler: &Scheduler, _id: TaskHandle, err: ErrorCode) -> bool {
        if err != ErrorCode::None {
            log::trace!(target: "tcp-client", "server connection errored: {:?}", err);
            self.close_remote(scheduler);
            return true;
        }

        let (fd, buffer_size) = {
            let io = self.inner.io.lock().unwrap();
            (io.fd, io.buffer_size)
        };
        let mut buf = vec![0u8; buffer_size];
        match tcp_net::receive(fd, &mut buf) {
            Ok(0) => {
                log::info!(target: "tcp-client", "server disconnected");
                self.close_remote(scheduler);
                true
            }
            Ok(n) => {
                let cb = self.inner.io.lock().unwrap().on_response.take();
                let done = match cb {
                    Some(mut cb) => {
                        let done = {
                            let mut user = self.inner.user.lock().unwrap();
                            cb(self, &mut user, &buf[..n])
                        };
                        self.inner.io.lock().unwrap().on_response = Some(cb);
                        done
                    }
                    None => false,
                };
                if done {
                    // The response indicated the conversation is finished:
                    // this is a locally-initiated close.
                    self.disconnect();
                    true
                } else {
                    false
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::Interrupted => false,
            Err(e) => {
                log::error!(target: "tcp-client", "failed to read from server: {}", e);
                self.close_remote(scheduler);
                true
            }
        }
    }

    /// Tears down the connection as a remote-initiated close: closes the fd
    /// and invokes [`OnClosed`] with [`ClosedReason::Remote`]. Does not
    /// unschedule the read task itself — the pump is already in the process
    /// of completing it (this runs from inside that very callback).
    fn close_remote(&self, _scheduler: &Scheduler) {
        let (fd, cb) = {
            let mut io = self.inner.io.lock().unwrap();
            io.io_task = None;
            if io.fd < 0 {
                return;
            }
            let fd = io.fd;
            io.fd = -1;
            (fd, io.on_closed.take())
        };
        crate::net::close(fd);
        if let Some(mut cb) = cb {
            let mut user = self.inner.user.lock().unwrap();
            cb(self, &mut user, ClosedReason::Remote);
        }
    }

    /// Sends `data` to the peer, blocking the calling thread until the full
    /// buffer is accepted by the kernel.
    pub fn send(&self, data: &[u8]) -> std::io::Result<usize> {
        let fd = self.inner.io.lock().unwrap().fd;
        tcp_net::send(fd, data)
    }

    /// Locally-initiated disconnect: unschedules the read task (if any),
    /// closes the socket, and invokes [`OnClosed`] with
    /// [`ClosedReason::Local`] — exactly once, even across repeated calls.
    pub fn disconnect(&self) {
        let (fd, cb) = {
            let mut io = self.inner.io.lock().unwrap();
            if let Some(id) = io.io_task.take() {
                self.inner.scheduler.unschedule_task(id);
            }
            if io.fd < 0 {
                return;
            }
            let fd = io.fd;
            io.fd = -1;
            (fd, io.on_closed.take())
        };
        log::debug!(target: "tcp-client", "closing socket connected to server");
        crate::net::close(fd);
        if let Some(mut cb) = cb {
            let mut user = self.inner.user.lock().unwrap();
            cb(self, &mut user, ClosedReason::Local);
        }
    }

    /// Runs `f` with mutable access to the connection-scoped user state.
    pub fn with_user<R>(&self, f: impl FnOnce(&mut U) -> R) -> R {
        let mut user = self.inner.user.lock().unwrap();
        f(&mut user)
    }
}
