//! Accepting TCP service: one bound, listening socket shared through the
//! [`SocketRegistry`](crate::registry::SocketRegistry), fanning out accepted
//! connections into per-client read loops tracked in a [`Slab`].
//!
//! Per-accepted-client state lives in the caller's own `U` (threaded through
//! every callback), not duplicated on [`ClientState`] — the client record
//! here only carries what the read loop itself needs: fd, peer address, and
//! its scheduler task.

use crate::error::ErrorCode;
use crate::net::tcp as tcp_net;
use crate::registry::SocketRegistry;
use crate::scheduler::{Scheduler, TaskHandle};
use crate::util::{Index, Slab};

use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

const MAX_CLIENTS: usize = 1024;

/// Opaque handle to one accepted client connection, stable for the
/// connection's lifetime. `Copy` rather than a borrowing reference, the same
/// tradeoff `mio`'s own `Token` makes, since it has to be named from inside
/// a boxed `'static` callback.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct RemoteClientHandle(u32);

impl Index for RemoteClientHandle {
    fn from_usize(i: usize) -> Self {
        RemoteClientHandle(i as u32)
    }
    fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

/// Admission control consulted before every accept. Returning `false`
/// rejects this round (no accept is performed; the listening task stays
/// scheduled and is tried again on the next readiness).
pub type OnClientWaiting<U> = Box<dyn FnMut(&TcpListener<U>) -> bool + Send>;

/// Invoked once per accepted connection, before its read loop is armed.
/// Returning `false` means the callback fully handled (or rejected) the
/// connection synchronously; the client record is torn down immediately
/// without ever being scheduled for reads.
pub type OnClientConnected<U> = Box<dyn FnMut(&TcpListener<U>, RemoteClientHandle, Ipv4Addr, u16) -> bool + Send>;

/// Invoked for each inbound chunk from an accepted client. A `true` return
/// means the transaction is complete and the client should be disconnected;
/// `false` means stay connected.
pub type OnClientRequest<U> = Box<dyn FnMut(&TcpListener<U>, RemoteClientHandle, &[u8]) -> bool + Send>;

/// Invoked once a client is about to be dropped, whether from an orderly
/// remote close, a hard read error, or `on_client_request` signaling the
/// transaction is done.
pub type OnClientDisconnected<U> = Box<dyn FnMut(&TcpListener<U>, RemoteClientHandle) + Send>;

/// Invoked once, when the listening port is actually released (refcount
/// dropped to zero in the [`SocketRegistry`]).
pub type OnClosed = Box<dyn Fn(u16) + Send + Sync>;

struct ClientState {
    fd: RawFd,
    remote_ip: Ipv4Addr,
    remote_port: u16,
    io_task: Option<TaskHandle>,
}

struct Inner<U> {
    scheduler: Scheduler,
    registry: Arc<SocketRegistry>,
    port: u16,
    listen_fd: RawFd,
    buffer_size: usize,
    accept_task: Mutex<Option<TaskHandle>>,
    clients: Mutex<Slab<ClientState, RemoteClientHandle>>,
    on_waiting: Mutex<Option<OnClientWaiting<U>>>,
    on_connected: Mutex<OnClientConnected<U>>,
    on_request: Mutex<OnClientRequest<U>>,
    on_disconnected: Mutex<Option<OnClientDisconnected<U>>>,
    on_closed: Mutex<Option<OnClosed>>,
}

/// A cheaply cloneable handle to a listening TCP service and its accepted
/// clients.
pub struct TcpListener<U> {
    inner: Arc<Inner<U>>,
}

impl<U> Clone for TcpListener<U> {
    fn clone(&self) -> Self {
        TcpListener { inner: self.inner.clone() }
    }
}

impl<U: Send + 'static> TcpListener<U> {
    /// Binds (or shares, via `registry`) a listening socket on `port` and
    /// arms the accept loop. `buffer_size` sets the size of the per-client
    /// read buffer. `on_connected` is required (a listener with no way to
    /// handle an accepted client is a misconfiguration); `on_waiting` and
    /// `on_disconnected` may be registered afterward with
    /// [`set_on_waiting`](Self::set_on_waiting) /
    /// [`set_on_disconnected`](Self::set_on_disconnected).
    pub fn init(
        scheduler: &Scheduler,
        registry: Arc<SocketRegistry>,
        port: u16,
        buffer_size: usize,
        on_connected: OnClientConnected<U>,
        on_request: OnClientRequest<U>,
    ) -> std::io::Result<TcpListener<U>> {
        let listen_fd = registry.get_or_create_tcp(port)?;

        let listener = TcpListener {
            inner: Arc::new(Inner {
                scheduler: scheduler.clone(),
                registry,
                port,
                listen_fd,
                buffer_size,
                accept_task: Mutex::new(None),
                clients: Mutex::new(Slab::new(MAX_CLIENTS)),
                on_waiting: Mutex::new(None),
                on_connected: Mutex::new(on_connected),
                on_request: Mutex::new(on_request),
                on_disconnected: Mutex::new(None),
                on_closed: Mutex::new(None),
            }),
        };

        let accepting = listener.clone();
        let task = scheduler.create_reader_task(
            listen_fd,
            None,
            Box::new(()),
            Box::new(move |scheduler, id, err| accepting.handle_acceptable(scheduler, id, err)),
        );
        match task {
            Some(id) => {
                scheduler.schedule_task(id);
                *listener.inner.accept_task.lock().unwrap() = Some(id);
                log::info!(target: "tcp-listener", "listener started for TCP port {}", port);
                Ok(listener)
            }
            None => {
                listener.inner.registry.close_tcp(listen_fd);
                Err(std::io::Error::new(std::io::ErrorKind::Other, "scheduler task pool exhausted"))
            }
        }
    }

    /// Registers the admission-control callback consulted before every
    /// accept (see [`OnClientWaiting`]).
    pub fn set_on_waiting(&self, handler: OnClientWaiting<U>) {
        *self.inner.on_waiting.lock().unwrap() = Some(handler);
    }

    /// Registers the callback invoked when a client is about to be dropped
    /// (see [`OnClientDisconnected`]).
    pub fn set_on_disconnected(&self, handler: OnClientDisconnected<U>) {
        *self.inner.on_disconnected.lock().unwrap() = Some(handler);
    }

    /// Registers a callback invoked once the listening port is actually
    /// released (see [`OnClosed`]); only meaningful to call once.
    pub fn set_on_closed(&self, handler: OnClosed) {
        *self.inner.on_closed.lock().unwrap() = Some(handler);
    }

    /// The local port this listener accepts on.
    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// Drains and drops every accepted client, then unschedules the accept
    /// task. After this returns the client list is empty, which is what
    /// dropping the listener afterward relies on.
    pub fn stop(&self) {
        if let Some(id) = self.inner.accept_task.lock().unwrap().take() {
            self.inner.scheduler.unschedule_task(id);
        }
        let mut clients = self.inner.clients.lock().unwrap();
        let handles: Vec<RemoteClientHandle> = clients.iter().map(|(h, _)| h).collect();
        for h in handles {
            if let Some(state) = clients.remove(h) {
                if let Some(task) = state.io_task {
                    self.inner.scheduler.unschedule_task(task);
                }
                crate::net::close(state.fd);
            }
        }
    }

    /// One pump of the accept loop: consults `on_waiting`, accepts at most
    /// one connection, and returns `false` (not-complete) so the task stays
    /// scheduled — one `accept()` per readiness rather than draining the
    /// backlog.
    fn handle_acceptable(&self, _scheduler: &Scheduler, _id: TaskHandle, err: ErrorCode) -> bool {
        if err != ErrorCode::None {
            log::warn!(target: "tcp-listener", "listening socket errored: {:?}", err);
            return false;
        }

        if let Some(on_waiting) = self.inner.on_waiting.lock().unwrap().as_mut() {
            if !on_waiting(self) {
                return false;
            }
        }

        match tcp_net::accept_full(self.inner.listen_fd) {
            Ok(Some((fd, ip, port))) => self.admit_client(fd, ip, port),
            Ok(None) => {}
            Err(e) => log::warn!(target: "tcp-listener", "accept() failed: {}", e),
        }
        false
    }

    fn admit_client(&self, fd: RawFd, ip: Ipv4Addr, port: u16) {
        let handle = {
            let mut clients = self.inner.clients.lock().unwrap();
            let placeholder = ClientState { fd, remote_ip: ip, remote_port: port, io_task: None };
            match clients.insert(placeholder) {
                Ok(h) => h,
                Err(_) => {
                    log::warn!(target: "tcp-listener", "client pool exhausted, refusing connection from {}:{}", ip, port);
                    crate::net::close(fd);
                    return;
                }
            }
        };

        // Create (but do not yet schedule) the client's reader task —
        // `on_connected` below may decide to handle the connection
        // synchronously and never need it.
        let listener = self.clone();
        let task_id = self.inner.scheduler.create_task(
            fd,
            crate::scheduler::Opts::READ,
            None,
            Box::new(()),
            Some(Box::new(move |scheduler, id, err| listener.handle_client_readable(scheduler, id, handle, err))),
            None,
            None,
            None,
        );

        let admitted = (self.inner.on_connected.lock().unwrap())(self, handle, ip, port);

        if !admitted {
            log::debug!(target: "tcp-listener", "on_client_connected did not arm a read loop; closing remote socket");
            self.inner.clients.lock().unwrap().remove(handle);
            crate::net::close(fd);
            return;
        }

        let task_id = match task_id {
            Some(id) => id,
            None => {
                log::error!(target: "tcp-listener", "scheduler task pool exhausted, dropping accepted connection");
                self.inner.clients.lock().unwrap().remove(handle);
                crate::net::close(fd);
                return;
            }
        };

        self.inner.scheduler.schedule_task(task_id);
        if let Some(state) = self.inner.clients.lock().unwrap().get_mut(handle) {
            state.io_task = Some(task_id);
        }
        log::debug!(target: "tcp-listener", "remote client {}:{} started", ip, port);
    }

    fn handle_client_readable(
        &self,
        _scheduler: &Scheduler,
        _id: TaskHandle,
        handle: RemoteClientHandle,
        err: ErrorCode,
    ) -> bool {
        if err != ErrorCode::None {
            self.notify_disconnected(handle);
            self.drop_client(handle);
            return true;
        }

        let fd = match self.inner.clients.lock().unwrap().get(handle) {
            Some(c) => c.fd,
            None => return true,
        };

        let mut buf = vec![0u8; self.inner.buffer_size];
        match tcp_net::receive(fd, &mut buf) {
            Ok(0) => {
                log::info!(target: "tcp-listener", "client disconnected");
                self.notify_disconnected(handle);
                self.drop_client(handle);
                true
            }
            Ok(n) => {
                let done = (self.inner.on_request.lock().unwrap())(self, handle, &buf[..n]);
                if done {
                    self.notify_disconnected(handle);
                    self.drop_client(handle);
                    true
                } else {
                    false
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::Interrupted => false,
            Err(e) => {
                log::error!(target: "tcp-listener", "failed to read from client: {}", e);
                self.notify_disconnected(handle);
                self.drop_client(handle);
                true
            }
        }
    }

    fn notify_disconnected(&self, handle: RemoteClientHandle) {
        if let Some(cb) = self.inner.on_disconnected.lock().unwrap().as_mut() {
            cb(self, handle);
        }
    }

    /// Sends `data` to the given accepted client.
    pub fn send(&self, handle: RemoteClientHandle, data: &[u8]) -> std::io::Result<usize> {
        let fd = self
            .inner
            .clients
            .lock()
            .unwrap()
            .get(handle)
            .map(|c| c.fd)
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "unknown client handle"))?;
        tcp_net::send(fd, data)
    }

    /// The remote address and port of an accepted client.
    pub fn peer_addr(&self, handle: RemoteClientHandle) -> Option<(Ipv4Addr, u16)> {
        self.inner.clients.lock().unwrap().get(handle).map(|c| (c.remote_ip, c.remote_port))
    }

    /// Forcibly disconnects one accepted client without notifying
    /// `on_disconnected` — a bare unlink-and-close, leaving the "was this
    /// planned?" notification to the caller.
    pub fn disconnect(&self, handle: RemoteClientHandle) {
        self.drop_client(handle);
    }

    fn drop_client(&self, handle: RemoteClientHandle) {
        let removed = self.inner.clients.lock().unwrap().remove(handle);
        if let Some(state) = removed {
            if let Some(task) = state.io_task {
                self.inner.scheduler.unschedule_task(task);
            }
            crate::net::close(state.fd);
        }
    }
}

impl<U> Drop for Inner<U> {
    fn drop(&mut self) {
        let empty = self.clients.get_mut().unwrap().is_empty();
        debug_assert!(empty, "TcpListener dropped with clients still connected; call stop() first");

        if let Some(id) = self.accept_task.get_mut().unwrap().take() {
            self.scheduler.unschedule_task(id);
        }
        self.registry.close_tcp(self.listen_fd);
        if let Some(handler) = self.on_closed.get_mut().unwrap().take() {
            handler(self.port);
        }
    }
}
