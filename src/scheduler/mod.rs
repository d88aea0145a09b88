//! The cooperative, single-threaded I/O scheduler.
//!
//! A `select(2)`-based pump that multiplexes fd readiness and timers over a
//! pre-allocated pool of task slots. The low-level `select(2)` wrapper lives
//! in `select.rs`; this module builds the safe `Task`/`Scheduler` API on
//! top of it.

mod select;

use crate::error::ErrorCode;
use crate::util::{Index, Slab};
use select::FdSet;

use std::any::Any;
use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bitflags::bitflags;

bitflags! {
    /// Which readiness conditions a task is interested in.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Opts: u8 {
        const READ   = 0b0000_0001;
        const WRITE  = 0b0000_0010;
        const ERROR  = 0b0000_0100;
        const TIMER  = 0b0000_1000;
        const REMOVE = 0b1000_0000;
    }
}

/// A task is identified by the fd it watches, or, for a pure timer, by a
/// pseudo-id drawn from a reserved negative range that can never collide
/// with a real descriptor.
const INVALID_FD: RawFd = -1;

/// Opaque handle to a [`Task`] inside a [`Scheduler`]'s slot pool. Stable
/// for the task's lifetime; never reused while the task is live.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TaskHandle(u32);

impl Index for TaskHandle {
    fn from_usize(i: usize) -> Self {
        TaskHandle(i as u32)
    }
    fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

/// A callback invoked on readiness, error, or timeout. Returning `true`
/// tells the scheduler the task is complete and should be unscheduled;
/// `false` keeps it scheduled (the sanctioned way for a timer to repeat).
pub type Callback = Box<dyn FnMut(&Scheduler, TaskHandle, ErrorCode) -> bool + Send>;

struct Task {
    fd: RawFd,
    opts: Opts,
    timeout: Option<Duration>,
    expire_at: Option<Instant>,
    user: Box<dyn Any + Send>,
    on_read: Option<Callback>,
    on_write: Option<Callback>,
    on_error: Option<Callback>,
    on_timeout: Option<Callback>,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("fd", &self.fd)
            .field("opts", &self.opts)
            .finish()
    }
}

/// Pool of reserved negative pseudo-ids for pure-timer tasks, distinct from
/// any real fd. Drawn from the contiguous range `[-max_timers-2, -2)`.
struct TimerIdPool {
    free: Vec<RawFd>,
}

impl TimerIdPool {
    fn new(max_timers: usize) -> TimerIdPool {
        let start = -(max_timers as RawFd) - 2;
        let free = (start..-2).rev().collect();
        TimerIdPool { free }
    }

    fn alloc(&mut self) -> Option<RawFd> {
        self.free.pop()
    }

    fn release(&mut self, id: RawFd) {
        debug_assert!(!self.free.contains(&id), "pseudo-id released twice");
        self.free.push(id);
    }
}

struct State {
    pool: Slab<Task, TaskHandle>,
    live_order: Vec<TaskHandle>,
    timer_ids: TimerIdPool,
}

struct Shared {
    state: Mutex<State>,
    stop: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// A cooperative, single-pump-at-a-time I/O scheduler.
///
/// Cheaply cloneable: clones share the same underlying task list, so a
/// callback can hold a `Scheduler` handle and call `schedule_task`/
/// `unschedule_task` back into the very scheduler dispatching it.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    /// Pre-allocates `max_tasks` task slots and `max_timers` pseudo-ids.
    /// Fails if either count is zero.
    pub fn create(max_tasks: usize, max_timers: usize) -> io::Result<Scheduler> {
        if max_tasks == 0 || max_timers == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "max_tasks and max_timers must both be non-zero",
            ));
        }
        Ok(Scheduler {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    pool: Slab::new(max_tasks),
                    live_order: Vec::with_capacity(max_tasks),
                    timer_ids: TimerIdPool::new(max_timers),
                }),
                stop: AtomicBool::new(false),
                worker: Mutex::new(None),
            }),
        })
    }

    /// General task constructor. Pops a slot from the task pool; fails
    /// (returning `None`) when the pool is exhausted — callers treat this
    /// as backpressure.
    #[allow(clippy::too_many_arguments)]
    pub fn create_task(
        &self,
        fd: RawFd,
        opts: Opts,
        timeout: Option<Duration>,
        user: Box<dyn Any + Send>,
        on_read: Option<Callback>,
        on_write: Option<Callback>,
        on_error: Option<Callback>,
        on_timeout: Option<Callback>,
    ) -> Option<TaskHandle> {
        let task = Task {
            fd,
            opts: opts.difference(Opts::REMOVE),
            timeout,
            expire_at: None,
            user,
            on_read,
            on_write,
            on_error,
            on_timeout,
        };
        let mut st = self.shared.state.lock().unwrap();
        st.pool.insert(task).ok()
    }

    /// Convenience: a reader task. `on_timeout` is not stored separately —
    /// on expiry, dispatch falls back to invoking `on_read` with
    /// [`ErrorCode::OpTimeout`] since no distinct timeout handler is set.
    pub fn create_reader_task(
        &self,
        fd: RawFd,
        timeout: Option<Duration>,
        user: Box<dyn Any + Send>,
        on_read: Callback,
    ) -> Option<TaskHandle> {
        let opts = Opts::READ | if timeout.is_some() { Opts::TIMER } else { Opts::empty() };
        self.create_task(fd, opts, timeout, user, Some(on_read), None, None, None)
    }

    /// Like [`Scheduler::create_reader_task`] but also watches for error
    /// readiness through a distinct callback.
    pub fn create_reader_task_ex(
        &self,
        fd: RawFd,
        timeout: Option<Duration>,
        user: Box<dyn Any + Send>,
        on_read: Callback,
        on_error: Callback,
    ) -> Option<TaskHandle> {
        let opts = Opts::READ | Opts::ERROR | if timeout.is_some() { Opts::TIMER } else { Opts::empty() };
        self.create_task(fd, opts, timeout, user, Some(on_read), None, Some(on_error), None)
    }

    /// Symmetric with [`Scheduler::create_reader_task`] for write-readiness.
    pub fn create_writer_task(
        &self,
        fd: RawFd,
        timeout: Option<Duration>,
        user: Box<dyn Any + Send>,
        on_write: Callback,
    ) -> Option<TaskHandle> {
        let opts = Opts::WRITE | if timeout.is_some() { Opts::TIMER } else { Opts::empty() };
        self.create_task(fd, opts, timeout, user, None, Some(on_write), None, None)
    }

    /// A pure-timer task: pops a pseudo-id from the timer pool and installs
    /// a task with no real fd.
    pub fn create_timer_task(
        &self,
        timeout: Duration,
        user: Box<dyn Any + Send>,
        on_timeout: Callback,
    ) -> Option<TaskHandle> {
        let mut st = self.shared.state.lock().unwrap();
        let id = st.timer_ids.alloc()?;
        let task = Task {
            fd: id,
            opts: Opts::TIMER,
            timeout: Some(timeout),
            expire_at: None,
            user,
            on_read: None,
            on_write: None,
            on_error: None,
            on_timeout: Some(on_timeout),
        };
        match st.pool.insert(task) {
            Ok(handle) => Some(handle),
            Err(_) => {
                st.timer_ids.release(id);
                None
            }
        }
    }

    /// Admits a created task into the live (scheduled) list. Any opt whose
    /// callback is absent is downgraded out of `opts`; if that reduces
    /// `opts` to nothing, the task is immediately marked for removal
    /// instead of being scheduled. Returns `false` if `id` no longer
    /// refers to a live task.
    pub fn schedule_task(&self, id: TaskHandle) -> bool {
        let mut st = self.shared.state.lock().unwrap();
        let now = Instant::now();
        {
            let task = match st.pool.get_mut(id) {
                Some(t) => t,
                None => return false,
            };
            if task.opts.contains(Opts::READ) && task.on_read.is_none() {
                task.opts.remove(Opts::READ);
            }
            if task.opts.contains(Opts::WRITE) && task.on_write.is_none() {
                task.opts.remove(Opts::WRITE);
            }
            if task.opts.contains(Opts::ERROR) && task.on_error.is_none() {
                task.opts.remove(Opts::ERROR);
            }
            if task.opts.contains(Opts::TIMER) && task.on_timeout.is_none() {
                task.opts.remove(Opts::TIMER);
            }
            if task.opts.is_empty() {
                task.opts.insert(Opts::REMOVE);
            } else if task.opts.contains(Opts::TIMER) {
                task.expire_at = task.timeout.map(|d| now + d);
            }
        }
        st.live_order.push(id);
        true
    }

    /// Recomputes `expire_at` from `now + timeout`. Fails if the task is
    /// already marked for removal.
    pub fn reschedule_task(&self, id: TaskHandle) -> bool {
        let mut st = self.shared.state.lock().unwrap();
        let now = Instant::now();
        match st.pool.get_mut(id) {
            Some(task) if !task.opts.contains(Opts::REMOVE) => {
                task.expire_at = task.timeout.map(|d| now + d);
                true
            }
            _ => false,
        }
    }

    /// Linear search over the live list for a task watching `fd`.
    pub fn find_task(&self, fd: RawFd) -> Option<TaskHandle> {
        let st = self.shared.state.lock().unwrap();
        st.live_order
            .iter()
            .copied()
            .find(|&id| st.pool.get(id).is_some_and(|t| t.fd == fd))
    }

    /// Edge-triggered cancellation: marks the task for removal. The task is
    /// not destroyed here; that happens at the top of the next pump
    /// iteration. Idempotent, and a no-op for the reserved invalid-fd
    /// sentinel (used by consumers that manage that task's lifecycle
    /// through another route).
    pub fn unschedule_task(&self, id: TaskHandle) {
        let mut st = self.shared.state.lock().unwrap();
        if let Some(task) = st.pool.get_mut(id) {
            if task.fd != INVALID_FD {
                task.opts.insert(Opts::REMOVE);
            }
        }
    }

    /// Stores into the task's opaque user payload slot, for constructors
    /// that created the task before their real payload was ready.
    pub fn set_user_data(&self, id: TaskHandle, user: Box<dyn Any + Send>) {
        let mut st = self.shared.state.lock().unwrap();
        if let Some(task) = st.pool.get_mut(id) {
            task.user = user;
        }
    }

    fn is_empty(&self) -> bool {
        self.shared.state.lock().unwrap().live_order.is_empty()
    }

    /// Runs the pump loop on the calling thread until the stop flag is set
    /// or the live list is empty.
    pub fn run(&self) {
        loop {
            if self.shared.stop.load(Ordering::SeqCst) || self.is_empty() {
                break;
            }
            self.pump_once(false);
        }
    }

    /// Spawns a worker thread that pumps until `stop` is requested. The
    /// worker sleeps ~1 ms between iterations when the live list is empty,
    /// rather than exiting, to avoid busy-waiting.
    pub fn start_thread(&self) -> io::Result<()> {
        let me = self.clone();
        let handle = thread::Builder::new()
            .name("svckit-scheduler".into())
            .spawn(move || {
                while !me.shared.stop.load(Ordering::SeqCst) {
                    me.pump_once(true);
                }
            })?;
        *self.shared.worker.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Marks every live task for removal, sets the stop flag, and joins the
    /// worker thread if one was started. Idempotent.
    pub fn stop(&self) {
        {
            let mut st = self.shared.state.lock().unwrap();
            for &id in st.live_order.clone().iter() {
                if let Some(task) = st.pool.get_mut(id) {
                    task.opts.insert(Opts::REMOVE);
                }
            }
        }
        self.shared.stop.store(true, Ordering::SeqCst);
        let handle = self.shared.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    fn pump_once(&self, on_worker: bool) {
        if self.is_empty() {
            if on_worker {
                select::idle_sleep(Duration::from_millis(1));
            }
            return;
        }

        let (snapshot, maxfd, mut rd, mut wr, mut er) = {
            let mut st = self.shared.state.lock().unwrap();
            let State { pool, live_order, timer_ids } = &mut *st;

            // Coalesce: drop every Remove-flagged task (except the invalid-fd
            // sentinel, which manages its own lifecycle) and return its slot
            // and, for timers, its pseudo-id.
            live_order.retain(|&id| {
                let drop_it = match pool.get(id) {
                    Some(t) => t.opts.contains(Opts::REMOVE) && t.fd != INVALID_FD,
                    None => true,
                };
                if drop_it {
                    if let Some(task) = pool.remove(id) {
                        if task.fd < 0 {
                            timer_ids.release(task.fd);
                        }
                    }
                }
                !drop_it
            });

            let mut maxfd: RawFd = -1;
            let mut rd = FdSet::empty();
            let mut wr = FdSet::empty();
            let mut er = FdSet::empty();
            for &id in live_order.iter() {
                if let Some(task) = pool.get(id) {
                    if task.fd >= 0 {
                        if task.opts.contains(Opts::READ) {
                            rd.set(task.fd);
                            maxfd = maxfd.max(task.fd);
                        }
                        if task.opts.contains(Opts::WRITE) {
                            wr.set(task.fd);
                            maxfd = maxfd.max(task.fd);
                        }
                        if task.opts.contains(Opts::ERROR) {
                            er.set(task.fd);
                            maxfd = maxfd.max(task.fd);
                        }
                    }
                }
            }
            (live_order.clone(), maxfd, rd, wr, er)
        };

        if self.shared.stop.load(Ordering::SeqCst) {
            return;
        }

        if select::select(maxfd, &mut rd, &mut wr, &mut er, Duration::from_millis(10)).is_err() {
            log::warn!(target: "io-scheduler", "select() failed: {}", io::Error::last_os_error());
            return;
        }

        for id in snapshot {
            if self.shared.stop.load(Ordering::SeqCst) {
                break;
            }
            self.process_task(id, &rd, &wr, &er);
        }
    }

    fn task_fd(&self, id: TaskHandle) -> Option<RawFd> {
        self.shared.state.lock().unwrap().pool.get(id).map(|t| t.fd)
    }

    fn task_expired(&self, id: TaskHandle) -> bool {
        let st = self.shared.state.lock().unwrap();
        match st.pool.get(id) {
            Some(task) => match task.expire_at {
                Some(at) => Instant::now() >= at,
                None => false,
            },
            None => false,
        }
    }

    fn take_error_cbk(&self, id: TaskHandle) -> Option<Callback> {
        self.shared.state.lock().unwrap().pool.get_mut(id).and_then(|t| t.on_error.take())
    }
    fn put_error_cbk(&self, id: TaskHandle, cb: Callback) {
        if let Some(t) = self.shared.state.lock().unwrap().pool.get_mut(id) {
            t.on_error = Some(cb);
        }
    }

    /// Readiness fired: deliver through `on_read`, falling back to
    /// `on_timeout` only when no distinct read handler is installed (the
    /// aliasing `create_reader_task` relies on). Returns which field the
    /// callback came from so `put_read_cbk` can put it back.
    fn take_read_ready_cbk(&self, id: TaskHandle) -> (Option<Callback>, bool /* from_timeout */) {
        let mut st = self.shared.state.lock().unwrap();
        if let Some(t) = st.pool.get_mut(id) {
            if let Some(cb) = t.on_read.take() {
                return (Some(cb), false);
            }
            if let Some(cb) = t.on_timeout.take() {
                return (Some(cb), true);
            }
        }
        (None, false)
    }
    /// The deadline expired: deliver through `on_timeout`, falling back to
    /// `on_read` only when no distinct timeout handler is installed.
    fn take_read_timeout_cbk(&self, id: TaskHandle) -> (Option<Callback>, bool /* from_timeout */) {
        let mut st = self.shared.state.lock().unwrap();
        if let Some(t) = st.pool.get_mut(id) {
            if let Some(cb) = t.on_timeout.take() {
                return (Some(cb), true);
            }
            if let Some(cb) = t.on_read.take() {
                return (Some(cb), false);
            }
        }
        (None, false)
    }
    fn put_read_cbk(&self, id: TaskHandle, cb: Callback, from_timeout: bool) {
        if let Some(t) = self.shared.state.lock().unwrap().pool.get_mut(id) {
            if from_timeout {
                t.on_timeout = Some(cb);
            } else {
                t.on_read = Some(cb);
            }
        }
    }

    fn take_write_ready_cbk(&self, id: TaskHandle) -> (Option<Callback>, bool /* from_timeout */) {
        let mut st = self.shared.state.lock().unwrap();
        if let Some(t) = st.pool.get_mut(id) {
            if let Some(cb) = t.on_write.take() {
                return (Some(cb), false);
            }
            if let Some(cb) = t.on_timeout.take() {
                return (Some(cb), true);
            }
        }
        (None, false)
    }
    fn take_write_timeout_cbk(&self, id: TaskHandle) -> (Option<Callback>, bool /* from_timeout */) {
        let mut st = self.shared.state.lock().unwrap();
        if let Some(t) = st.pool.get_mut(id) {
            if let Some(cb) = t.on_timeout.take() {
                return (Some(cb), true);
            }
            if let Some(cb) = t.on_write.take() {
                return (Some(cb), false);
            }
        }
        (None, false)
    }
    fn put_write_cbk(&self, id: TaskHandle, cb: Callback, from_timeout: bool) {
        if let Some(t) = self.shared.state.lock().unwrap().pool.get_mut(id) {
            if from_timeout {
                t.on_timeout = Some(cb);
            } else {
                t.on_write = Some(cb);
            }
        }
    }

    fn take_timer_cbk(&self, id: TaskHandle) -> Option<Callback> {
        self.shared.state.lock().unwrap().pool.get_mut(id).and_then(|t| t.on_timeout.take())
    }
    fn put_timer_cbk(&self, id: TaskHandle, cb: Callback) {
        if let Some(t) = self.shared.state.lock().unwrap().pool.get_mut(id) {
            t.on_timeout = Some(cb);
        }
    }

    fn task_opts(&self, id: TaskHandle) -> Opts {
        self.shared
            .state
            .lock()
            .unwrap()
            .pool
            .get(id)
            .map(|t| t.opts)
            .unwrap_or(Opts::REMOVE)
    }

    fn set_expire_at(&self, id: TaskHandle, at: Instant) {
        if let Some(t) = self.shared.state.lock().unwrap().pool.get_mut(id) {
            t.expire_at = Some(at);
        }
    }

    /// Dispatches one task against this iteration's readiness sets,
    /// mirroring `io_sched_process_task`: error readiness is reported but
    /// never by itself completes the task; read/write readiness or
    /// expiry each contribute a completion bit; a pure timer completes
    /// only when its callback returns `true`.
    fn process_task(&self, id: TaskHandle, rd: &FdSet, wr: &FdSet, er: &FdSet) {
        let opts = self.task_opts(id);
        if opts.contains(Opts::REMOVE) {
            return;
        }
        let fd = match self.task_fd(id) {
            Some(fd) => fd,
            None => return,
        };
        let expired = self.task_expired(id);

        if fd >= 0 {
            let mut complete = true;

            if opts.contains(Opts::ERROR) && er.is_set(fd) {
                if let Some(mut cb) = self.take_error_cbk(id) {
                    cb(self, id, ErrorCode::None);
                    self.put_error_cbk(id, cb);
                }
            }

            if opts.contains(Opts::READ) {
                if rd.is_set(fd) {
                    let (cb, fallback) = self.take_read_ready_cbk(id);
                    if let Some(mut cb) = cb {
                        let done = cb(self, id, ErrorCode::None);
                        self.put_read_cbk(id, cb, fallback);
                        complete = complete && done;
                    }
                } else if expired {
                    let (cb, fallback) = self.take_read_timeout_cbk(id);
                    if let Some(mut cb) = cb {
                        let done = cb(self, id, ErrorCode::OpTimeout);
                        self.put_read_cbk(id, cb, fallback);
                        complete = complete && done;
                    }
                } else {
                    complete = false;
                }
            }

            if opts.contains(Opts::WRITE) {
                if wr.is_set(fd) {
                    let (cb, fallback) = self.take_write_ready_cbk(id);
                    if let Some(mut cb) = cb {
                        let done = cb(self, id, ErrorCode::None);
                        self.put_write_cbk(id, cb, fallback);
                        complete = complete && done;
                    }
                } else if expired {
                    let (cb, fallback) = self.take_write_timeout_cbk(id);
                    if let Some(mut cb) = cb {
                        let done = cb(self, id, ErrorCode::OpTimeout);
                        self.put_write_cbk(id, cb, fallback);
                        complete = complete && done;
                    }
                } else {
                    complete = false;
                }
            }

            if complete {
                self.unschedule_task(id);
            }
        } else {
            // Pure timer.
            if expired {
                if let Some(mut cb) = self.take_timer_cbk(id) {
                    let done = cb(self, id, ErrorCode::OpTimeout);
                    self.put_timer_cbk(id, cb);
                    if done {
                        self.unschedule_task(id);
                    } else {
                        // Wants to repeat: recompute the deadline from now.
                        let period = self
                            .shared
                            .state
                            .lock()
                            .unwrap()
                            .pool
                            .get(id)
                            .and_then(|t| t.timeout);
                        if let Some(period) = period {
                            self.set_expire_at(id, Instant::now() + period);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn create_fails_on_zero_capacity() {
        assert!(Scheduler::create(0, 1).is_err());
        assert!(Scheduler::create(1, 0).is_err());
    }

    #[test]
    fn schedule_task_without_callback_marks_remove() {
        let sched = Scheduler::create(4, 4).unwrap();
        let id = sched
            .create_task(3, Opts::READ, None, Box::new(()), None, None, None, None)
            .unwrap();
        assert!(sched.schedule_task(id));
        assert!(sched.task_opts(id).contains(Opts::REMOVE));
    }

    #[test]
    fn timer_task_repeats_until_true() {
        let sched = Scheduler::create(4, 4).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let count_cl = count.clone();
        let id = sched
            .create_timer_task(
                Duration::from_millis(1),
                Box::new(()),
                Box::new(move |_s: &Scheduler, _id, _err| {
                    count_cl.fetch_add(1, Ordering::SeqCst);
                    count_cl.load(Ordering::SeqCst) >= 3
                }),
            )
            .unwrap();
        assert!(sched.schedule_task(id));
        sched.run();
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn pool_exhaustion_then_recovery() {
        let sched = Scheduler::create(2, 1).unwrap();
        let a = sched
            .create_task(10, Opts::READ, None, Box::new(()), Some(Box::new(|_: &Scheduler, _, _| true)), None, None, None)
            .unwrap();
        let _b = sched
            .create_task(11, Opts::READ, None, Box::new(()), Some(Box::new(|_: &Scheduler, _, _| true)), None, None, None)
            .unwrap();
        assert!(sched
            .create_task(12, Opts::READ, None, Box::new(()), Some(Box::new(|_: &Scheduler, _, _| true)), None, None, None)
            .is_none());
        sched.unschedule_task(a);
        // Force a coalesce pass without needing the task to be scheduled.
        sched.shared.state.lock().unwrap().live_order.push(a);
        sched.pump_once(false);
        assert!(sched
            .create_task(13, Opts::READ, None, Box::new(()), Some(Box::new(|_: &Scheduler, _, _| true)), None, None, None)
            .is_some());
    }
}
