//! Periodic, non-blocking reaping of monitored child processes.
//!
//! A one-second scheduler timer task drives a `waitpid(-1, &status, WNOHANG)`
//! loop, dispatching one exit callback per reaped PID and then unlinking it
//! from the monitored list.
//!
//! There is only one admission path, [`ChildProcessMonitor::monitor`] — this
//! crate never hands out a free-standing child-process handle the caller
//! could also own independently of the monitor.

use crate::scheduler::{Scheduler, TaskHandle};

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const REAP_INTERVAL: Duration = Duration::from_secs(1);

/// A child process that has just been reaped. Handed to [`OnExit`] by value;
/// nothing references the monitor's bookkeeping for it afterward.
pub struct ExitedChild<U> {
    pub pid: libc::pid_t,
    /// The fd the caller associated with this child at [`ChildProcessMonitor::monitor`]
    /// time — typically a pipe or socket the caller was using to talk to it.
    pub fd: RawFd,
    pub user: U,
    /// Raw `waitpid` status; inspect with `libc::WIFEXITED`/`WEXITSTATUS`/
    /// `WIFSIGNALED`/`WTERMSIG`.
    pub status: libc::c_int,
}

/// Invoked once per reaped child, from the scheduler's pump thread.
pub type OnExit<U> = Box<dyn FnMut(ExitedChild<U>) + Send>;

struct MonitoredChild<U> {
    fd: RawFd,
    user: Option<U>,
    on_exit: Option<OnExit<U>>,
}

struct MonitorInner<U> {
    scheduler: Scheduler,
    monitored: Mutex<HashMap<libc::pid_t, MonitoredChild<U>>>,
    timer_task: Mutex<Option<TaskHandle>>,
}

/// A cheaply cloneable handle to a running child-process monitor.
pub struct ChildProcessMonitor<U> {
    inner: Arc<MonitorInner<U>>,
}

impl<U> Clone for ChildProcessMonitor<U> {
    fn clone(&self) -> Self {
        ChildProcessMonitor { inner: self.inner.clone() }
    }
}

impl<U: Send + 'static> ChildProcessMonitor<U> {
    pub fn new(scheduler: &Scheduler) -> ChildProcessMonitor<U> {
        ChildProcessMonitor {
            inner: Arc::new(MonitorInner {
                scheduler: scheduler.clone(),
                monitored: Mutex::new(HashMap::new()),
                timer_task: Mutex::new(None),
            }),
        }
    }

    /// Starts the one-second reap tick. Calling this again while already
    /// started stops the existing tick first and restarts it cleanly.
    pub fn start(&self) -> bool {
        self.stop();
        let monitor = self.clone();
        let task = self.inner.scheduler.create_timer_task(
            REAP_INTERVAL,
            Box::new(()),
            Box::new(move |scheduler, _id, _err| {
                monitor.reap_tick(scheduler);
                false
            }),
        );
        match task {
            Some(id) => {
                self.inner.scheduler.schedule_task(id);
                *self.inner.timer_task.lock().unwrap() = Some(id);
                true
            }
            None => {
                log::error!(target: "childprocmgr", "failed to create/schedule monitor I/O task");
                false
            }
        }
    }

    /// Stops the reap tick. Already-monitored children are left in place
    /// (and will resume being reaped once [`start`](Self::start) is called
    /// again) since they are not themselves scheduler tasks.
    pub fn stop(&self) {
        if let Some(id) = self.inner.timer_task.lock().unwrap().take() {
            log::debug!(target: "childprocmgr", "stopping monitor I/O task");
            self.inner.scheduler.unschedule_task(id);
        }
    }

    /// Begins monitoring `pid`, invoking `on_exit` exactly once when it is
    /// reaped. Refuses (returning `false`) a `pid` already under monitor.
    pub fn monitor(&self, pid: libc::pid_t, fd: RawFd, user: U, on_exit: OnExit<U>) -> bool {
        let mut monitored = self.inner.monitored.lock().unwrap();
        if monitored.contains_key(&pid) {
            log::warn!(target: "childprocmgr", "this child process is already being monitored; refusing to add another monitor");
            return false;
        }
        log::info!(target: "childprocmgr", "monitoring child process ({})", pid);
        monitored.insert(pid, MonitoredChild { fd, user: Some(user), on_exit: Some(on_exit) });
        true
    }

    fn reap_tick(&self, _scheduler: &Scheduler) {
        loop {
            let mut status: libc::c_int = 0;
            let child_pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };

            if child_pid == -1 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ECHILD) {
                    log::error!(target: "childprocmgr", "reap_tick(): waitpid() returned an error: {}", err);
                }
                break;
            }
            if child_pid == 0 {
                break;
            }

            let reaped = self.inner.monitored.lock().unwrap().remove(&child_pid);
            if let Some(mut child) = reaped {
                if let Some(mut on_exit) = child.on_exit.take() {
                    let exited = ExitedChild {
                        pid: child_pid,
                        fd: child.fd,
                        user: child.user.take().expect("user state present until reaped"),
                        status,
                    };
                    on_exit(exited);
                }
            }
        }
    }
}

impl<U> Drop for MonitorInner<U> {
    fn drop(&mut self) {
        if let Some(id) = self.timer_task.get_mut().unwrap().take() {
            self.scheduler.unschedule_task(id);
        }
        for (_, child) in self.monitored.get_mut().unwrap().drain() {
            crate::net::close(child.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refuses_duplicate_monitor() {
        let scheduler = Scheduler::create(4, 4).unwrap();
        let monitor: ChildProcessMonitor<()> = ChildProcessMonitor::new(&scheduler);
        assert!(monitor.monitor(12345, -1, (), Box::new(|_| {})));
        assert!(!monitor.monitor(12345, -1, (), Box::new(|_| {})));
    }
}
