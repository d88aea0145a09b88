//! Scenario: child-process monitor reaps a forked child and reports its
//! exit status (spec.md §8, scenario 6).

mod util;

use std::process::Command;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use svckit::child::ChildProcessMonitor;
use svckit::scheduler::Scheduler;

#[test]
fn reaps_exited_child_with_its_exit_status() {
    util::init_logging();

    let scheduler = Scheduler::create(8, 8).unwrap();
    let monitor: ChildProcessMonitor<()> = ChildProcessMonitor::new(&scheduler);
    assert!(monitor.start());

    let mut child = Command::new("sh").arg("-c").arg("exit 7").spawn().unwrap();
    let pid = child.id() as libc::pid_t;

    let raw_status = Arc::new(AtomicI32::new(-1));
    let raw_status_cl = raw_status.clone();
    assert!(monitor.monitor(
        pid,
        -1,
        (),
        Box::new(move |exited| {
            raw_status_cl.store(exited.status, Ordering::SeqCst);
        }),
    ));

    // A duplicate admission for the same still-pending pid must be refused.
    assert!(!monitor.monitor(pid, -1, (), Box::new(|_| {})));

    scheduler.start_thread().unwrap();
    std::thread::sleep(Duration::from_millis(1500));
    scheduler.stop();

    let status = raw_status.load(Ordering::SeqCst);
    assert_ne!(status, -1, "on_exit never fired within the reap window");
    unsafe {
        assert!(libc::WIFEXITED(status));
        assert_eq!(libc::WEXITSTATUS(status), 7);
    }

    // The child was already reaped by the monitor's own waitpid(); std's
    // wait() will simply report it as already gone.
    let _ = child.wait();

    // Once reaped, the pid is no longer tracked, so re-monitoring it is a
    // fresh admission rather than a rejected duplicate.
    assert!(monitor.monitor(pid, -1, (), Box::new(|_| {})));
}
