//! PID-file bookkeeping and captured-output subprocess spawning.
//!
//! PID files live under `/var/run/{name}.pid`. Spawning is expressed over
//! [`std::process::Command`] rather than hand-rolled `fork`/`pipe`/`dup2`,
//! since the standard library already owns that plumbing safely.

use std::io;
use std::path::PathBuf;
use std::process::{Command, Stdio};

fn pid_file_path(process_name: &str) -> io::Result<PathBuf> {
    if process_name.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "process name must not be empty"));
    }
    Ok(PathBuf::from("/var/run").join(format!("{}.pid", process_name)))
}

/// Sends signal `0` to `pid`: no-op delivery used purely to probe liveness.
pub fn is_pid_alive(pid: libc::pid_t) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Reads `/var/run/{process_name}.pid`, and if it names a still-live
/// process, returns that PID.
pub fn is_process_alive(process_name: &str) -> io::Result<Option<libc::pid_t>> {
    let path = pid_file_path(process_name)?;
    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let pid: libc::pid_t = match contents.trim().parse() {
        Ok(pid) => pid,
        Err(_) => return Ok(None),
    };
    Ok(if is_pid_alive(pid) { Some(pid) } else { None })
}

/// Records the current process's PID to `/var/run/{process_name}.pid`.
pub fn record_my_pid(process_name: &str) -> io::Result<()> {
    record_pid(process_name, std::process::id() as libc::pid_t)
}

/// Records `pid` to `/var/run/{process_name}.pid`, without a trailing
/// newline.
pub fn record_pid(process_name: &str, pid: libc::pid_t) -> io::Result<()> {
    let path = pid_file_path(process_name)?;
    std::fs::write(path, pid.to_string())
}

/// Spawns `program` with `args`, piping stdin/stdout/stderr, and returns the
/// running [`std::process::Child`]. Reaping it (so it does not zombie) is
/// the caller's responsibility, e.g. via a [`crate::child::ChildProcessMonitor`].
pub fn spawn_captured(program: &str, args: &[&str]) -> io::Result<std::process::Child> {
    Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
}

/// Runs `program` with `args` to completion and returns its captured
/// stdout. Always returns the captured output; callers that don't need it
/// can simply ignore the result.
pub fn run_capturing_output(program: &str, args: &[&str]) -> io::Result<Vec<u8>> {
    let output = Command::new(program).args(args).output()?;
    Ok(output.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_process_is_alive() {
        assert!(is_pid_alive(std::process::id() as libc::pid_t));
    }

    #[test]
    fn pid_file_path_rejects_empty_name() {
        assert!(pid_file_path("").is_err());
    }

    #[test]
    fn run_capturing_output_returns_stdout() {
        let out = run_capturing_output("echo", &["hello"]).unwrap();
        assert_eq!(String::from_utf8_lossy(&out).trim(), "hello");
    }
}
