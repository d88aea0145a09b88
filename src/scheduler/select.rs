//! A thin safe wrapper around `select(2)`, this scheduler's one readiness
//! primitive rather than a portable epoll/kqueue abstraction — the pump's
//! 10 ms/1 ms timing and `fd_set` bookkeeping live here.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

pub(crate) struct FdSet(libc::fd_set);

impl FdSet {
    pub(crate) fn empty() -> FdSet {
        unsafe {
            let mut raw = std::mem::MaybeUninit::<libc::fd_set>::uninit();
            libc::FD_ZERO(raw.as_mut_ptr());
            FdSet(raw.assume_init())
        }
    }

    pub(crate) fn set(&mut self, fd: RawFd) {
        unsafe { libc::FD_SET(fd, &mut self.0) }
    }

    pub(crate) fn is_set(&self, fd: RawFd) -> bool {
        unsafe { libc::FD_ISSET(fd, &self.0) }
    }
}

/// Blocks for up to `timeout`, waking early if any fd in `rd`/`wr`/`er`
/// (up to and including `maxfd`) becomes ready. Returns the number of ready
/// descriptors.
pub(crate) fn select(
    maxfd: RawFd,
    rd: &mut FdSet,
    wr: &mut FdSet,
    er: &mut FdSet,
    timeout: Duration,
) -> io::Result<i32> {
    let mut tv = libc::timeval {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_usec: timeout.subsec_micros() as libc::suseconds_t,
    };
    let rv = unsafe { libc::select(maxfd + 1, &mut rd.0, &mut wr.0, &mut er.0, &mut tv) };
    if rv < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rv)
    }
}

/// Sleeps for `dur` via a zero-fd `select`, matching the idle-sleep the
/// original pump uses instead of `thread::sleep` (kept for texture, the
/// observable effect is identical).
pub(crate) fn idle_sleep(dur: Duration) {
    let mut tv = libc::timeval {
        tv_sec: dur.as_secs() as libc::time_t,
        tv_usec: dur.subsec_micros() as libc::suseconds_t,
    };
    unsafe {
        libc::select(0, std::ptr::null_mut(), std::ptr::null_mut(), std::ptr::null_mut(), &mut tv);
    }
}
