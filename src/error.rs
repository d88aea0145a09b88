//! Error codes surfaced to scheduler and TCP-service callbacks.
//!
//! Fallible constructors (sockets, schedulers, pools) return
//! [`std::io::Result`]; this module only covers the small, closed set of
//! conditions a *callback* needs to distinguish once it has already been
//! invoked (readiness fired, or didn't, or a deadline passed).

use std::io;

/// The value delivered to a connect completion callback when the connect's
/// deadline passes before the kernel reports success or failure. It is not
/// an errno; kept stable because callers match on it directly.
pub const CONNECT_TIMEOUT_ERRCODE: i32 = 1;

/// Error codes a scheduler or TCP-service callback may observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// No error; the callback fired because its condition was satisfied.
    None,
    /// The task's deadline passed before its condition was satisfied.
    OpTimeout,
    /// The peer reset the connection.
    ConnReset,
    /// A read observed zero bytes (orderly peer shutdown).
    EndOfData,
    /// The operation would have blocked (used internally; rarely surfaced).
    WouldBlock,
    /// The file descriptor was invalid or closed out from under the task.
    BadFd,
}

impl ErrorCode {
    pub fn is_none(self) -> bool {
        matches!(self, ErrorCode::None)
    }

    /// Maps the raw `errno` of a failed syscall onto the closed set of
    /// [`ErrorCode`] variants a callback can act on.
    pub fn from_raw_os_error(errno: i32) -> ErrorCode {
        match errno {
            libc::ECONNRESET => ErrorCode::ConnReset,
            libc::EWOULDBLOCK | libc::EAGAIN => ErrorCode::WouldBlock,
            libc::EBADF => ErrorCode::BadFd,
            _ => ErrorCode::ConnReset,
        }
    }
}

impl From<ErrorCode> for io::Error {
    fn from(code: ErrorCode) -> io::Error {
        match code {
            ErrorCode::None => io::Error::from(io::ErrorKind::Other),
            ErrorCode::OpTimeout => io::Error::from(io::ErrorKind::TimedOut),
            ErrorCode::ConnReset => io::Error::from(io::ErrorKind::ConnectionReset),
            ErrorCode::EndOfData => io::Error::from(io::ErrorKind::UnexpectedEof),
            ErrorCode::WouldBlock => io::Error::from(io::ErrorKind::WouldBlock),
            ErrorCode::BadFd => io::Error::from(io::ErrorKind::InvalidInput),
        }
    }
}
