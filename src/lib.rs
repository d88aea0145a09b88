//! `svckit`: a cooperative, single-threaded I/O scheduler built on
//! `select(2)`, a TCP client/listener service layer driven by it, and a
//! periodic child-process monitor — the building blocks a small POSIX
//! network service is assembled from.
//!
//! Grounded on a C codebase (see `DESIGN.md` for the file-by-file ledger)
//! structured around exactly these three collaborating pieces: an I/O
//! scheduler, a TCP service layer built over it, and a child-process
//! monitor that reaps exited children on the same scheduler. This crate
//! keeps that shape, re-expressed in Rust: `Arc`-backed cloneable handles in
//! place of hand-managed `malloc`/`free` structs, a fixed-capacity
//! [`util::Slab`] in place of sentinel-headed linked lists, and `Result`/
//! `ErrorCode` in place of raw `errno` out-parameters.
//!
//! # Modules
//!
//! - [`scheduler`] — the reactor: register fd readiness or timer interest,
//!   pump it from the calling thread or a dedicated worker.
//! - [`tcp`] — [`tcp::TcpClient`] (deadline-bound connect, read loop) and
//!   [`tcp::TcpListener`] (accept loop, per-client read loop), both driven
//!   by a [`scheduler::Scheduler`].
//! - [`child`] — [`child::ChildProcessMonitor`], a one-second reap tick over
//!   monitored child PIDs.
//! - [`registry`] — [`registry::SocketRegistry`], a refcounted cache of
//!   bound listening sockets shared across services on the same port.
//! - [`net`] — raw non-blocking socket helpers (TCP/UDP/UNIX) the rest of
//!   the crate is built from.
//! - [`process`] — PID-file bookkeeping and captured-output subprocess
//!   spawning.
//! - [`error`] — the closed set of error conditions scheduler and TCP
//!   callbacks observe.

pub mod child;
pub mod error;
pub mod net;
pub mod process;
pub mod registry;
pub mod scheduler;
pub mod tcp;

mod util;
