//! # confine-core
//!
//! Single-shot supervisor for running one untrusted, already-compiled
//! program and judging how it behaved.
//!
//! This crate provides:
//! - Hard resource limits via `setrlimit` (stack, address space, CPU, nproc, fsize)
//! - A default-deny seccomp filter with argument-checked `execve`/`open`/`tgkill`
//! - File or pipe plumbing for the child's standard streams
//! - A wall-clock watchdog and `wait4`-based resource accounting
//! - Classification of the reaped child into a [`Verdict`]

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod isolation;
pub mod launcher;
pub mod monitor;
pub mod pipe;
pub mod result;
pub mod supervisor;
pub mod verdict;
pub mod watchdog;

pub use config::{IoMode, LimitConfig};
pub use error::{ConfineError, ErrorKind};
pub use pipe::CallerStreams;
pub use result::{Outcome, Report};
pub use supervisor::Supervisor;
pub use verdict::{ClassifyPolicy, Verdict};

/// Crate-level result type
pub type Result<T> = std::result::Result<T, ConfineError>;
