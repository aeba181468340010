//! Error types for confine-core

use serde::{Serialize, Serializer};
use thiserror::Error;

/// Supervisor failures.
///
/// These describe the supervisor's inability to finish its job. The behavior
/// of the confined program is reported through [`crate::Verdict`] instead and
/// is never an error.
#[derive(Error, Debug)]
pub enum ConfineError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("fork failed: {0}")]
    Fork(#[source] nix::Error),

    #[error("failed to spawn {what} thread: {source}")]
    Thread {
        what: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("wait failed: {0}")]
    Wait(#[source] nix::Error),

    #[error("seccomp error: {0}")]
    Seccomp(String),

    #[error("setrlimit failed for {resource}: {source}")]
    Rlimit {
        resource: &'static str,
        #[source]
        source: nix::Error,
    },

    #[error("failed to bind {stream}: {source}")]
    Redirect {
        stream: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to drop privileges: {0}")]
    Credentials(#[source] nix::Error),

    #[error("execve failed: {0}")]
    Exec(#[source] nix::Error),

    #[error("forwarding {stream} failed: {source}")]
    Forward {
        stream: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfineError {
    /// Stable failure category used in reports.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::InvalidConfig,
            Self::Fork(_) => ErrorKind::ForkFailed,
            Self::Thread { .. } => ErrorKind::ThreadFailed,
            Self::Wait(_) => ErrorKind::WaitFailed,
            Self::Seccomp(_) => ErrorKind::LoadSeccompFailed,
            Self::Rlimit { .. } => ErrorKind::SetrlimitFailed,
            Self::Redirect { .. } => ErrorKind::Dup2Failed,
            Self::Credentials(_) => ErrorKind::SetuidFailed,
            Self::Exec(_) => ErrorKind::ExecveFailed,
            Self::Forward { .. } | Self::Io(_) => ErrorKind::ForwardIoFailed,
        }
    }

    /// The failure happened before any child existed.
    ///
    /// Child-side setup errors never reach the supervisor as errors (they end
    /// in a `SystemError` verdict), so a `Redirect` seen here comes from pipe
    /// creation and an `Io` from duplicating the caller's streams.
    #[must_use]
    pub const fn is_pre_launch(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::Fork(_) | Self::Redirect { .. } | Self::Io(_)
        )
    }
}

/// Numeric failure taxonomy, rendered as its ordinal in the `error` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorKind {
    InvalidConfig = 1,
    ForkFailed = 2,
    ThreadFailed = 3,
    WaitFailed = 4,
    LoadSeccompFailed = 5,
    SetrlimitFailed = 6,
    Dup2Failed = 7,
    SetuidFailed = 8,
    ExecveFailed = 9,
    ForwardIoFailed = 10,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::InvalidConfig => "INVALID_CONFIG",
            Self::ForkFailed => "FORK_FAILED",
            Self::ThreadFailed => "THREAD_FAILED",
            Self::WaitFailed => "WAIT_FAILED",
            Self::LoadSeccompFailed => "LOAD_SECCOMP_FAILED",
            Self::SetrlimitFailed => "SETRLIMIT_FAILED",
            Self::Dup2Failed => "DUP2_FAILED",
            Self::SetuidFailed => "SETUID_FAILED",
            Self::ExecveFailed => "EXECVE_FAILED",
            Self::ForwardIoFailed => "FORWARD_IO_FAILED",
        }
    }
}

impl Serialize for ErrorKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}
