//! Post-mortem classification of a reaped child

use crate::LimitConfig;
use nix::sys::signal::Signal;
use serde::{Serialize, Serializer};

/// Signal the child raises on itself when setup fails before exec.
pub const SANDBOX_FAILURE_SIGNAL: Signal = Signal::SIGUSR1;

/// Classification of a completed child execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Verdict {
    Success = 0,
    CpuTimeExceeded = 1,
    WallTimeExceeded = 2,
    MemoryExceeded = 3,
    RuntimeError = 4,
    SystemError = 5,
}

impl Verdict {
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }
}

impl Serialize for Verdict {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

/// What the monitor measured for the reaped child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Measurement {
    /// User CPU time in milliseconds
    pub cpu_time: u64,
    /// Wall-clock time in milliseconds
    pub real_time: u64,
    /// Peak resident set size in bytes
    pub memory: u64,
    /// Terminating signal number, 0 if the child exited
    pub signal: i32,
    pub exit_code: i32,
}

/// Ceilings the classifier compares against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ceilings {
    pub cpu_time: Option<u64>,
    pub real_time: Option<u64>,
    pub memory: Option<u64>,
}

impl From<&LimitConfig> for Ceilings {
    fn from(config: &LimitConfig) -> Self {
        Self {
            cpu_time: config.max_cpu_time,
            real_time: config.max_real_time,
            memory: config.max_memory,
        }
    }
}

/// Verdict precedence, evaluated top to bottom:
///
/// | step | condition                                   | verdict          |
/// |------|---------------------------------------------|------------------|
/// | 1    | killed by the sandbox failure signal        | `SystemError`, final |
/// | 2    | `SIGSEGV` and peak memory above its ceiling | `MemoryExceeded` |
/// | 2    | `SIGSEGV` otherwise                         | `RuntimeError`   |
/// | 3    | any other signal                            | `RuntimeError`   |
/// | 4    | non-zero exit, if the policy asks for it    | `RuntimeError`   |
/// | 5    | peak memory above its ceiling               | `MemoryExceeded` |
/// | 6    | wall time above its ceiling                 | `WallTimeExceeded` |
/// | 7    | CPU time above its ceiling                  | `CpuTimeExceeded` |
///
/// Steps 5-7 overwrite whatever was decided before them, so a time limit is
/// reported even when the child also crashed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClassifyPolicy {
    /// Treat a bare non-zero exit code as `RuntimeError`. Off by default.
    pub nonzero_exit_is_runtime_error: bool,
}

impl ClassifyPolicy {
    #[must_use]
    pub fn classify(self, m: &Measurement, ceilings: &Ceilings) -> Verdict {
        if m.signal == SANDBOX_FAILURE_SIGNAL as i32 {
            return Verdict::SystemError;
        }

        let exceeds = |ceiling: Option<u64>, used: u64| ceiling.is_some_and(|max| used > max);

        let mut verdict = Verdict::Success;

        if m.signal == Signal::SIGSEGV as i32 {
            verdict = if exceeds(ceilings.memory, m.memory) {
                Verdict::MemoryExceeded
            } else {
                Verdict::RuntimeError
            };
        } else if m.signal != 0 {
            verdict = Verdict::RuntimeError;
        }

        if self.nonzero_exit_is_runtime_error && m.signal == 0 && m.exit_code != 0 {
            verdict = Verdict::RuntimeError;
        }

        if exceeds(ceilings.memory, m.memory) {
            verdict = Verdict::MemoryExceeded;
        }
        if exceeds(ceilings.real_time, m.real_time) {
            verdict = Verdict::WallTimeExceeded;
        }
        if exceeds(ceilings.cpu_time, m.cpu_time) {
            verdict = Verdict::CpuTimeExceeded;
        }

        verdict
    }
}
