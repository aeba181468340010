//! Reaping the child and measuring what it used

use crate::pipe::InputPump;
use crate::verdict::Measurement;
use crate::{ConfineError, Result};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::mem::MaybeUninit;
use std::time::Duration;

/// Upper bound on how long the monitor waits for input activity before
/// checking whether the child has exited.
pub const POLL_INTERVAL_MS: u16 = 20;

/// Termination status and resource usage collected by a single `wait4`.
#[derive(Clone, Copy)]
pub struct Reaped {
    pub status: WaitStatus,
    pub usage: libc::rusage,
}

impl std::fmt::Debug for Reaped {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reaped")
            .field("status", &self.status)
            .field("cpu_time_ms", &self.cpu_time_ms())
            .field("peak_memory", &self.peak_memory())
            .finish()
    }
}

impl Reaped {
    /// Terminating signal number, or 0 for a normal exit.
    #[must_use]
    pub const fn signal(&self) -> i32 {
        match self.status {
            WaitStatus::Signaled(_, sig, _) => sig as i32,
            _ => 0,
        }
    }

    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self.status {
            WaitStatus::Exited(_, code) => code,
            _ => 0,
        }
    }

    /// User CPU time in milliseconds.
    #[must_use]
    pub fn cpu_time_ms(&self) -> u64 {
        let tv = self.usage.ru_utime;
        let secs = u64::try_from(tv.tv_sec).unwrap_or(0);
        let micros = u64::try_from(tv.tv_usec).unwrap_or(0);
        secs * 1000 + micros / 1000
    }

    /// Peak resident set size in bytes (`ru_maxrss` is in KiB on Linux).
    #[must_use]
    pub fn peak_memory(&self) -> u64 {
        u64::try_from(self.usage.ru_maxrss).unwrap_or(0) * 1024
    }

    #[must_use]
    pub fn measure(&self, elapsed: Duration) -> Measurement {
        Measurement {
            cpu_time: self.cpu_time_ms(),
            real_time: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            memory: self.peak_memory(),
            signal: self.signal(),
            exit_code: self.exit_code(),
        }
    }
}

/// `wait4` for `pid`. Returns `None` if `WNOHANG` was given and the child is
/// still running. Stops and continues are skipped.
pub fn wait4(pid: Pid, flags: WaitPidFlag) -> nix::Result<Option<Reaped>> {
    loop {
        let mut status = 0;
        let mut usage = MaybeUninit::<libc::rusage>::zeroed();

        // SAFETY: status and usage point to writable memory of the right type
        let ret = unsafe { libc::wait4(pid.as_raw(), &mut status, flags.bits(), usage.as_mut_ptr()) };

        match ret {
            -1 if Errno::last() == Errno::EINTR => {}
            -1 => return Err(Errno::last()),
            0 => return Ok(None),
            _ => {
                let status = WaitStatus::from_raw(pid, status)?;
                if matches!(status, WaitStatus::Exited(..) | WaitStatus::Signaled(..)) {
                    // SAFETY: wait4 filled usage for a reaped child
                    let usage = unsafe { usage.assume_init() };
                    return Ok(Some(Reaped { status, usage }));
                }
            }
        }
    }
}

/// Block until `pid` terminates, pumping caller input into it meanwhile.
///
/// Without a pump (file mode, or once input is exhausted) this is a plain
/// blocking wait. Any failure kills and reaps the child before returning.
pub fn wait(pid: Pid, mut pump: Option<&mut InputPump>) -> Result<Reaped> {
    let result = wait_inner(pid, &mut pump);
    if result.is_err() {
        kill_and_reap(pid);
    }
    result
}

fn wait_inner(pid: Pid, pump: &mut Option<&mut InputPump>) -> Result<Reaped> {
    loop {
        match pump {
            Some(p) if !p.is_done() => {
                p.step(POLL_INTERVAL_MS)?;
                if let Some(reaped) = wait4(pid, WaitPidFlag::WNOHANG).map_err(ConfineError::Wait)? {
                    return Ok(reaped);
                }
            }
            _ => {
                if let Some(reaped) = wait4(pid, WaitPidFlag::empty()).map_err(ConfineError::Wait)? {
                    return Ok(reaped);
                }
            }
        }
    }
}

/// Best-effort cleanup after a supervisor failure.
pub fn kill_and_reap(pid: Pid) {
    match kill(pid, Signal::SIGKILL) {
        Ok(()) => {
            let _ = wait4(pid, WaitPidFlag::empty());
        }
        Err(e) => tracing::warn!(pid = pid.as_raw(), error = %e, "failed to kill child"),
    }
}
