//! Wall-clock kill timer

use crate::isolation::rlimits::cpu_seconds;
use crate::{ConfineError, Result};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread;
use std::time::Duration;

/// Seconds added on top of the rounded ceiling so the timer does not race a
/// child that finishes right at its limit.
const SLACK_SECS: u64 = 1;

/// Delay before the watchdog fires for a wall-clock ceiling in milliseconds.
#[must_use]
pub const fn deadline(max_real_time_ms: u64) -> Duration {
    Duration::from_secs(cpu_seconds(max_real_time_ms) + SLACK_SECS)
}

/// Detached timer thread that sends `SIGKILL` to the child at its deadline.
///
/// Never joined. Dropping the handle disarms it, so a late timer cannot hit
/// a pid the kernel has already recycled; a kill that does land on an already
/// dead child is a harmless no-op.
#[derive(Debug)]
pub struct Watchdog {
    _disarm: Sender<()>,
}

impl Watchdog {
    pub fn arm(child: Pid, max_real_time_ms: u64) -> Result<Self> {
        let delay = deadline(max_real_time_ms);
        let (disarm, disarmed) = mpsc::channel::<()>();

        thread::Builder::new()
            .name("confine-watchdog".into())
            .spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = disarmed.recv_timeout(delay) {
                    match kill(child, Signal::SIGKILL) {
                        Ok(()) => tracing::info!(pid = child.as_raw(), ?delay, "watchdog killed child"),
                        Err(Errno::ESRCH) => {}
                        Err(e) => tracing::warn!(pid = child.as_raw(), error = %e, "watchdog kill failed"),
                    }
                }
            })
            .map_err(|source| ConfineError::Thread {
                what: "watchdog",
                source,
            })?;

        tracing::debug!(pid = child.as_raw(), ?delay, "watchdog armed");
        Ok(Self { _disarm: disarm })
    }
}
