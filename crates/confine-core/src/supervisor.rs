//! One supervised invocation, from validation to verdict

use crate::launcher::{self, ExecImage};
use crate::monitor;
use crate::pipe::{self, CallerStreams, ChildStdio, InputPump};
use crate::verdict::{Ceilings, ClassifyPolicy};
use crate::watchdog::Watchdog;
use crate::{ConfineError, LimitConfig, Outcome, Result};
use nix::unistd::Pid;
use std::thread::JoinHandle;
use std::time::Instant;

/// Launches, watches and judges exactly one child per call to [`Supervisor::run`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Supervisor {
    policy: ClassifyPolicy,
}

impl Supervisor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the verdict precedence policy.
    #[must_use]
    pub const fn with_policy(policy: ClassifyPolicy) -> Self {
        Self { policy }
    }

    /// Run `config.exe_path` under confinement. In pipe mode the supervisor's
    /// own standard streams are forwarded.
    pub fn run(&self, config: &LimitConfig) -> Result<Outcome> {
        config.validate()?;
        let streams = if config.is_pipe_mode() {
            Some(CallerStreams::inherit()?)
        } else {
            None
        };
        self.run_with_streams(config, streams)
    }

    /// Like [`Supervisor::run`], forwarding the given caller streams in pipe
    /// mode. `streams` is ignored in file mode.
    pub fn run_with_streams(
        &self,
        config: &LimitConfig,
        streams: Option<CallerStreams>,
    ) -> Result<Outcome> {
        config.validate()?;
        let image = ExecImage::new(config)?;

        let streams = match (config.is_pipe_mode(), streams) {
            (true, Some(streams)) => Some(streams),
            (true, None) => {
                return Err(ConfineError::Config("pipe mode needs caller streams".into()));
            }
            (false, _) => None,
        };

        let (child_stdio, parent_pipes) = ChildStdio::for_mode(&config.io)?;

        let start = Instant::now();
        let pid = launcher::spawn(config, &image, child_stdio)?;
        tracing::info!(pid = pid.as_raw(), exe = ?config.exe_path, "child launched");

        let watchdog = match config.max_real_time {
            Some(ms) => {
                Some(Watchdog::arm(pid, ms).inspect_err(|_| monitor::kill_and_reap(pid))?)
            }
            None => None,
        };

        let (mut pump, forwarders) = match (parent_pipes, streams) {
            (Some(pipes), Some(streams)) => {
                let forwarders = start_forwarders(
                    pid,
                    pipes.stdout_rx,
                    pipes.stderr_rx,
                    streams.output,
                    streams.error,
                )
                .inspect_err(|_| monitor::kill_and_reap(pid))?;
                let pump = InputPump::new(streams.input, pipes.stdin_tx)
                    .inspect_err(|_| monitor::kill_and_reap(pid))?;
                (Some(pump), forwarders)
            }
            _ => (None, Vec::new()),
        };

        let reaped = monitor::wait(pid, pump.as_mut())?;
        let elapsed = start.elapsed();
        drop(watchdog);
        drop(pump);

        for handle in forwarders {
            join_forwarder(handle)?;
        }

        let measurement = reaped.measure(elapsed);
        let verdict = self.policy.classify(&measurement, &Ceilings::from(config));
        let outcome = Outcome::new(measurement, verdict);

        tracing::info!(
            pid = pid.as_raw(),
            cpu_time = outcome.cpu_time,
            real_time = outcome.real_time,
            memory = outcome.memory,
            signal = outcome.signal,
            exit_code = outcome.exit_code,
            verdict = ?outcome.verdict,
            "child reaped"
        );

        Ok(outcome)
    }
}

type Forwarder = JoinHandle<Result<u64>>;

fn start_forwarders(
    pid: Pid,
    stdout_rx: std::fs::File,
    stderr_rx: std::fs::File,
    output: Box<dyn std::io::Write + Send>,
    error: Box<dyn std::io::Write + Send>,
) -> Result<Vec<Forwarder>> {
    let stdout = pipe::spawn_forwarder("stdout", stdout_rx, output, pid)?;
    let stderr = pipe::spawn_forwarder("stderr", stderr_rx, error, pid)?;
    Ok(vec![stdout, stderr])
}

fn join_forwarder(handle: Forwarder) -> Result<()> {
    handle
        .join()
        .map_err(|_| ConfineError::Forward {
            stream: "output",
            source: std::io::Error::other("forwarder thread panicked"),
        })?
        .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::{fork, ForkResult};

    #[test]
    fn invalid_config_is_reported_before_streams_are_touched() {
        let expected = i32::from(ErrorKind::InvalidConfig.code());

        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                // Inheriting caller streams would now fail with EBADF.
                unsafe { libc::close(libc::STDIN_FILENO) };
                let config = LimitConfig::builder().pipes().build();
                let code = match Supervisor::new().run(&config) {
                    Err(e) => i32::from(e.kind().code()),
                    Ok(_) => 0,
                };
                unsafe { libc::_exit(code) }
            }
            ForkResult::Parent { child } => {
                assert_eq!(waitpid(child, None).unwrap(), WaitStatus::Exited(child, expected));
            }
        }
    }
}
