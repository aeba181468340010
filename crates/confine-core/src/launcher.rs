//! Fork and the child's confinement sequence
//!
//! The child applies, strictly in this order and without retries:
//! resource limits, stdio binding, optional privilege drop, the syscall
//! filter, and finally `execve`. Any failure raises
//! [`SANDBOX_FAILURE_SIGNAL`] so the parent can tell "never ran" apart from
//! "ran and crashed".

use crate::isolation::{Credentials, RlimitPlan, SeccompConfig};
use crate::pipe::ChildStdio;
use crate::verdict::SANDBOX_FAILURE_SIGNAL;
use crate::{ConfineError, ErrorKind, LimitConfig, Result};
use nix::errno::Errno;
use nix::sys::signal::{raise, signal, sigprocmask, SigHandler, SigSet, SigmaskHow, Signal};
use nix::unistd::{fork, ForkResult, Pid};
use std::convert::Infallible;
use std::ffi::{c_char, CString};
use std::os::unix::ffi::OsStrExt;

/// Everything `execve` needs, owned and NUL-terminated, built before fork.
#[derive(Debug)]
pub struct ExecImage {
    path: CString,
    // Keep the strings alive: `argv`/`envp` point into their heap buffers.
    _args: Vec<CString>,
    _env: Vec<CString>,
    argv: Vec<*const c_char>,
    envp: Vec<*const c_char>,
}

impl ExecImage {
    pub fn new(config: &LimitConfig) -> Result<Self> {
        let path = CString::new(config.exe_path.as_os_str().as_bytes())
            .map_err(|_| ConfineError::Config("executable path contains a NUL byte".into()))?;
        let args = to_cstrings(&config.args)?;
        let env = to_cstrings(&config.env)?;
        let argv = null_terminated(&args);
        let envp = null_terminated(&env);

        Ok(Self {
            path,
            _args: args,
            _env: env,
            argv,
            envp,
        })
    }

    #[must_use]
    pub fn path(&self) -> &CString {
        &self.path
    }

    /// Replace the current process image. Only returns on failure.
    pub fn exec(&self) -> ConfineError {
        // SAFETY: path, argv and envp are NUL-terminated and outlive the call
        unsafe {
            libc::execve(self.path.as_ptr(), self.argv.as_ptr(), self.envp.as_ptr());
        }
        ConfineError::Exec(Errno::last())
    }
}

fn to_cstrings(items: &[String]) -> Result<Vec<CString>> {
    items
        .iter()
        .map(|s| {
            CString::new(s.as_bytes())
                .map_err(|_| ConfineError::Config(format!("argument contains a NUL byte: {s:?}")))
        })
        .collect()
}

fn null_terminated(items: &[CString]) -> Vec<*const c_char> {
    items
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

/// Fork the confined child. In the parent, returns its pid; the child never
/// returns from this call.
pub fn spawn(config: &LimitConfig, image: &ExecImage, stdio: ChildStdio) -> Result<Pid> {
    // SAFETY: the child only runs the confinement sequence, then execs or exits
    match unsafe { fork() }.map_err(ConfineError::Fork)? {
        ForkResult::Child => child_main(config, image, stdio),
        ForkResult::Parent { child } => {
            // Closes the child's pipe ends on our side.
            drop(stdio);
            Ok(child)
        }
    }
}

fn child_main(config: &LimitConfig, image: &ExecImage, stdio: ChildStdio) -> ! {
    let err = match confine_and_exec(config, image, stdio) {
        Ok(never) => match never {},
        Err(err) => err,
    };
    child_error_exit(&err)
}

fn confine_and_exec(config: &LimitConfig, image: &ExecImage, stdio: ChildStdio) -> Result<Infallible> {
    reset_signals();

    RlimitPlan::from_config(config).apply()?;

    stdio.bind()?;

    if config.drop_privileges {
        Credentials::new(config.uid, config.gid).apply()?;
    }

    SeccompConfig::for_current_process(image.path(), config.debug_mode).apply()?;
    // The filter is live: nothing below may log.

    Err(image.exec())
}

/// Give the program a clean signal state: empty mask, default dispositions
/// for the signals the supervisor may ignore. Neither call can fail with
/// these arguments.
fn reset_signals() {
    let _ = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None);
    for sig in [Signal::SIGPIPE, SANDBOX_FAILURE_SIGNAL] {
        // SAFETY: restoring the default disposition installs no handler code
        let _ = unsafe { signal(sig, SigHandler::SigDfl) };
    }
}

fn child_error_exit(err: &ConfineError) -> ! {
    // Past the filter only exec can fail, and logging would trip the filter.
    if err.kind() != ErrorKind::ExecveFailed {
        tracing::error!(error = %err, kind = err.kind().name(), "fatal error in child");
    }

    let _ = raise(SANDBOX_FAILURE_SIGNAL);

    // SAFETY: terminate without running the parent's atexit handlers
    unsafe { libc::_exit(libc::EXIT_FAILURE) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CStr;

    #[test]
    fn exec_image_is_null_terminated_and_uncapped() {
        let mut builder = LimitConfig::builder().exe_path("/bin/echo");
        for i in 0..1000 {
            builder = builder.arg(format!("arg{i}"));
        }
        let config = builder.env("LANG", "C").build();
        let image = ExecImage::new(&config).unwrap();

        assert_eq!(image.argv.len(), 1001);
        assert!(image.argv[1000].is_null());
        assert_eq!(image.envp.len(), 2);
        assert!(image.envp[1].is_null());

        // SAFETY: pointers reference CStrings owned by `image`
        let last = unsafe { CStr::from_ptr(image.argv[999]) };
        assert_eq!(last.to_bytes(), b"arg999");
        let env = unsafe { CStr::from_ptr(image.envp[0]) };
        assert_eq!(env.to_bytes(), b"LANG=C");
    }

    #[test]
    fn exec_image_keeps_the_configured_path() {
        let config = LimitConfig::builder().exe_path("/usr/bin/env").build();
        let image = ExecImage::new(&config).unwrap();
        assert_eq!(image.path().as_bytes(), b"/usr/bin/env");
    }

    #[test]
    fn nul_bytes_are_config_errors() {
        let config = LimitConfig::builder()
            .exe_path("/bin/true")
            .env("A", "b\0c")
            .build();
        let err = ExecImage::new(&config).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    }
}
