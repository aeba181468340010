//! Children that install the filter and then try allowed and forbidden calls

use confine_core::isolation::SeccompConfig;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult};
use std::ffi::{CStr, CString};

const TRUE: &CStr = c"/bin/true";

/// Fork, install the production filter for `exe_path` in the child, run
/// `body`, then `_exit` with its return value.
fn confined(exe_path: &CStr, body: impl FnOnce() -> i32) -> WaitStatus {
    match unsafe { fork() }.unwrap() {
        ForkResult::Child => {
            let code = match SeccompConfig::for_current_process(exe_path, false).apply() {
                Ok(()) => body(),
                Err(_) => 100,
            };
            unsafe { libc::_exit(code) }
        }
        ForkResult::Parent { child } => waitpid(child, None).unwrap(),
    }
}

fn killed_by(status: WaitStatus, expected: Signal) -> bool {
    matches!(status, WaitStatus::Signaled(_, sig, _) if sig == expected)
}

#[test]
fn read_only_open_is_allowed() {
    let status = confined(TRUE, || {
        let fd = unsafe { libc::open(c"/dev/null".as_ptr(), libc::O_RDONLY) };
        i32::from(fd < 0)
    });
    assert!(matches!(status, WaitStatus::Exited(_, 0)), "{status:?}");
}

#[test]
fn write_only_open_kills_the_process() {
    let status = confined(TRUE, || {
        unsafe { libc::open(c"/dev/null".as_ptr(), libc::O_WRONLY) };
        0
    });
    assert!(killed_by(status, Signal::SIGSYS), "{status:?}");
}

#[test]
fn read_write_open_kills_the_process() {
    let status = confined(TRUE, || {
        unsafe { libc::openat(libc::AT_FDCWD, c"/dev/null".as_ptr(), libc::O_RDWR) };
        0
    });
    assert!(killed_by(status, Signal::SIGSYS), "{status:?}");
}

#[test]
fn exec_of_a_different_path_kills_the_process() {
    let other = CString::new("/bin/true").unwrap();
    let status = confined(TRUE, move || {
        let argv = [other.as_ptr(), std::ptr::null()];
        let envp = [std::ptr::null()];
        unsafe { libc::execve(other.as_ptr(), argv.as_ptr(), envp.as_ptr()) };
        0
    });
    assert!(killed_by(status, Signal::SIGSYS), "{status:?}");
}

#[test]
fn exec_of_the_configured_path_runs_the_program() {
    let status = confined(TRUE, || {
        let argv = [TRUE.as_ptr(), std::ptr::null()];
        let envp = [std::ptr::null()];
        unsafe { libc::execve(TRUE.as_ptr(), argv.as_ptr(), envp.as_ptr()) };
        1
    });
    assert!(matches!(status, WaitStatus::Exited(_, 0)), "{status:?}");
}

#[test]
fn signalling_itself_is_allowed() {
    let status = confined(TRUE, || {
        unsafe { libc::raise(libc::SIGUSR1) };
        0
    });
    assert!(killed_by(status, Signal::SIGUSR1), "{status:?}");
}

#[test]
fn signalling_another_process_kills_the_process() {
    let status = confined(TRUE, || {
        unsafe { libc::kill(1, 0) };
        0
    });
    assert!(killed_by(status, Signal::SIGSYS), "{status:?}");
}

#[test]
fn reading_a_limit_is_allowed() {
    let status = confined(TRUE, || {
        let mut current = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        let ret = unsafe { libc::prlimit(0, libc::RLIMIT_NOFILE, std::ptr::null(), &mut current) };
        i32::from(ret != 0)
    });
    assert!(matches!(status, WaitStatus::Exited(_, 0)), "{status:?}");
}

#[test]
fn changing_a_limit_kills_the_process() {
    let status = confined(TRUE, || {
        let lower = libc::rlimit {
            rlim_cur: 16,
            rlim_max: 16,
        };
        unsafe { libc::prlimit(0, libc::RLIMIT_NOFILE, &lower, std::ptr::null_mut()) };
        0
    });
    assert!(killed_by(status, Signal::SIGSYS), "{status:?}");
}

#[test]
fn terminal_probe_ioctl_is_allowed() {
    let status = confined(TRUE, || {
        unsafe { libc::isatty(libc::STDIN_FILENO) };
        0
    });
    assert!(matches!(status, WaitStatus::Exited(_, 0)), "{status:?}");
}

#[test]
fn other_ioctls_kill_the_process() {
    let status = confined(TRUE, || {
        let mut pending: libc::c_int = 0;
        unsafe { libc::ioctl(libc::STDIN_FILENO, libc::FIONREAD, &mut pending) };
        0
    });
    assert!(killed_by(status, Signal::SIGSYS), "{status:?}");
}

#[test]
fn identity_queries_need_debug_mode() {
    let status = confined(TRUE, || {
        unsafe { libc::getppid() };
        0
    });
    assert!(killed_by(status, Signal::SIGSYS), "{status:?}");
}
