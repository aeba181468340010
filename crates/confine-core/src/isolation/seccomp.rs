//! Seccomp-BPF syscall filtering
//!
//! Default action is to kill the process. On top of a fixed allow-list,
//! these rules look at syscall arguments:
//!
//! - `execve` only for the exact path pointer the launcher will pass
//! - `tgkill` only aimed at the calling thread (lets `abort()` work)
//! - `open`/`openat` only without `O_WRONLY`/`O_RDWR`
//! - `prlimit64` only to read limits, never to change them
//! - `ioctl` only for the termios probe stdio does on character devices

use crate::{ConfineError, Result};
use seccompiler::{
    BpfProgram, SeccompAction, SeccompCmpArgLen, SeccompCmpOp, SeccompCondition, SeccompFilter,
    SeccompRule, TargetArch,
};
use std::collections::BTreeMap;
use std::ffi::CStr;

/// Access-mode bits an open request must not carry.
const WRITE_ACCESS: u64 = (libc::O_WRONLY | libc::O_RDWR) as u64;

/// Configuration for the child's syscall filter
#[derive(Debug, Clone)]
pub struct SeccompConfig {
    /// Unconditionally allowed syscalls
    pub allowed_syscalls: Vec<i64>,
    /// Address of the executable path string handed to `execve`
    pub exe_path_ptr: u64,
    /// Process that may signal itself
    pub pid: i32,
    /// Thread that may be signalled
    pub tid: i32,
}

impl SeccompConfig {
    /// Build the policy for the calling process.
    ///
    /// `exe_path` must be the very string later passed to `execve`: the
    /// kernel filter compares the pointer, not the contents.
    #[must_use]
    pub fn for_current_process(exe_path: &CStr, debug_mode: bool) -> Self {
        let mut allowed_syscalls = baseline_syscalls();
        if debug_mode {
            allowed_syscalls.extend(debug_syscalls());
        }

        Self {
            allowed_syscalls,
            exe_path_ptr: exe_path.as_ptr() as u64,
            pid: nix::unistd::getpid().as_raw(),
            tid: nix::unistd::gettid().as_raw(),
        }
    }

    /// Compile the policy into a BPF program without installing it.
    pub fn compile(&self) -> Result<BpfProgram> {
        let mut rules: BTreeMap<i64, Vec<SeccompRule>> = self
            .allowed_syscalls
            .iter()
            .map(|&nr| (nr, Vec::new()))
            .collect();

        rules.insert(
            libc::SYS_execve,
            vec![rule(vec![condition(
                0,
                SeccompCmpArgLen::Qword,
                SeccompCmpOp::Eq,
                self.exe_path_ptr,
            )?])?],
        );

        rules.insert(libc::SYS_rt_sigprocmask, Vec::new());
        rules.insert(
            libc::SYS_tgkill,
            vec![rule(vec![
                condition(0, SeccompCmpArgLen::Dword, SeccompCmpOp::Eq, self.pid as u64)?,
                condition(1, SeccompCmpArgLen::Dword, SeccompCmpOp::Eq, self.tid as u64)?,
            ])?],
        );

        #[cfg(target_arch = "x86_64")]
        rules.insert(libc::SYS_open, vec![read_only_open(1)?]);
        rules.insert(libc::SYS_openat, vec![read_only_open(2)?]);

        // new_limit must be NULL
        rules.insert(
            libc::SYS_prlimit64,
            vec![rule(vec![condition(2, SeccompCmpArgLen::Qword, SeccompCmpOp::Eq, 0)?])?],
        );
        rules.insert(
            libc::SYS_ioctl,
            vec![terminal_probe(libc::TCGETS as u64)?, terminal_probe(libc::TCGETS2 as u64)?],
        );

        let arch = TargetArch::try_from(std::env::consts::ARCH)
            .map_err(|e| ConfineError::Seccomp(format!("unsupported architecture: {e}")))?;

        let filter = SeccompFilter::new(
            rules,
            SeccompAction::KillProcess,
            SeccompAction::Allow,
            arch,
        )
        .map_err(|e| ConfineError::Seccomp(format!("failed to build filter: {e}")))?;

        BpfProgram::try_from(filter)
            .map_err(|e| ConfineError::Seccomp(format!("failed to compile filter: {e}")))
    }

    /// Compile and load the filter into the current process.
    ///
    /// Either the whole program is loaded or nothing is. Nothing that needs a
    /// syscall outside the allow-list may run after this returns `Ok`.
    pub fn apply(&self) -> Result<()> {
        let program = self.compile()?;

        tracing::debug!(
            syscalls = self.allowed_syscalls.len(),
            instructions = program.len(),
            "applying seccomp filter"
        );

        seccompiler::apply_filter(&program)
            .map_err(|e| ConfineError::Seccomp(format!("failed to load filter: {e}")))
    }
}

fn condition(arg: u8, len: SeccompCmpArgLen, op: SeccompCmpOp, value: u64) -> Result<SeccompCondition> {
    SeccompCondition::new(arg, len, op, value)
        .map_err(|e| ConfineError::Seccomp(format!("invalid condition on arg {arg}: {e}")))
}

fn rule(conditions: Vec<SeccompCondition>) -> Result<SeccompRule> {
    SeccompRule::new(conditions).map_err(|e| ConfineError::Seccomp(format!("invalid rule: {e}")))
}

/// Allow an open whose flags argument has neither write bit set.
fn read_only_open(flags_arg: u8) -> Result<SeccompRule> {
    rule(vec![condition(
        flags_arg,
        SeccompCmpArgLen::Dword,
        SeccompCmpOp::MaskedEq(WRITE_ACCESS),
        0,
    )?])
}

/// Allow an `ioctl` that only reads terminal attributes.
fn terminal_probe(request: u64) -> Result<SeccompRule> {
    rule(vec![condition(1, SeccompCmpArgLen::Dword, SeccompCmpOp::Eq, request)?])
}

/// Syscalls a dynamically linked program needs to start and do buffered I/O.
fn baseline_syscalls() -> Vec<i64> {
    let mut syscalls = vec![
        // stdio
        libc::SYS_read,
        libc::SYS_write,
        libc::SYS_readv,
        libc::SYS_writev,
        libc::SYS_pread64,
        libc::SYS_lseek,
        libc::SYS_close,
        libc::SYS_fstat,
        libc::SYS_newfstatat,
        libc::SYS_statx,
        libc::SYS_fadvise64,
        libc::SYS_copy_file_range,
        // memory
        libc::SYS_mmap,
        libc::SYS_mprotect,
        libc::SYS_munmap,
        libc::SYS_mremap,
        libc::SYS_madvise,
        libc::SYS_brk,
        // loader and libc startup
        libc::SYS_set_tid_address,
        libc::SYS_set_robust_list,
        libc::SYS_rseq,
        libc::SYS_getrandom,
        libc::SYS_uname,
        libc::SYS_sysinfo,
        libc::SYS_getpid,
        libc::SYS_gettid,
        // time
        libc::SYS_clock_gettime,
        libc::SYS_clock_nanosleep,
        libc::SYS_nanosleep,
        // signals and threads
        libc::SYS_futex,
        libc::SYS_rt_sigaction,
        libc::SYS_rt_sigreturn,
        libc::SYS_sigaltstack,
        libc::SYS_exit,
        libc::SYS_exit_group,
    ];

    #[cfg(target_arch = "x86_64")]
    syscalls.extend([libc::SYS_arch_prctl, libc::SYS_access, libc::SYS_readlink]);

    syscalls
}

/// Identity and process-tree queries, debug mode only.
fn debug_syscalls() -> Vec<i64> {
    vec![
        libc::SYS_getuid,
        libc::SYS_geteuid,
        libc::SYS_getgid,
        libc::SYS_getegid,
        libc::SYS_getppid,
    ]
}
