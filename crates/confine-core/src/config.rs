//! Limit configuration

use crate::{ConfineError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Legacy numeric sentinel meaning "no ceiling".
pub const UNLIMITED: i64 = -1;

/// Default stack ceiling (16 MiB).
pub const DEFAULT_MAX_STACK: u64 = 16 * 1024 * 1024;

/// Default identity for privilege drop (`nobody`).
pub const NOBODY: u32 = 65534;

/// How the child's standard streams are connected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoMode {
    /// Bind stdin/stdout/stderr to named files. `None` inherits the
    /// supervisor's stream.
    Files {
        input: Option<PathBuf>,
        output: Option<PathBuf>,
        error: Option<PathBuf>,
    },
    /// Connect pipes and forward the caller's streams.
    Pipes,
}

impl Default for IoMode {
    fn default() -> Self {
        Self::Files {
            input: None,
            output: None,
            error: None,
        }
    }
}

/// Ceilings, paths and exec parameters for one invocation.
///
/// Every ceiling is `None` for unlimited, otherwise a strictly positive value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitConfig {
    /// CPU time ceiling in milliseconds
    pub max_cpu_time: Option<u64>,

    /// Wall-clock ceiling in milliseconds
    pub max_real_time: Option<u64>,

    /// Address space / peak memory ceiling in bytes
    pub max_memory: Option<u64>,

    /// Stack ceiling in bytes
    pub max_stack: Option<u64>,

    /// Maximum number of processes/threads for the child's user
    pub max_process_number: Option<u64>,

    /// Largest file the child may write, in bytes
    pub max_output_size: Option<u64>,

    /// Program to execute; the only path exec is allowed for
    pub exe_path: PathBuf,

    pub io: IoMode,

    /// argv, passed verbatim (including argv[0])
    pub args: Vec<String>,

    /// envp entries in `KEY=VALUE` form
    pub env: Vec<String>,

    pub log_path: Option<PathBuf>,

    pub result_path: Option<PathBuf>,

    pub uid: u32,

    pub gid: u32,

    /// Switch to `uid`/`gid` before the filter is installed
    pub drop_privileges: bool,

    /// Widen the syscall allow-list. Never for untrusted production runs.
    pub debug_mode: bool,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            max_cpu_time: None,
            max_real_time: None,
            max_memory: None,
            max_stack: Some(DEFAULT_MAX_STACK),
            max_process_number: None,
            max_output_size: None,
            exe_path: PathBuf::new(),
            io: IoMode::default(),
            args: Vec::new(),
            env: Vec::new(),
            log_path: None,
            result_path: None,
            uid: NOBODY,
            gid: NOBODY,
            drop_privileges: false,
            debug_mode: false,
        }
    }
}

impl LimitConfig {
    /// Create a new config builder
    #[must_use]
    pub fn builder() -> LimitConfigBuilder {
        LimitConfigBuilder::default()
    }

    /// Check the invariants that must hold before any process is created.
    pub fn validate(&self) -> Result<()> {
        if self.exe_path.as_os_str().is_empty() {
            return Err(ConfineError::Config("executable path is not specified".into()));
        }

        for (name, ceiling) in self.ceilings() {
            if ceiling == Some(0) {
                return Err(ConfineError::Config(format!(
                    "{name} must be positive or unlimited"
                )));
            }
        }

        if let Some(arg) = self.args.iter().chain(&self.env).find(|s| s.contains('\0')) {
            return Err(ConfineError::Config(format!(
                "argument contains a NUL byte: {arg:?}"
            )));
        }

        Ok(())
    }

    fn ceilings(&self) -> [(&'static str, Option<u64>); 6] {
        [
            ("max_cpu_time", self.max_cpu_time),
            ("max_real_time", self.max_real_time),
            ("max_memory", self.max_memory),
            ("max_stack", self.max_stack),
            ("max_process_number", self.max_process_number),
            ("max_output_size", self.max_output_size),
        ]
    }

    #[must_use]
    pub const fn is_pipe_mode(&self) -> bool {
        matches!(self.io, IoMode::Pipes)
    }
}

/// Convert a legacy signed ceiling (`-1` = unlimited) into the typed form.
pub fn ceiling(name: &str, raw: i64) -> Result<Option<u64>> {
    match raw {
        UNLIMITED => Ok(None),
        n if n > 0 => Ok(Some(n.unsigned_abs())),
        n => Err(ConfineError::Config(format!(
            "{name} must be positive or {UNLIMITED}, got {n}"
        ))),
    }
}

/// Builder for `LimitConfig`
#[derive(Debug, Default)]
pub struct LimitConfigBuilder {
    config: LimitConfig,
}

impl LimitConfigBuilder {
    #[must_use]
    pub fn exe_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.exe_path = path.into();
        self
    }

    #[must_use]
    pub const fn max_cpu_time(mut self, ms: Option<u64>) -> Self {
        self.config.max_cpu_time = ms;
        self
    }

    #[must_use]
    pub const fn max_real_time(mut self, ms: Option<u64>) -> Self {
        self.config.max_real_time = ms;
        self
    }

    #[must_use]
    pub const fn max_memory(mut self, bytes: Option<u64>) -> Self {
        self.config.max_memory = bytes;
        self
    }

    #[must_use]
    pub const fn max_stack(mut self, bytes: Option<u64>) -> Self {
        self.config.max_stack = bytes;
        self
    }

    #[must_use]
    pub const fn max_process_number(mut self, n: Option<u64>) -> Self {
        self.config.max_process_number = n;
        self
    }

    #[must_use]
    pub const fn max_output_size(mut self, bytes: Option<u64>) -> Self {
        self.config.max_output_size = bytes;
        self
    }

    /// Clear every ceiling, including the default stack limit.
    #[must_use]
    pub const fn unlimited(self) -> Self {
        self.max_cpu_time(None)
            .max_real_time(None)
            .max_memory(None)
            .max_stack(None)
            .max_process_number(None)
            .max_output_size(None)
    }

    #[must_use]
    pub fn io(mut self, io: IoMode) -> Self {
        self.config.io = io;
        self
    }

    #[must_use]
    pub fn pipes(self) -> Self {
        self.io(IoMode::Pipes)
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.config.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.config
            .env
            .push(format!("{}={}", key.as_ref(), value.as_ref()));
        self
    }

    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.log_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn result_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.result_path = Some(path.into());
        self
    }

    #[must_use]
    pub const fn identity(mut self, uid: u32, gid: u32) -> Self {
        self.config.uid = uid;
        self.config.gid = gid;
        self
    }

    #[must_use]
    pub const fn drop_privileges(mut self, enabled: bool) -> Self {
        self.config.drop_privileges = enabled;
        self
    }

    #[must_use]
    pub const fn debug_mode(mut self, enabled: bool) -> Self {
        self.config.debug_mode = enabled;
        self
    }

    #[must_use]
    pub fn build(self) -> LimitConfig {
        self.config
    }
}
