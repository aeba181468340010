//! confine CLI - run one program under confinement and report the verdict

use clap::{Args, Parser, Subcommand};
use confine_core::config::{self, DEFAULT_MAX_STACK, NOBODY, UNLIMITED};
use confine_core::{ErrorKind, IoMode, LimitConfig, Outcome, Report, Supervisor};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "confine")]
#[command(author, version, about = "Single-shot supervisor for untrusted judged programs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a program under limits and print its outcome as JSON
    Run(RunArgs),

    /// Sleep, then delete the given files
    Sweep {
        /// Seconds to wait before deleting
        seconds: u64,

        /// Files to delete
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Load the whole limit configuration from a JSON file (other flags are ignored)
    #[arg(long)]
    config: Option<PathBuf>,

    /// CPU time ceiling in milliseconds (-1 for unlimited)
    #[arg(long, default_value_t = UNLIMITED, allow_negative_numbers = true)]
    max_cpu_time: i64,

    /// Wall-clock ceiling in milliseconds (-1 for unlimited)
    #[arg(long, default_value_t = UNLIMITED, allow_negative_numbers = true)]
    max_real_time: i64,

    /// Address space ceiling in bytes (-1 for unlimited)
    #[arg(long, default_value_t = UNLIMITED, allow_negative_numbers = true)]
    max_memory: i64,

    /// Stack ceiling in bytes (-1 for unlimited)
    #[arg(long, default_value_t = DEFAULT_MAX_STACK as i64, allow_negative_numbers = true)]
    max_stack: i64,

    /// Process/thread count ceiling (-1 for unlimited)
    #[arg(long, default_value_t = UNLIMITED, allow_negative_numbers = true)]
    max_process_number: i64,

    /// Largest file the program may write, in bytes (-1 for unlimited)
    #[arg(long, default_value_t = UNLIMITED, allow_negative_numbers = true)]
    max_output_size: i64,

    /// Program to execute
    #[arg(long, required_unless_present = "config")]
    exe_path: Option<PathBuf>,

    /// File bound to the program's stdin
    #[arg(long, conflicts_with = "pipe")]
    input_path: Option<PathBuf>,

    /// File bound to the program's stdout
    #[arg(long, conflicts_with = "pipe")]
    output_path: Option<PathBuf>,

    /// File bound to the program's stderr
    #[arg(long, conflicts_with = "pipe")]
    error_path: Option<PathBuf>,

    /// Forward this process's stdio to the program through pipes
    #[arg(long)]
    pipe: bool,

    /// Argument passed to the program, argv[0] included (repeatable)
    #[arg(long = "arg", allow_hyphen_values = true)]
    args: Vec<String>,

    /// Environment entry as KEY=VALUE (repeatable)
    #[arg(long = "env")]
    env: Vec<String>,

    /// Supervisor log file (defaults to stderr)
    #[arg(long)]
    log_path: Option<PathBuf>,

    /// Where to write the JSON report (defaults to stderr)
    #[arg(long)]
    result_path: Option<PathBuf>,

    /// Uid to switch to with --drop-privileges
    #[arg(long, default_value_t = NOBODY)]
    uid: u32,

    /// Gid to switch to with --drop-privileges
    #[arg(long, default_value_t = NOBODY)]
    gid: u32,

    /// Switch to --uid/--gid before installing the syscall filter
    #[arg(long)]
    drop_privileges: bool,

    /// Widen the syscall allow-list for modern runtimes
    #[arg(long)]
    debug: bool,
}

impl RunArgs {
    fn into_config(self) -> Result<LimitConfig, Box<dyn std::error::Error>> {
        if let Some(path) = &self.config {
            let raw = fs::read_to_string(path)?;
            return Ok(serde_json::from_str(&raw)?);
        }

        let io = if self.pipe {
            IoMode::Pipes
        } else {
            IoMode::Files {
                input: self.input_path,
                output: self.output_path,
                error: self.error_path,
            }
        };

        let mut builder = LimitConfig::builder()
            .exe_path(self.exe_path.unwrap_or_default())
            .max_cpu_time(config::ceiling("max_cpu_time", self.max_cpu_time)?)
            .max_real_time(config::ceiling("max_real_time", self.max_real_time)?)
            .max_memory(config::ceiling("max_memory", self.max_memory)?)
            .max_stack(config::ceiling("max_stack", self.max_stack)?)
            .max_process_number(config::ceiling("max_process_number", self.max_process_number)?)
            .max_output_size(config::ceiling("max_output_size", self.max_output_size)?)
            .io(io)
            .identity(self.uid, self.gid)
            .drop_privileges(self.drop_privileges)
            .debug_mode(self.debug);

        for arg in self.args {
            builder = builder.arg(arg);
        }
        for entry in self.env {
            let (key, value) = entry
                .split_once('=')
                .ok_or_else(|| format!("environment entry without '=': {entry:?}"))?;
            builder = builder.env(key, value);
        }
        if let Some(path) = self.log_path {
            builder = builder.log_path(path);
        }
        if let Some(path) = self.result_path {
            builder = builder.result_path(path);
        }

        Ok(builder.build())
    }
}

fn init_logging(log_path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::from_default_env().add_directive("confine=info".parse()?);
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match log_path {
        Some(path) => {
            let file = fs::OpenOptions::new().create(true).append(true).open(path)?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

fn write_report(report: &Report, result_path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let json = report.to_json()?;
    match result_path {
        Some(path) => {
            let mut file = File::create(path)?;
            writeln!(file, "{json}")?;
        }
        None => eprintln!("{json}"),
    }
    Ok(())
}

fn run(args: RunArgs) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let config = match args.into_config() {
        Ok(config) => config,
        Err(e) => {
            init_logging(None)?;
            tracing::error!(error = %e, "invalid configuration");
            write_report(&Report::failed(ErrorKind::InvalidConfig), None)?;
            return Ok(ExitCode::FAILURE);
        }
    };

    init_logging(config.log_path.as_deref())?;

    let result = Supervisor::new().run(&config);
    if let Err(e) = &result {
        tracing::error!(error = %e, kind = e.kind().name(), "supervision failed");
    }

    write_report(&Report::from(&result), config.result_path.as_deref())?;

    if failed_before_launch(&result) {
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

/// Nonzero exit only when no child was ever started; everything else is in
/// the report.
fn failed_before_launch(result: &confine_core::Result<Outcome>) -> bool {
    matches!(result, Err(e) if e.is_pre_launch())
}

fn sweep(seconds: u64, files: &[PathBuf]) -> Result<ExitCode, Box<dyn std::error::Error>> {
    init_logging(None)?;
    std::thread::sleep(Duration::from_secs(seconds));

    for file in files {
        match fs::remove_file(file) {
            Ok(()) => tracing::debug!(path = ?file, "removed"),
            Err(e) => tracing::warn!(path = ?file, error = %e, "could not remove file"),
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run(args),
        Commands::Sweep { seconds, files } => sweep(seconds, &files),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> RunArgs {
        let cli = Cli::try_parse_from(argv).unwrap();
        match cli.command {
            Commands::Run(args) => args,
            Commands::Sweep { .. } => panic!("expected run"),
        }
    }

    #[test]
    fn flags_build_a_config() {
        let config = parse(&[
            "confine", "run", "--exe-path", "/bin/cat", "--max-cpu-time", "1500",
            "--max-real-time", "-1", "--arg", "cat", "--arg", "-n", "--env", "A=b=c",
            "--output-path", "/tmp/out",
        ])
        .into_config()
        .unwrap();

        assert_eq!(config.exe_path, PathBuf::from("/bin/cat"));
        assert_eq!(config.max_cpu_time, Some(1500));
        assert_eq!(config.max_real_time, None);
        assert_eq!(config.max_stack, Some(DEFAULT_MAX_STACK));
        assert_eq!(config.args, ["cat", "-n"]);
        assert_eq!(config.env, ["A=b=c"]);
        assert!(!config.is_pipe_mode());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn pipe_flag_selects_pipe_mode() {
        let config = parse(&["confine", "run", "--exe-path", "/bin/cat", "--pipe"])
            .into_config()
            .unwrap();
        assert!(config.is_pipe_mode());
    }

    #[test]
    fn pipe_conflicts_with_file_paths() {
        let parsed = Cli::try_parse_from([
            "confine", "run", "--exe-path", "/bin/cat", "--pipe", "--input-path", "/tmp/in",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn bad_sentinel_is_rejected() {
        let parsed = parse(&["confine", "run", "--exe-path", "/bin/cat", "--max-memory", "-5"]);
        assert!(parsed.into_config().is_err());
    }

    #[test]
    fn env_without_separator_is_rejected() {
        let parsed = parse(&["confine", "run", "--exe-path", "/bin/cat", "--env", "NOPE"]);
        assert!(parsed.into_config().is_err());
    }

    #[test]
    fn config_file_is_loaded() {
        let dir = std::env::temp_dir().join(format!("confine-cli-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("limits.json");
        fs::write(&path, r#"{"exe_path":"/bin/true","max_real_time":2000,"io":"pipes"}"#).unwrap();

        let config = parse(&["confine", "run", "--config", path.to_str().unwrap()])
            .into_config()
            .unwrap();
        assert_eq!(config.exe_path, PathBuf::from("/bin/true"));
        assert_eq!(config.max_real_time, Some(2000));
        assert!(config.is_pipe_mode());

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn only_pre_launch_failures_fail_the_invocation() {
        use confine_core::ConfineError;

        assert!(failed_before_launch(&Err(ConfineError::Config("x".into()))));
        assert!(failed_before_launch(&Err(ConfineError::Redirect {
            stream: "pipe",
            source: std::io::Error::other("out of descriptors"),
        })));
        assert!(!failed_before_launch(&Err(ConfineError::Forward {
            stream: "stdout",
            source: std::io::Error::other("closed"),
        })));
        assert!(!failed_before_launch(&Err(ConfineError::Thread {
            what: "watchdog",
            source: std::io::Error::other("no threads"),
        })));
    }

    #[test]
    fn sweep_needs_files() {
        assert!(Cli::try_parse_from(["confine", "sweep", "5"]).is_err());
    }
}
