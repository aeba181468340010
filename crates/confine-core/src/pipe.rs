//! Standard stream plumbing between the supervisor and the confined child
//!
//! File mode binds named files onto the child's stdin/stdout/stderr. Pipe mode
//! connects three pipes: the parent forwards caller input into the child's
//! stdin and copies the child's stdout/stderr back to the caller.

use crate::{ConfineError, IoMode, Result};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

const BUF_SIZE: usize = 64 * 1024;

/// Caller-side streams forwarded in pipe mode.
pub struct CallerStreams {
    /// Read by the supervisor, written into the child's stdin
    pub input: File,
    /// Receives the child's stdout
    pub output: Box<dyn Write + Send>,
    /// Receives the child's stderr
    pub error: Box<dyn Write + Send>,
}

impl CallerStreams {
    /// Forward the supervisor's own standard streams.
    pub fn inherit() -> Result<Self> {
        let input = io::stdin().as_fd().try_clone_to_owned()?;
        Ok(Self {
            input: File::from(input),
            output: Box::new(io::stdout()),
            error: Box::new(io::stderr()),
        })
    }
}

impl std::fmt::Debug for CallerStreams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallerStreams")
            .field("input", &self.input)
            .finish_non_exhaustive()
    }
}

/// Three pipes for the child's standard streams
#[derive(Debug)]
pub struct StdioPipes {
    pub stdin_rx: File,
    pub stdin_tx: File,
    pub stdout_rx: File,
    pub stdout_tx: File,
    pub stderr_rx: File,
    pub stderr_tx: File,
}

impl StdioPipes {
    pub fn new() -> Result<Self> {
        let (stdin_rx, stdin_tx) = create_pipe()?;
        let (stdout_rx, stdout_tx) = create_pipe()?;
        let (stderr_rx, stderr_tx) = create_pipe()?;

        Ok(Self {
            stdin_rx,
            stdin_tx,
            stdout_rx,
            stdout_tx,
            stderr_rx,
            stderr_tx,
        })
    }

    /// Split into the supervisor's ends and the child's ends
    #[must_use]
    pub fn split(self) -> (ParentPipes, ChildPipes) {
        let parent = ParentPipes {
            stdin_tx: self.stdin_tx,
            stdout_rx: self.stdout_rx,
            stderr_rx: self.stderr_rx,
        };

        let child = ChildPipes {
            stdin_rx: self.stdin_rx,
            stdout_tx: self.stdout_tx,
            stderr_tx: self.stderr_tx,
        };

        (parent, child)
    }
}

/// Supervisor end of the stdio pipes
#[derive(Debug)]
pub struct ParentPipes {
    pub stdin_tx: File,
    pub stdout_rx: File,
    pub stderr_rx: File,
}

/// Child end of the stdio pipes
#[derive(Debug)]
pub struct ChildPipes {
    stdin_rx: File,
    stdout_tx: File,
    stderr_tx: File,
}

/// Whatever the child binds onto fds 0, 1 and 2.
#[derive(Debug)]
pub enum ChildStdio {
    Files {
        input: Option<PathBuf>,
        output: Option<PathBuf>,
        error: Option<PathBuf>,
    },
    Pipes(ChildPipes),
}

impl ChildStdio {
    /// Prepare the child side for `mode`, returning the supervisor's pipe
    /// ends in pipe mode.
    pub fn for_mode(mode: &IoMode) -> Result<(Self, Option<ParentPipes>)> {
        match mode {
            IoMode::Files {
                input,
                output,
                error,
            } => Ok((
                Self::Files {
                    input: input.clone(),
                    output: output.clone(),
                    error: error.clone(),
                },
                None,
            )),
            IoMode::Pipes => {
                let (parent, child) = StdioPipes::new()?.split();
                Ok((Self::Pipes(child), Some(parent)))
            }
        }
    }

    /// Bind onto the standard fds. Runs in the child; every handle opened
    /// here is closed again when this returns, on success or failure.
    pub fn bind(self) -> Result<()> {
        match self {
            Self::Files {
                input,
                output,
                error,
            } => {
                if let Some(path) = input {
                    let file = File::open(&path).map_err(redirect("stdin"))?;
                    bind_fd(file.into(), libc::STDIN_FILENO, "stdin")?;
                }
                if let Some(path) = output {
                    bind_fd(create_output(&path, "stdout")?, libc::STDOUT_FILENO, "stdout")?;
                }
                if let Some(path) = error {
                    bind_fd(create_output(&path, "stderr")?, libc::STDERR_FILENO, "stderr")?;
                }
            }
            Self::Pipes(pipes) => {
                bind_fd(pipes.stdin_rx.into(), libc::STDIN_FILENO, "stdin")?;
                bind_fd(pipes.stdout_tx.into(), libc::STDOUT_FILENO, "stdout")?;
                bind_fd(pipes.stderr_tx.into(), libc::STDERR_FILENO, "stderr")?;
            }
        }

        tracing::debug!("io redirect finished");
        Ok(())
    }
}

fn redirect(stream: &'static str) -> impl FnOnce(io::Error) -> ConfineError {
    move |source| ConfineError::Redirect { stream, source }
}

fn create_output(path: &Path, stream: &'static str) -> Result<OwnedFd> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o644)
        .open(path)
        .map(OwnedFd::from)
        .map_err(redirect(stream))
}

/// Duplicate `fd` onto `target` without close-on-exec, then drop the original.
fn bind_fd(fd: OwnedFd, target: RawFd, stream: &'static str) -> Result<()> {
    if fd.as_raw_fd() == target {
        // Already in place: keep it open and let it survive exec.
        let raw = fd.into_raw_fd();
        // SAFETY: raw is a valid open descriptor we own
        if unsafe { libc::fcntl(raw, libc::F_SETFD, 0) } == -1 {
            return Err(redirect(stream)(io::Error::last_os_error()));
        }
        return Ok(());
    }

    // SAFETY: both descriptors are valid; dup2 clears FD_CLOEXEC on target
    if unsafe { libc::dup2(fd.as_raw_fd(), target) } == -1 {
        return Err(redirect(stream)(io::Error::last_os_error()));
    }
    Ok(())
}

/// Create a pipe (returns read end, write end)
fn create_pipe() -> Result<(File, File)> {
    let mut fds = [0i32; 2];

    // SAFETY: pipe2 syscall
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };

    if ret != 0 {
        return Err(redirect("pipe")(io::Error::last_os_error()));
    }

    // SAFETY: We just created these file descriptors
    let read_end = unsafe { File::from_raw_fd(fds[0]) };
    let write_end = unsafe { File::from_raw_fd(fds[1]) };

    Ok((read_end, write_end))
}

fn set_nonblocking(file: &File) -> io::Result<()> {
    let fd = file.as_raw_fd();
    // SAFETY: fd is a valid open descriptor owned by `file`
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags == -1 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Copy `src` into `dst` until end of stream.
pub fn forward(mut src: impl Read, mut dst: impl Write, stream: &'static str) -> Result<u64> {
    let mut buf = vec![0u8; BUF_SIZE];
    let mut total = 0u64;

    loop {
        let n = match src.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(source) => return Err(ConfineError::Forward { stream, source }),
        };

        dst.write_all(&buf[..n])
            .and_then(|()| dst.flush())
            .map_err(|source| ConfineError::Forward { stream, source })?;
        total += n as u64;
    }

    Ok(total)
}

/// Run [`forward`] on its own thread. A forwarding error kills `child`.
pub fn spawn_forwarder(
    stream: &'static str,
    src: File,
    dst: Box<dyn Write + Send>,
    child: Pid,
) -> Result<JoinHandle<Result<u64>>> {
    thread::Builder::new()
        .name(format!("confine-{stream}"))
        .spawn(move || {
            let result = forward(src, dst, stream);
            match &result {
                Ok(bytes) => tracing::debug!(stream, bytes, "forwarder finished"),
                Err(e) => {
                    tracing::error!(stream, error = %e, "forwarding failed, killing child");
                    let _ = kill(child, Signal::SIGKILL);
                }
            }
            result
        })
        .map_err(|source| ConfineError::Thread {
            what: "forwarder",
            source,
        })
}

/// Moves caller input into the child's stdin without ever blocking on it.
///
/// Driven by the monitor between non-blocking reaps: each [`InputPump::step`]
/// waits at most `timeout_ms` for the caller input to become readable or the
/// child's stdin to become writable.
#[derive(Debug)]
pub struct InputPump {
    source: File,
    sink: Option<File>,
    pending: Vec<u8>,
    offset: usize,
}

impl InputPump {
    pub fn new(source: File, sink: File) -> Result<Self> {
        set_nonblocking(&sink).map_err(|source| ConfineError::Forward {
            stream: "stdin",
            source,
        })?;

        Ok(Self {
            source,
            sink: Some(sink),
            pending: Vec::new(),
            offset: 0,
        })
    }

    /// Caller input is exhausted and the child's stdin has been closed.
    #[must_use]
    pub const fn is_done(&self) -> bool {
        self.sink.is_none()
    }

    pub fn step(&mut self, timeout_ms: u16) -> Result<()> {
        let Some(sink) = self.sink.as_ref() else {
            return Ok(());
        };

        let has_pending = self.offset < self.pending.len();
        let (fd, events) = if has_pending {
            (sink.as_fd(), PollFlags::POLLOUT)
        } else {
            (self.source.as_fd(), PollFlags::POLLIN)
        };

        let mut fds = [PollFd::new(fd, events)];
        match poll(&mut fds, PollTimeout::from(timeout_ms)) {
            Ok(0) | Err(nix::Error::EINTR) => return Ok(()),
            Ok(_) => {}
            Err(e) => return Err(forward_error(io::Error::from(e))),
        }

        if !has_pending {
            self.fill()?;
        }
        self.flush()
    }

    fn fill(&mut self) -> Result<()> {
        self.pending.resize(BUF_SIZE, 0);
        self.offset = 0;

        loop {
            match self.source.read(&mut self.pending) {
                Ok(0) => {
                    self.pending.clear();
                    self.close_sink();
                    return Ok(());
                }
                Ok(n) => {
                    self.pending.truncate(n);
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.pending.clear();
                    return Ok(());
                }
                Err(e) => return Err(forward_error(e)),
            }
        }
    }

    fn flush(&mut self) -> Result<()> {
        while self.offset < self.pending.len() {
            let Some(sink) = self.sink.as_mut() else {
                return Ok(());
            };

            match sink.write(&self.pending[self.offset..]) {
                Ok(n) => self.offset += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    tracing::debug!("child closed stdin, discarding remaining input");
                    self.close_sink();
                }
                Err(e) => return Err(forward_error(e)),
            }
        }

        self.pending.clear();
        self.offset = 0;
        Ok(())
    }

    fn close_sink(&mut self) {
        if self.sink.take().is_some() {
            tracing::debug!("caller input exhausted, closed child stdin");
        }
        self.pending.clear();
        self.offset = 0;
    }
}

const fn forward_error(source: io::Error) -> ConfineError {
    ConfineError::Forward {
        stream: "stdin",
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct FailingWriter;

    impl Write for FailingWriter {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::other("caller went away"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn forward_copies_until_eof() {
        let (rx, mut tx) = create_pipe().unwrap();
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();

        let writer = {
            let payload = payload.clone();
            thread::spawn(move || tx.write_all(&payload))
        };

        let out = SharedBuf::default();
        let copied = forward(rx, out.clone(), "stdout").unwrap();
        writer.join().unwrap().unwrap();

        assert_eq!(copied, payload.len() as u64);
        assert_eq!(*out.0.lock().unwrap(), payload);
    }

    #[test]
    fn forward_reports_writer_failure() {
        let (rx, mut tx) = create_pipe().unwrap();
        tx.write_all(b"hello").unwrap();
        drop(tx);

        let err = forward(rx, FailingWriter, "stderr").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ForwardIoFailed);
    }

    #[test]
    fn pump_delivers_input_in_order_and_closes_on_eof() {
        let (caller_rx, mut caller_tx) = create_pipe().unwrap();
        let (child_rx, child_tx) = create_pipe().unwrap();

        caller_tx.write_all(b"first line\nsecond line\n").unwrap();
        drop(caller_tx);

        let mut pump = InputPump::new(caller_rx, child_tx).unwrap();
        for _ in 0..16 {
            if pump.is_done() {
                break;
            }
            pump.step(50).unwrap();
        }
        assert!(pump.is_done());

        let mut received = Vec::new();
        let mut child_rx = child_rx;
        child_rx.read_to_end(&mut received).unwrap();
        assert_eq!(received, b"first line\nsecond line\n");
    }

    #[test]
    fn pump_keeps_bytes_pending_when_child_is_not_reading() {
        let (caller_rx, mut caller_tx) = create_pipe().unwrap();
        let (mut child_rx, child_tx) = create_pipe().unwrap();

        let payload: Vec<u8> = (0..300_000u32).map(|i| (i % 253) as u8).collect();
        let feeder = {
            let payload = payload.clone();
            thread::spawn(move || caller_tx.write_all(&payload))
        };

        let mut pump = InputPump::new(caller_rx, child_tx).unwrap();
        let reader = thread::spawn(move || {
            let mut received = Vec::new();
            child_rx.read_to_end(&mut received).map(|_| received)
        });

        while !pump.is_done() {
            pump.step(20).unwrap();
        }
        feeder.join().unwrap().unwrap();

        assert_eq!(reader.join().unwrap().unwrap(), payload);
    }

    #[test]
    fn pump_treats_closed_child_stdin_as_end_of_input() {
        let (caller_rx, mut caller_tx) = create_pipe().unwrap();
        let (child_rx, child_tx) = create_pipe().unwrap();
        drop(child_rx);

        caller_tx.write_all(b"nobody listens").unwrap();

        let mut pump = InputPump::new(caller_rx, child_tx).unwrap();
        pump.step(50).unwrap();
        assert!(pump.is_done());
    }

    #[test]
    fn split_hands_out_opposite_ends() {
        let (mut parent, child) = StdioPipes::new().unwrap().split();
        let ChildPipes {
            mut stdin_rx,
            mut stdout_tx,
            ..
        } = child;

        parent.stdin_tx.write_all(b"in").unwrap();
        let mut buf = [0u8; 2];
        stdin_rx.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"in");

        stdout_tx.write_all(b"out").unwrap();
        let mut buf = [0u8; 3];
        parent.stdout_rx.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"out");
    }
}
