//! Handles to supervised processes.

#![allow(unsafe_code)]

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use kennel_common::{KennelError, KennelResult, ProcessDir};
use kennel_oci::TtySize;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;

use super::pidfile::{self, PidFileReader};
use crate::notify;

/// How long [`Process::wait`] lets output streams drain after exit.
pub const STREAM_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle of one process. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Plumbing exists; nothing launched.
    Created,
    /// Supervisor started, launch status pending.
    Launching,
    /// The runtime launched the process.
    Running,
    /// Exit code known.
    Exited(i32),
}

impl ProcessState {
    const fn rank(self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Launching => 1,
            Self::Running => 2,
            Self::Exited(_) => 3,
        }
    }

    /// Move to `next` if it comes later in the lifecycle. Returns whether
    /// the state changed.
    pub fn advance(&mut self, next: Self) -> bool {
        if next.rank() <= self.rank() {
            return false;
        }
        *self = next;
        true
    }
}

/// Signals a process can be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// `SIGHUP`
    Hangup,
    /// `SIGINT`
    Interrupt,
    /// `SIGQUIT`
    Quit,
    /// `SIGKILL`
    Kill,
    /// `SIGUSR1`
    User1,
    /// `SIGUSR2`
    User2,
    /// `SIGTERM`
    Terminate,
}

impl Signal {
    /// Signal number.
    #[must_use]
    pub const fn as_raw(self) -> i32 {
        match self {
            Self::Hangup => libc::SIGHUP,
            Self::Interrupt => libc::SIGINT,
            Self::Quit => libc::SIGQUIT,
            Self::Kill => libc::SIGKILL,
            Self::User1 => libc::SIGUSR1,
            Self::User2 => libc::SIGUSR2,
            Self::Terminate => libc::SIGTERM,
        }
    }

    /// Name without the `SIG` prefix, as runtimes expect it.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Hangup => "HUP",
            Self::Interrupt => "INT",
            Self::Quit => "QUIT",
            Self::Kill => "KILL",
            Self::User1 => "USR1",
            Self::User2 => "USR2",
            Self::Terminate => "TERM",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIG{}", self.name())
    }
}

impl FromStr for Signal {
    type Err = KennelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_ascii_uppercase();
        let name = upper.strip_prefix("SIG").unwrap_or(&upper);
        Ok(match name {
            "HUP" | "1" => Self::Hangup,
            "INT" | "2" => Self::Interrupt,
            "QUIT" | "3" => Self::Quit,
            "KILL" | "9" => Self::Kill,
            "USR1" | "10" => Self::User1,
            "USR2" | "12" => Self::User2,
            "TERM" | "15" => Self::Terminate,
            _ => {
                return Err(KennelError::Config {
                    message: format!("unknown signal {s:?}"),
                });
            }
        })
    }
}

/// Caller-side stdio of a process. Absent streams are closed (stdin) or
/// discarded (stdout/stderr).
#[derive(Default)]
pub struct ProcessIo {
    /// Copied into the process's stdin; EOF closes it.
    pub stdin: Option<Box<dyn AsyncRead + Send + Unpin>>,
    /// Receives the process's stdout.
    pub stdout: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    /// Receives the process's stderr.
    pub stderr: Option<Box<dyn AsyncWrite + Send + Unpin>>,
}

impl ProcessIo {
    /// Feed `reader` to stdin.
    #[must_use]
    pub fn with_stdin(mut self, reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        self.stdin = Some(Box::new(reader));
        self
    }

    /// Send stdout to `writer`.
    #[must_use]
    pub fn with_stdout(mut self, writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.stdout = Some(Box::new(writer));
        self
    }

    /// Send stderr to `writer`.
    #[must_use]
    pub fn with_stderr(mut self, writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.stderr = Some(Box::new(writer));
        self
    }
}

impl fmt::Debug for ProcessIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessIo")
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish()
    }
}

#[derive(Debug)]
struct Inner {
    dir: ProcessDir,
    pidfile: PidFileReader,
    supervisor: Option<watch::Receiver<Option<i32>>>,
    drained: watch::Receiver<bool>,
    winsz: Mutex<Option<File>>,
    state: Mutex<ProcessState>,
}

/// A launched (or re-attached) process. Clones share state.
#[derive(Debug, Clone)]
pub struct Process {
    inner: Arc<Inner>,
}

impl Process {
    /// Handle for a process whose launch just succeeded. `state` is where
    /// the launch left off; it moves on to [`ProcessState::Running`].
    pub(crate) fn running(
        dir: ProcessDir,
        pidfile: PidFileReader,
        mut state: ProcessState,
        supervisor: watch::Receiver<Option<i32>>,
        drained: watch::Receiver<bool>,
        winsz: File,
    ) -> Self {
        state.advance(ProcessState::Running);
        Self::build(dir, pidfile, state, Some(supervisor), drained, Some(winsz))
    }

    pub(crate) fn attached(dir: ProcessDir, pidfile: PidFileReader) -> Self {
        let (_, drained) = watch::channel(true);
        let state = read_exitcode(&dir).map_or(ProcessState::Running, ProcessState::Exited);
        Self::build(dir, pidfile, state, None, drained, None)
    }

    fn build(
        dir: ProcessDir,
        pidfile: PidFileReader,
        state: ProcessState,
        supervisor: Option<watch::Receiver<Option<i32>>>,
        drained: watch::Receiver<bool>,
        winsz: Option<File>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                dir,
                pidfile,
                supervisor,
                drained,
                winsz: Mutex::new(winsz),
                state: Mutex::new(state),
            }),
        }
    }

    /// Process identifier (the handle for init processes).
    #[must_use]
    pub fn id(&self) -> &str {
        self.inner.dir.id()
    }

    /// Process directory.
    #[must_use]
    pub fn dir(&self) -> &ProcessDir {
        &self.inner.dir
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ProcessState {
        *self.inner.state.lock()
    }

    /// Pid from the pidfile, if it has been written.
    #[must_use]
    pub fn pid(&self) -> Option<i32> {
        pidfile::try_read(&self.inner.dir.pidfile())
    }

    /// Wait for the process to exit and return its exit code.
    ///
    /// Any number of callers may wait concurrently. Output streams get
    /// [`STREAM_DRAIN_TIMEOUT`] to finish after the exit.
    ///
    /// # Errors
    ///
    /// Returns an error if the exit socket cannot be reached, or
    /// [`KennelError::ProcessNotFound`] if no exit code was recorded and no
    /// supervisor status is available.
    pub async fn wait(&self) -> KennelResult<i32> {
        if let ProcessState::Exited(code) = self.state() {
            return Ok(code);
        }

        notify::wait(&self.inner.dir.exit_socket()).await?;

        let code = match read_exitcode(&self.inner.dir) {
            Some(code) => code,
            None => self.supervisor_exit().await.ok_or_else(|| KennelError::ProcessNotFound {
                id: self.id().to_string(),
            })?,
        };

        let mut drained = self.inner.drained.clone();
        if tokio::time::timeout(STREAM_DRAIN_TIMEOUT, drained.wait_for(|done| *done))
            .await
            .is_err()
        {
            tracing::warn!(id = self.id(), "Output streams still open after exit");
        }

        self.inner.state.lock().advance(ProcessState::Exited(code));
        tracing::debug!(id = self.id(), code, "Process exited");
        Ok(code)
    }

    /// Exit status of the supervisor, once it has been reaped.
    pub async fn supervisor_exit(&self) -> Option<i32> {
        let mut status = self.inner.supervisor.clone()?;
        let code = *status.wait_for(Option::is_some).await.ok()?;
        code
    }

    /// Whether the process is known to have exited, so its pid may already
    /// belong to someone else.
    fn has_exited(&self) -> bool {
        if matches!(self.state(), ProcessState::Exited(_)) {
            return true;
        }
        if let Some(code) = read_exitcode(&self.inner.dir) {
            self.inner.state.lock().advance(ProcessState::Exited(code));
            return true;
        }
        self.inner
            .supervisor
            .as_ref()
            .is_some_and(|status| status.borrow().is_some())
    }

    /// Send `signal` to the process.
    ///
    /// # Errors
    ///
    /// Returns [`KennelError::ProcessNotFound`] once the process has exited,
    /// [`KennelError::PidFileTimeout`] if the pid never becomes known, or the
    /// `kill` error.
    pub async fn signal(&self, signal: Signal) -> KennelResult<()> {
        if self.has_exited() {
            return Err(KennelError::ProcessNotFound {
                id: self.id().to_string(),
            });
        }
        let pid = self.inner.pidfile.read(&self.inner.dir.pidfile()).await?;
        if self.has_exited() {
            return Err(KennelError::ProcessNotFound {
                id: self.id().to_string(),
            });
        }
        if unsafe { libc::kill(pid, signal.as_raw()) } < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Err(KennelError::ProcessNotFound { id: pid.to_string() });
            }
            return Err(err.into());
        }
        tracing::debug!(id = self.id(), pid, %signal, "Signaled process");
        Ok(())
    }

    /// Resize the process's terminal.
    ///
    /// # Errors
    ///
    /// Returns an error if the control FIFO has no reader or cannot be
    /// written.
    pub fn set_tty(&self, size: TtySize) -> KennelResult<()> {
        let mut line = serde_json::to_vec(&size)?;
        line.push(b'\n');

        let mut winsz = self.inner.winsz.lock();
        if winsz.is_none() {
            let control = OpenOptions::new()
                .write(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(self.inner.dir.winsz())?;
            *winsz = Some(control);
        }
        if let Some(control) = winsz.as_mut() {
            control.write_all(&line)?;
        }
        Ok(())
    }
}

fn read_exitcode(dir: &ProcessDir) -> Option<i32> {
    std::fs::read_to_string(dir.exitcode()).ok()?.trim().parse().ok()
}
