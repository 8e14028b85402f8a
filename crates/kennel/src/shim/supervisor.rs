//! The supervision flow: launch through the runtime, then outlive the
//! process and report how it ended.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread::JoinHandle;
use std::time::Duration;

use kennel_common::{KennelError, ProcessDir};
use kennel_oci::RuntimeCli;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::oneshot;

use super::args::{Mode, ShimArgs};
use super::console::{self, ConsoleSocket};
use super::reaper::{self, Reaper, SystemWaiter};
use super::status::{SPAWN_FAILED, StatusWriter};
use crate::notify::ExitNotifier;

/// Supervisor exit code when the runtime itself failed.
pub const EXIT_RUNTIME_FAILED: i32 = 3;
/// Supervisor exit code when the process could not be tracked.
pub const EXIT_UNTRACKABLE: i32 = 255;
/// How long terminal output may keep flowing after the process exits.
pub const CONSOLE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Why supervision ended without a process exit code.
#[derive(Debug, Error)]
pub enum ShimError {
    /// Something the runtime needs could not be prepared.
    #[error("setup failed: {0}")]
    Setup(#[from] KennelError),

    /// The runtime binary could not be started.
    #[error("failed to start runtime {}: {source}", runtime.display())]
    Spawn {
        /// Runtime binary.
        runtime: PathBuf,
        /// Spawn error.
        #[source]
        source: io::Error,
    },

    /// The runtime ran and failed.
    #[error("runtime exited with status {0}")]
    RuntimeFailed(i32),

    /// The runtime succeeded but left no usable pidfile.
    #[error("failed to read pidfile {}: {reason}", path.display())]
    Pidfile {
        /// Pidfile location.
        path: PathBuf,
        /// What was wrong with it.
        reason: String,
    },

    /// Reaping children failed.
    #[error("reaping failed: {0}")]
    Reap(#[source] io::Error),
}

impl ShimError {
    /// Exit code of the supervisor process.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Setup(_) | Self::Spawn { .. } => SPAWN_FAILED as i32,
            Self::RuntimeFailed(_) => EXIT_RUNTIME_FAILED,
            Self::Pidfile { .. } | Self::Reap(_) => EXIT_UNTRACKABLE,
        }
    }

    /// Status byte still owed to the launcher, if any.
    #[must_use]
    pub const fn status_byte(&self) -> Option<u8> {
        match self {
            Self::Setup(_) | Self::Spawn { .. } => Some(SPAWN_FAILED),
            _ => None,
        }
    }
}

/// Supervise `args` to completion and return the supervisor's exit code.
///
/// Must run on a Tokio runtime owned by this process; every child is
/// reaped here, so nothing else may wait on children.
pub async fn supervise(args: ShimArgs, mut status: StatusWriter) -> i32 {
    match run(&args, &mut status).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, container = %args.container_id, "Supervision failed");
            if let Some(byte) = e.status_byte() {
                status.send(byte);
            }
            e.exit_code()
        }
    }
}

async fn run(args: &ShimArgs, status: &mut StatusWriter) -> Result<i32, ShimError> {
    reaper::become_subreaper().map_err(KennelError::from)?;
    let mut sigchld = signal(SignalKind::child()).map_err(KennelError::from)?;

    let dir = ProcessDir::new(&args.dir, &args.container_id);
    let notifier = ExitNotifier::listen(dir.exit_socket())?;
    remove_stale(&dir.pidfile())?;

    let stdio = RuntimeStdio::open(args)?;
    let console = if args.tty {
        Some(ConsoleSocket::bind(&dir.console_socket())?)
    } else {
        None
    };

    let process = match (&args.process, args.mode) {
        (Some(path), _) => Some(path.clone()),
        (None, Mode::Exec) => Some(persist_process_json(&dir).await?),
        (None, Mode::Run) => None,
    };

    let cli = match &args.log {
        Some(log) => RuntimeCli::new(&args.runtime).with_log(log),
        None => RuntimeCli::new(&args.runtime),
    };
    let console_path = console.as_ref().map(ConsoleSocket::path);
    let argv = match (args.mode, process.as_deref()) {
        (Mode::Exec, Some(process)) => cli.exec(&dir.pidfile(), process, console_path, &args.container_id),
        _ => cli.create(args.bundle(), &dir.pidfile(), console_path, &args.container_id),
    };

    let mut relay = None;
    let runtime_pid = {
        let (stdin, stdout, stderr) = match console {
            Some(socket) => {
                let (runtime_stdio, console_relay) = stdio.relay_through_console(socket);
                relay = Some(console_relay);
                runtime_stdio
            }
            None => stdio.into_runtime_stdio(),
        };
        let child = Command::new(cli.binary())
            .args(&argv)
            .stdin(stdin)
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|source| ShimError::Spawn {
                runtime: args.runtime.clone(),
                source,
            })?;
        // The reap loop owns the child from here; our stdio copies drop now.
        i32::try_from(child.id()).map_err(|_| ShimError::Reap(io::Error::other("pid out of range")))?
    };
    tracing::info!(
        runtime = %args.runtime.display(),
        mode = args.mode.as_str(),
        pid = runtime_pid,
        container = %args.container_id,
        "Runtime started"
    );

    let mut reaper = Reaper::new(SystemWaiter);
    let mut tracked: Option<i32> = None;
    loop {
        reaper.drain().map_err(ShimError::Reap)?;

        match tracked {
            None => {
                if let Some(code) = reaper.take(runtime_pid) {
                    status.send(status_byte(code));
                    if code != 0 {
                        return Err(ShimError::RuntimeFailed(code));
                    }
                    let pid = read_pid(&dir.pidfile())?;
                    tracing::info!(pid, "Tracking process");
                    tracked = Some(pid);
                    continue;
                }
            }
            Some(pid) => {
                if let Some(code) = reaper.take(pid) {
                    tracing::info!(pid, code, "Process exited");
                    if let Some(relay) = relay.take() {
                        relay.drain(CONSOLE_DRAIN_TIMEOUT).await;
                    }
                    finish(args, &cli, &dir, code);
                    notifier.close();
                    return Ok(code);
                }
            }
        }

        if sigchld.recv().await.is_none() {
            return Err(ShimError::Reap(io::Error::other("SIGCHLD stream closed")));
        }
    }
}

/// Byte reported for a runtime exit code.
const fn status_byte(code: i32) -> u8 {
    (code & 0xff) as u8
}

fn finish(args: &ShimArgs, cli: &RuntimeCli, dir: &ProcessDir, code: i32) {
    if args.mode == Mode::Run {
        let result = Command::new(cli.binary())
            .args(cli.delete(&args.container_id))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .status();
        match result {
            Ok(exit) if exit.success() => tracing::debug!(container = %args.container_id, "Runtime delete finished"),
            Ok(exit) => tracing::warn!(container = %args.container_id, status = %exit, "Runtime delete failed"),
            Err(e) => tracing::warn!(container = %args.container_id, error = %e, "Runtime delete could not run"),
        }
    }

    if let Err(e) = std::fs::write(dir.exitcode(), code.to_string()) {
        tracing::warn!(path = %dir.exitcode().display(), error = %e, "Failed to record exit code");
    }
}

fn remove_stale(path: &Path) -> Result<(), KennelError> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

async fn persist_process_json(dir: &ProcessDir) -> Result<PathBuf, KennelError> {
    let mut spec = Vec::new();
    tokio::io::stdin().read_to_end(&mut spec).await?;
    serde_json::from_slice::<serde_json::Value>(&spec)?;
    let path = dir.process_json();
    std::fs::write(&path, &spec)?;
    Ok(path)
}

fn read_pid(path: &Path) -> Result<i32, ShimError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ShimError::Pidfile {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    contents.trim().parse().map_err(|_| ShimError::Pidfile {
        path: path.to_path_buf(),
        reason: format!("not a pid: {:?}", contents.trim()),
    })
}

/// The FIFOs handed to the runtime, opened in protocol order.
struct RuntimeStdio {
    stdin: Option<File>,
    stdout: Option<File>,
    stderr: Option<File>,
    winsz: Option<File>,
}

impl RuntimeStdio {
    fn open(args: &ShimArgs) -> Result<Self, KennelError> {
        let stdin = args.stdin.as_deref().map(File::open).transpose()?;
        let stdout = args.stdout.as_deref().map(open_write).transpose()?;
        let stderr = args.stderr.as_deref().map(open_write).transpose()?;
        let winsz = if args.tty {
            args.winsz.as_deref().map(File::open).transpose()?
        } else {
            None
        };
        Ok(Self {
            stdin,
            stdout,
            stderr,
            winsz,
        })
    }

    fn into_runtime_stdio(self) -> (Stdio, Stdio, Stdio) {
        (
            self.stdin.map_or_else(Stdio::null, Stdio::from),
            self.stdout.map_or_else(Stdio::null, Stdio::from),
            self.stderr.map_or_else(Stdio::inherit, Stdio::from),
        )
    }

    /// Hand stdin/stdout/winsz to relay threads fed by the PTY master the
    /// runtime sends to `socket`; only stderr goes to the runtime.
    fn relay_through_console(self, socket: ConsoleSocket) -> ((Stdio, Stdio, Stdio), ConsoleRelay) {
        let Self {
            stdin,
            stdout,
            stderr,
            winsz,
        } = self;

        let (done_tx, done) = oneshot::channel();
        let thread = std::thread::spawn(move || {
            relay_console(&socket, stdin, stdout, winsz);
            drop(socket);
            let _ = done_tx.send(());
        });

        let runtime_stdio = (Stdio::null(), Stdio::null(), stderr.map_or_else(Stdio::inherit, Stdio::from));
        (runtime_stdio, ConsoleRelay { thread, done })
    }
}

fn relay_console(socket: &ConsoleSocket, stdin: Option<File>, stdout: Option<File>, winsz: Option<File>) {
    let master = match socket.receive_master() {
        Ok(master) => File::from(master),
        Err(e) => {
            tracing::error!(error = %e, "No console received from runtime");
            return;
        }
    };

    if let Some(mut input) = stdin {
        if let Ok(mut to_master) = master.try_clone() {
            std::thread::spawn(move || io::copy(&mut input, &mut to_master));
        }
    }
    if let Some(control) = winsz {
        if let Ok(resized) = master.try_clone() {
            std::thread::spawn(move || console::relay_winsize(control, &resized));
        }
    }
    if let Some(mut output) = stdout {
        let mut from_master = master;
        // EIO once the last slave closes.
        let _ = io::copy(&mut from_master, &mut output);
    }
}

/// The PTY master to stdout copy, running until the terminal closes.
struct ConsoleRelay {
    thread: JoinHandle<()>,
    done: oneshot::Receiver<()>,
}

impl ConsoleRelay {
    /// Wait up to `timeout` for buffered terminal output to reach stdout.
    async fn drain(self, timeout: Duration) {
        if tokio::time::timeout(timeout, self.done).await.is_err() {
            tracing::warn!("Terminal output still open after exit");
            return;
        }
        if self.thread.join().is_err() {
            tracing::warn!("Console relay panicked");
        }
    }
}

fn open_write(path: &Path) -> io::Result<File> {
    OpenOptions::new().write(true).open(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_by_stage() {
        let spawn = ShimError::Spawn {
            runtime: PathBuf::from("/missing/runc"),
            source: io::Error::from(io::ErrorKind::NotFound),
        };
        assert_eq!(spawn.exit_code(), 2);
        assert_eq!(spawn.status_byte(), Some(2));

        let failed = ShimError::RuntimeFailed(1);
        assert_eq!(failed.exit_code(), 3);
        assert_eq!(failed.status_byte(), None);

        let pidfile = ShimError::Pidfile {
            path: PathBuf::from("/p/pidfile"),
            reason: "missing".into(),
        };
        assert_eq!(pidfile.exit_code(), 255);
    }

    #[test]
    fn signaled_runtime_byte() {
        assert_eq!(status_byte(137), 137);
        assert_eq!(status_byte(0), 0);
    }

    #[tokio::test]
    async fn console_relay_drains_buffered_output() {
        let dir = tempfile::tempdir().unwrap();
        let socket = ConsoleSocket::bind(&dir.path().join("console.sock")).unwrap();
        let path = socket.path().to_path_buf();
        let out = dir.path().join("out");
        let stdio = RuntimeStdio {
            stdin: None,
            stdout: Some(File::create(&out).unwrap()),
            stderr: None,
            winsz: None,
        };
        let (_, relay) = stdio.relay_through_console(socket);

        // A pipe stands in for the PTY master; closing the writer ends it.
        let (reader, writer) = rustix::pipe::pipe().unwrap();
        let stream = std::os::unix::net::UnixStream::connect(&path).unwrap();
        console::send_fd(&stream, std::os::fd::AsRawFd::as_raw_fd(&reader)).unwrap();
        drop(reader);
        let mut writer = File::from(writer);
        io::Write::write_all(&mut writer, b"last words\n").unwrap();
        drop(writer);

        relay.drain(Duration::from_secs(5)).await;
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "last words\n");
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn console_relay_drain_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let socket = ConsoleSocket::bind(&dir.path().join("console.sock")).unwrap();
        let stdio = RuntimeStdio {
            stdin: None,
            stdout: None,
            stderr: None,
            winsz: None,
        };
        let (_, relay) = stdio.relay_through_console(socket);

        // Nobody connects, so the relay never finishes.
        let started = std::time::Instant::now();
        relay.drain(Duration::from_millis(100)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn pidfile_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pidfile");
        std::fs::write(&path, "4242\n").unwrap();
        assert_eq!(read_pid(&path).unwrap(), 4242);

        std::fs::write(&path, "garbage").unwrap();
        assert!(matches!(read_pid(&path), Err(ShimError::Pidfile { .. })));
        assert!(read_pid(&dir.path().join("missing")).is_err());
    }
}
