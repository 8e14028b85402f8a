//! Launching processes under `kennel-shim`.
//!
//! The launch sequence:
//!
//! 1. Create the four FIFOs and hold a read-write placeholder on each.
//! 2. Create the status pipe and start the supervisor in its own session
//!    with the pipe's write end as fd 3.
//! 3. Pipe the process JSON (exec only) into the supervisor's stdin.
//! 4. Read one status byte. `0` means launched; any other byte is the
//!    runtime's failure; EOF means the supervisor died first.
//! 5. On success open the real FIFO ends, start the stream pumps and drop
//!    the placeholders.

#![allow(unsafe_code)]

use std::fs::File;
use std::io::Read;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use futures::future::join_all;
use kennel_common::{ContainerHandle, KennelError, KennelPaths, KennelResult, ProcessDir, ProcessId};
use kennel_oci::ProcessSpec;
use rustix::pipe::{PipeFlags, pipe_with};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::process::Command;
use tokio::sync::watch;

use super::fifo::Fifos;
use super::pidfile::PidFileReader;
use super::process::{Process, ProcessIo, ProcessState};
use crate::shim::{DEFAULT_STATUS_FD, Mode, ShimArgs};

/// Starts supervisors and hands back [`Process`] handles.
#[derive(Debug, Clone)]
pub struct ExecRunner {
    shim: PathBuf,
    runtime: PathBuf,
    paths: KennelPaths,
    pidfile: PidFileReader,
}

struct Launch {
    mode: Mode,
    dir: ProcessDir,
    container_id: String,
    bundle: Option<PathBuf>,
    spec: Option<Vec<u8>>,
    tty: bool,
}

impl ExecRunner {
    /// Runner starting `shim` to drive `runtime`, with state under `paths`.
    pub fn new(shim: impl Into<PathBuf>, runtime: impl Into<PathBuf>, paths: KennelPaths) -> Self {
        Self {
            shim: shim.into(),
            runtime: runtime.into(),
            paths,
            pidfile: PidFileReader::default(),
        }
    }

    /// Use `pidfile` for signal delivery.
    #[must_use]
    pub const fn with_pidfile_reader(mut self, pidfile: PidFileReader) -> Self {
        self.pidfile = pidfile;
        self
    }

    /// Supervisor binary.
    #[must_use]
    pub fn shim(&self) -> &Path {
        &self.shim
    }

    /// Runtime binary.
    #[must_use]
    pub fn runtime(&self) -> &Path {
        &self.runtime
    }

    /// Create and start tracking the init process of `handle` from `bundle`.
    ///
    /// The container's depot directory must exist; it becomes the init
    /// process directory.
    ///
    /// # Errors
    ///
    /// Returns [`KennelError::LaunchFailed`] if the runtime refused the
    /// bundle, or any plumbing error.
    pub async fn run_init(&self, handle: &ContainerHandle, bundle: &Path, io: ProcessIo) -> KennelResult<Process> {
        let dir = self.paths.init_process(handle.as_str());
        if !dir.path().is_dir() {
            return Err(KennelError::HandleNotFound {
                handle: handle.to_string(),
            });
        }
        self.launch(
            Launch {
                mode: Mode::Run,
                dir,
                container_id: handle.to_string(),
                bundle: Some(bundle.to_path_buf()),
                spec: None,
                tty: false,
            },
            io,
        )
        .await
    }

    /// Run `spec` inside the running container `handle`.
    ///
    /// # Errors
    ///
    /// Returns [`KennelError::HandleNotFound`] if the container has no depot
    /// directory, [`KennelError::LaunchFailed`] if the runtime refused the
    /// process, or any plumbing error.
    pub async fn exec(&self, handle: &ContainerHandle, spec: &ProcessSpec, io: ProcessIo) -> KennelResult<Process> {
        if !self.paths.container(handle.as_str()).is_dir() {
            return Err(KennelError::HandleNotFound {
                handle: handle.to_string(),
            });
        }
        std::fs::create_dir_all(self.paths.processes(handle.as_str()))?;

        let id = ProcessId::generate();
        let dir = self.paths.process(handle.as_str(), id.as_str());
        std::fs::create_dir(dir.path())?;

        self.launch(
            Launch {
                mode: Mode::Exec,
                dir,
                container_id: handle.to_string(),
                bundle: None,
                spec: Some(serde_json::to_vec(&spec.to_runtime())?),
                tty: spec.tty.is_some(),
            },
            io,
        )
        .await
    }

    /// Handle on a process launched earlier, possibly by another runner.
    #[must_use]
    pub fn attach(&self, dir: ProcessDir) -> Process {
        Process::attached(dir, self.pidfile)
    }

    async fn launch(&self, launch: Launch, io: ProcessIo) -> KennelResult<Process> {
        let dir = launch.dir;
        let fifos = Fifos::create(&dir)?;
        let mut state = ProcessState::Created;

        let args = ShimArgs {
            log: Some(dir.runtime_log()),
            stdin: Some(dir.stdin()),
            stdout: Some(dir.stdout()),
            stderr: Some(dir.stderr()),
            winsz: Some(dir.winsz()),
            tty: launch.tty,
            process: None,
            bundle: launch.bundle,
            status_fd: DEFAULT_STATUS_FD,
            mode: launch.mode,
            runtime: self.runtime.clone(),
            dir: dir.path().to_path_buf(),
            container_id: launch.container_id,
        };

        let (status_reader, status_writer) = pipe_with(PipeFlags::CLOEXEC).map_err(std::io::Error::from)?;
        let supervisor_log = File::create(dir.supervisor_log())?;

        let mut command = Command::new(&self.shim);
        command
            .args(args.to_args())
            .stdin(if launch.spec.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::null())
            .stderr(supervisor_log);

        let status_fd = status_writer.as_raw_fd();
        unsafe {
            command.pre_exec(move || {
                if libc::setsid() < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if status_fd == DEFAULT_STATUS_FD {
                    let flags = libc::fcntl(status_fd, libc::F_GETFD);
                    if flags < 0 || libc::fcntl(status_fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                } else if libc::dup2(status_fd, DEFAULT_STATUS_FD) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = command.spawn().map_err(|e| KennelError::Command {
            program: self.shim.display().to_string(),
            message: e.to_string(),
        })?;
        drop(status_writer);
        state.advance(ProcessState::Launching);
        tracing::debug!(id = dir.id(), pid = child.id(), mode = launch.mode.as_str(), "Started supervisor");

        if let (Some(spec), Some(mut stdin)) = (launch.spec, child.stdin.take()) {
            if let Err(e) = stdin.write_all(&spec).await {
                tracing::debug!(id = dir.id(), error = %e, "Supervisor closed stdin early");
            }
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code().or_else(|| status.signal().map(|s| 128 + s)).unwrap_or(-1),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to wait for supervisor");
                    -1
                }
            };
            let _ = exit_tx.send(Some(code));
        });

        let byte = tokio::task::spawn_blocking(move || read_status(status_reader))
            .await
            .map_err(|e| KennelError::Internal {
                message: format!("status reader panicked: {e}"),
            })??;

        match byte {
            Some(0) => {
                let (drained, winsz) = attach_streams(&dir, fifos, io)?;
                tracing::info!(id = dir.id(), "Process launched");
                Ok(Process::running(dir, self.pidfile, state, exit_rx, drained, winsz))
            }
            Some(code) => {
                let message = kennel_oci::log::last_error_in(&dir.runtime_log())
                    .unwrap_or_else(|| format!("runtime exited with status {code}"));
                tracing::warn!(id = dir.id(), code, %message, "Launch failed");
                Err(KennelError::LaunchFailed {
                    code: i32::from(code),
                    message,
                })
            }
            None => {
                let mut exit = exit_rx;
                let code = exit.wait_for(Option::is_some).await.ok().and_then(|code| *code).unwrap_or(-1);
                tracing::warn!(id = dir.id(), code, "Supervisor exited without a launch status");
                Err(KennelError::LaunchFailed {
                    code,
                    message: "supervisor exited before reporting launch status".to_string(),
                })
            }
        }
    }
}

fn read_status(reader: OwnedFd) -> KennelResult<Option<u8>> {
    let mut file = File::from(reader);
    let mut byte = [0u8; 1];
    loop {
        match file.read(&mut byte) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(byte[0])),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
}

/// Open the runner's ends of the FIFOs, start copying and release the
/// placeholders. Returns the drained signal and the winsz placeholder.
fn attach_streams(dir: &ProcessDir, fifos: Fifos, io: ProcessIo) -> KennelResult<(watch::Receiver<bool>, File)> {
    let stdin = pipe::OpenOptions::new().open_sender(dir.stdin())?;
    let stdout = pipe::OpenOptions::new().open_receiver(dir.stdout())?;
    let stderr = pipe::OpenOptions::new().open_receiver(dir.stderr())?;

    drop(fifos.stdin);
    drop(fifos.stdout);
    drop(fifos.stderr);
    let winsz = fifos.winsz;

    tokio::spawn(pump_stdin(io.stdin, stdin));
    let outputs = [
        tokio::spawn(pump_output(stdout, io.stdout)),
        tokio::spawn(pump_output(stderr, io.stderr)),
    ];

    let (drained_tx, drained_rx) = watch::channel(false);
    tokio::spawn(async move {
        join_all(outputs).await;
        let _ = drained_tx.send(true);
    });

    Ok((drained_rx, winsz))
}

async fn pump_stdin(source: Option<Box<dyn AsyncRead + Send + Unpin>>, mut sink: pipe::Sender) {
    if let Some(mut source) = source {
        if let Err(e) = tokio::io::copy(&mut source, &mut sink).await {
            tracing::debug!(error = %e, "stdin copy stopped");
        }
    }
}

async fn pump_output(mut source: pipe::Receiver, sink: Option<Box<dyn AsyncWrite + Send + Unpin>>) {
    let result = match sink {
        Some(mut sink) => match tokio::io::copy(&mut source, &mut sink).await {
            Ok(n) => sink.flush().await.map(|()| n),
            Err(e) => Err(e),
        },
        None => tokio::io::copy(&mut source, &mut tokio::io::sink()).await,
    };
    if let Err(e) = result {
        tracing::debug!(error = %e, "Output copy stopped");
    }
}
