//! Command lines for a runc-compatible runtime.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Builds argument vectors for the low-level OCI runtime.
///
/// Global flags (`--debug --log <path>`) come first when a log is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeCli {
    binary: PathBuf,
    log: Option<PathBuf>,
}

impl RuntimeCli {
    /// Runtime at `binary`, no log.
    #[must_use]
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            log: None,
        }
    }

    /// Ask the runtime to write its JSON debug log to `log`.
    #[must_use]
    pub fn with_log(mut self, log: impl Into<PathBuf>) -> Self {
        self.log = Some(log.into());
        self
    }

    /// The runtime binary.
    #[must_use]
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn global(&self) -> Vec<OsString> {
        match &self.log {
            Some(log) => vec!["--debug".into(), "--log".into(), log.into(), "--log-format".into(), "json".into()],
            None => Vec::new(),
        }
    }

    /// `create --bundle <dir> --pid-file <p> [--console-socket <s>] <id>`
    #[must_use]
    pub fn create(&self, bundle: &Path, pidfile: &Path, console_socket: Option<&Path>, id: &str) -> Vec<OsString> {
        let mut args = self.global();
        args.extend(["create".into(), "--bundle".into(), bundle.into()]);
        args.extend(["--pid-file".into(), pidfile.into()]);
        if let Some(socket) = console_socket {
            args.extend(["--console-socket".into(), socket.into()]);
        }
        args.push(id.into());
        args
    }

    /// `exec -d --pid-file <p> --process <spec> [--tty --console-socket <s>] <id>`
    #[must_use]
    pub fn exec(&self, pidfile: &Path, process: &Path, console_socket: Option<&Path>, id: &str) -> Vec<OsString> {
        let mut args = self.global();
        args.extend(["exec".into(), "-d".into()]);
        args.extend(["--pid-file".into(), pidfile.into()]);
        args.extend(["--process".into(), process.into()]);
        if let Some(socket) = console_socket {
            args.extend(["--tty".into(), "--console-socket".into(), socket.into()]);
        }
        args.push(id.into());
        args
    }

    /// `start <id>`
    #[must_use]
    pub fn start(&self, id: &str) -> Vec<OsString> {
        self.simple("start", id)
    }

    /// `delete <id>`
    #[must_use]
    pub fn delete(&self, id: &str) -> Vec<OsString> {
        self.simple("delete", id)
    }

    /// `delete --force <id>`
    #[must_use]
    pub fn force_delete(&self, id: &str) -> Vec<OsString> {
        let mut args = self.global();
        args.extend(["delete".into(), "--force".into(), id.into()]);
        args
    }

    /// `kill <id> <signal>`
    #[must_use]
    pub fn kill(&self, id: &str, signal: &str) -> Vec<OsString> {
        let mut args = self.global();
        args.extend(["kill".into(), id.into(), signal.into()]);
        args
    }

    fn simple(&self, verb: &str, id: &str) -> Vec<OsString> {
        let mut args = self.global();
        args.extend([verb.into(), id.into()]);
        args
    }
}
