//! Command line of `kennel-shim`.

use std::ffi::OsString;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use clap::{Parser, ValueEnum};

/// Default descriptor the launch status byte is written to.
pub const DEFAULT_STATUS_FD: RawFd = 3;

/// Which runtime verb the supervisor drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// `create` a container from a bundle; its init is the tracked process.
    Run,
    /// `exec` an additional process into a running container.
    Exec,
}

impl Mode {
    /// Name used on the command line.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Exec => "exec",
        }
    }
}

/// Supervise one runtime `create`/`exec` and relay the process's exit status.
#[derive(Debug, Parser)]
#[command(name = "kennel-shim")]
#[command(author, version, about, long_about = None)]
pub struct ShimArgs {
    /// Runtime debug log (JSON lines)
    #[arg(long)]
    pub log: Option<PathBuf>,

    /// FIFO the process reads stdin from
    #[arg(long)]
    pub stdin: Option<PathBuf>,

    /// FIFO the process writes stdout to
    #[arg(long)]
    pub stdout: Option<PathBuf>,

    /// FIFO the process writes stderr to
    #[arg(long)]
    pub stderr: Option<PathBuf>,

    /// Control FIFO carrying window size updates
    #[arg(long)]
    pub winsz: Option<PathBuf>,

    /// Allocate a terminal through the runtime's console socket
    #[arg(long)]
    pub tty: bool,

    /// Process JSON for exec (read from stdin when absent)
    #[arg(long)]
    pub process: Option<PathBuf>,

    /// OCI bundle for run (defaults to the process directory)
    #[arg(long)]
    pub bundle: Option<PathBuf>,

    /// Descriptor the launch status byte is written to
    #[arg(long, default_value_t = DEFAULT_STATUS_FD)]
    pub status_fd: RawFd,

    /// Runtime verb to drive
    #[arg(value_enum)]
    pub mode: Mode,

    /// Low-level OCI runtime binary
    pub runtime: PathBuf,

    /// Process directory (exit socket, pidfile, exit code)
    pub dir: PathBuf,

    /// Container ID passed to the runtime
    pub container_id: String,
}

impl ShimArgs {
    /// Bundle directory for `create`.
    #[must_use]
    pub fn bundle(&self) -> &Path {
        self.bundle.as_deref().unwrap_or(&self.dir)
    }

    /// Argument vector that parses back into `self`.
    #[must_use]
    pub fn to_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::new();
        let paths = [
            ("--log", &self.log),
            ("--stdin", &self.stdin),
            ("--stdout", &self.stdout),
            ("--stderr", &self.stderr),
            ("--winsz", &self.winsz),
            ("--process", &self.process),
            ("--bundle", &self.bundle),
        ];
        for (flag, value) in paths {
            if let Some(value) = value {
                args.push(flag.into());
                args.push(value.into());
            }
        }
        if self.tty {
            args.push("--tty".into());
        }
        if self.status_fd != DEFAULT_STATUS_FD {
            args.push("--status-fd".into());
            args.push(self.status_fd.to_string().into());
        }
        args.push(self.mode.as_str().into());
        args.push(self.runtime.as_os_str().to_owned());
        args.push(self.dir.as_os_str().to_owned());
        args.push(self.container_id.clone().into());
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_command_line() {
        let args = ShimArgs::try_parse_from([
            "kennel-shim",
            "--log",
            "/p/runtime.log",
            "--stdin",
            "/p/x.stdin",
            "--tty",
            "exec",
            "runc",
            "/p",
            "box",
        ])
        .unwrap();

        assert_eq!(args.mode, Mode::Exec);
        assert_eq!(args.runtime, PathBuf::from("runc"));
        assert_eq!(args.status_fd, 3);
        assert!(args.tty);
        assert_eq!(args.bundle(), Path::new("/p"));
    }

    #[test]
    fn to_args_round_trips() {
        let args = ShimArgs::try_parse_from([
            "kennel-shim",
            "--bundle",
            "/bundles/box",
            "--status-fd",
            "5",
            "run",
            "/usr/bin/runc",
            "/depot/box",
            "box",
        ])
        .unwrap();

        let mut argv: Vec<OsString> = vec!["kennel-shim".into()];
        argv.extend(args.to_args());
        let reparsed = ShimArgs::try_parse_from(argv).unwrap();
        assert_eq!(reparsed.bundle(), Path::new("/bundles/box"));
        assert_eq!(reparsed.status_fd, 5);
        assert_eq!(reparsed.mode, Mode::Run);
    }

    #[test]
    fn rejects_unknown_mode() {
        assert!(ShimArgs::try_parse_from(["kennel-shim", "start", "runc", "/p", "box"]).is_err());
    }
}
