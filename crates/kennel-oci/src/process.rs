//! Process specifications.
//!
//! [`ProcessSpec`] is what callers describe; [`RuntimeProcess`] is the OCI
//! `process` object the runtime receives on `exec --process`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A process to run inside a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSpec {
    /// Executable, resolved inside the container.
    pub path: String,
    /// Arguments, excluding the executable.
    #[serde(default)]
    pub args: Vec<String>,
    /// `KEY=VALUE` environment entries.
    #[serde(default)]
    pub env: Vec<String>,
    /// Working directory; `/` when unset.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// Allocate a terminal of this size.
    #[serde(default)]
    pub tty: Option<TtySize>,
    /// Resource limits.
    #[serde(default)]
    pub limits: ResourceLimits,
    /// User to run as.
    #[serde(default)]
    pub user: User,
}

impl ProcessSpec {
    /// Spec running `path` with `args`.
    #[must_use]
    pub fn new(path: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            path: path.into(),
            args: args.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Set the environment.
    #[must_use]
    pub fn with_env(mut self, env: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.env = env.into_iter().map(Into::into).collect();
        self
    }

    /// Set the working directory.
    #[must_use]
    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    /// Request a terminal.
    #[must_use]
    pub const fn with_tty(mut self, size: TtySize) -> Self {
        self.tty = Some(size);
        self
    }

    /// The OCI process object handed to the runtime.
    #[must_use]
    pub fn to_runtime(&self) -> RuntimeProcess {
        let mut args = Vec::with_capacity(self.args.len() + 1);
        args.push(self.path.clone());
        args.extend(self.args.iter().cloned());

        RuntimeProcess {
            terminal: self.tty.is_some(),
            console_size: self.tty.map(ConsoleSize::from),
            user: self.user.clone(),
            args,
            env: self.env.clone(),
            cwd: self.dir.clone().unwrap_or_else(|| PathBuf::from("/")),
            rlimits: self.limits.to_rlimits(),
        }
    }
}

/// Terminal dimensions as sent over the window-size control FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtySize {
    /// Columns.
    pub columns: u16,
    /// Rows.
    pub rows: u16,
}

impl TtySize {
    /// Size with `columns` x `rows`.
    #[must_use]
    pub const fn new(columns: u16, rows: u16) -> Self {
        Self { columns, rows }
    }
}

/// Console size in OCI form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleSize {
    /// Height in characters.
    pub height: u32,
    /// Width in characters.
    pub width: u32,
}

impl From<TtySize> for ConsoleSize {
    fn from(size: TtySize) -> Self {
        Self {
            height: u32::from(size.rows),
            width: u32::from(size.columns),
        }
    }
}

/// User and group IDs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// User ID.
    pub uid: u32,
    /// Group ID.
    pub gid: u32,
    /// Additional group IDs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_gids: Vec<u32>,
}

/// Per-process resource limits. Unset entries inherit the runtime default.
///
/// Each value applies as both the soft and the hard limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// `RLIMIT_AS`
    pub address_space: Option<u64>,
    /// `RLIMIT_CORE`
    pub core: Option<u64>,
    /// `RLIMIT_CPU`
    pub cpu: Option<u64>,
    /// `RLIMIT_DATA`
    pub data: Option<u64>,
    /// `RLIMIT_FSIZE`
    pub file_size: Option<u64>,
    /// `RLIMIT_LOCKS`
    pub locks: Option<u64>,
    /// `RLIMIT_MEMLOCK`
    pub memlock: Option<u64>,
    /// `RLIMIT_MSGQUEUE`
    pub msgqueue: Option<u64>,
    /// `RLIMIT_NICE`
    pub nice: Option<u64>,
    /// `RLIMIT_NOFILE`
    pub nofile: Option<u64>,
    /// `RLIMIT_NPROC`
    pub nproc: Option<u64>,
    /// `RLIMIT_RSS`
    pub rss: Option<u64>,
    /// `RLIMIT_RTPRIO`
    pub rtprio: Option<u64>,
    /// `RLIMIT_SIGPENDING`
    pub sigpending: Option<u64>,
    /// `RLIMIT_STACK`
    pub stack: Option<u64>,
}

impl ResourceLimits {
    fn to_rlimits(self) -> Vec<Rlimit> {
        [
            ("RLIMIT_AS", self.address_space),
            ("RLIMIT_CORE", self.core),
            ("RLIMIT_CPU", self.cpu),
            ("RLIMIT_DATA", self.data),
            ("RLIMIT_FSIZE", self.file_size),
            ("RLIMIT_LOCKS", self.locks),
            ("RLIMIT_MEMLOCK", self.memlock),
            ("RLIMIT_MSGQUEUE", self.msgqueue),
            ("RLIMIT_NICE", self.nice),
            ("RLIMIT_NOFILE", self.nofile),
            ("RLIMIT_NPROC", self.nproc),
            ("RLIMIT_RSS", self.rss),
            ("RLIMIT_RTPRIO", self.rtprio),
            ("RLIMIT_SIGPENDING", self.sigpending),
            ("RLIMIT_STACK", self.stack),
        ]
        .into_iter()
        .filter_map(|(name, value)| {
            value.map(|v| Rlimit {
                limit_type: name.to_string(),
                hard: v,
                soft: v,
            })
        })
        .collect()
    }
}

/// A single OCI rlimit entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rlimit {
    /// Limit type (e.g., `RLIMIT_NOFILE`).
    #[serde(rename = "type")]
    pub limit_type: String,
    /// Hard limit.
    pub hard: u64,
    /// Soft limit.
    pub soft: u64,
}

/// OCI `process` object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeProcess {
    /// Whether to run with a terminal.
    #[serde(default)]
    pub terminal: bool,
    /// Console size (if terminal is true).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub console_size: Option<ConsoleSize>,
    /// User to run as.
    pub user: User,
    /// Command arguments, executable first.
    pub args: Vec<String>,
    /// Environment variables.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    /// Working directory.
    pub cwd: PathBuf,
    /// Resource limits.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rlimits: Vec<Rlimit>,
}
