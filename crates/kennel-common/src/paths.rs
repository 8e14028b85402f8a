//! Standard filesystem paths for Kennel.
//!
//! The supervisor, the exec runner and the orchestrator all agree on the
//! names below; nothing else is passed between them.

use std::path::{Path, PathBuf};

/// Environment variable overriding the default root.
pub const ROOT_ENV: &str = "KENNEL_ROOT";

/// Environment variable overriding the default runtime directory.
pub const RUNTIME_DIR_ENV: &str = "KENNEL_RUNTIME_DIR";

fn default_root() -> PathBuf {
    std::env::var_os(ROOT_ENV).map_or_else(|| PathBuf::from("/var/lib/kennel"), PathBuf::from)
}

fn default_runtime_dir() -> PathBuf {
    std::env::var_os(RUNTIME_DIR_ENV).map_or_else(|| PathBuf::from("/run/kennel"), PathBuf::from)
}

/// Standard paths used by Kennel on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KennelPaths {
    /// Root data directory (default: /var/lib/kennel).
    pub root: PathBuf,
    /// Runtime directory (default: /run/kennel).
    pub runtime: PathBuf,
}

impl KennelPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom root directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let runtime = root.join("run");
        Self { root, runtime }
    }

    /// Directory holding one subdirectory per container.
    #[must_use]
    pub fn depot(&self) -> PathBuf {
        self.root.join("depot")
    }

    /// Depot directory (and OCI bundle) of a container.
    #[must_use]
    pub fn container(&self, handle: &str) -> PathBuf {
        self.depot().join(handle)
    }

    /// Parent of the per-process directories of a container.
    #[must_use]
    pub fn processes(&self, handle: &str) -> PathBuf {
        self.container(handle).join("processes")
    }

    /// Directory of one exec'd process.
    #[must_use]
    pub fn process(&self, handle: &str, process_id: &str) -> ProcessDir {
        ProcessDir::new(self.processes(handle).join(process_id), process_id)
    }

    /// Directory of a container's init process (the bundle itself).
    #[must_use]
    pub fn init_process(&self, handle: &str) -> ProcessDir {
        ProcessDir::new(self.container(handle), handle)
    }

    /// Persisted network configuration of a container.
    #[must_use]
    pub fn network_config(&self, handle: &str) -> PathBuf {
        self.root.join("network").join(format!("{handle}.json"))
    }

    /// Port pool state file.
    #[must_use]
    pub fn port_pool_state(&self) -> PathBuf {
        self.root.join("port-pool.json")
    }

    /// Host-wide iptables lock file.
    #[must_use]
    pub fn iptables_lock(&self) -> PathBuf {
        self.runtime.join("iptables.lock")
    }

    /// Create all necessary directories.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(&self.runtime)?;
        std::fs::create_dir_all(self.depot())?;
        std::fs::create_dir_all(self.root.join("network"))?;
        Ok(())
    }
}

impl Default for KennelPaths {
    fn default() -> Self {
        Self {
            root: default_root(),
            runtime: default_runtime_dir(),
        }
    }
}

/// Layout of a single process directory.
///
/// For a container's init process the directory is the bundle and the ID
/// is the handle; for exec'd processes it is `processes/<id>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessDir {
    dir: PathBuf,
    id: String,
}

impl ProcessDir {
    /// Describe the process directory `dir` for process `id`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, id: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            id: id.into(),
        }
    }

    /// The directory itself.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Process identifier used for FIFO names.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    fn fifo(&self, suffix: &str) -> PathBuf {
        self.dir.join(format!("{}.{suffix}", self.id))
    }

    /// Stdin FIFO.
    #[must_use]
    pub fn stdin(&self) -> PathBuf {
        self.fifo("stdin")
    }

    /// Stdout FIFO.
    #[must_use]
    pub fn stdout(&self) -> PathBuf {
        self.fifo("stdout")
    }

    /// Stderr FIFO.
    #[must_use]
    pub fn stderr(&self) -> PathBuf {
        self.fifo("stderr")
    }

    /// Window-size control FIFO.
    #[must_use]
    pub fn winsz(&self) -> PathBuf {
        self.fifo("winsz")
    }

    /// Exit notification socket.
    #[must_use]
    pub fn exit_socket(&self) -> PathBuf {
        self.dir.join("exit.sock")
    }

    /// Console socket used to receive the pty master.
    #[must_use]
    pub fn console_socket(&self) -> PathBuf {
        self.dir.join("console.sock")
    }

    /// Pidfile written by the runtime.
    #[must_use]
    pub fn pidfile(&self) -> PathBuf {
        self.dir.join("pidfile")
    }

    /// Exit code written by the supervisor.
    #[must_use]
    pub fn exitcode(&self) -> PathBuf {
        self.dir.join("exitcode")
    }

    /// Runtime's JSON debug log.
    #[must_use]
    pub fn runtime_log(&self) -> PathBuf {
        self.dir.join("runtime.log")
    }

    /// Supervisor's own log.
    #[must_use]
    pub fn supervisor_log(&self) -> PathBuf {
        self.dir.join("supervisor.log")
    }

    /// Process spec handed to `<runtime> exec --process`.
    #[must_use]
    pub fn process_json(&self) -> PathBuf {
        self.dir.join("process.json")
    }
}
