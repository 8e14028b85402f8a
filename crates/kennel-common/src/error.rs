//! Common error types for Kennel.

use std::path::PathBuf;
use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`KennelError`].
pub type KennelResult<T> = Result<T, KennelError>;

/// Errors shared by the supervisor, the exec runner and the network engine.
#[derive(Error, Diagnostic, Debug)]
pub enum KennelError {
    /// Invalid container handle format.
    #[error("Invalid container handle: {handle}")]
    #[diagnostic(
        code(kennel::handle::invalid),
        help("Handles must start with an alphanumeric character and contain only [A-Za-z0-9_.-], 1-128 characters")
    )]
    InvalidHandle {
        /// The rejected handle.
        handle: String,
    },

    /// Nothing is known about this handle.
    #[error("Container not found: {handle}")]
    #[diagnostic(code(kennel::handle::not_found))]
    HandleNotFound {
        /// The handle that was not found.
        handle: String,
    },

    /// A live container already uses this handle.
    #[error("Container already exists: {handle}")]
    #[diagnostic(code(kennel::handle::in_use))]
    HandleInUse {
        /// The contested handle.
        handle: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(kennel::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(kennel::serialization))]
    Serialization(String),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(kennel::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// An `iptables` invocation failed.
    #[error("iptables {action}: {stderr}")]
    #[diagnostic(code(kennel::iptables::command))]
    Iptables {
        /// What was being attempted, e.g. `create-instance-chains`.
        action: String,
        /// Trimmed stderr of the failing command.
        stderr: String,
    },

    /// An `iptables-restore` batch failed.
    #[error("iptables: {action}: {stderr}")]
    #[diagnostic(code(kennel::iptables::restore))]
    IptablesRestore {
        /// What was being attempted, e.g. `bulk-prepend-rules`.
        action: String,
        /// Trimmed stderr of the failing command.
        stderr: String,
    },

    /// A firewall rule could not be translated into arguments.
    #[error("Invalid firewall rule: {reason}")]
    #[diagnostic(code(kennel::iptables::invalid_rule))]
    InvalidRule {
        /// Why the rule was rejected.
        reason: String,
    },

    /// No ports remain in the pool.
    #[error("Port pool exhausted")]
    #[diagnostic(code(kennel::ports::exhausted))]
    PortPoolExhausted,

    /// Port is already handed out.
    #[error("Port already acquired: {port}")]
    #[diagnostic(code(kennel::ports::taken))]
    PortTaken {
        /// The contested port.
        port: u16,
    },

    /// Release of a port that is not currently acquired.
    #[error("Port not acquired: {port}")]
    #[diagnostic(code(kennel::ports::not_acquired))]
    PortNotAcquired {
        /// The released port.
        port: u16,
    },

    /// No subnets remain in the dynamic range.
    #[error("Subnet pool exhausted")]
    #[diagnostic(code(kennel::subnets::exhausted))]
    SubnetPoolExhausted,

    /// A requested subnet overlaps another allocation or the dynamic range.
    #[error("Subnet conflict: {subnet}")]
    #[diagnostic(code(kennel::subnets::conflict))]
    SubnetConflict {
        /// The requested subnet.
        subnet: String,
    },

    /// A requested address is already allocated.
    #[error("IP already allocated: {ip}")]
    #[diagnostic(code(kennel::subnets::ip_taken))]
    IpTaken {
        /// The contested address.
        ip: String,
    },

    /// The pidfile never appeared.
    #[error("Timed out after {elapsed:?} waiting for pidfile {}", path.display())]
    #[diagnostic(code(kennel::process::pidfile_timeout))]
    PidFileTimeout {
        /// Pidfile location.
        path: PathBuf,
        /// How long was spent polling.
        elapsed: Duration,
    },

    /// The supervisor reported a non-zero launch status.
    #[error("Process launch failed (status {code}): {message}")]
    #[diagnostic(code(kennel::process::launch_failed))]
    LaunchFailed {
        /// Status byte from the supervisor, or its exit code.
        code: i32,
        /// Best available explanation, usually from the runtime log.
        message: String,
    },

    /// No such process is tracked.
    #[error("Process not found: {id}")]
    #[diagnostic(code(kennel::process::not_found))]
    ProcessNotFound {
        /// The process identifier.
        id: String,
    },

    /// An external command could not be run or returned failure.
    #[error("Command `{program}` failed: {message}")]
    #[diagnostic(code(kennel::command))]
    Command {
        /// Program name.
        program: String,
        /// Error text.
        message: String,
    },

    /// Permission denied.
    #[error("Permission denied: {operation}")]
    #[diagnostic(
        code(kennel::permission_denied),
        help("Try running with elevated privileges (sudo)")
    )]
    PermissionDenied {
        /// The operation that was denied.
        operation: String,
    },

    /// Feature not supported on this platform.
    #[error("Feature not supported: {feature}")]
    #[diagnostic(code(kennel::unsupported))]
    Unsupported {
        /// The unsupported feature.
        feature: String,
    },

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(kennel::internal),
        help("This is a bug, please report it")
    )]
    Internal {
        /// The error message.
        message: String,
    },
}

impl KennelError {
    /// Shorthand for an [`KennelError::Iptables`] error.
    pub fn iptables(action: impl Into<String>, stderr: impl AsRef<str>) -> Self {
        Self::Iptables {
            action: action.into(),
            stderr: stderr.as_ref().trim().to_string(),
        }
    }

    /// Shorthand for an [`KennelError::InvalidRule`] error.
    pub fn invalid_rule(reason: impl Into<String>) -> Self {
        Self::InvalidRule {
            reason: reason.into(),
        }
    }

    /// Whether the error means the target is already gone.
    ///
    /// Teardown paths treat these as success.
    #[must_use]
    pub fn is_already_gone(&self) -> bool {
        match self {
            Self::Io(err) => err.kind() == std::io::ErrorKind::NotFound,
            Self::Iptables { stderr, .. } | Self::Command { message: stderr, .. } => {
                let lower = stderr.to_ascii_lowercase();
                lower.contains("no chain/target/match")
                    || lower.contains("does a matching rule exist")
                    || lower.contains("cannot find device")
                    || lower.contains("does not exist")
            }
            Self::HandleNotFound { .. } | Self::ProcessNotFound { .. } => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for KennelError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
