//! Host configuration.
//!
//! Loaded from a TOML file; every section and key is optional.
//!
//! ```toml
//! [paths]
//! root = "/var/lib/kennel"
//!
//! [runtime]
//! binary = "runc"
//!
//! [network]
//! pool = "10.254.0.0/22"
//! external_ip = "203.0.113.7"
//!
//! [ports]
//! start = 60000
//! size = 5000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use kennel_common::{KennelError, KennelPaths, KennelResult};
use kennel_network::NetworkSettings;
use serde::{Deserialize, Serialize};

use crate::exec::PidFileReader;

/// Everything the orchestrator and the CLI are configured with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KennelConfig {
    /// Where state lives.
    pub paths: PathsConfig,
    /// Runtime and supervisor binaries.
    pub runtime: RuntimeConfig,
    /// Container networking.
    pub network: NetworkSettings,
    /// Host port pool.
    pub ports: PortsConfig,
}

/// `[paths]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Data directory (depot, network configs, port pool state).
    pub root: PathBuf,
    /// Runtime directory (lock files).
    pub runtime_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let paths = KennelPaths::default();
        Self {
            root: paths.root,
            runtime_dir: paths.runtime,
        }
    }
}

/// `[runtime]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// runc-compatible OCI runtime.
    pub binary: PathBuf,
    /// `kennel-shim` binary.
    pub shim: PathBuf,
    /// How long to wait for a pidfile, in milliseconds.
    pub pidfile_timeout_ms: u64,
    /// Pidfile poll interval, in milliseconds.
    pub pidfile_interval_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("runc"),
            shim: default_shim(),
            pidfile_timeout_ms: 10_000,
            pidfile_interval_ms: 100,
        }
    }
}

/// The supervisor installed next to the running binary, else `$PATH`.
fn default_shim() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("kennel-shim")))
        .filter(|shim| shim.is_file())
        .unwrap_or_else(|| PathBuf::from("kennel-shim"))
}

/// `[ports]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortsConfig {
    /// First host port handed out.
    pub start: u16,
    /// Number of ports in the pool.
    pub size: u16,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self { start: 60000, size: 5000 }
    }
}

impl KennelConfig {
    /// Read `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid TOML.
    pub fn load(path: &Path) -> KennelResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| KennelError::Config {
            message: format!("Failed to read {}: {e}", path.display()),
        })?;
        Self::from_toml(&content)
    }

    /// Parse TOML.
    ///
    /// # Errors
    ///
    /// Returns [`KennelError::Config`] on invalid TOML or unknown values.
    pub fn from_toml(content: &str) -> KennelResult<Self> {
        toml::from_str(content).map_err(|e| KennelError::Config {
            message: format!("Failed to parse TOML: {e}"),
        })
    }

    /// Filesystem layout.
    #[must_use]
    pub fn paths(&self) -> KennelPaths {
        KennelPaths {
            root: self.paths.root.clone(),
            runtime: self.paths.runtime_dir.clone(),
        }
    }

    /// Pidfile lookup bounds.
    #[must_use]
    pub const fn pidfile_reader(&self) -> PidFileReader {
        PidFileReader::new(
            Duration::from_millis(self.runtime.pidfile_timeout_ms),
            Duration::from_millis(self.runtime.pidfile_interval_ms),
        )
    }

    /// Keep all state, including the iptables lock, under `root`.
    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        let paths = KennelPaths::with_root(root);
        self.network.iptables.lock_file = paths.iptables_lock();
        self.paths = PathsConfig {
            root: paths.root,
            runtime_dir: paths.runtime,
        };
        self
    }

    /// Set the OCI runtime.
    #[must_use]
    pub fn with_runtime(mut self, binary: impl Into<PathBuf>) -> Self {
        self.runtime.binary = binary.into();
        self
    }

    /// Set the supervisor binary.
    #[must_use]
    pub fn with_shim(mut self, shim: impl Into<PathBuf>) -> Self {
        self.runtime.shim = shim.into();
        self
    }

    /// Set the port pool range.
    #[must_use]
    pub const fn with_ports(mut self, start: u16, size: u16) -> Self {
        self.ports = PortsConfig { start, size };
        self
    }

    /// Set the network settings.
    #[must_use]
    pub fn with_network(mut self, network: NetworkSettings) -> Self {
        self.network = network;
        self
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = KennelConfig::from_toml(
            r#"
            [paths]
            root = "/srv/kennel"

            [runtime]
            binary = "/usr/bin/crun"

            [network]
            pool = "10.80.0.0/16"
            external_ip = "203.0.113.7"

            [ports]
            start = 61000
            "#,
        )
        .unwrap();

        assert_eq!(config.paths.root, PathBuf::from("/srv/kennel"));
        assert_eq!(config.runtime.binary, PathBuf::from("/usr/bin/crun"));
        assert_eq!(config.runtime.pidfile_timeout_ms, 10_000);
        assert_eq!(config.network.external_ip, Some(Ipv4Addr::new(203, 0, 113, 7)));
        assert_eq!(config.network.mtu, 1500);
        assert_eq!(config.ports, PortsConfig { start: 61000, size: 5000 });
    }

    #[test]
    fn invalid_toml_is_config_error() {
        let err = KennelConfig::from_toml("[ports]\nstart = \"many\"").unwrap_err();
        assert!(matches!(err, KennelError::Config { .. }));
    }

    #[test]
    fn missing_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            KennelConfig::load(&dir.path().join("kennel.toml")),
            Err(KennelError::Config { .. })
        ));
    }

    #[test]
    fn builder_pattern() {
        let config = KennelConfig::default()
            .with_root("/tmp/kennel")
            .with_runtime("crun")
            .with_shim("/opt/kennel-shim")
            .with_ports(40000, 10);

        assert_eq!(config.paths().depot(), PathBuf::from("/tmp/kennel/depot"));
        assert_eq!(config.network.iptables.lock_file, PathBuf::from("/tmp/kennel/run/iptables.lock"));
        assert_eq!(config.runtime.binary, PathBuf::from("crun"));
        assert_eq!(config.ports.size, 10);
        assert_eq!(
            config.pidfile_reader(),
            PidFileReader::new(Duration::from_secs(10), Duration::from_millis(100))
        );
    }
}
