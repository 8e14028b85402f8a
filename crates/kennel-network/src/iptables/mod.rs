//! IPTables engine.
//!
//! Owns the host-wide chains (created once by [`IptablesEngine::setup`]) and
//! the per-container instance chains, and translates NetOut/NetIn rules into
//! ordered `iptables` invocations.
//!
//! Chain layout for prefix `w--`:
//!
//! ```text
//! filter  INPUT   -i w+ -> w--input
//!         FORWARD -i w+ -> w--forward -> w--instance-<id> -> w--default
//!                                                      \-> w--instance-<id>-log
//! nat     PREROUTING/OUTPUT -> w--prerouting -> w--instance-<id>
//!         POSTROUTING       -> w--postrouting
//! ```

mod chains;
mod global;
mod instance;
mod lock;
mod restore;
mod rules;

use std::path::PathBuf;
use std::sync::Arc;

use kennel_common::{KennelError, KennelResult};
use serde::{Deserialize, Serialize};

use crate::command::{CommandOutput, CommandRunner};

pub use chains::{GlobalChains, InstanceChains, MAX_CHAIN_NAME, MAX_PREFIX_LEN};
pub use global::GlobalSetup;
pub use lock::{IptablesLock, LockGuard};
pub use restore::{quote, tokenize};
pub use rules::{IcmpControl, IpRange, NetInRule, NetOutRule, PortRange, Protocol};

/// iptables table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    /// `filter`
    Filter,
    /// `nat`
    Nat,
}

impl Table {
    /// Name passed to `-t`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Filter => "filter",
            Self::Nat => "nat",
        }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the engine finds its tools and how it names things.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IptablesSettings {
    /// `iptables` binary.
    pub binary: String,
    /// `iptables-restore` binary.
    pub restore_binary: String,
    /// Prefix of every chain Kennel owns (at most five characters).
    pub chain_prefix: String,
    /// Prefix of every host interface Kennel creates.
    pub interface_prefix: String,
    /// Host-wide lock file.
    pub lock_file: PathBuf,
}

impl Default for IptablesSettings {
    fn default() -> Self {
        Self {
            binary: "iptables".into(),
            restore_binary: "iptables-restore".into(),
            chain_prefix: "w--".into(),
            interface_prefix: "w".into(),
            lock_file: PathBuf::from("/run/kennel/iptables.lock"),
        }
    }
}

/// Global and per-instance chain management.
#[derive(Debug, Clone)]
pub struct IptablesEngine {
    runner: Arc<dyn CommandRunner>,
    settings: IptablesSettings,
    chains: GlobalChains,
    lock: IptablesLock,
}

impl IptablesEngine {
    /// Engine driving `runner` with `settings`.
    ///
    /// # Errors
    ///
    /// Returns [`KennelError::Config`] if the chain prefix would push chain
    /// names past the kernel's limit.
    pub fn new(runner: Arc<dyn CommandRunner>, settings: IptablesSettings) -> KennelResult<Self> {
        chains::validate_prefix(&settings.chain_prefix)?;
        let chains = GlobalChains::new(&settings.chain_prefix);
        let lock = IptablesLock::new(&settings.lock_file);
        Ok(Self {
            runner,
            settings,
            chains,
            lock,
        })
    }

    /// Names of the host-wide chains.
    #[must_use]
    pub const fn chains(&self) -> &GlobalChains {
        &self.chains
    }

    /// Settings in use.
    #[must_use]
    pub const fn settings(&self) -> &IptablesSettings {
        &self.settings
    }

    /// Names of the chains owned by `handle`.
    #[must_use]
    pub fn instance_chains(&self, handle: &kennel_common::ContainerHandle) -> InstanceChains {
        InstanceChains::new(&self.settings.chain_prefix, handle)
    }

    async fn session(&self) -> KennelResult<Session<'_>> {
        let guard = self.lock.acquire().await?;
        Ok(Session {
            engine: self,
            _guard: guard,
        })
    }
}

/// A sequence of invocations under the host-wide lock.
struct Session<'a> {
    engine: &'a IptablesEngine,
    _guard: LockGuard,
}

impl Session<'_> {
    fn command(table: Table, args: &[String]) -> Vec<String> {
        let mut full = Vec::with_capacity(args.len() + 3);
        full.extend(["-w".to_string(), "-t".to_string(), table.as_str().to_string()]);
        full.extend(args.iter().cloned());
        full
    }

    /// Run and return the raw output.
    async fn raw(&self, table: Table, args: &[String]) -> KennelResult<CommandOutput> {
        let settings = &self.engine.settings;
        self.engine
            .runner
            .run(&settings.binary, &Self::command(table, args), None)
            .await
    }

    /// Run; a non-zero exit becomes `iptables <action>: <stderr>`.
    async fn run(&self, action: &str, table: Table, args: &[String]) -> KennelResult<String> {
        let output = self.raw(table, args).await?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(KennelError::iptables(action, &output.stderr))
        }
    }

    /// Run, logging instead of failing.
    async fn best_effort(&self, table: Table, args: &[String]) {
        match self.raw(table, args).await {
            Ok(output) if output.success() => {}
            Ok(output) => {
                tracing::debug!(table = %table, ?args, stderr = output.stderr.trim(), "Ignoring iptables failure");
            }
            Err(e) => tracing::debug!(table = %table, ?args, error = %e, "Ignoring iptables failure"),
        }
    }

    async fn chain_exists(&self, table: Table, chain: &str) -> KennelResult<bool> {
        let output = self
            .raw(table, &crate::command::args(["-n", "-L", chain]))
            .await?;
        Ok(output.success())
    }

    async fn rule_exists(&self, table: Table, chain: &str, rule: &[String]) -> KennelResult<bool> {
        let mut args = crate::command::args(["-C", chain]);
        args.extend(rule.iter().cloned());
        Ok(self.raw(table, &args).await?.success())
    }

    /// `-N`, tolerating an existing chain, then `-F`.
    async fn fresh_chain(&self, action: &str, table: Table, chain: &str) -> KennelResult<()> {
        if !self.chain_exists(table, chain).await? {
            self.run(action, table, &crate::command::args(["-N", chain]))
                .await?;
        }
        self.run(action, table, &crate::command::args(["-F", chain]))
            .await?;
        Ok(())
    }

    /// Insert `rule` at the top of `chain` unless an identical rule exists.
    async fn ensure_hook(&self, action: &str, table: Table, chain: &str, rule: &[String]) -> KennelResult<()> {
        if self.rule_exists(table, chain, rule).await? {
            return Ok(());
        }
        let mut args = crate::command::args(["-I", chain, "1"]);
        args.extend(rule.iter().cloned());
        self.run(action, table, &args).await?;
        Ok(())
    }

    async fn append(&self, action: &str, table: Table, chain: &str, rule: &[String]) -> KennelResult<()> {
        let mut args = crate::command::args(["-A", chain]);
        args.extend(rule.iter().cloned());
        self.run(action, table, &args).await?;
        Ok(())
    }

    async fn restore(&self, action: &str, payload: &str) -> KennelResult<()> {
        let settings = &self.engine.settings;
        let output = self
            .engine
            .runner
            .run(
                &settings.restore_binary,
                &crate::command::args(["--noflush"]),
                Some(payload),
            )
            .await?;
        if output.success() {
            Ok(())
        } else {
            Err(KennelError::IptablesRestore {
                action: action.to_string(),
                stderr: output.stderr.trim().to_string(),
            })
        }
    }
}
