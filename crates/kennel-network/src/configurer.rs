//! Per-container network wiring.
//!
//! Allocates an address, plugs a veth into the subnet's bridge, configures
//! the container side from inside its namespace, writes its resolver files
//! and creates its iptables chains. Teardown undoes all of it.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use kennel_common::{ContainerHandle, KennelError, KennelResult};

use crate::bridge::{self, MAX_IFNAME};
use crate::command::CommandRunner;
use crate::config::{NetworkConfig, NetworkSettings, NetworkSpec};
use crate::dns;
use crate::iptables::{GlobalSetup, IptablesEngine, NetInRule, NetOutRule};
use crate::portpool::PortPool;
use crate::subnet::{SubnetPool, gateway};
use crate::veth::VethPair;

/// Interface prefix budget: `<prefix><10 hex>-0` must fit `IFNAMSIZ`.
const MAX_INTERFACE_PREFIX: usize = MAX_IFNAME - ContainerHandle::INSTANCE_ID_LEN - 2;

/// Applies and removes container networks.
#[derive(Debug)]
pub struct Configurer {
    runner: Arc<dyn CommandRunner>,
    iptables: IptablesEngine,
    subnets: SubnetPool,
    ports: Arc<PortPool>,
    settings: NetworkSettings,
    proc_root: PathBuf,
}

impl Configurer {
    /// Configurer using `settings`, drawing NetIn ports from `ports`.
    ///
    /// # Errors
    ///
    /// Returns [`KennelError::Config`] for invalid prefixes or pool ranges.
    pub fn new(runner: Arc<dyn CommandRunner>, settings: NetworkSettings, ports: Arc<PortPool>) -> KennelResult<Self> {
        let prefix = &settings.iptables.interface_prefix;
        if prefix.is_empty() || prefix.len() > MAX_INTERFACE_PREFIX {
            return Err(KennelError::Config {
                message: format!("interface prefix {prefix:?} must be 1-{MAX_INTERFACE_PREFIX} characters"),
            });
        }
        let iptables = IptablesEngine::new(Arc::clone(&runner), settings.iptables.clone())?;
        let subnets = SubnetPool::new(settings.pool)?;
        Ok(Self {
            runner,
            iptables,
            subnets,
            ports,
            settings,
            proc_root: PathBuf::from("/proc"),
        })
    }

    /// Resolve container files under `root` instead of `/proc`.
    #[must_use]
    pub fn with_proc_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.proc_root = root.into();
        self
    }

    /// The iptables engine.
    #[must_use]
    pub const fn iptables(&self) -> &IptablesEngine {
        &self.iptables
    }

    /// The subnet pool.
    #[must_use]
    pub const fn subnets(&self) -> &SubnetPool {
        &self.subnets
    }

    /// The port pool.
    #[must_use]
    pub fn ports(&self) -> &PortPool {
        &self.ports
    }

    /// Create the host-wide chains and apply the configured deny networks.
    ///
    /// Deny networks are rebuilt on every call so configuration changes take
    /// effect on restart.
    ///
    /// # Errors
    ///
    /// Returns the first iptables failure.
    pub async fn setup_host(&self) -> KennelResult<()> {
        let setup = GlobalSetup {
            allow_host_access: self.settings.allow_host_access,
            deny_networks: self.settings.deny_networks.clone(),
        };
        self.iptables.setup(&setup).await?;
        self.iptables.reset_deny_networks(&setup.deny_networks).await
    }

    /// Wire the network of the container whose init is `pid`.
    ///
    /// On failure every step already taken is undone and the address is
    /// returned to the pool.
    ///
    /// # Errors
    ///
    /// Returns the pool or command error that stopped configuration.
    pub async fn configure(&self, handle: &ContainerHandle, pid: u32, spec: &NetworkSpec) -> KennelResult<NetworkConfig> {
        let (subnet, container_ip) = self.subnets.acquire(spec.subnet, spec.ip)?;
        let prefix = &self.settings.iptables.interface_prefix;
        let veth = VethPair::for_handle(prefix, handle);

        let config = NetworkConfig {
            handle: handle.clone(),
            bridge_name: bridge::bridge_name(prefix, subnet),
            host_interface: veth.host.clone(),
            container_interface: veth.container.clone(),
            container_ip,
            bridge_ip: gateway(subnet),
            subnet,
            mtu: self.settings.mtu,
            dns_servers: if spec.dns_servers.is_empty() {
                self.settings.dns_servers.clone()
            } else {
                spec.dns_servers.clone()
            },
            instance_chain: self.iptables.instance_chains(handle).instance,
            external_ip: self.settings.external_ip,
        };

        tracing::info!(
            handle = %handle,
            pid,
            ip = %container_ip,
            subnet = %subnet,
            bridge = %config.bridge_name,
            "Configuring container network"
        );

        let hostname = spec.hostname.as_deref().unwrap_or(handle.as_str());
        if let Err(e) = self.apply(&config, &veth, pid, hostname).await {
            tracing::warn!(handle = %handle, error = %e, "Network configuration failed, rolling back");
            self.destroy(&config).await;
            return Err(e);
        }
        Ok(config)
    }

    async fn apply(&self, config: &NetworkConfig, veth: &VethPair, pid: u32, hostname: &str) -> KennelResult<()> {
        let runner = self.runner.as_ref();

        bridge::ensure(runner, &config.bridge_name, config.bridge_ip, config.subnet, config.mtu).await?;
        veth.create(runner, &config.bridge_name, config.mtu, pid).await?;
        veth.configure_container_side(runner, pid, config.container_ip, config.subnet, config.bridge_ip)
            .await?;

        let root = dns::container_root(&self.proc_root, pid);
        dns::write_files(&root, &config.dns_servers, hostname, config.container_ip)?;

        // Leftovers from a crash would make chain creation fail.
        self.iptables.destroy_instance_chains(&config.handle).await?;
        self.iptables
            .create_instance_chains(&config.handle, &config.bridge_name, config.container_ip, config.subnet)
            .await
    }

    /// Re-reserve the address of a container that survived a restart.
    ///
    /// # Errors
    ///
    /// Returns [`KennelError::IpTaken`] if the address is already reserved.
    pub fn restore(&self, config: &NetworkConfig) -> KennelResult<()> {
        self.subnets.remove(config.subnet, config.container_ip)
    }

    /// Undo [`Self::configure`]. Best-effort: every step runs, failures are
    /// logged.
    pub async fn destroy(&self, config: &NetworkConfig) {
        let handle = &config.handle;
        if let Err(e) = self.iptables.destroy_instance_chains(handle).await {
            tracing::warn!(handle = %handle, error = %e, "Failed to destroy instance chains");
        }

        let veth = VethPair {
            host: config.host_interface.clone(),
            container: config.container_interface.clone(),
        };
        if let Err(e) = veth.delete(self.runner.as_ref()).await {
            tracing::warn!(handle = %handle, error = %e, "Failed to delete veth");
        }

        if self.subnets.release(config.subnet, config.container_ip) {
            if let Err(e) = bridge::delete(self.runner.as_ref(), &config.bridge_name).await {
                tracing::warn!(bridge = %config.bridge_name, error = %e, "Failed to delete bridge");
            }
        }
        tracing::debug!(handle = %handle, "Container network destroyed");
    }

    /// Map a host port to a container port.
    ///
    /// A zero host port takes the next port from the pool; an explicit one
    /// is reserved in the pool. A zero container port mirrors the host port.
    ///
    /// # Errors
    ///
    /// Returns [`KennelError::PortPoolExhausted`], [`KennelError::PortTaken`],
    /// [`KennelError::Config`] when no external IP is configured, or the
    /// iptables failure. A port taken from the pool is returned on failure.
    pub async fn net_in(&self, config: &NetworkConfig, host_port: u16, container_port: u16) -> KennelResult<NetInRule> {
        let external_ip: Ipv4Addr = config.external_ip.ok_or_else(|| KennelError::Config {
            message: "net-in requires an external IP".into(),
        })?;

        let host_port = if host_port == 0 {
            self.ports.acquire()?
        } else {
            self.ports.remove(host_port)?;
            host_port
        };
        let container_port = if container_port == 0 { host_port } else { container_port };

        if let Err(e) = self
            .iptables
            .forward(&config.handle, external_ip, config.container_ip, host_port, container_port)
            .await
        {
            if let Err(release) = self.ports.release(host_port) {
                tracing::warn!(handle = %config.handle, port = host_port, error = %release, "Failed to return port");
            }
            return Err(e);
        }

        tracing::info!(handle = %config.handle, host_port, container_port, "Mapped port");
        Ok(NetInRule {
            host_port,
            container_port,
        })
    }

    /// Allow one outbound rule.
    ///
    /// # Errors
    ///
    /// See [`IptablesEngine::open`].
    pub async fn net_out(&self, handle: &ContainerHandle, rule: &NetOutRule) -> KennelResult<()> {
        self.iptables.open(handle, rule).await
    }

    /// Allow many outbound rules in one batch.
    ///
    /// # Errors
    ///
    /// See [`IptablesEngine::bulk_open`].
    pub async fn bulk_net_out(&self, handle: &ContainerHandle, rules: &[NetOutRule]) -> KennelResult<()> {
        self.iptables.bulk_open(handle, rules).await
    }
}
