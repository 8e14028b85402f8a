//! Network settings and per-container network configuration.

use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use kennel_common::{ContainerHandle, KennelResult};
use serde::{Deserialize, Serialize};

use crate::iptables::IptablesSettings;
use crate::subnet::{IpSelector, SubnetSelector};

/// Host-wide network settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    /// Range dynamic /30 subnets are carved from.
    pub pool: Ipv4Network,
    /// MTU of bridges and veths.
    pub mtu: u32,
    /// Resolvers written to containers' resolv.conf when none are requested.
    pub dns_servers: Vec<Ipv4Addr>,
    /// Host address NetIn mappings listen on.
    pub external_ip: Option<Ipv4Addr>,
    /// Destinations containers may never reach.
    pub deny_networks: Vec<Ipv4Network>,
    /// Let containers reach services on the host.
    pub allow_host_access: bool,
    /// iptables binaries, prefixes and lock file.
    pub iptables: IptablesSettings,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            pool: Ipv4Network::new(Ipv4Addr::new(10, 254, 0, 0), 22).unwrap_or_else(|_| unreachable!()),
            mtu: 1500,
            dns_servers: vec![Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(8, 8, 4, 4)],
            external_ip: None,
            deny_networks: Vec::new(),
            allow_host_access: false,
            iptables: IptablesSettings::default(),
        }
    }
}

/// What a container asks for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSpec {
    /// Subnet selection.
    pub subnet: SubnetSelector,
    /// Address selection.
    pub ip: IpSelector,
    /// Resolvers; the host-wide defaults when empty.
    pub dns_servers: Vec<Ipv4Addr>,
    /// Hostname written to the container's hosts file; the handle when unset.
    pub hostname: Option<String>,
}

/// Everything applied for one container, persisted so teardown and restarts
/// can undo or re-reserve it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Owning container.
    pub handle: ContainerHandle,
    /// Bridge the host veth is attached to.
    pub bridge_name: String,
    /// Host side of the veth pair.
    pub host_interface: String,
    /// Container side of the veth pair.
    pub container_interface: String,
    /// Container address.
    pub container_ip: Ipv4Addr,
    /// Bridge (gateway) address.
    pub bridge_ip: Ipv4Addr,
    /// Container subnet.
    pub subnet: Ipv4Network,
    /// Interface MTU.
    pub mtu: u32,
    /// Resolvers written to resolv.conf.
    pub dns_servers: Vec<Ipv4Addr>,
    /// Name of the filter/nat instance chain.
    pub instance_chain: String,
    /// Host address NetIn mappings use.
    pub external_ip: Option<Ipv4Addr>,
}

impl NetworkConfig {
    /// Read a persisted config.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &std::path::Path) -> KennelResult<Self> {
        Ok(serde_json::from_slice(&std::fs::read(path)?)?)
    }

    /// Persist to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &std::path::Path) -> KennelResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}
