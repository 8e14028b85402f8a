//! NetOut / NetIn rules and their translation into iptables arguments.

use std::net::Ipv4Addr;

use kennel_common::{ContainerHandle, KennelError, KennelResult};
use serde::{Deserialize, Serialize};

use super::restore::payload;
use super::{IptablesEngine, Table};
use crate::command::args;

/// Protocol matched by a NetOut rule.
///
/// Serialized as its numeric code: 0 all, 1 tcp, 2 icmp, 3 udp.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Protocol {
    /// Any protocol.
    #[default]
    All,
    /// TCP.
    Tcp,
    /// ICMP.
    Icmp,
    /// UDP.
    Udp,
}

impl Protocol {
    /// Decode a numeric protocol code.
    ///
    /// # Errors
    ///
    /// Returns [`KennelError::InvalidRule`] for unknown codes.
    pub fn from_code(code: u8) -> KennelResult<Self> {
        match code {
            0 => Ok(Self::All),
            1 => Ok(Self::Tcp),
            2 => Ok(Self::Icmp),
            3 => Ok(Self::Udp),
            other => Err(KennelError::invalid_rule(format!("invalid protocol: {other}"))),
        }
    }

    /// Numeric code.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::All => 0,
            Self::Tcp => 1,
            Self::Icmp => 2,
            Self::Udp => 3,
        }
    }

    const fn name(self) -> Option<&'static str> {
        match self {
            Self::All => None,
            Self::Tcp => Some("tcp"),
            Self::Icmp => Some("icmp"),
            Self::Udp => Some("udp"),
        }
    }
}

impl TryFrom<u8> for Protocol {
    type Error = KennelError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Self::from_code(code)
    }
}

impl From<Protocol> for u8 {
    fn from(protocol: Protocol) -> Self {
        protocol.code()
    }
}

/// Inclusive IPv4 range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpRange {
    /// First address.
    pub start: Ipv4Addr,
    /// Last address.
    pub end: Ipv4Addr,
}

impl IpRange {
    /// A single address.
    #[must_use]
    pub const fn single(ip: Ipv4Addr) -> Self {
        Self { start: ip, end: ip }
    }

    /// `start..=end`.
    #[must_use]
    pub const fn new(start: Ipv4Addr, end: Ipv4Addr) -> Self {
        Self { start, end }
    }

    fn to_args(self) -> KennelResult<Vec<String>> {
        if self.start > self.end {
            return Err(KennelError::invalid_rule(format!(
                "invalid IP range: {} > {}",
                self.start, self.end
            )));
        }
        if self.start == self.end {
            Ok(args(["--destination".to_string(), self.start.to_string()]))
        } else {
            Ok(args([
                "-m".to_string(),
                "iprange".to_string(),
                "--dst-range".to_string(),
                format!("{}-{}", self.start, self.end),
            ]))
        }
    }
}

/// Inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    /// First port.
    pub start: u16,
    /// Last port.
    pub end: u16,
}

impl PortRange {
    /// A single port.
    #[must_use]
    pub const fn single(port: u16) -> Self {
        Self { start: port, end: port }
    }

    /// `start..=end`.
    #[must_use]
    pub const fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    fn to_args(self) -> KennelResult<Vec<String>> {
        if self.start > self.end {
            return Err(KennelError::invalid_rule(format!(
                "invalid port range: {} > {}",
                self.start, self.end
            )));
        }
        let spec = if self.start == self.end {
            self.start.to_string()
        } else {
            format!("{}:{}", self.start, self.end)
        };
        Ok(args(["--destination-port".to_string(), spec]))
    }
}

/// ICMP type and optional code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IcmpControl {
    /// ICMP type.
    #[serde(rename = "type")]
    pub icmp_type: u8,
    /// ICMP code; any code when unset.
    #[serde(default)]
    pub code: Option<u8>,
}

/// An outbound allow rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetOutRule {
    /// Protocol to match.
    pub protocol: Protocol,
    /// Destination ranges; any destination when empty.
    pub networks: Vec<IpRange>,
    /// Destination ports; only valid with TCP or UDP.
    pub ports: Vec<PortRange>,
    /// ICMP match; only valid with ICMP.
    pub icmps: Option<IcmpControl>,
    /// Log new TCP connections matched by this rule.
    pub log: bool,
}

impl NetOutRule {
    /// Argument lists (without chain or position), networks outer and
    /// ports inner. Always at least one.
    ///
    /// # Errors
    ///
    /// Returns [`KennelError::InvalidRule`] for inconsistent rules.
    pub fn translate(&self, log_chain: &str) -> KennelResult<Vec<Vec<String>>> {
        if !self.ports.is_empty() && !matches!(self.protocol, Protocol::Tcp | Protocol::Udp) {
            return Err(KennelError::invalid_rule(format!(
                "port range is not valid for protocol {}",
                self.protocol.name().unwrap_or("all")
            )));
        }
        if self.icmps.is_some() && self.protocol != Protocol::Icmp {
            return Err(KennelError::invalid_rule("icmp control requires the icmp protocol"));
        }

        let networks: Vec<Option<IpRange>> = if self.networks.is_empty() {
            vec![None]
        } else {
            self.networks.iter().copied().map(Some).collect()
        };
        let ports: Vec<Option<PortRange>> = if self.ports.is_empty() {
            vec![None]
        } else {
            self.ports.iter().copied().map(Some).collect()
        };

        let mut rules = Vec::with_capacity(networks.len() * ports.len());
        for network in &networks {
            for port in &ports {
                let mut rule = Vec::new();
                if let Some(name) = self.protocol.name() {
                    rule.extend(args(["--protocol", name]));
                }
                if let Some(network) = network {
                    rule.extend(network.to_args()?);
                }
                if let Some(port) = port {
                    rule.extend(port.to_args()?);
                }
                if let Some(icmp) = self.icmps {
                    let spec = icmp
                        .code
                        .map_or_else(|| icmp.icmp_type.to_string(), |code| format!("{}/{code}", icmp.icmp_type));
                    rule.extend(args(["--icmp-type".to_string(), spec]));
                }
                if self.log {
                    rule.extend(args(["--goto", log_chain]));
                } else {
                    rule.extend(args(["--jump", "RETURN"]));
                }
                rules.push(rule);
            }
        }
        Ok(rules)
    }
}

/// An inbound port mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetInRule {
    /// Port on the host's external address.
    pub host_port: u16,
    /// Port inside the container.
    pub container_port: u16,
}

impl IptablesEngine {
    /// Prepend the rules of `rule` to the instance chain.
    ///
    /// # Errors
    ///
    /// Returns [`KennelError::InvalidRule`] before touching iptables if the
    /// rule cannot be translated, otherwise [`KennelError::Iptables`].
    pub async fn open(&self, handle: &ContainerHandle, rule: &NetOutRule) -> KennelResult<()> {
        let chains = self.instance_chains(handle);
        let translated = rule.translate(&chains.log)?;

        let session = self.session().await?;
        for rule in translated {
            let mut command = args(["-I", chains.instance.as_str(), "1"]);
            command.extend(rule);
            session.run("prepend-rule", Table::Filter, &command).await?;
        }
        tracing::debug!(handle = %handle, chain = %chains.instance, "Opened NetOut rule");
        Ok(())
    }

    /// Prepend many rules with a single `iptables-restore` call.
    ///
    /// # Errors
    ///
    /// Returns [`KennelError::InvalidRule`] if any rule cannot be translated
    /// (nothing is applied), or [`KennelError::IptablesRestore`] if the batch
    /// is rejected.
    pub async fn bulk_open(&self, handle: &ContainerHandle, rules: &[NetOutRule]) -> KennelResult<()> {
        let chains = self.instance_chains(handle);

        let mut lines = Vec::new();
        for rule in rules {
            for translated in rule.translate(&chains.log)? {
                let mut line = args(["-I", chains.instance.as_str(), "1"]);
                line.extend(translated);
                lines.push(line);
            }
        }
        if lines.is_empty() {
            return Ok(());
        }

        let session = self.session().await?;
        session
            .restore("bulk-prepend-rules", &payload(Table::Filter, &lines))
            .await?;
        tracing::debug!(handle = %handle, count = lines.len(), "Bulk opened NetOut rules");
        Ok(())
    }
}
