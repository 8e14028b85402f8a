//! Subnet and address allocation.
//!
//! Dynamic requests get a private /30 carved out of the configured pool.
//! Static requests name a subnet outside the pool, which several containers
//! may share. A subnet returns to the pool only when its last address is
//! released.

use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use kennel_common::{KennelError, KennelResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

const DYNAMIC_PREFIX: u8 = 30;

/// Which subnet a container wants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubnetSelector {
    /// Next free /30 from the pool.
    #[default]
    Dynamic,
    /// A caller-chosen subnet outside the pool.
    Static(Ipv4Network),
}

/// Which address inside the subnet a container wants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpSelector {
    /// Next free host address.
    #[default]
    Dynamic,
    /// A caller-chosen address.
    Static(Ipv4Addr),
}

/// Tracks live subnet/address allocations.
#[derive(Debug)]
pub struct SubnetPool {
    dynamic: Ipv4Network,
    allocations: Mutex<HashMap<Ipv4Network, BTreeSet<Ipv4Addr>>>,
}

/// First host of `subnet`, used by the bridge.
#[must_use]
pub fn gateway(subnet: Ipv4Network) -> Ipv4Addr {
    offset(subnet.network(), 1)
}

fn offset(ip: Ipv4Addr, by: u32) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip).wrapping_add(by))
}

fn overlaps(a: Ipv4Network, b: Ipv4Network) -> bool {
    a.contains(b.network()) || b.contains(a.network())
}

fn normalize(subnet: Ipv4Network) -> KennelResult<Ipv4Network> {
    Ipv4Network::new(subnet.network(), subnet.prefix()).map_err(|e| KennelError::Config {
        message: format!("invalid subnet {subnet}: {e}"),
    })
}

impl SubnetPool {
    /// Pool carving /30s out of `dynamic`.
    ///
    /// # Errors
    ///
    /// Returns [`KennelError::Config`] if `dynamic` is smaller than a /30.
    pub fn new(dynamic: Ipv4Network) -> KennelResult<Self> {
        if dynamic.prefix() > DYNAMIC_PREFIX {
            return Err(KennelError::Config {
                message: format!("dynamic subnet pool {dynamic} is smaller than a /{DYNAMIC_PREFIX}"),
            });
        }
        Ok(Self {
            dynamic: normalize(dynamic)?,
            allocations: Mutex::new(HashMap::new()),
        })
    }

    /// The dynamic range.
    #[must_use]
    pub const fn dynamic_range(&self) -> Ipv4Network {
        self.dynamic
    }

    /// Allocate a subnet and an address in it.
    ///
    /// # Errors
    ///
    /// - [`KennelError::SubnetPoolExhausted`] when no /30 is free
    /// - [`KennelError::SubnetConflict`] for a static subnet overlapping the
    ///   pool or a different live allocation
    /// - [`KennelError::IpTaken`] for a static address already in use
    pub fn acquire(&self, subnet: SubnetSelector, ip: IpSelector) -> KennelResult<(Ipv4Network, Ipv4Addr)> {
        let mut allocations = self.allocations.lock();

        let subnet = match subnet {
            SubnetSelector::Dynamic => {
                if matches!(ip, IpSelector::Static(_)) {
                    return Err(KennelError::Config {
                        message: "a static IP requires a static subnet".into(),
                    });
                }
                self.next_dynamic(&allocations)?
            }
            SubnetSelector::Static(requested) => {
                let requested = normalize(requested)?;
                let conflict = overlaps(requested, self.dynamic)
                    || allocations
                        .keys()
                        .any(|&existing| existing != requested && overlaps(existing, requested));
                if conflict || requested.prefix() > DYNAMIC_PREFIX {
                    return Err(KennelError::SubnetConflict {
                        subnet: requested.to_string(),
                    });
                }
                requested
            }
        };

        let taken = allocations.get(&subnet);
        let ip = match ip {
            IpSelector::Dynamic => Self::next_ip(subnet, taken).ok_or(KennelError::SubnetPoolExhausted)?,
            IpSelector::Static(ip) => {
                if !Self::is_assignable(subnet, ip) {
                    return Err(KennelError::Config {
                        message: format!("{ip} is not an assignable address in {subnet}"),
                    });
                }
                if taken.is_some_and(|ips| ips.contains(&ip)) {
                    return Err(KennelError::IpTaken { ip: ip.to_string() });
                }
                ip
            }
        };

        allocations.entry(subnet).or_default().insert(ip);
        tracing::debug!(%subnet, %ip, "Allocated address");
        Ok((subnet, ip))
    }

    /// Re-reserve an allocation discovered after a restart.
    ///
    /// # Errors
    ///
    /// Returns [`KennelError::IpTaken`] if the address is already reserved.
    pub fn remove(&self, subnet: Ipv4Network, ip: Ipv4Addr) -> KennelResult<()> {
        let subnet = normalize(subnet)?;
        let mut allocations = self.allocations.lock();
        if !allocations.entry(subnet).or_default().insert(ip) {
            return Err(KennelError::IpTaken { ip: ip.to_string() });
        }
        Ok(())
    }

    /// Release one address. Returns `true` when it was the subnet's last.
    ///
    /// Releasing something never allocated is not an error.
    pub fn release(&self, subnet: Ipv4Network, ip: Ipv4Addr) -> bool {
        let Ok(subnet) = normalize(subnet) else {
            return false;
        };
        let mut allocations = self.allocations.lock();
        let Some(ips) = allocations.get_mut(&subnet) else {
            return false;
        };
        ips.remove(&ip);
        if ips.is_empty() {
            allocations.remove(&subnet);
            tracing::debug!(%subnet, "Subnet returned to pool");
            true
        } else {
            false
        }
    }

    /// Number of live subnets.
    #[must_use]
    pub fn allocated_subnets(&self) -> usize {
        self.allocations.lock().len()
    }

    fn next_dynamic(&self, allocations: &HashMap<Ipv4Network, BTreeSet<Ipv4Addr>>) -> KennelResult<Ipv4Network> {
        let base = u32::from(self.dynamic.network());
        let blocks = self.dynamic.size() >> (32 - u32::from(DYNAMIC_PREFIX));
        (0..blocks)
            .filter_map(|block| Ipv4Network::new(Ipv4Addr::from(base + (block << 2)), DYNAMIC_PREFIX).ok())
            .find(|candidate| !allocations.contains_key(candidate))
            .ok_or(KennelError::SubnetPoolExhausted)
    }

    fn is_assignable(subnet: Ipv4Network, ip: Ipv4Addr) -> bool {
        subnet.contains(ip) && ip != subnet.network() && ip != subnet.broadcast() && ip != gateway(subnet)
    }

    fn next_ip(subnet: Ipv4Network, taken: Option<&BTreeSet<Ipv4Addr>>) -> Option<Ipv4Addr> {
        let first = u32::from(subnet.network()) + 2;
        let last = u32::from(subnet.broadcast());
        (first..last)
            .map(Ipv4Addr::from)
            .find(|ip| !taken.is_some_and(|ips| ips.contains(ip)))
    }
}
