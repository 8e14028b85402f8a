//! # kennel-network
//!
//! Per-container networking for Kennel.
//!
//! - [`iptables`]: global and per-instance chains, NetOut/NetIn translation
//! - [`portpool`]: persistent FIFO host-port allocator
//! - [`subnet`]: subnet and address allocation
//! - [`configurer`]: bridge, veth, DNS and chain wiring for one container
//!
//! Every external program (`iptables`, `iptables-restore`, `ip`, `nsenter`)
//! runs through a [`CommandRunner`], so the whole crate can be driven by the
//! in-memory simulator in `fake` under test.

#![warn(missing_docs)]

pub mod bridge;
pub mod command;
pub mod config;
pub mod configurer;
pub mod dns;
pub mod iptables;
pub mod portpool;
pub mod subnet;
pub mod veth;

#[cfg(any(test, feature = "test-support"))]
pub mod fake;

pub use command::{CommandOutput, CommandRunner, SystemRunner};
pub use config::{NetworkConfig, NetworkSettings, NetworkSpec};
pub use configurer::Configurer;
pub use iptables::{GlobalSetup, IptablesEngine, IptablesSettings, NetInRule, NetOutRule};
pub use portpool::PortPool;
pub use subnet::{IpSelector, SubnetPool, SubnetSelector};
