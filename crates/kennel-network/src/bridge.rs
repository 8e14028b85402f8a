//! Linux bridge management.
//!
//! One bridge per subnet, shared by every container in it.

use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use kennel_common::KennelResult;

use crate::command::{CommandRunner, args};

/// Longest usable interface name (`IFNAMSIZ` minus NUL).
pub const MAX_IFNAME: usize = 15;

/// Bridge name for `subnet`: `<prefix>b-<network address in hex>`.
#[must_use]
pub fn bridge_name(prefix: &str, subnet: Ipv4Network) -> String {
    format!("{prefix}b-{:08x}", u32::from(subnet.network()))
}

/// Create the bridge with `gateway` as its address, unless it exists.
///
/// # Errors
///
/// Returns [`kennel_common::KennelError::Command`] if any `ip` step fails.
pub async fn ensure(runner: &dyn CommandRunner, name: &str, gateway: Ipv4Addr, subnet: Ipv4Network, mtu: u32) -> KennelResult<()> {
    if runner.run("ip", &args(["link", "show", name]), None).await?.success() {
        tracing::debug!(name, "Bridge already exists");
        return Ok(());
    }

    tracing::debug!(name, %gateway, %subnet, "Creating bridge");
    let mtu = mtu.to_string();
    let address = format!("{gateway}/{}", subnet.prefix());
    let broadcast = subnet.broadcast().to_string();

    runner
        .run("ip", &args(["link", "add", "name", name, "mtu", mtu.as_str(), "type", "bridge"]), None)
        .await?
        .check("ip")?;
    runner
        .run(
            "ip",
            &args(["addr", "add", address.as_str(), "broadcast", broadcast.as_str(), "dev", name]),
            None,
        )
        .await?
        .check("ip")?;
    runner
        .run("ip", &args(["link", "set", name, "up"]), None)
        .await?
        .check("ip")?;

    tracing::info!(name, "Bridge created successfully");
    Ok(())
}

/// Delete the bridge; a missing bridge is not an error.
///
/// # Errors
///
/// Returns an error if `ip` cannot be run or fails for another reason.
pub async fn delete(runner: &dyn CommandRunner, name: &str) -> KennelResult<()> {
    match runner
        .run("ip", &args(["link", "delete", name, "type", "bridge"]), None)
        .await?
        .check("ip")
    {
        Ok(_) => {
            tracing::debug!(name, "Bridge deleted");
            Ok(())
        }
        Err(e) if e.is_already_gone() => Ok(()),
        Err(e) => Err(e),
    }
}
