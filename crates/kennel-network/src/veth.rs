//! Virtual ethernet pair management.

use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use kennel_common::{ContainerHandle, KennelResult};

use crate::command::{CommandRunner, args};

/// Host and container interface names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VethPair {
    /// Host-side interface name.
    pub host: String,
    /// Container-side interface name.
    pub container: String,
}

impl VethPair {
    /// Names for `handle`: `<prefix><instance id>-0` and `-1`.
    #[must_use]
    pub fn for_handle(prefix: &str, handle: &ContainerHandle) -> Self {
        let id = handle.instance_id();
        Self {
            host: format!("{prefix}{id}-0"),
            container: format!("{prefix}{id}-1"),
        }
    }

    /// Create the pair, attach the host side to `bridge` and move the
    /// container side into the network namespace of `pid`.
    ///
    /// # Errors
    ///
    /// Returns [`kennel_common::KennelError::Command`] on the first failing
    /// `ip` step.
    pub async fn create(&self, runner: &dyn CommandRunner, bridge: &str, mtu: u32, pid: u32) -> KennelResult<()> {
        tracing::debug!(host = %self.host, container = %self.container, bridge, pid, "Creating veth pair");
        let mtu = mtu.to_string();
        let pid = pid.to_string();

        for step in [
            args([
                "link",
                "add",
                self.host.as_str(),
                "mtu",
                mtu.as_str(),
                "type",
                "veth",
                "peer",
                "name",
                self.container.as_str(),
                "mtu",
                mtu.as_str(),
            ]),
            args(["link", "set", self.host.as_str(), "master", bridge]),
            args(["link", "set", self.host.as_str(), "up"]),
            args(["link", "set", self.container.as_str(), "netns", pid.as_str()]),
        ] {
            runner.run("ip", &step, None).await?.check("ip")?;
        }
        Ok(())
    }

    /// Address the container side from inside the namespace of `pid` and
    /// route through `gateway`.
    ///
    /// # Errors
    ///
    /// Returns [`kennel_common::KennelError::Command`] on the first failing
    /// step.
    pub async fn configure_container_side(
        &self,
        runner: &dyn CommandRunner,
        pid: u32,
        ip: Ipv4Addr,
        subnet: Ipv4Network,
        gateway: Ipv4Addr,
    ) -> KennelResult<()> {
        let target = pid.to_string();
        let address = format!("{ip}/{}", subnet.prefix());
        let gateway = gateway.to_string();

        for step in [
            vec!["addr", "add", address.as_str(), "dev", self.container.as_str()],
            vec!["link", "set", self.container.as_str(), "up"],
            vec!["link", "set", "lo", "up"],
            vec!["route", "add", "default", "via", gateway.as_str(), "dev", self.container.as_str()],
        ] {
            let mut command = args(["--target", target.as_str(), "--net", "--", "ip"]);
            command.extend(args(step));
            runner.run("nsenter", &command, None).await?.check("nsenter")?;
        }
        Ok(())
    }

    /// Delete the host side (which removes its peer too); a missing
    /// interface is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if `ip` fails for another reason.
    pub async fn delete(&self, runner: &dyn CommandRunner) -> KennelResult<()> {
        match runner
            .run("ip", &args(["link", "delete", self.host.as_str()]), None)
            .await?
            .check("ip")
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_already_gone() => Ok(()),
            Err(e) => Err(e),
        }
    }
}
