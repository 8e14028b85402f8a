//! Per-container chains.

use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use kennel_common::{ContainerHandle, KennelResult};

use super::restore::tokenize;
use super::{IptablesEngine, Session, Table};
use crate::command::args;

const CREATE: &str = "create-instance-chains";

/// iptables caps `--log-prefix` at 29 characters.
const LOG_PREFIX_MAX: usize = 29;

impl IptablesEngine {
    /// Create the nat, filter and log chains for `handle` and bind them into
    /// the global chains.
    ///
    /// The filter chain is inserted at the top of the forward chain, ahead of
    /// its trailing DROP.
    ///
    /// # Errors
    ///
    /// Returns `iptables create-instance-chains: <stderr>` on the first
    /// failing step. Nothing is rolled back; callers follow up with
    /// [`Self::destroy_instance_chains`].
    pub async fn create_instance_chains(
        &self,
        handle: &ContainerHandle,
        bridge: &str,
        container_ip: Ipv4Addr,
        subnet: Ipv4Network,
    ) -> KennelResult<()> {
        let chains = self.instance_chains(handle);
        let instance = chains.instance.as_str();
        let comment = handle.as_str();
        let subnet = subnet.to_string();
        let ip = container_ip.to_string();

        tracing::debug!(handle = %handle, chain = instance, bridge, ip = %ip, "Creating instance chains");
        let session = self.session().await?;

        session.run(CREATE, Table::Nat, &args(["-N", instance])).await?;
        session
            .append(
                CREATE,
                Table::Nat,
                &self.chains.prerouting,
                &args(["--jump", instance, "-m", "comment", "--comment", comment]),
            )
            .await?;
        session
            .append(
                CREATE,
                Table::Nat,
                &self.chains.postrouting,
                &args([
                    "--source",
                    subnet.as_str(),
                    "!",
                    "--destination",
                    subnet.as_str(),
                    "--jump",
                    "MASQUERADE",
                    "-m",
                    "comment",
                    "--comment",
                    comment,
                ]),
            )
            .await?;

        session.run(CREATE, Table::Filter, &args(["-N", instance])).await?;
        session
            .run(
                CREATE,
                Table::Filter,
                &args([
                    "-I",
                    self.chains.forward.as_str(),
                    "1",
                    "--in-interface",
                    bridge,
                    "--source",
                    ip.as_str(),
                    "--goto",
                    instance,
                    "-m",
                    "comment",
                    "--comment",
                    comment,
                ]),
            )
            .await?;
        session
            .append(
                CREATE,
                Table::Filter,
                instance,
                &args([
                    "--source",
                    subnet.as_str(),
                    "--destination",
                    subnet.as_str(),
                    "--jump",
                    "ACCEPT",
                ]),
            )
            .await?;
        session
            .append(CREATE, Table::Filter, instance, &args(["--goto", self.chains.default.as_str()]))
            .await?;

        session.run(CREATE, Table::Filter, &args(["-N", chains.log.as_str()])).await?;
        session
            .append(
                CREATE,
                Table::Filter,
                &chains.log,
                &args([
                    "-m",
                    "conntrack",
                    "--ctstate",
                    "NEW,UNTRACKED,INVALID",
                    "--protocol",
                    "tcp",
                    "--jump",
                    "LOG",
                    "--log-prefix",
                    handle.tail(LOG_PREFIX_MAX),
                ]),
            )
            .await?;
        session
            .append(CREATE, Table::Filter, &chains.log, &args(["--jump", "RETURN"]))
            .await?;

        Ok(())
    }

    /// Remove everything [`Self::create_instance_chains`] and later rules
    /// added for `handle`.
    ///
    /// Every step is best-effort: chains or references that are already
    /// gone are not errors.
    ///
    /// # Errors
    ///
    /// Only fails if the host-wide lock cannot be taken.
    pub async fn destroy_instance_chains(&self, handle: &ContainerHandle) -> KennelResult<()> {
        let chains = self.instance_chains(handle);
        tracing::debug!(handle = %handle, chain = %chains.instance, "Destroying instance chains");
        let session = self.session().await?;

        for (table, parent) in [
            (Table::Nat, self.chains.prerouting.as_str()),
            (Table::Nat, self.chains.postrouting.as_str()),
            (Table::Filter, self.chains.forward.as_str()),
        ] {
            Self::remove_references(&session, table, parent, &chains.instance, handle.as_str()).await;
        }

        for (table, chain) in [
            (Table::Nat, chains.instance.as_str()),
            (Table::Filter, chains.instance.as_str()),
            (Table::Filter, chains.log.as_str()),
        ] {
            session.best_effort(table, &args(["-F", chain])).await;
            session.best_effort(table, &args(["-X", chain])).await;
        }

        Ok(())
    }

    /// Delete every rule in `parent` that jumps to `chain` or carries the
    /// handle comment.
    async fn remove_references(session: &Session<'_>, table: Table, parent: &str, chain: &str, comment: &str) {
        let listing = match session.raw(table, &args(["-S", parent])).await {
            Ok(output) if output.success() => output.stdout,
            _ => return,
        };

        for line in listing.lines() {
            let Ok(tokens) = tokenize(line) else {
                continue;
            };
            if tokens.first().map(String::as_str) != Some("-A") {
                continue;
            }
            let references = tokens.iter().any(|t| t == chain)
                || tokens
                    .windows(2)
                    .any(|pair| pair[0] == "--comment" && pair[1] == comment);
            if !references {
                continue;
            }
            let mut delete = args(["-D"]);
            delete.extend(tokens.into_iter().skip(1));
            session.best_effort(table, &delete).await;
        }
    }

    /// DNAT `external_ip:host_port` to `container_ip:container_port`.
    ///
    /// # Errors
    ///
    /// Returns `iptables forward: <stderr>` on failure.
    pub async fn forward(
        &self,
        handle: &ContainerHandle,
        external_ip: Ipv4Addr,
        container_ip: Ipv4Addr,
        host_port: u16,
        container_port: u16,
    ) -> KennelResult<()> {
        let chains = self.instance_chains(handle);
        let external = external_ip.to_string();
        let host_port = host_port.to_string();
        let target = format!("{container_ip}:{container_port}");

        let session = self.session().await?;
        session
            .append(
                "forward",
                Table::Nat,
                &chains.instance,
                &args([
                    "--protocol",
                    "tcp",
                    "--destination",
                    external.as_str(),
                    "--destination-port",
                    host_port.as_str(),
                    "--jump",
                    "DNAT",
                    "--to-destination",
                    target.as_str(),
                    "-m",
                    "comment",
                    "--comment",
                    handle.as_str(),
                ]),
            )
            .await?;
        tracing::debug!(handle = %handle, %target, "Forwarded port");
        Ok(())
    }
}
