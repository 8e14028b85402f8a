//! Host-wide chains.

use ipnetwork::Ipv4Network;
use kennel_common::KennelResult;
use serde::{Deserialize, Serialize};

use super::{IptablesEngine, Session, Table};
use crate::command::args;

const SETUP: &str = "setup-global-chains";
const RESET: &str = "reset-deny-networks";

/// Host policy applied by [`IptablesEngine::setup`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalSetup {
    /// Let containers reach services on the host.
    pub allow_host_access: bool,
    /// Destinations containers may never reach.
    pub deny_networks: Vec<Ipv4Network>,
}

fn established() -> Vec<String> {
    args([
        "-m",
        "conntrack",
        "--ctstate",
        "ESTABLISHED,RELATED",
        "--jump",
        "ACCEPT",
    ])
}

impl IptablesEngine {
    /// Create the host-wide chains.
    ///
    /// A no-op once a previous setup completed: completion is marked by the
    /// `INPUT` hook into the input chain, which is installed last.
    ///
    /// # Errors
    ///
    /// Returns [`kennel_common::KennelError::Iptables`] naming the failing
    /// step.
    pub async fn setup(&self, setup: &GlobalSetup) -> KennelResult<()> {
        let session = self.session().await?;
        let chains = &self.chains;
        let iface = format!("{}+", self.settings.interface_prefix);
        let input_hook = args(["--in-interface", iface.as_str(), "--jump", chains.input.as_str()]);

        if session.chain_exists(Table::Filter, &chains.input).await?
            && session.rule_exists(Table::Filter, "INPUT", &input_hook).await?
        {
            tracing::debug!(chain = %chains.input, "Global chains already present");
            return Ok(());
        }

        tracing::info!(prefix = %self.settings.chain_prefix, "Creating global iptables chains");

        session.fresh_chain(SETUP, Table::Nat, &chains.prerouting).await?;
        session.fresh_chain(SETUP, Table::Nat, &chains.postrouting).await?;
        let to_prerouting = args(["--jump", chains.prerouting.as_str()]);
        session.ensure_hook(SETUP, Table::Nat, "PREROUTING", &to_prerouting).await?;
        session.ensure_hook(SETUP, Table::Nat, "OUTPUT", &to_prerouting).await?;
        session
            .ensure_hook(SETUP, Table::Nat, "POSTROUTING", &args(["--jump", chains.postrouting.as_str()]))
            .await?;

        session.fresh_chain(SETUP, Table::Filter, &chains.default).await?;
        Self::fill_default(&session, RESET, &chains.default, &setup.deny_networks).await?;

        session.fresh_chain(SETUP, Table::Filter, &chains.forward).await?;
        session
            .append(SETUP, Table::Filter, &chains.forward, &args(["--jump", "DROP"]))
            .await?;
        session
            .ensure_hook(
                SETUP,
                Table::Filter,
                "FORWARD",
                &args(["--in-interface", iface.as_str(), "--jump", chains.forward.as_str()]),
            )
            .await?;

        session.fresh_chain(SETUP, Table::Filter, &chains.input).await?;
        session.append(SETUP, Table::Filter, &chains.input, &established()).await?;
        for protocol in ["udp", "tcp"] {
            session
                .append(
                    SETUP,
                    Table::Filter,
                    &chains.input,
                    &args(["--protocol", protocol, "--destination-port", "53", "--jump", "ACCEPT"]),
                )
                .await?;
        }
        if !setup.allow_host_access {
            session
                .append(
                    SETUP,
                    Table::Filter,
                    &chains.input,
                    &args(["--jump", "REJECT", "--reject-with", "icmp-host-prohibited"]),
                )
                .await?;
        }
        session.ensure_hook(SETUP, Table::Filter, "INPUT", &input_hook).await?;

        Ok(())
    }

    /// Rebuild the default chain: accept established traffic, then reject
    /// every deny network in order.
    ///
    /// # Errors
    ///
    /// Returns [`kennel_common::KennelError::Iptables`] if any step fails.
    pub async fn reset_deny_networks(&self, cidrs: &[Ipv4Network]) -> KennelResult<()> {
        let session = self.session().await?;
        let chain = &self.chains.default;
        session.run(RESET, Table::Filter, &args(["-F", chain.as_str()])).await?;
        Self::fill_default(&session, RESET, chain, cidrs).await?;
        tracing::info!(count = cidrs.len(), "Reset deny networks");
        Ok(())
    }

    async fn fill_default(session: &Session<'_>, action: &str, chain: &str, cidrs: &[Ipv4Network]) -> KennelResult<()> {
        session.append(action, Table::Filter, chain, &established()).await?;
        for cidr in cidrs {
            let cidr = cidr.to_string();
            session
                .append(
                    action,
                    Table::Filter,
                    chain,
                    &args(["--destination", cidr.as_str(), "--jump", "REJECT", "--reject-with", "icmp-host-prohibited"]),
                )
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iptables::test_support::engine;

    #[tokio::test]
    async fn setup_creates_and_hooks_chains() {
        let (engine, fake, _dir) = engine();
        engine.setup(&GlobalSetup::default()).await.unwrap();

        assert_eq!(
            fake.rules("filter", "INPUT").unwrap(),
            vec!["--in-interface w+ --jump w--input"]
        );
        assert_eq!(
            fake.rules("filter", "FORWARD").unwrap(),
            vec!["--in-interface w+ --jump w--forward"]
        );
        assert_eq!(fake.rules("filter", "w--forward").unwrap(), vec!["--jump DROP"]);
        assert_eq!(
            fake.rules("filter", "w--input").unwrap().last().unwrap(),
            "--jump REJECT --reject-with icmp-host-prohibited"
        );
        assert_eq!(fake.rules("nat", "PREROUTING").unwrap(), vec!["--jump w--prerouting"]);
        assert_eq!(fake.rules("nat", "OUTPUT").unwrap(), vec!["--jump w--prerouting"]);
        assert_eq!(fake.rules("nat", "POSTROUTING").unwrap(), vec!["--jump w--postrouting"]);
    }

    #[tokio::test]
    async fn setup_twice_is_a_noop() {
        let (engine, fake, _dir) = engine();
        engine.setup(&GlobalSetup::default()).await.unwrap();
        let once = fake.ruleset();

        fake.clear_calls();
        engine.setup(&GlobalSetup::default()).await.unwrap();

        assert_eq!(fake.ruleset(), once);
        let mutations = fake
            .calls_to("iptables")
            .into_iter()
            .filter(|call| ["-N", "-A", "-I", "-F"].iter().any(|op| call.contains(&(*op).to_string())))
            .count();
        assert_eq!(mutations, 0);
    }

    #[tokio::test]
    async fn setup_finishes_a_partial_run() {
        let (engine, fake, _dir) = engine();
        fake.fail_when("--jump w--input", "iptables: interrupted");
        assert!(engine.setup(&GlobalSetup::default()).await.is_err());

        fake.clear_failures();
        engine.setup(&GlobalSetup::default()).await.unwrap();
        assert_eq!(fake.rules("filter", "w--forward").unwrap(), vec!["--jump DROP"]);
        assert_eq!(fake.rules("filter", "FORWARD").unwrap().len(), 1);
        assert_eq!(fake.rules("filter", "INPUT").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn host_access_skips_reject() {
        let (engine, fake, _dir) = engine();
        let setup = GlobalSetup {
            allow_host_access: true,
            ..GlobalSetup::default()
        };
        engine.setup(&setup).await.unwrap();
        let input = fake.rules("filter", "w--input").unwrap();
        assert!(input.iter().all(|rule| !rule.contains("REJECT")));
    }

    #[tokio::test]
    async fn reset_deny_networks_rebuilds_default_chain() {
        let (engine, fake, _dir) = engine();
        engine.setup(&GlobalSetup::default()).await.unwrap();
        assert_eq!(fake.rules("filter", "w--default").unwrap().len(), 1);

        engine
            .reset_deny_networks(&["8.8.8.0/24".parse().unwrap()])
            .await
            .unwrap();

        assert_eq!(
            fake.rules("filter", "w--default").unwrap(),
            vec![
                "-m conntrack --ctstate ESTABLISHED,RELATED --jump ACCEPT",
                "--destination 8.8.8.0/24 --jump REJECT --reject-with icmp-host-prohibited",
            ]
        );
    }

    #[tokio::test]
    async fn reset_deny_networks_does_not_accumulate() {
        let (engine, fake, _dir) = engine();
        engine.setup(&GlobalSetup::default()).await.unwrap();
        let cidrs: Vec<Ipv4Network> = vec!["10.0.0.0/8".parse().unwrap(), "192.168.0.0/16".parse().unwrap()];

        engine.reset_deny_networks(&cidrs).await.unwrap();
        engine.reset_deny_networks(&cidrs[1..]).await.unwrap();

        let rules = fake.rules("filter", "w--default").unwrap();
        assert_eq!(rules.len(), 2);
        assert!(rules[1].contains("192.168.0.0/16"));
    }
}
