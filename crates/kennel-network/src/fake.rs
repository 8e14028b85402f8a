//! In-memory stand-in for the host's networking commands.
//!
//! [`FakeRunner`] keeps an iptables ruleset in memory and understands the
//! subset of `iptables` and `iptables-restore` the engine emits. Every other
//! program (`ip`, `nsenter`) is recorded and succeeds.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use kennel_common::KennelResult;
use parking_lot::Mutex;

use crate::command::{CommandOutput, CommandRunner};
use crate::iptables::tokenize;

/// table -> chain -> rules (arguments after the chain name, space-joined).
pub type Ruleset = BTreeMap<String, BTreeMap<String, Vec<String>>>;

const NO_CHAIN: &str = "iptables: No chain/target/match by that name.";
const NO_RULE: &str = "iptables: Bad rule (does a matching rule exist in that chain?).";

const TARGETS: &[&str] = &[
    "ACCEPT",
    "DROP",
    "REJECT",
    "RETURN",
    "LOG",
    "MASQUERADE",
    "DNAT",
    "SNAT",
];

/// Recording command runner with an iptables simulator.
#[derive(Debug)]
pub struct FakeRunner {
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    tables: Ruleset,
    calls: Vec<Vec<String>>,
    failures: Vec<(String, String)>,
}

impl FakeRunner {
    /// Fresh host: only builtin chains, all empty.
    #[must_use]
    pub fn new() -> Self {
        let mut tables = Ruleset::new();
        for chain in ["INPUT", "FORWARD", "OUTPUT"] {
            tables.entry("filter".into()).or_default().insert(chain.into(), Vec::new());
        }
        for chain in ["PREROUTING", "INPUT", "OUTPUT", "POSTROUTING"] {
            tables.entry("nat".into()).or_default().insert(chain.into(), Vec::new());
        }
        Self {
            state: Mutex::new(State {
                tables,
                ..State::default()
            }),
        }
    }

    /// Make every invocation whose command line contains `needle` fail.
    pub fn fail_when(&self, needle: impl Into<String>, stderr: impl Into<String>) {
        self.state.lock().failures.push((needle.into(), stderr.into()));
    }

    /// Stop injecting failures.
    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// Every invocation so far, program first.
    #[must_use]
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.state.lock().calls.clone()
    }

    /// Invocations of `program`, without the program name.
    #[must_use]
    pub fn calls_to(&self, program: &str) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|call| call.first().is_some_and(|p| base_name(p) == program))
            .map(|mut call| {
                call.remove(0);
                call
            })
            .collect()
    }

    /// Forget recorded invocations.
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Copy of the whole ruleset.
    #[must_use]
    pub fn ruleset(&self) -> Ruleset {
        self.state.lock().tables.clone()
    }

    /// Rules of one chain, `None` if it does not exist.
    #[must_use]
    pub fn rules(&self, table: &str, chain: &str) -> Option<Vec<String>> {
        self.state.lock().tables.get(table)?.get(chain).cloned()
    }

    /// Whether `chain` exists in `table`.
    #[must_use]
    pub fn has_chain(&self, table: &str, chain: &str) -> bool {
        self.rules(table, chain).is_some()
    }

    /// Drop a chain and its rules without any checks.
    pub fn remove_chain(&self, table: &str, chain: &str) {
        if let Some(chains) = self.state.lock().tables.get_mut(table) {
            chains.remove(chain);
        }
    }

    /// Drop every rule in `table`/`chain` that contains `needle`.
    pub fn remove_rules_matching(&self, table: &str, chain: &str, needle: &str) {
        if let Some(rules) = self
            .state
            .lock()
            .tables
            .get_mut(table)
            .and_then(|chains| chains.get_mut(chain))
        {
            rules.retain(|rule| !rule.contains(needle));
        }
    }

    fn iptables(tables: &mut Ruleset, args: &[String]) -> Result<String, String> {
        let mut table = "filter".to_string();
        let mut rest = args;
        loop {
            match rest.first().map(String::as_str) {
                Some("-w" | "--wait" | "-n") => rest = &rest[1..],
                Some("-t") => {
                    table = rest.get(1).cloned().ok_or("missing table")?;
                    rest = &rest[2..];
                }
                _ => break,
            }
        }
        apply(tables, &table, rest)
    }

    fn restore(tables: &mut Ruleset, payload: &str) -> Result<String, String> {
        let mut scratch = tables.clone();
        let mut table: Option<String> = None;

        for (index, line) in payload.lines().enumerate() {
            let line = line.trim();
            let failed = || format!("iptables-restore: line {} failed", index + 1);
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(name) = line.strip_prefix('*') {
                table = Some(name.to_string());
                continue;
            }
            if line == "COMMIT" {
                table = None;
                continue;
            }
            let Some(current) = table.as_deref() else {
                return Err(failed());
            };
            let tokens = tokenize(line).map_err(|_| failed())?;
            apply(&mut scratch, current, &tokens).map_err(|_| failed())?;
        }

        if table.is_some() {
            return Err("iptables-restore: COMMIT expected at line end".into());
        }
        *tables = scratch;
        Ok(String::new())
    }
}

impl Default for FakeRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, program: &str, args: &[String], stdin: Option<&str>) -> KennelResult<CommandOutput> {
        let mut state = self.state.lock();

        let mut call = vec![program.to_string()];
        call.extend(args.iter().cloned());
        let line = format!("{} {}", call.join(" "), stdin.unwrap_or_default());
        state.calls.push(call);

        if let Some((_, stderr)) = state.failures.iter().find(|(needle, _)| line.contains(needle.as_str())) {
            return Ok(CommandOutput::failed(1, stderr.clone()));
        }

        let result = match base_name(program) {
            "iptables" => Self::iptables(&mut state.tables, args),
            "iptables-restore" => Self::restore(&mut state.tables, stdin.unwrap_or_default()),
            _ => Ok(String::new()),
        };

        Ok(match result {
            Ok(stdout) => CommandOutput::ok(stdout),
            Err(stderr) => CommandOutput::failed(1, stderr),
        })
    }
}

fn base_name(program: &str) -> &str {
    Path::new(program)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(program)
}

fn jump_target(rule: &[String]) -> Option<&str> {
    rule.windows(2)
        .find(|pair| matches!(pair[0].as_str(), "-j" | "--jump" | "-g" | "--goto"))
        .map(|pair| pair[1].as_str())
}

fn apply(tables: &mut Ruleset, table: &str, args: &[String]) -> Result<String, String> {
    let chains = tables.entry(table.to_string()).or_default();
    let (command, rest) = args.split_first().ok_or("no command")?;

    if command == "-S" {
        return match rest.first() {
            Some(chain) => {
                let rules = chains.get(chain).ok_or(NO_CHAIN)?;
                Ok(list_chain(chain, rules))
            }
            None => Ok(chains.iter().map(|(chain, rules)| list_chain(chain, rules)).collect()),
        };
    }

    let (chain, rule) = rest.split_first().ok_or("no chain")?;

    match command.as_str() {
        "-N" => {
            if chains.contains_key(chain) {
                return Err("iptables: Chain already exists.".into());
            }
            chains.insert(chain.clone(), Vec::new());
        }
        "-X" => {
            let rules = chains.get(chain).ok_or(NO_CHAIN)?;
            if !rules.is_empty() {
                return Err("iptables: Directory not empty.".into());
            }
            let referenced = chains.values().flatten().any(|r| {
                let tokens: Vec<String> = r.split(' ').map(String::from).collect();
                jump_target(&tokens) == Some(chain.as_str())
            });
            if referenced {
                return Err("iptables: Too many links.".into());
            }
            chains.remove(chain);
        }
        "-F" => chains.get_mut(chain).ok_or(NO_CHAIN)?.clear(),
        "-L" => {
            let rules = chains.get(chain).ok_or(NO_CHAIN)?;
            return Ok(format!("Chain {chain}\n{}", rules.join("\n")));
        }
        "-A" | "-I" | "-D" | "-C" => {
            let (position, rule) = match (command.as_str(), rule.first()) {
                ("-I", Some(n)) if n.parse::<usize>().is_ok() => (n.parse::<usize>().ok(), &rule[1..]),
                _ => (None, rule),
            };

            if let Some(target) = jump_target(rule) {
                if !TARGETS.contains(&target) && !chains.contains_key(target) {
                    return Err(NO_CHAIN.into());
                }
            }

            let joined = rule.join(" ");
            let rules = chains.get_mut(chain).ok_or(NO_CHAIN)?;
            match command.as_str() {
                "-A" => rules.push(joined),
                "-I" => {
                    let index = position.unwrap_or(1).saturating_sub(1);
                    if index > rules.len() {
                        return Err("iptables: Index of insertion too big.".into());
                    }
                    rules.insert(index, joined);
                }
                "-D" => {
                    let index = rules.iter().position(|r| *r == joined).ok_or(NO_RULE)?;
                    rules.remove(index);
                }
                _ => {
                    if !rules.contains(&joined) {
                        return Err(NO_RULE.into());
                    }
                }
            }
        }
        other => return Err(format!("unsupported command {other}")),
    }

    Ok(String::new())
}

fn list_chain(chain: &str, rules: &[String]) -> String {
    let header = if chain.chars().all(|c| c.is_ascii_uppercase()) {
        format!("-P {chain} ACCEPT\n")
    } else {
        format!("-N {chain}\n")
    };
    rules
        .iter()
        .fold(header, |out, rule| out + &format!("-A {chain} {rule}\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::args;

    #[tokio::test]
    async fn create_append_list() {
        let fake = FakeRunner::new();
        fake.run("iptables", &args(["-w", "-N", "c"]), None).await.unwrap();
        fake.run("iptables", &args(["-w", "-A", "c", "--jump", "ACCEPT"]), None)
            .await
            .unwrap();

        let out = fake.run("iptables", &args(["-w", "-S", "c"]), None).await.unwrap();
        assert_eq!(out.stdout, "-N c\n-A c --jump ACCEPT\n");
    }

    #[tokio::test]
    async fn duplicate_chain_fails() {
        let fake = FakeRunner::new();
        fake.run("iptables", &args(["-N", "c"]), None).await.unwrap();
        let out = fake.run("iptables", &args(["-N", "c"]), None).await.unwrap();
        assert!(!out.success());
        assert!(out.stderr.contains("Chain already exists"));
    }

    #[tokio::test]
    async fn insert_at_position() {
        let fake = FakeRunner::new();
        fake.run("iptables", &args(["-A", "FORWARD", "--jump", "DROP"]), None).await.unwrap();
        fake.run("iptables", &args(["-I", "FORWARD", "1", "--jump", "ACCEPT"]), None)
            .await
            .unwrap();
        assert_eq!(
            fake.rules("filter", "FORWARD").unwrap(),
            vec!["--jump ACCEPT", "--jump DROP"]
        );
    }

    #[tokio::test]
    async fn restore_is_atomic() {
        let fake = FakeRunner::new();
        let payload = "*filter\n-A INPUT --jump ACCEPT\n-A missing --jump ACCEPT\nCOMMIT\n";
        let out = fake.run("iptables-restore", &args(["--noflush"]), Some(payload)).await.unwrap();
        assert!(!out.success());
        assert!(fake.rules("filter", "INPUT").unwrap().is_empty());
    }

    #[tokio::test]
    async fn injected_failure() {
        let fake = FakeRunner::new();
        fake.fail_when("link add", "RTNETLINK answers: Operation not permitted");
        let out = fake.run("ip", &args(["link", "add", "x"]), None).await.unwrap();
        assert!(!out.success());
        assert_eq!(fake.calls_to("ip").len(), 1);
    }
}
