//! CLI command definitions and handlers.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use ipnetwork::Ipv4Network;
use kennel_common::ContainerHandle;
use kennel_network::{IpSelector, NetOutRule, NetworkSpec, SubnetSelector, SystemRunner};
use kennel_oci::{ProcessSpec, TtySize};

use crate::config::KennelConfig;
use crate::exec::{ProcessIo, Signal};
use crate::orchestrator::Orchestrator;

/// Config file read when `--config` is not given and it exists.
pub const DEFAULT_CONFIG: &str = "/etc/kennel/kennel.toml";

/// Kennel - container backend
#[derive(Debug, Parser)]
#[command(name = "kennel")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true, env = "KENNEL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Root directory for kennel data
    #[arg(long, global = true, env = "KENNEL_ROOT")]
    pub root: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Kennel commands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Install the host-wide firewall chains
    Setup,

    /// Create a container, relay its stdio and wait for its init to exit
    Create {
        /// Container handle
        handle: String,

        /// Path to the OCI bundle
        #[arg(short, long)]
        bundle: PathBuf,

        /// Static subnet (default: next free /30 from the pool)
        #[arg(long)]
        subnet: Option<Ipv4Network>,

        /// Static container address
        #[arg(long)]
        ip: Option<Ipv4Addr>,

        /// Hostname written to the container's hosts file
        #[arg(long)]
        hostname: Option<String>,

        /// DNS servers (repeatable)
        #[arg(long = "dns")]
        dns_servers: Vec<Ipv4Addr>,

        /// Forward this terminal's stdin
        #[arg(short, long)]
        interactive: bool,
    },

    /// Run a process in a container and wait for it
    Exec {
        /// Container handle
        handle: String,

        /// Environment variables (KEY=VALUE)
        #[arg(short, long)]
        env: Vec<String>,

        /// Working directory
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Allocate a terminal of COLUMNSxROWS
        #[arg(short, long, value_parser = parse_tty)]
        tty: Option<TtySize>,

        /// Forward this terminal's stdin
        #[arg(short, long)]
        interactive: bool,

        /// Command and arguments
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },

    /// Wait for a process and exit with its code
    Wait {
        /// Container handle
        handle: String,

        /// Process ID (default: the init process)
        #[arg(long)]
        process: Option<String>,
    },

    /// Send a signal to a process
    Kill {
        /// Container handle
        handle: String,

        /// Signal to send
        #[arg(default_value = "TERM")]
        signal: Signal,

        /// Process ID (default: the init process)
        #[arg(long)]
        process: Option<String>,
    },

    /// Map a host port to a container port
    NetIn {
        /// Container handle
        handle: String,

        /// Host port (0: next from the pool)
        #[arg(long, default_value_t = 0)]
        host_port: u16,

        /// Container port (0: same as the host port)
        #[arg(long, default_value_t = 0)]
        container_port: u16,
    },

    /// Allow outbound traffic described by a JSON rule list
    NetOut {
        /// Container handle
        handle: String,

        /// JSON file with an array of rules
        #[arg(short, long)]
        rules: PathBuf,
    },

    /// Kill and delete a container and undo its network
    Destroy {
        /// Container handle
        handle: String,
    },
}

fn parse_tty(value: &str) -> Result<TtySize, String> {
    let (columns, rows) = value
        .split_once('x')
        .ok_or_else(|| format!("expected COLUMNSxROWS, got {value:?}"))?;
    Ok(TtySize::new(
        columns.parse().map_err(|e| format!("columns: {e}"))?,
        rows.parse().map_err(|e| format!("rows: {e}"))?,
    ))
}

fn parse_handle(value: &str) -> Result<ContainerHandle> {
    ContainerHandle::new(value).map_err(|e| eyre!("{e}"))
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

fn stdio(interactive: bool) -> ProcessIo {
    let io = ProcessIo::default()
        .with_stdout(tokio::io::stdout())
        .with_stderr(tokio::io::stderr());
    if interactive { io.with_stdin(tokio::io::stdin()) } else { io }
}

impl Cli {
    /// Load the configuration this invocation runs with.
    ///
    /// # Errors
    ///
    /// Returns an error if an explicit or default config file is invalid.
    pub fn load_config(&self) -> Result<KennelConfig> {
        let path = self
            .config
            .clone()
            .or_else(|| Some(PathBuf::from(DEFAULT_CONFIG)).filter(|p| p.exists()));
        let config = match path {
            Some(path) => KennelConfig::load(&path).map_err(|e| eyre!("{e}"))?,
            None => KennelConfig::default(),
        };
        Ok(match &self.root {
            Some(root) => config.with_root(root),
            None => config,
        })
    }

    /// Execute the CLI command.
    ///
    /// # Errors
    ///
    /// Returns the first failure, wrapped with what was being attempted.
    pub async fn execute(self) -> Result<ExitCode> {
        let config = self.load_config()?;
        let orchestrator = Orchestrator::new(config, Arc::new(SystemRunner))
            .map_err(|e| eyre!("{e}"))
            .wrap_err("Failed to initialize")?;
        orchestrator.restore().map_err(|e| eyre!("{e}"))?;

        let result = run_command(&orchestrator, self.command).await;
        orchestrator
            .shutdown()
            .map_err(|e| eyre!("{e}"))
            .wrap_err("Failed to save port pool")?;
        result
    }
}

async fn run_command(orchestrator: &Orchestrator, command: Commands) -> Result<ExitCode> {
    match command {
        Commands::Setup => {
            orchestrator
                .setup()
                .await
                .map_err(|e| eyre!("Failed to set up host: {e}"))?;
            println!("Host firewall ready");
            Ok(ExitCode::SUCCESS)
        }

        Commands::Create {
            handle: name,
            bundle,
            subnet,
            ip,
            hostname,
            dns_servers,
            interactive,
        } => {
            let handle = parse_handle(&name)?;
            let spec = NetworkSpec {
                subnet: subnet.map_or(SubnetSelector::Dynamic, SubnetSelector::Static),
                ip: ip.map_or(IpSelector::Dynamic, IpSelector::Static),
                dns_servers,
                hostname,
            };
            let container = orchestrator
                .create(&handle, &bundle, &spec, stdio(interactive))
                .await
                .map_err(|e| eyre!("Failed to create container: {e}"))?;
            eprintln!("Container {handle} running at {}", container.network.container_ip);

            let code = container
                .init
                .wait()
                .await
                .map_err(|e| eyre!("Failed to wait for container: {e}"))?;
            Ok(exit_code(code))
        }

        Commands::Exec {
            handle: name,
            env,
            cwd,
            tty,
            interactive,
            command,
        } => {
            let handle = parse_handle(&name)?;
            let (path, args) = command.split_first().ok_or_else(|| eyre!("No command given"))?;
            let mut spec = ProcessSpec::new(path.as_str(), args.iter().cloned()).with_env(env);
            if let Some(cwd) = cwd {
                spec = spec.with_dir(cwd);
            }
            if let Some(size) = tty {
                spec = spec.with_tty(size);
            }

            let process = orchestrator
                .run(&handle, &spec, stdio(interactive))
                .await
                .map_err(|e| eyre!("Failed to exec: {e}"))?;
            let code = process
                .wait()
                .await
                .map_err(|e| eyre!("Failed to wait for process: {e}"))?;
            Ok(exit_code(code))
        }

        Commands::Wait { handle: name, process } => {
            let handle = parse_handle(&name)?;
            let dir = process_dir(orchestrator, &handle, process.as_deref())?;
            let code = orchestrator
                .runner()
                .attach(dir)
                .wait()
                .await
                .map_err(|e| eyre!("Failed to wait: {e}"))?;
            println!("{code}");
            Ok(exit_code(code))
        }

        Commands::Kill {
            handle: name,
            signal,
            process,
        } => {
            let handle = parse_handle(&name)?;
            let dir = process_dir(orchestrator, &handle, process.as_deref())?;
            orchestrator
                .runner()
                .attach(dir)
                .signal(signal)
                .await
                .map_err(|e| eyre!("Failed to signal: {e}"))?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::NetIn {
            handle: name,
            host_port,
            container_port,
        } => {
            let handle = parse_handle(&name)?;
            let rule = orchestrator
                .net_in(&handle, host_port, container_port)
                .await
                .map_err(|e| eyre!("Failed to map port: {e}"))?;
            println!("{}", serde_json::to_string(&rule)?);
            Ok(ExitCode::SUCCESS)
        }

        Commands::NetOut { handle: name, rules } => {
            let handle = parse_handle(&name)?;
            let rules = read_rules(&rules)?;
            let result = match rules.as_slice() {
                [rule] => orchestrator.net_out(&handle, rule).await,
                rules => orchestrator.bulk_net_out(&handle, rules).await,
            };
            result.map_err(|e| eyre!("Failed to allow outbound traffic: {e}"))?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Destroy { handle: name } => {
            let handle = parse_handle(&name)?;
            orchestrator
                .destroy(&handle)
                .await
                .map_err(|e| eyre!("Failed to destroy container: {e}"))?;
            println!("Container {handle} destroyed");
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn process_dir(
    orchestrator: &Orchestrator,
    handle: &ContainerHandle,
    process: Option<&str>,
) -> Result<kennel_common::ProcessDir> {
    let paths = orchestrator.paths();
    if !paths.container(handle.as_str()).is_dir() {
        return Err(eyre!("Container not found: {handle}"));
    }
    Ok(match process {
        Some(id) => paths.process(handle.as_str(), id),
        None => paths.init_process(handle.as_str()),
    })
}

fn read_rules(path: &Path) -> Result<Vec<NetOutRule>> {
    let content = std::fs::read_to_string(path).wrap_err_with(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).wrap_err("Invalid rule list")
}
