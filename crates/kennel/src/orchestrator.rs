//! Container lifecycle on top of the exec runner and the network configurer.
//!
//! Operations on one handle are serialized; different handles proceed in
//! parallel. The in-memory table is rebuilt from the depot by
//! [`Orchestrator::restore`], so short-lived callers (the CLI) see the same
//! containers a long-running one would.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use kennel_common::{ContainerHandle, KennelError, KennelPaths, KennelResult};
use kennel_network::{CommandRunner, Configurer, NetInRule, NetOutRule, NetworkConfig, NetworkSpec, PortPool};
use kennel_oci::{ProcessSpec, RuntimeCli};
use tokio::sync::Mutex;

use crate::config::KennelConfig;
use crate::exec::{ExecRunner, Process, ProcessIo};

const NET_IN_FILE: &str = "net-in.json";

/// A container the orchestrator manages.
#[derive(Debug, Clone)]
pub struct Container {
    /// Container handle.
    pub handle: ContainerHandle,
    /// Init process.
    pub init: Process,
    /// Applied network configuration.
    pub network: NetworkConfig,
    /// Inbound port mappings, in creation order.
    pub net_in: Vec<NetInRule>,
}

/// Creates, wires and destroys containers.
#[derive(Debug)]
pub struct Orchestrator {
    config: KennelConfig,
    paths: KennelPaths,
    runner: ExecRunner,
    network: Configurer,
    ports: Arc<PortPool>,
    commands: Arc<dyn CommandRunner>,
    locks: DashMap<ContainerHandle, Arc<Mutex<()>>>,
    containers: DashMap<ContainerHandle, Container>,
}

impl Orchestrator {
    /// Orchestrator for `config`, running host commands through `commands`.
    ///
    /// Creates the state directories and restores the port pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the directories cannot be created, the port pool
    /// state is unreadable or the network settings are invalid.
    pub fn new(config: KennelConfig, commands: Arc<dyn CommandRunner>) -> KennelResult<Self> {
        let paths = config.paths();
        paths.create_dirs()?;

        let ports = Arc::new(PortPool::load(
            &paths.port_pool_state(),
            config.ports.start,
            config.ports.size,
        )?);
        let network = Configurer::new(Arc::clone(&commands), config.network.clone(), Arc::clone(&ports))?;
        let runner = ExecRunner::new(&config.runtime.shim, &config.runtime.binary, paths.clone())
            .with_pidfile_reader(config.pidfile_reader());

        Ok(Self {
            config,
            paths,
            runner,
            network,
            ports,
            commands,
            locks: DashMap::new(),
            containers: DashMap::new(),
        })
    }

    /// Resolve container files under `root` instead of `/proc`.
    #[must_use]
    pub fn with_proc_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.network = self.network.with_proc_root(root);
        self
    }

    /// Filesystem layout in use.
    #[must_use]
    pub const fn paths(&self) -> &KennelPaths {
        &self.paths
    }

    /// The exec runner.
    #[must_use]
    pub const fn runner(&self) -> &ExecRunner {
        &self.runner
    }

    /// Install the host-wide firewall chains. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns the first iptables failure.
    pub async fn setup(&self) -> KennelResult<()> {
        self.network.setup_host().await
    }

    /// A known container.
    #[must_use]
    pub fn container(&self, handle: &ContainerHandle) -> Option<Container> {
        self.containers.get(handle).map(|entry| entry.value().clone())
    }

    /// Handles of all known containers.
    #[must_use]
    pub fn handles(&self) -> Vec<ContainerHandle> {
        let mut handles: Vec<_> = self.containers.iter().map(|entry| entry.key().clone()).collect();
        handles.sort();
        handles
    }

    /// Rebuild the container table from the depot.
    ///
    /// Containers with a persisted network configuration get their address
    /// and mapped host ports re-reserved and their init process re-attached.
    /// Returns how many were restored.
    ///
    /// # Errors
    ///
    /// Returns an error if the depot cannot be listed or the port pool
    /// cannot be saved.
    pub fn restore(&self) -> KennelResult<usize> {
        let mut restored = 0;
        for entry in std::fs::read_dir(self.paths.depot())? {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let Ok(handle) = ContainerHandle::new(name) else {
                continue;
            };
            if self.containers.contains_key(&handle) {
                continue;
            }

            let network = match NetworkConfig::load(&self.paths.network_config(handle.as_str())) {
                Ok(network) => network,
                Err(e) => {
                    tracing::debug!(handle = %handle, error = %e, "No usable network config, skipping");
                    continue;
                }
            };
            if let Err(e) = self.network.restore(&network) {
                tracing::warn!(handle = %handle, error = %e, "Failed to re-reserve address");
            }

            let net_in = self.load_net_in(&handle);
            for rule in &net_in {
                match self.ports.remove(rule.host_port) {
                    Ok(()) | Err(KennelError::PortTaken { .. }) => {}
                    Err(e) => {
                        tracing::warn!(handle = %handle, port = rule.host_port, error = %e, "Failed to reserve port");
                    }
                }
            }

            let container = Container {
                init: self.runner.attach(self.paths.init_process(handle.as_str())),
                net_in,
                network,
                handle: handle.clone(),
            };
            self.containers.insert(handle, container);
            restored += 1;
        }
        if restored > 0 {
            self.ports.save(&self.paths.port_pool_state())?;
        }
        tracing::info!(restored, "Restored containers");
        Ok(restored)
    }

    /// Create and start a container from `bundle`, then wire its network.
    ///
    /// On failure everything already done is undone.
    ///
    /// # Errors
    ///
    /// Returns [`KennelError::HandleInUse`] if the handle has a depot
    /// directory, or the launch, pidfile, network or runtime failure.
    pub async fn create(
        &self,
        handle: &ContainerHandle,
        bundle: &Path,
        spec: &NetworkSpec,
        io: ProcessIo,
    ) -> KennelResult<Container> {
        let lock = self.lock(handle);
        let _guard = lock.lock().await;

        let depot = self.paths.container(handle.as_str());
        if let Err(e) = std::fs::create_dir(&depot) {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                return Err(KennelError::HandleInUse {
                    handle: handle.to_string(),
                });
            }
            return Err(e.into());
        }
        tracing::info!(handle = %handle, bundle = %bundle.display(), "Creating container");

        let mut network = None;
        match self.start(handle, bundle, spec, io, &mut network).await {
            Ok(init) => {
                let container = Container {
                    handle: handle.clone(),
                    init,
                    network: network.ok_or_else(|| KennelError::Internal {
                        message: "network configured without a config".into(),
                    })?,
                    net_in: Vec::new(),
                };
                self.containers.insert(handle.clone(), container.clone());
                tracing::info!(handle = %handle, ip = %container.network.container_ip, "Container created");
                Ok(container)
            }
            Err(e) => {
                tracing::warn!(handle = %handle, error = %e, "Create failed, rolling back");
                self.teardown(handle, network.as_ref(), &[]).await;
                Err(e)
            }
        }
    }

    async fn start(
        &self,
        handle: &ContainerHandle,
        bundle: &Path,
        spec: &NetworkSpec,
        io: ProcessIo,
        network: &mut Option<NetworkConfig>,
    ) -> KennelResult<Process> {
        std::fs::create_dir_all(self.paths.processes(handle.as_str()))?;

        let init = self.runner.run_init(handle, bundle, io).await?;
        let pid = self.config.pidfile_reader().read(&init.dir().pidfile()).await?;
        let pid = u32::try_from(pid).map_err(|_| KennelError::Internal {
            message: format!("invalid init pid {pid}"),
        })?;

        let applied = network.insert(self.network.configure(handle, pid, spec).await?);
        applied.save(&self.paths.network_config(handle.as_str()))?;

        let args = self.runtime_cli(handle).start(handle.as_str());
        self.runtime_command(&args).await?;
        Ok(init)
    }

    /// Run `spec` inside a container.
    ///
    /// # Errors
    ///
    /// Returns [`KennelError::HandleNotFound`] for unknown containers, or the
    /// launch failure.
    pub async fn run(&self, handle: &ContainerHandle, spec: &ProcessSpec, io: ProcessIo) -> KennelResult<Process> {
        let lock = self.lock(handle);
        let _guard = lock.lock().await;
        self.runner.exec(handle, spec, io).await
    }

    /// Map `host_port` (0 = from the pool) to `container_port` (0 = same).
    ///
    /// # Errors
    ///
    /// Returns [`KennelError::HandleNotFound`] for unknown containers, or the
    /// port pool or iptables failure.
    pub async fn net_in(&self, handle: &ContainerHandle, host_port: u16, container_port: u16) -> KennelResult<NetInRule> {
        let lock = self.lock(handle);
        let _guard = lock.lock().await;

        let network = self.network_of(handle)?;
        let rule = self.network.net_in(&network, host_port, container_port).await?;

        let rules = self.containers.get_mut(handle).map(|mut container| {
            container.net_in.push(rule);
            container.net_in.clone()
        });
        if let Some(rules) = rules {
            self.save_net_in(handle, &rules)?;
        }
        Ok(rule)
    }

    /// Allow one outbound rule.
    ///
    /// # Errors
    ///
    /// Returns [`KennelError::HandleNotFound`] for unknown containers, or the
    /// rule or iptables failure.
    pub async fn net_out(&self, handle: &ContainerHandle, rule: &NetOutRule) -> KennelResult<()> {
        let lock = self.lock(handle);
        let _guard = lock.lock().await;
        self.network_of(handle)?;
        self.network.net_out(handle, rule).await
    }

    /// Allow many outbound rules in one batch; none are applied on error.
    ///
    /// # Errors
    ///
    /// Returns [`KennelError::HandleNotFound`] for unknown containers, or the
    /// rule or `iptables-restore` failure.
    pub async fn bulk_net_out(&self, handle: &ContainerHandle, rules: &[NetOutRule]) -> KennelResult<()> {
        let lock = self.lock(handle);
        let _guard = lock.lock().await;
        self.network_of(handle)?;
        self.network.bulk_net_out(handle, rules).await
    }

    /// Kill and delete a container, undo its network and release its ports.
    ///
    /// Works on containers known only from the depot. Every step is
    /// best-effort.
    ///
    /// # Errors
    ///
    /// Returns [`KennelError::HandleNotFound`] if nothing is known about
    /// the handle.
    pub async fn destroy(&self, handle: &ContainerHandle) -> KennelResult<()> {
        let lock = self.lock(handle);
        let _guard = lock.lock().await;

        let known = self.containers.remove(handle).map(|(_, container)| container);
        let depot = self.paths.container(handle.as_str());
        let (network, net_in) = match known {
            Some(container) => (Some(container.network), container.net_in),
            None => {
                let network = NetworkConfig::load(&self.paths.network_config(handle.as_str())).ok();
                if network.is_none() && !depot.exists() {
                    return Err(KennelError::HandleNotFound {
                        handle: handle.to_string(),
                    });
                }
                (network, self.load_net_in(handle))
            }
        };

        tracing::info!(handle = %handle, "Destroying container");
        let cli = self.runtime_cli(handle);
        if let Err(e) = self.runtime_command(&cli.kill(handle.as_str(), "KILL")).await {
            tracing::debug!(handle = %handle, error = %e, "Kill failed");
        }
        self.teardown(handle, network.as_ref(), &net_in).await;
        Ok(())
    }

    async fn teardown(&self, handle: &ContainerHandle, network: Option<&NetworkConfig>, net_in: &[NetInRule]) {
        let cli = self.runtime_cli(handle);
        if let Err(e) = self.runtime_command(&cli.force_delete(handle.as_str())).await {
            if !e.is_already_gone() {
                tracing::warn!(handle = %handle, error = %e, "Runtime delete failed");
            }
        }

        if let Some(network) = network {
            self.network.destroy(network).await;
        }
        for rule in net_in {
            if let Err(e) = self.ports.release(rule.host_port) {
                tracing::warn!(handle = %handle, port = rule.host_port, error = %e, "Failed to release port");
            }
        }

        for result in [
            remove_file(&self.paths.network_config(handle.as_str())),
            remove_dir(&self.paths.container(handle.as_str())),
        ] {
            if let Err(e) = result {
                tracing::warn!(handle = %handle, error = %e, "Failed to remove container state");
            }
        }
    }

    /// Persist the port pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the state file cannot be written.
    pub fn shutdown(&self) -> KennelResult<()> {
        self.ports.save(&self.paths.port_pool_state())?;
        tracing::debug!(path = %self.paths.port_pool_state().display(), "Saved port pool");
        Ok(())
    }

    fn lock(&self, handle: &ContainerHandle) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(handle.clone()).or_default().value())
    }

    fn network_of(&self, handle: &ContainerHandle) -> KennelResult<NetworkConfig> {
        self.containers
            .get(handle)
            .map(|container| container.network.clone())
            .ok_or_else(|| KennelError::HandleNotFound {
                handle: handle.to_string(),
            })
    }

    fn runtime_cli(&self, handle: &ContainerHandle) -> RuntimeCli {
        RuntimeCli::new(&self.config.runtime.binary).with_log(self.paths.init_process(handle.as_str()).runtime_log())
    }

    async fn runtime_command(&self, args: &[std::ffi::OsString]) -> KennelResult<()> {
        let program = self.config.runtime.binary.to_string_lossy();
        let args: Vec<String> = args.iter().map(|arg| arg.to_string_lossy().into_owned()).collect();
        self.commands.run(&program, &args, None).await?.check(&program)?;
        Ok(())
    }

    fn net_in_path(&self, handle: &ContainerHandle) -> PathBuf {
        self.paths.container(handle.as_str()).join(NET_IN_FILE)
    }

    fn load_net_in(&self, handle: &ContainerHandle) -> Vec<NetInRule> {
        std::fs::read(self.net_in_path(handle))
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default()
    }

    fn save_net_in(&self, handle: &ContainerHandle, rules: &[NetInRule]) -> KennelResult<()> {
        std::fs::write(self.net_in_path(handle), serde_json::to_vec_pretty(rules)?)?;
        Ok(())
    }
}

fn remove_file(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn remove_dir(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_dir_all(path) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use kennel_network::NetworkSettings;
    use kennel_network::fake::FakeRunner;

    use super::*;

    struct Harness {
        orchestrator: Orchestrator,
        fake: Arc<FakeRunner>,
        dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeRunner::new());
        let network = NetworkSettings {
            pool: "10.254.0.0/29".parse().unwrap(),
            external_ip: Some(Ipv4Addr::new(203, 0, 113, 1)),
            ..NetworkSettings::default()
        };
        let config = KennelConfig::default()
            .with_network(network)
            .with_root(dir.path())
            .with_runtime("runc")
            .with_ports(60000, 4);
        let orchestrator = Orchestrator::new(config, fake.clone()).unwrap();
        Harness { orchestrator, fake, dir }
    }

    fn persisted_network(h: &Harness, handle: &ContainerHandle) -> NetworkConfig {
        let chains = h.orchestrator.network.iptables().instance_chains(handle);
        let network = NetworkConfig {
            handle: handle.clone(),
            bridge_name: "wb-0afe0000".into(),
            host_interface: "w0123456789-0".into(),
            container_interface: "w0123456789-1".into(),
            container_ip: Ipv4Addr::new(10, 254, 0, 2),
            bridge_ip: Ipv4Addr::new(10, 254, 0, 1),
            subnet: "10.254.0.0/30".parse().unwrap(),
            mtu: 1500,
            dns_servers: vec![Ipv4Addr::new(8, 8, 8, 8)],
            instance_chain: chains.instance,
            external_ip: Some(Ipv4Addr::new(203, 0, 113, 1)),
        };
        std::fs::create_dir_all(h.orchestrator.paths().container(handle.as_str())).unwrap();
        network
            .save(&h.orchestrator.paths().network_config(handle.as_str()))
            .unwrap();
        network
    }

    #[tokio::test]
    async fn create_rejects_existing_handle() {
        let h = harness();
        let handle = ContainerHandle::new("busy").unwrap();
        std::fs::create_dir_all(h.orchestrator.paths().container("busy")).unwrap();

        let err = h
            .orchestrator
            .create(&handle, h.dir.path(), &NetworkSpec::default(), ProcessIo::default())
            .await
            .unwrap_err();
        assert!(matches!(err, KennelError::HandleInUse { .. }));
        assert!(h.orchestrator.paths().container("busy").exists());
    }

    #[tokio::test]
    async fn failed_create_removes_depot_dir() {
        let h = harness();
        let handle = ContainerHandle::new("doomed").unwrap();
        let orchestrator = Orchestrator::new(
            h.orchestrator
                .config
                .clone()
                .with_shim(h.dir.path().join("missing-shim")),
            h.fake.clone(),
        )
        .unwrap();

        let err = orchestrator
            .create(&handle, h.dir.path(), &NetworkSpec::default(), ProcessIo::default())
            .await
            .unwrap_err();
        assert!(matches!(err, KennelError::Command { .. }));
        assert!(!orchestrator.paths().container("doomed").exists());
        assert!(h.fake.calls_to("runc").iter().any(|call| call.contains(&"delete".to_string())));
    }

    #[tokio::test]
    async fn operations_on_unknown_handle_fail() {
        let h = harness();
        let handle = ContainerHandle::new("ghost").unwrap();

        assert!(matches!(
            h.orchestrator.net_in(&handle, 0, 80).await,
            Err(KennelError::HandleNotFound { .. })
        ));
        assert!(matches!(
            h.orchestrator.net_out(&handle, &NetOutRule::default()).await,
            Err(KennelError::HandleNotFound { .. })
        ));
        assert!(matches!(
            h.orchestrator.destroy(&handle).await,
            Err(KennelError::HandleNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn restored_container_can_be_destroyed() {
        let h = harness();
        h.orchestrator.setup().await.unwrap();
        let handle = ContainerHandle::new("survivor").unwrap();
        let network = persisted_network(&h, &handle);
        h.orchestrator
            .network
            .iptables()
            .create_instance_chains(&handle, &network.bridge_name, network.container_ip, network.subnet)
            .await
            .unwrap();

        assert_eq!(h.orchestrator.restore().unwrap(), 1);
        assert_eq!(h.orchestrator.handles(), vec![handle.clone()]);

        let rule = h.orchestrator.net_in(&handle, 0, 8080).await.unwrap();
        assert_eq!(rule.host_port, 60000);
        h.orchestrator.net_out(&handle, &NetOutRule::default()).await.unwrap();

        h.fake.clear_calls();
        h.orchestrator.destroy(&handle).await.unwrap();

        let runtime_calls = h.fake.calls_to("runc");
        assert!(runtime_calls.iter().any(|call| call.contains(&"kill".to_string())));
        assert!(runtime_calls.iter().any(|call| call.contains(&"--force".to_string())));
        assert!(!h.orchestrator.paths().container("survivor").exists());
        assert!(!h.orchestrator.paths().network_config("survivor").exists());
        assert!(h.orchestrator.container(&handle).is_none());

        // The port went back to the tail of the queue.
        for expected in [60001, 60002, 60003, 60000] {
            assert_eq!(h.orchestrator.ports.acquire().unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn restore_reserves_mapped_ports() {
        let h = harness();
        h.orchestrator.setup().await.unwrap();
        let handle = ContainerHandle::new("mapped").unwrap();
        let network = persisted_network(&h, &handle);
        h.orchestrator
            .network
            .iptables()
            .create_instance_chains(&handle, &network.bridge_name, network.container_ip, network.subnet)
            .await
            .unwrap();
        let mapped = NetInRule {
            host_port: 60000,
            container_port: 8080,
        };
        h.orchestrator.save_net_in(&handle, &[mapped]).unwrap();

        assert_eq!(h.orchestrator.restore().unwrap(), 1);
        assert_eq!(h.orchestrator.container(&handle).unwrap().net_in, vec![mapped]);

        let saved = PortPool::load(&h.orchestrator.paths().port_pool_state(), 60000, 4).unwrap();
        assert!(saved.snapshot().acquired.contains(&60000));

        let rule = h.orchestrator.net_in(&handle, 0, 9090).await.unwrap();
        assert_eq!(rule.host_port, 60001);
        assert!(matches!(
            h.orchestrator.net_in(&handle, 60000, 80).await,
            Err(KennelError::PortTaken { port: 60000 })
        ));

        // Restoring twice keeps the reservation without failing.
        h.orchestrator.containers.clear();
        assert_eq!(h.orchestrator.restore().unwrap(), 1);

        h.orchestrator.destroy(&handle).await.unwrap();
        let state = h.orchestrator.ports.snapshot();
        assert!(state.acquired.is_empty());
    }

    #[tokio::test]
    async fn destroy_from_depot_alone() {
        let h = harness();
        let handle = ContainerHandle::new("orphan").unwrap();
        persisted_network(&h, &handle);

        h.orchestrator.destroy(&handle).await.unwrap();
        assert!(!h.orchestrator.paths().container("orphan").exists());
        assert!(matches!(
            h.orchestrator.destroy(&handle).await,
            Err(KennelError::HandleNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn shutdown_persists_ports() {
        let h = harness();
        h.orchestrator.ports.acquire().unwrap();
        h.orchestrator.shutdown().unwrap();

        let reloaded = PortPool::load(&h.orchestrator.paths().port_pool_state(), 60000, 4).unwrap();
        assert_eq!(reloaded.acquire().unwrap(), 60001);
    }
}
