//! End-to-end container lifecycle: real supervisor, fake runtime, simulated
//! host networking.

mod common;

use std::net::Ipv4Addr;
use std::sync::Arc;

use kennel::config::KennelConfig;
use kennel::exec::ProcessIo;
use kennel::orchestrator::Orchestrator;
use kennel_common::{ContainerHandle, KennelError};
use kennel_network::fake::FakeRunner;
use kennel_network::{NetworkSettings, NetworkSpec};
use kennel_oci::ProcessSpec;
use tempfile::TempDir;

fn orchestrator(tmp: &TempDir, fake: &Arc<FakeRunner>) -> Orchestrator {
    let network = NetworkSettings {
        pool: "10.254.0.0/29".parse().unwrap(),
        external_ip: Some(Ipv4Addr::new(203, 0, 113, 1)),
        ..NetworkSettings::default()
    };
    let config = KennelConfig::default()
        .with_network(network)
        .with_root(tmp.path().join("root"))
        .with_runtime(common::fake_runtime())
        .with_shim(common::shim())
        .with_ports(60000, 5);
    Orchestrator::new(config, fake.clone())
        .unwrap()
        .with_proc_root(tmp.path().join("proc"))
}

#[test_log::test(tokio::test)]
async fn container_lifecycle() -> Result<(), Box<dyn std::error::Error>> {
    let tmp = TempDir::new()?;
    let fake = Arc::new(FakeRunner::new());
    let orchestrator = orchestrator(&tmp, &fake);
    orchestrator.setup().await?;

    let handle = ContainerHandle::new("web")?;
    let bundle = common::bundle(tmp.path(), "sleep 1\nexit 3\n");
    let container = orchestrator
        .create(&handle, &bundle, &NetworkSpec::default(), ProcessIo::default())
        .await?;

    assert_eq!(container.network.container_ip, Ipv4Addr::new(10, 254, 0, 2));
    assert!(orchestrator.paths().network_config("web").exists());
    let runtime_calls = fake.calls_to("fake-runc");
    assert!(runtime_calls.iter().any(|call| call.contains(&"start".to_string())));

    let pid = container.init.pid().expect("init pid");
    let resolv = tmp.path().join(format!("proc/{pid}/root/etc/resolv.conf"));
    assert!(std::fs::read_to_string(resolv)?.contains("nameserver 8.8.8.8"));

    let exec = orchestrator
        .run(&handle, &ProcessSpec::new("/bin/sh", ["-c", "exit 9"]), ProcessIo::default())
        .await?;
    assert_eq!(exec.wait().await?, 9);

    let rule = orchestrator.net_in(&handle, 0, 80).await?;
    assert_eq!((rule.host_port, rule.container_port), (60000, 80));

    assert_eq!(container.init.wait().await?, 3);

    orchestrator.destroy(&handle).await?;
    assert!(!orchestrator.paths().container("web").exists());
    assert!(!orchestrator.paths().network_config("web").exists());
    assert!(orchestrator.handles().is_empty());
    Ok(())
}

#[tokio::test]
async fn refused_bundle_leaves_nothing_behind() -> Result<(), Box<dyn std::error::Error>> {
    let tmp = TempDir::new()?;
    let fake = Arc::new(FakeRunner::new());
    let orchestrator = orchestrator(&tmp, &fake);
    orchestrator.setup().await?;

    let handle = ContainerHandle::new("broken")?;
    let bundle = common::failing_bundle(tmp.path(), "bad config.json");
    let err = orchestrator
        .create(&handle, &bundle, &NetworkSpec::default(), ProcessIo::default())
        .await
        .unwrap_err();

    assert!(matches!(err, KennelError::LaunchFailed { code: 1, .. }));
    assert!(!orchestrator.paths().container("broken").exists());
    assert!(orchestrator.handles().is_empty());

    // The handle is free again.
    let bundle = common::bundle(&tmp.path().join("second"), "exit 0\n");
    let container = orchestrator
        .create(&handle, &bundle, &NetworkSpec::default(), ProcessIo::default())
        .await?;
    assert_eq!(container.init.wait().await?, 0);
    orchestrator.destroy(&handle).await?;
    Ok(())
}

#[tokio::test]
async fn restart_restores_containers() -> Result<(), Box<dyn std::error::Error>> {
    let tmp = TempDir::new()?;
    let fake = Arc::new(FakeRunner::new());
    let first = orchestrator(&tmp, &fake);
    first.setup().await?;

    let handle = ContainerHandle::new("db")?;
    let bundle = common::bundle(tmp.path(), "exit 0\n");
    let container = first
        .create(&handle, &bundle, &NetworkSpec::default(), ProcessIo::default())
        .await?;
    let rule = first.net_in(&handle, 0, 5432).await?;
    container.init.wait().await?;
    first.shutdown()?;
    drop(first);

    let second = orchestrator(&tmp, &fake);
    assert_eq!(second.restore()?, 1);
    let restored = second.container(&handle).expect("restored container");
    assert_eq!(restored.network, container.network);
    assert_eq!(restored.net_in, vec![rule]);
    assert_eq!(restored.init.wait().await?, 0);

    second.destroy(&handle).await?;
    second.shutdown()?;
    Ok(())
}
