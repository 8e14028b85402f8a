//! Integration tests for the exec runner against the real supervisor.

mod common;

use std::path::Path;
use std::time::Duration;

use kennel::exec::{ExecRunner, PidFileReader, ProcessIo, ProcessState, Signal};
use kennel_common::{ContainerHandle, KennelError, KennelPaths};
use kennel_oci::ProcessSpec;
use tempfile::TempDir;

fn runner(root: &Path) -> ExecRunner {
    ExecRunner::new(common::shim(), common::fake_runtime(), KennelPaths::with_root(root))
        .with_pidfile_reader(PidFileReader::new(Duration::from_secs(5), Duration::from_millis(20)))
}

fn container(root: &Path, name: &str) -> ContainerHandle {
    std::fs::create_dir_all(KennelPaths::with_root(root).container(name)).unwrap();
    ContainerHandle::new(name).unwrap()
}

async fn output_file(path: &Path) -> tokio::fs::File {
    tokio::fs::File::create(path).await.unwrap()
}

#[test_log::test(tokio::test)]
async fn init_exit_code_and_output() -> Result<(), Box<dyn std::error::Error>> {
    let tmp = TempDir::new()?;
    let handle = container(tmp.path(), "c1");
    let bundle = common::bundle(tmp.path(), "echo hello\nexit 12\n");
    let out = tmp.path().join("out");

    let io = ProcessIo::default().with_stdout(output_file(&out).await);
    let process = runner(tmp.path()).run_init(&handle, &bundle, io).await?;

    let other = process.clone();
    let (first, second) = tokio::join!(process.wait(), other.wait());
    assert_eq!(first?, 12);
    assert_eq!(second?, 12);
    assert_eq!(std::fs::read_to_string(&out)?, "hello\n");
    assert_eq!(process.supervisor_exit().await, Some(12));
    Ok(())
}

#[tokio::test]
async fn exec_separates_streams() -> Result<(), Box<dyn std::error::Error>> {
    let tmp = TempDir::new()?;
    let handle = container(tmp.path(), "c1");
    let out = tmp.path().join("out");
    let err = tmp.path().join("err");

    let spec = ProcessSpec::new("/bin/sh", ["-c", "echo out; echo err >&2; exit 7"]);
    let io = ProcessIo::default()
        .with_stdout(output_file(&out).await)
        .with_stderr(output_file(&err).await);
    let process = runner(tmp.path()).exec(&handle, &spec, io).await?;

    assert_eq!(process.wait().await?, 7);
    assert_eq!(std::fs::read_to_string(&out)?, "out\n");
    assert_eq!(std::fs::read_to_string(&err)?, "err\n");
    assert!(process.dir().path().starts_with(KennelPaths::with_root(tmp.path()).processes("c1")));
    Ok(())
}

#[tokio::test]
async fn exec_feeds_stdin_until_eof() -> Result<(), Box<dyn std::error::Error>> {
    let tmp = TempDir::new()?;
    let handle = container(tmp.path(), "c1");
    let out = tmp.path().join("out");

    let io = ProcessIo::default()
        .with_stdin(&b"ping\n"[..])
        .with_stdout(output_file(&out).await);
    let process = runner(tmp.path())
        .exec(&handle, &ProcessSpec::new("/bin/cat", Vec::<String>::new()), io)
        .await?;

    assert_eq!(process.wait().await?, 0);
    assert_eq!(std::fs::read_to_string(&out)?, "ping\n");
    Ok(())
}

#[tokio::test]
async fn signal_reaches_process() -> Result<(), Box<dyn std::error::Error>> {
    let tmp = TempDir::new()?;
    let handle = container(tmp.path(), "c1");
    let bundle = common::bundle(tmp.path(), "exec sleep 30\n");

    let process = runner(tmp.path())
        .run_init(&handle, &bundle, ProcessIo::default())
        .await?;
    assert_eq!(process.state(), ProcessState::Running);
    process.signal(Signal::Terminate).await?;

    assert_eq!(process.wait().await?, 128 + 15);
    assert_eq!(process.state(), ProcessState::Exited(143));
    assert!(matches!(
        process.signal(Signal::Kill).await,
        Err(KennelError::ProcessNotFound { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn attach_after_exit_reads_recorded_code() -> Result<(), Box<dyn std::error::Error>> {
    let tmp = TempDir::new()?;
    let handle = container(tmp.path(), "c1");
    let bundle = common::bundle(tmp.path(), "exit 4\n");
    let runner = runner(tmp.path());

    let process = runner.run_init(&handle, &bundle, ProcessIo::default()).await?;
    assert_eq!(process.wait().await?, 4);

    let attached = runner.attach(process.dir().clone());
    assert_eq!(attached.wait().await?, 4);
    Ok(())
}

#[tokio::test]
async fn refused_bundle_is_launch_failure() -> Result<(), Box<dyn std::error::Error>> {
    let tmp = TempDir::new()?;
    let handle = container(tmp.path(), "c1");
    let bundle = common::failing_bundle(tmp.path(), "no such rootfs");

    let err = runner(tmp.path())
        .run_init(&handle, &bundle, ProcessIo::default())
        .await
        .unwrap_err();
    match err {
        KennelError::LaunchFailed { code, message } => {
            assert_eq!(code, 1);
            assert_eq!(message, "no such rootfs");
        }
        other => panic!("unexpected error: {other}"),
    }
    Ok(())
}

#[tokio::test]
async fn missing_runtime_is_launch_failure() -> Result<(), Box<dyn std::error::Error>> {
    let tmp = TempDir::new()?;
    let handle = container(tmp.path(), "c1");
    let bundle = common::bundle(tmp.path(), "exit 0\n");
    let runner = ExecRunner::new(
        common::shim(),
        tmp.path().join("no-such-runc"),
        KennelPaths::with_root(tmp.path()),
    );

    let err = runner
        .run_init(&handle, &bundle, ProcessIo::default())
        .await
        .unwrap_err();
    assert!(matches!(err, KennelError::LaunchFailed { code: 2, .. }));
    Ok(())
}
