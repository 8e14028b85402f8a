//! Terminal sessions through the supervisor.
//!
//! This binary is also the runtime for its own tests. Started with the
//! runtime's global `--debug` flag, it behaves like `runc exec --tty`:
//! it opens a PTY sized from the process JSON, sends the master to the
//! console socket, starts the process on the slave as an orphan and
//! writes its pid.

#![allow(unsafe_code)]

mod common;

use std::error::Error;
use std::ffi::CStr;
use std::fs::{File, OpenOptions};
use std::future::Future;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::panic::AssertUnwindSafe;
use std::process::{Command, ExitCode};
use std::time::Duration;

use kennel::exec::{ExecRunner, ProcessIo};
use kennel::shim::console;
use kennel_common::{ContainerHandle, KennelPaths};
use kennel_oci::{ProcessSpec, TtySize};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, DuplexStream};

type TestResult = Result<(), Box<dyn Error>>;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    if args.get(1).is_some_and(|arg| arg == "--debug") {
        return match fake_runtime(&args) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("fake runtime: {e}");
                ExitCode::FAILURE
            }
        };
    }

    let mut failed = 0;
    failed += run("terminal_size_and_resize", terminal_size_and_resize());
    failed += run("terminal_output_drains_before_exit", terminal_output_drains_before_exit());
    if failed == 0 { ExitCode::SUCCESS } else { ExitCode::FAILURE }
}

fn run(name: &str, test: impl Future<Output = TestResult>) -> usize {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| runtime.block_on(test)));
    match outcome {
        Ok(Ok(())) => {
            println!("test {name} ... ok");
            0
        }
        Ok(Err(e)) => {
            println!("test {name} ... FAILED: {e}");
            1
        }
        Err(_) => {
            println!("test {name} ... FAILED (panicked)");
            1
        }
    }
}

fn value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    let at = args.iter().position(|arg| arg == flag)?;
    args.get(at + 1).map(String::as_str)
}

fn fake_runtime(args: &[String]) -> TestResult {
    if !args.iter().any(|arg| arg == "exec") {
        // start, kill and delete have nothing to do here.
        return Ok(());
    }
    let pidfile = value(args, "--pid-file").ok_or("missing --pid-file")?;
    let socket = value(args, "--console-socket").ok_or("missing --console-socket")?;
    let process: serde_json::Value =
        serde_json::from_slice(&std::fs::read(value(args, "--process").ok_or("missing --process")?)?)?;

    let argv: Vec<String> = process["args"]
        .as_array()
        .ok_or("process has no args")?
        .iter()
        .filter_map(|arg| arg.as_str().map(str::to_string))
        .collect();
    let (program, rest) = argv.split_first().ok_or("empty args")?;

    let (master, slave) = open_pty()?;
    let size = &process["consoleSize"];
    if let (Some(width), Some(height)) = (size["width"].as_u64(), size["height"].as_u64()) {
        console::set_winsize(&master, TtySize::new(u16::try_from(width)?, u16::try_from(height)?))?;
    }
    console::send_fd(&UnixStream::connect(socket)?, master.as_raw_fd())?;
    drop(master);

    let mut command = Command::new(program);
    command
        .args(rest)
        .stdin(slave.try_clone()?)
        .stdout(slave.try_clone()?)
        .stderr(slave);
    unsafe {
        command.pre_exec(|| {
            if libc::setsid() < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
    let child = command.spawn()?;
    std::fs::write(pidfile, child.id().to_string())?;
    Ok(())
}

fn open_pty() -> io::Result<(File, File)> {
    let fd = unsafe { libc::posix_openpt(libc::O_RDWR | libc::O_NOCTTY) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let master = unsafe { File::from_raw_fd(fd) };
    let mut name = [0 as libc::c_char; 128];
    unsafe {
        if libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) < 0 || libc::grantpt(fd) < 0 || libc::unlockpt(fd) < 0 {
            return Err(io::Error::last_os_error());
        }
        let rc = libc::ptsname_r(fd, name.as_mut_ptr(), name.len());
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
    }
    let path = unsafe { CStr::from_ptr(name.as_ptr()) }
        .to_str()
        .map_err(io::Error::other)?
        .to_string();
    let slave = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY)
        .open(path)?;
    Ok((master, slave))
}

fn runner(tmp: &TempDir) -> Result<(ExecRunner, ContainerHandle), Box<dyn Error>> {
    let paths = KennelPaths::with_root(tmp.path());
    std::fs::create_dir_all(paths.container("c1"))?;
    let runner = ExecRunner::new(common::shim(), std::env::current_exe()?, paths);
    Ok((runner, ContainerHandle::new("c1")?))
}

async fn read_until(reader: &mut DuplexStream, seen: &mut String, needle: &str) -> TestResult {
    let mut buf = [0u8; 256];
    while !seen.contains(needle) {
        let n = tokio::time::timeout(Duration::from_secs(10), reader.read(&mut buf)).await??;
        if n == 0 {
            return Err(format!("output ended before {needle:?}: {seen:?}").into());
        }
        seen.push_str(&String::from_utf8_lossy(&buf[..n]));
    }
    Ok(())
}

async fn terminal_size_and_resize() -> TestResult {
    let tmp = TempDir::new()?;
    let (runner, handle) = runner(&tmp)?;
    let script = r#"[ -t 0 ] && echo on-a-tty
stty size
while [ "$(stty size)" != "40 120" ]; do sleep 0.05; done
echo resized
exit 4"#;
    let spec = ProcessSpec::new("/bin/sh", ["-c", script]).with_tty(TtySize::new(100, 30));
    let (writer, mut reader) = tokio::io::duplex(64 * 1024);

    let process = runner.exec(&handle, &spec, ProcessIo::default().with_stdout(writer)).await?;
    let mut seen = String::new();
    read_until(&mut reader, &mut seen, "30 100").await?;

    process.set_tty(TtySize::new(120, 40))?;
    read_until(&mut reader, &mut seen, "resized").await?;
    assert_eq!(process.wait().await?, 4);

    reader.read_to_string(&mut seen).await?;
    assert!(seen.contains("on-a-tty"), "{seen:?}");
    Ok(())
}

async fn terminal_output_drains_before_exit() -> TestResult {
    let tmp = TempDir::new()?;
    let (runner, handle) = runner(&tmp)?;
    let script = "i=0; while [ $i -lt 300 ]; do echo line$i; i=$((i+1)); done; exit 0";
    let spec = ProcessSpec::new("/bin/sh", ["-c", script]).with_tty(TtySize::new(80, 24));
    let (writer, mut reader) = tokio::io::duplex(64 * 1024);

    let process = runner.exec(&handle, &spec, ProcessIo::default().with_stdout(writer)).await?;
    assert_eq!(process.wait().await?, 0);

    let mut output = String::new();
    reader.read_to_string(&mut output).await?;
    assert!(output.contains("line0\r\n"), "{output:?}");
    assert!(output.contains("line299\r\n"), "{output:?}");
    Ok(())
}
