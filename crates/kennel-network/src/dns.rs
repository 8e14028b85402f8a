//! Name resolution files inside a container.
//!
//! Files are opened relative to `/proc/<pid>/root` with `RESOLVE_IN_ROOT`,
//! so symlinks in the container's `/etc` resolve against the container's
//! root and never reach host paths.

use std::fmt::Write as _;
use std::fs::File;
use std::io::Write as _;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use kennel_common::KennelResult;
use rustix::fs::{Mode, OFlags, ResolveFlags};

/// Generate resolv.conf content.
#[must_use]
pub fn generate_resolv_conf(servers: &[Ipv4Addr]) -> String {
    servers.iter().fold(String::new(), |mut out, server| {
        let _ = writeln!(out, "nameserver {server}");
        out
    })
}

/// Generate /etc/hosts content for a container.
#[must_use]
pub fn generate_hosts(hostname: &str, container_ip: Ipv4Addr) -> String {
    format!("127.0.0.1 localhost\n{container_ip} {hostname}\n")
}

/// Root filesystem of the container whose init is `pid`.
#[must_use]
pub fn container_root(proc_root: &Path, pid: u32) -> PathBuf {
    proc_root.join(pid.to_string()).join("root")
}

/// Write resolv.conf and hosts into the container rooted at `root`.
///
/// # Errors
///
/// Returns an error if either file cannot be written, including when its
/// path resolves to a directory that does not exist inside the container.
pub fn write_files(root: &Path, servers: &[Ipv4Addr], hostname: &str, container_ip: Ipv4Addr) -> KennelResult<()> {
    std::fs::create_dir_all(root)?;
    let root = rustix::fs::open(root, OFlags::DIRECTORY | OFlags::RDONLY | OFlags::CLOEXEC, Mode::empty())
        .map_err(std::io::Error::from)?;
    match rustix::fs::mkdirat(&root, "etc", Mode::from_raw_mode(0o755)) {
        Ok(()) | Err(rustix::io::Errno::EXIST) => {}
        Err(e) => return Err(std::io::Error::from(e).into()),
    }

    write_in_root(&root, "etc/resolv.conf", &generate_resolv_conf(servers))?;
    write_in_root(&root, "etc/hosts", &generate_hosts(hostname, container_ip))?;
    tracing::debug!(hostname, "Wrote resolv.conf and hosts");
    Ok(())
}

fn write_in_root(root: &std::os::fd::OwnedFd, path: &str, contents: &str) -> std::io::Result<()> {
    let fd = rustix::fs::openat2(
        root,
        path,
        OFlags::WRONLY | OFlags::CREATE | OFlags::TRUNC | OFlags::CLOEXEC,
        Mode::from_raw_mode(0o644),
        ResolveFlags::IN_ROOT,
    )?;
    File::from(fd).write_all(contents.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolv_conf_lists_servers_in_order() {
        let conf = generate_resolv_conf(&[Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(1, 1, 1, 1)]);
        assert_eq!(conf, "nameserver 8.8.8.8\nnameserver 1.1.1.1\n");
    }

    #[test]
    fn hosts_maps_hostname() {
        let hosts = generate_hosts("box", Ipv4Addr::new(10, 254, 0, 2));
        assert!(hosts.contains("10.254.0.2 box"));
        assert!(hosts.starts_with("127.0.0.1 localhost"));
    }

    #[test]
    fn writes_through_proc_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = container_root(dir.path(), 4242);
        std::fs::create_dir_all(&root).unwrap();
        write_files(&root, &[Ipv4Addr::new(9, 9, 9, 9)], "box", Ipv4Addr::new(10, 0, 0, 2)).unwrap();

        let resolv = std::fs::read_to_string(dir.path().join("4242/root/etc/resolv.conf")).unwrap();
        assert_eq!(resolv, "nameserver 9.9.9.9\n");
        let hosts = std::fs::read_to_string(dir.path().join("4242/root/etc/hosts")).unwrap();
        assert!(hosts.contains("10.0.0.2 box"));
    }

    #[test]
    fn absolute_symlink_stays_inside_container_root() {
        let dir = tempfile::tempdir().unwrap();
        let host = tempfile::tempdir().unwrap();
        let target = host.path().join("resolv.conf");
        std::fs::write(&target, "host content\n").unwrap();

        let root = dir.path().join("root");
        std::fs::create_dir_all(root.join("etc")).unwrap();
        std::os::unix::fs::symlink(&target, root.join("etc/resolv.conf")).unwrap();
        // The same absolute path, seen from inside the container.
        let inside = root.join(target.strip_prefix("/").unwrap());
        std::fs::create_dir_all(inside.parent().unwrap()).unwrap();

        write_files(&root, &[Ipv4Addr::new(6, 6, 6, 6)], "box", Ipv4Addr::new(10, 0, 0, 2)).unwrap();

        assert_eq!(std::fs::read_to_string(&target).unwrap(), "host content\n");
        assert_eq!(std::fs::read_to_string(&inside).unwrap(), "nameserver 6.6.6.6\n");
    }

    #[test]
    fn dangling_escape_fails_without_touching_host() {
        let dir = tempfile::tempdir().unwrap();
        let host = tempfile::tempdir().unwrap();
        let target = host.path().join("hosts");
        std::fs::write(&target, "host content\n").unwrap();

        let root = dir.path().join("root");
        std::fs::create_dir_all(root.join("etc")).unwrap();
        std::os::unix::fs::symlink(&target, root.join("etc/hosts")).unwrap();

        let result = write_files(&root, &[Ipv4Addr::new(6, 6, 6, 6)], "box", Ipv4Addr::new(10, 0, 0, 2));

        assert!(result.is_err());
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "host content\n");
    }

    #[test]
    fn relative_symlink_inside_root_is_followed() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        std::fs::create_dir_all(root.join("etc")).unwrap();
        std::fs::create_dir_all(root.join("run/resolve")).unwrap();
        std::os::unix::fs::symlink("../run/resolve/stub.conf", root.join("etc/resolv.conf")).unwrap();

        write_files(&root, &[Ipv4Addr::new(1, 1, 1, 1)], "box", Ipv4Addr::new(10, 0, 0, 2)).unwrap();

        let stub = std::fs::read_to_string(root.join("run/resolve/stub.conf")).unwrap();
        assert_eq!(stub, "nameserver 1.1.1.1\n");
    }
}
