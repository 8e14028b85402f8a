//! Shared fixtures: a shell stand-in for the OCI runtime.
//!
//! The fake runtime understands the subset of the runc command line the
//! supervisor emits. `create` runs `<bundle>/init.sh`, `exec` runs the
//! process JSON's `args`; both start the process as an orphan so the
//! supervisor has to reap it as subreaper. A `<bundle>/fail` file makes
//! `create` log its contents as an error and exit 1.

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tempfile::TempDir;

const FAKE_RUNTIME: &str = r#"#!/bin/sh
log=/dev/null
while [ $# -gt 0 ]; do
  case "$1" in
    --log) log="$2"; shift 2 ;;
    --log-format) shift 2 ;;
    --debug) shift ;;
    *) break ;;
  esac
done

verb="$1"; shift
bundle=""; pidfile=""; process=""
while [ $# -gt 1 ]; do
  case "$1" in
    --bundle) bundle="$2"; shift 2 ;;
    --pid-file) pidfile="$2"; shift 2 ;;
    --process) process="$2"; shift 2 ;;
    --console-socket) shift 2 ;;
    *) shift ;;
  esac
done

fail() {
  printf '{"level":"error","msg":"%s","time":"now"}\n' "$1" >> "$log"
  exit 1
}

case "$verb" in
  create)
    if [ -f "$bundle/fail" ]; then fail "$(cat "$bundle/fail")"; fi
    exec 3<&0
    ( sh "$bundle/init.sh" <&3 3<&- & echo $! > "$pidfile" )
    ;;
  exec)
    args=$(sed -n 's/.*"args":\[\([^]]*\)\].*/\1/p' "$process" | sed 's/","/" "/g')
    eval "set -- $args"
    exec 3<&0
    ( "$@" <&3 3<&- & echo $! > "$pidfile" )
    ;;
  start|delete|kill) ;;
  *) fail "unknown verb $verb" ;;
esac
exit 0
"#;

/// The supervisor binary built alongside these tests.
pub fn shim() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_kennel-shim"))
}

/// The fake runtime, written once per test binary.
///
/// Writing an executable while other threads fork can make its exec fail
/// with `ETXTBSY`, so every test shares one copy.
pub fn fake_runtime() -> PathBuf {
    static RUNTIME: OnceLock<(TempDir, PathBuf)> = OnceLock::new();
    let (_, path) = RUNTIME.get_or_init(|| {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fake-runc");
        std::fs::write(&path, FAKE_RUNTIME).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        (dir, path)
    });
    path.clone()
}

/// A bundle whose init runs `script`.
pub fn bundle(dir: &Path, script: &str) -> PathBuf {
    let bundle = dir.join("bundle");
    std::fs::create_dir_all(&bundle).unwrap();
    std::fs::write(bundle.join("init.sh"), script).unwrap();
    bundle
}

/// A bundle the fake runtime refuses with `message`.
pub fn failing_bundle(dir: &Path, message: &str) -> PathBuf {
    let bundle = bundle(dir, "exit 0\n");
    std::fs::write(bundle.join("fail"), message).unwrap();
    bundle
}
