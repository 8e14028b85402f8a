//! Child reaping for a subreaper.
//!
//! SIGCHLDs coalesce, so each wakeup drains `waitpid(-1, WNOHANG)` until
//! nothing is reapable and records every status by pid. Orphaned
//! descendants show up here too; the supervisor simply never asks for them.

#![allow(unsafe_code)]

use std::collections::HashMap;
use std::io;

/// Make orphaned descendants reparent to this process.
///
/// # Errors
///
/// Returns the `prctl` error.
pub fn become_subreaper() -> io::Result<()> {
    let ret = unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1, 0, 0, 0) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    tracing::debug!("Registered as child subreaper");
    Ok(())
}

/// Source of exited children.
pub trait ChildWaiter {
    /// Reap one exited child without blocking.
    ///
    /// Returns `Ok(None)` when no child is reapable right now (or there are
    /// no children at all).
    ///
    /// # Errors
    ///
    /// Returns the OS error for anything but "no children".
    fn reap(&mut self) -> io::Result<Option<(i32, i32)>>;
}

/// `waitpid(-1, WNOHANG)` on the calling process.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemWaiter;

impl ChildWaiter for SystemWaiter {
    fn reap(&mut self) -> io::Result<Option<(i32, i32)>> {
        loop {
            let mut status: libc::c_int = 0;
            let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
            match pid {
                0 => return Ok(None),
                -1 => {
                    let err = io::Error::last_os_error();
                    match err.raw_os_error() {
                        Some(libc::ECHILD) => return Ok(None),
                        Some(libc::EINTR) => {}
                        _ => return Err(err),
                    }
                }
                pid => {
                    if let Some(code) = exit_code(status) {
                        return Ok(Some((pid, code)));
                    }
                }
            }
        }
    }
}

/// Shell-style exit code of a wait status: the exit status, or 128 plus the
/// terminating signal. `None` for stop/continue notifications.
#[must_use]
pub fn exit_code(status: libc::c_int) -> Option<i32> {
    if libc::WIFEXITED(status) {
        Some(libc::WEXITSTATUS(status))
    } else if libc::WIFSIGNALED(status) {
        Some(128 + libc::WTERMSIG(status))
    } else {
        None
    }
}

/// Exit statuses collected so far.
#[derive(Debug)]
pub struct Reaper<W> {
    waiter: W,
    exited: HashMap<i32, i32>,
}

impl<W: ChildWaiter> Reaper<W> {
    /// Reaper over `waiter`.
    pub fn new(waiter: W) -> Self {
        Self {
            waiter,
            exited: HashMap::new(),
        }
    }

    /// Reap until nothing is left. Returns how many children were reaped.
    ///
    /// # Errors
    ///
    /// Returns the waiter's error; statuses reaped before it are kept.
    pub fn drain(&mut self) -> io::Result<usize> {
        let mut reaped = 0;
        while let Some((pid, code)) = self.waiter.reap()? {
            tracing::debug!(pid, code, "Reaped child");
            self.exited.insert(pid, code);
            reaped += 1;
        }
        Ok(reaped)
    }

    /// Take the recorded status of `pid`, if it has exited.
    pub fn take(&mut self, pid: i32) -> Option<i32> {
        self.exited.remove(&pid)
    }

    /// Number of recorded statuses nobody has asked for.
    #[must_use]
    pub fn unclaimed(&self) -> usize {
        self.exited.len()
    }
}
