//! Host-wide iptables lock.
//!
//! `iptables --wait` only guards a single invocation against xtables lock
//! contention. Multi-command sequences (global setup, instance teardown)
//! hold this `flock(2)` lock across the whole sequence instead.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use kennel_common::KennelResult;
use rustix::fs::{FlockOperation, flock};

/// Lock file shared by every Kennel process on the host.
#[derive(Debug, Clone)]
pub struct IptablesLock {
    path: PathBuf,
}

/// Held lock; released on drop.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
}

impl IptablesLock {
    /// Lock backed by the file at `path` (created on first use).
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Lock file location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block until the lock is held.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock file cannot be opened or locked.
    pub async fn acquire(&self) -> KennelResult<LockGuard> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || Self::acquire_blocking(&path))
            .await
            .map_err(|e| kennel_common::KennelError::Internal {
                message: format!("iptables lock task failed: {e}"),
            })?
    }

    fn acquire_blocking(path: &Path) -> KennelResult<LockGuard> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        flock(&file, FlockOperation::LockExclusive).map_err(std::io::Error::from)?;
        tracing::trace!(path = %path.display(), "Acquired iptables lock");
        Ok(LockGuard { file })
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = flock(&self.file, FlockOperation::Unlock);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn lock_excludes_concurrent_holders() {
        let dir = tempfile::tempdir().unwrap();
        let lock = IptablesLock::new(dir.path().join("nested/iptables.lock"));
        let inside = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let lock = lock.clone();
            let inside = Arc::clone(&inside);
            tasks.push(tokio::spawn(async move {
                let _guard = lock.acquire().await.unwrap();
                assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                tokio::time::sleep(Duration::from_millis(20)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert!(lock.path().exists());
    }
}
