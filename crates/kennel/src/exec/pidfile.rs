//! Pidfile polling.

use std::path::Path;
use std::time::Duration;

use kennel_common::{KennelError, KennelResult};
use tokio::time::Instant;

/// How long to wait for a pidfile by default.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
/// How often to look for it.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(100);

/// Bounded pidfile lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PidFileReader {
    timeout: Duration,
    interval: Duration,
}

impl Default for PidFileReader {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT, DEFAULT_INTERVAL)
    }
}

impl PidFileReader {
    /// Reader giving up after `timeout`, polling every `interval`.
    #[must_use]
    pub const fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    /// Pid in `path`, waiting for it to appear.
    ///
    /// # Errors
    ///
    /// Returns [`KennelError::PidFileTimeout`] if no valid pid shows up in
    /// time.
    pub async fn read(&self, path: &Path) -> KennelResult<i32> {
        let start = Instant::now();
        loop {
            if let Some(pid) = try_read(path) {
                return Ok(pid);
            }
            let elapsed = start.elapsed();
            if elapsed >= self.timeout {
                tracing::warn!(path = %path.display(), ?elapsed, "Pidfile never appeared");
                return Err(KennelError::PidFileTimeout {
                    path: path.to_path_buf(),
                    elapsed,
                });
            }
            tokio::time::sleep(self.interval).await;
        }
    }
}

/// Pid in `path` right now; `None` if missing, empty or partially written.
#[must_use]
pub fn try_read(path: &Path) -> Option<i32> {
    std::fs::read_to_string(path)
        .ok()?
        .trim()
        .parse()
        .ok()
        .filter(|pid: &i32| *pid > 0)
}
