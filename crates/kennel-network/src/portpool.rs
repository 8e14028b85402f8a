//! Host port allocation.
//!
//! Ports are handed out from the front of a queue and returned to its back,
//! so a released port is reused only after every other free port. State is
//! persisted as JSON so a restart resumes from the same frontier.

use std::collections::{BTreeSet, VecDeque};
use std::path::Path;

use kennel_common::{KennelError, KennelResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Persisted pool state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortPoolState {
    /// Free ports, next to hand out first.
    pub queue: VecDeque<u16>,
    /// Ports currently handed out.
    pub acquired: BTreeSet<u16>,
}

/// FIFO allocator over `[start, start + size)`.
#[derive(Debug)]
pub struct PortPool {
    start: u16,
    size: u16,
    state: Mutex<PortPoolState>,
}

impl PortPool {
    /// Fresh pool with every port free, in ascending order.
    ///
    /// # Errors
    ///
    /// Returns [`KennelError::Config`] if the range runs past port 65535.
    pub fn new(start: u16, size: u16) -> KennelResult<Self> {
        if u32::from(start) + u32::from(size) > u32::from(u16::MAX) + 1 {
            return Err(KennelError::Config {
                message: format!("port pool {start}+{size} exceeds the port range"),
            });
        }
        let queue = (0..size).map(|offset| start + offset).collect();
        Ok(Self {
            start,
            size,
            state: Mutex::new(PortPoolState {
                queue,
                acquired: BTreeSet::new(),
            }),
        })
    }

    /// Pool restored from `path`, or fresh if the file does not exist.
    ///
    /// Persisted ports outside the configured range are dropped; in-range
    /// ports the file does not mention are appended as free.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path, start: u16, size: u16) -> KennelResult<Self> {
        let pool = Self::new(start, size)?;
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No port pool state, starting fresh");
                return Ok(pool);
            }
            Err(e) => return Err(e.into()),
        };
        let saved: PortPoolState = serde_json::from_str(&contents)?;

        let mut state = PortPoolState::default();
        for port in saved.acquired {
            if pool.contains(port) {
                state.acquired.insert(port);
            }
        }
        let mut seen = state.acquired.clone();
        for port in saved.queue {
            if pool.contains(port) && seen.insert(port) {
                state.queue.push_back(port);
            }
        }
        for offset in 0..size {
            let port = start + offset;
            if seen.insert(port) {
                state.queue.push_back(port);
            }
        }

        tracing::info!(
            path = %path.display(),
            free = state.queue.len(),
            acquired = state.acquired.len(),
            "Restored port pool"
        );
        *pool.state.lock() = state;
        Ok(pool)
    }

    /// Write the state to `path` atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &Path) -> KennelResult<()> {
        let json = serde_json::to_vec_pretty(&*self.state.lock())?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Whether `port` belongs to this pool.
    #[must_use]
    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && u32::from(port) < u32::from(self.start) + u32::from(self.size)
    }

    /// Hand out the port at the front of the queue.
    ///
    /// # Errors
    ///
    /// Returns [`KennelError::PortPoolExhausted`] when no port is free.
    pub fn acquire(&self) -> KennelResult<u16> {
        let mut state = self.state.lock();
        let port = state.queue.pop_front().ok_or(KennelError::PortPoolExhausted)?;
        state.acquired.insert(port);
        Ok(port)
    }

    /// Return `port` to the back of the queue.
    ///
    /// Ports outside the range are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`KennelError::PortNotAcquired`] if the port is in range but
    /// not currently handed out, which catches double releases.
    pub fn release(&self, port: u16) -> KennelResult<()> {
        if !self.contains(port) {
            return Ok(());
        }
        let mut state = self.state.lock();
        if !state.acquired.remove(&port) {
            return Err(KennelError::PortNotAcquired { port });
        }
        state.queue.push_back(port);
        Ok(())
    }

    /// Reserve a specific port, taking it out of the queue.
    ///
    /// Ports outside the range are not managed and always succeed.
    ///
    /// # Errors
    ///
    /// Returns [`KennelError::PortTaken`] if the port is already handed out.
    pub fn remove(&self, port: u16) -> KennelResult<()> {
        if !self.contains(port) {
            return Ok(());
        }
        let mut state = self.state.lock();
        if state.acquired.contains(&port) {
            return Err(KennelError::PortTaken { port });
        }
        state.queue.retain(|&p| p != port);
        state.acquired.insert(port);
        Ok(())
    }

    /// Copy of the current state.
    #[must_use]
    pub fn snapshot(&self) -> PortPoolState {
        self.state.lock().clone()
    }
}
