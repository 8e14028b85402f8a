//! Exit notification over a Unix socket.
//!
//! The owner of a process binds the socket before the process starts and
//! accepts connections without ever writing to them. When the owner closes
//! the notifier (or dies), every held connection closes and every waiter
//! sees EOF. A waiter that arrives after the owner is gone gets
//! `NotFound`/`ConnectionRefused` and returns at once.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use kennel_common::{KennelError, KennelResult};
use tokio::io::AsyncReadExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;

/// Bound exit socket. Drop or [`ExitNotifier::close`] signals exit.
#[derive(Debug)]
pub struct ExitNotifier {
    path: PathBuf,
    accept: JoinHandle<()>,
}

impl ExitNotifier {
    /// Bind `path`, replacing a stale socket, and start accepting waiters.
    ///
    /// Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails if the parent directory is missing or not writable.
    pub fn listen(path: impl Into<PathBuf>) -> KennelResult<Self> {
        let path = path.into();
        match std::fs::remove_file(&path) {
            Ok(()) => tracing::debug!(path = %path.display(), "Removed stale exit socket"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let listener = UnixListener::bind(&path).map_err(|e| KennelError::Internal {
            message: format!("Failed to bind exit socket {}: {e}", path.display()),
        })?;
        tracing::debug!(path = %path.display(), "Exit socket listening");

        let accept = tokio::spawn(accept_loop(listener));
        Ok(Self { path, accept })
    }

    /// Socket location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Close every waiter's connection.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for ExitNotifier {
    fn drop(&mut self) {
        self.accept.abort();
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn accept_loop(listener: UnixListener) {
    let mut held = Vec::new();
    loop {
        match listener.accept().await {
            Ok((stream, _)) => held.push(stream),
            Err(e) => tracing::warn!(error = %e, "Exit socket accept failed"),
        }
    }
}

/// Wait until the owner of the socket at `path` has exited.
///
/// Returns immediately if the owner is already gone.
///
/// # Errors
///
/// Returns an error if connecting fails for any other reason.
pub async fn wait(path: &Path) -> KennelResult<()> {
    let mut stream = match UnixStream::connect(path).await {
        Ok(stream) => stream,
        Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::ConnectionRefused) => {
            tracing::trace!(path = %path.display(), "Exit socket already gone");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let mut buf = [0u8; 64];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => return Ok(()),
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::ConnectionReset => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }
}
