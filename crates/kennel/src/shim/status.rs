//! The launch status side channel.
//!
//! One byte, written once: `0` when the runtime launched the process,
//! otherwise the failure code. The descriptor is close-on-exec so neither
//! the runtime nor the container can hold the channel open.

#![allow(unsafe_code)]

use std::fs::File;
use std::io::Write;
use std::os::unix::io::{BorrowedFd, FromRawFd, OwnedFd, RawFd};

use rustix::io::{FdFlags, fcntl_getfd, fcntl_setfd};

/// Status byte: the runtime launched the process.
pub const LAUNCHED: u8 = 0;
/// Status byte: the runtime could not be started (or setup failed).
pub const SPAWN_FAILED: u8 = 2;
/// Status byte: the command line could not be parsed.
pub const USAGE: u8 = 127;

/// Writer for the status descriptor; a no-op if the descriptor is not open.
#[derive(Debug)]
pub struct StatusWriter {
    file: Option<File>,
}

impl StatusWriter {
    /// Adopt `fd`, marking it close-on-exec.
    ///
    /// The descriptor must not be owned by anything else in this process.
    #[must_use]
    pub fn adopt(fd: RawFd) -> Self {
        if fd < 0 {
            return Self::closed();
        }
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let Ok(flags) = fcntl_getfd(borrowed) else {
            tracing::debug!(fd, "Status descriptor not open");
            return Self::closed();
        };
        if let Err(e) = fcntl_setfd(borrowed, flags | FdFlags::CLOEXEC) {
            tracing::warn!(fd, error = %e, "Failed to mark status descriptor close-on-exec");
        }
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        Self {
            file: Some(File::from(owned)),
        }
    }

    /// Writer that drops every byte.
    #[must_use]
    pub const fn closed() -> Self {
        Self { file: None }
    }

    /// Write `byte` and close the channel. Later calls are no-ops.
    pub fn send(&mut self, byte: u8) {
        let Some(mut file) = self.file.take() else {
            return;
        };
        match file.write_all(&[byte]) {
            Ok(()) => tracing::debug!(byte, "Wrote status byte"),
            Err(e) => tracing::warn!(byte, error = %e, "Failed to write status byte"),
        }
    }

    /// Whether a byte can still be sent.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.file.is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::os::unix::io::IntoRawFd;

    use super::*;

    #[test]
    fn sends_one_byte_then_closes() {
        let (reader, writer) = rustix::pipe::pipe().unwrap();
        let mut status = StatusWriter::adopt(writer.into_raw_fd());
        assert!(status.is_open());

        status.send(12);
        status.send(0);
        assert!(!status.is_open());

        let mut received = Vec::new();
        File::from(reader).read_to_end(&mut received).unwrap();
        assert_eq!(received, [12]);
    }

    #[test]
    fn adopted_descriptor_is_cloexec() {
        let (_reader, writer) = rustix::pipe::pipe().unwrap();
        let fd = writer.into_raw_fd();
        let status = StatusWriter::adopt(fd);
        let flags = fcntl_getfd(unsafe { BorrowedFd::borrow_raw(fd) }).unwrap();
        assert!(flags.contains(FdFlags::CLOEXEC));
        drop(status);
    }

    #[test]
    fn closed_writer_ignores_bytes() {
        let mut status = StatusWriter::closed();
        status.send(2);
        assert!(!status.is_open());
    }
}
