//! Terminal plumbing for `--tty`.
//!
//! The runtime connects to the console socket and sends the PTY master over
//! `SCM_RIGHTS`. The supervisor then relays the stdin FIFO into the master,
//! the master into the stdout FIFO, and window size lines from the control
//! FIFO into `TIOCSWINSZ`.

#![allow(unsafe_code)]

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::os::unix::io::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use kennel_common::{KennelError, KennelResult};
use kennel_oci::TtySize;

/// Listening console socket; removed on drop.
#[derive(Debug)]
pub struct ConsoleSocket {
    path: PathBuf,
    listener: UnixListener,
}

impl ConsoleSocket {
    /// Bind at `path`, replacing a stale socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound.
    pub fn bind(path: &Path) -> KennelResult<Self> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path).map_err(|e| KennelError::Internal {
            message: format!("Failed to bind console socket: {e}"),
        })?;
        tracing::debug!(path = %path.display(), "Console socket created");
        Ok(Self {
            path: path.to_path_buf(),
            listener,
        })
    }

    /// Socket location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block until the runtime connects and hands over the PTY master.
    ///
    /// # Errors
    ///
    /// Returns an error if accepting fails or no descriptor arrives.
    pub fn receive_master(&self) -> KennelResult<OwnedFd> {
        let (stream, _) = self.listener.accept().map_err(|e| KennelError::Internal {
            message: format!("Failed to accept console connection: {e}"),
        })?;
        recv_pty_master(&stream)
    }
}

impl Drop for ConsoleSocket {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Receive a PTY master over a connected socket.
///
/// # Errors
///
/// Returns an error if `recvmsg` fails or the message carries no descriptor.
pub fn recv_pty_master(stream: &UnixStream) -> KennelResult<OwnedFd> {
    // runc sends the console path as payload; only the descriptor matters.
    let mut buf = [0u8; 4096];
    let fd = recv_fd(stream.as_raw_fd(), &mut buf)?;
    let Some(fd) = fd else {
        return Err(KennelError::Internal {
            message: "No PTY master received".to_string(),
        });
    };
    tracing::debug!(fd, "Received PTY master");
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Send `fd` over a connected socket, the way a runtime hands over its
/// console.
///
/// # Errors
///
/// Returns an error if `sendmsg` fails.
pub fn send_fd(stream: &UnixStream, fd: RawFd) -> KennelResult<()> {
    let buf = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: buf.as_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };

    let mut cmsg_buf = [0u8; 64];
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast::<libc::c_void>();
    msg.msg_controllen = unsafe { libc::CMSG_SPACE(std::mem::size_of::<RawFd>() as u32) } as usize;

    let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    if !cmsg.is_null() {
        unsafe {
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(std::mem::size_of::<RawFd>() as u32) as usize;
            std::ptr::write_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>(), fd);
        }
    }

    if unsafe { libc::sendmsg(stream.as_raw_fd(), &msg, 0) } < 0 {
        return Err(KennelError::Internal {
            message: format!("sendmsg failed: {}", std::io::Error::last_os_error()),
        });
    }
    Ok(())
}

fn recv_fd(sock_fd: RawFd, buf: &mut [u8]) -> KennelResult<Option<RawFd>> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast::<libc::c_void>(),
        iov_len: buf.len(),
    };

    let mut cmsg_buf = [0u8; 64];
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast::<libc::c_void>();
    msg.msg_controllen = cmsg_buf.len();

    if unsafe { libc::recvmsg(sock_fd, &mut msg, libc::MSG_CMSG_CLOEXEC) } < 0 {
        return Err(KennelError::Internal {
            message: format!("recvmsg failed: {}", std::io::Error::last_os_error()),
        });
    }

    let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    if cmsg.is_null() {
        return Ok(None);
    }
    let header = unsafe { &*cmsg };
    if header.cmsg_level != libc::SOL_SOCKET || header.cmsg_type != libc::SCM_RIGHTS {
        return Ok(None);
    }
    let fd = unsafe { std::ptr::read_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>()) };
    Ok((fd >= 0).then_some(fd))
}

/// Apply `size` to the terminal behind `master`.
///
/// # Errors
///
/// Returns an error if the ioctl fails.
pub fn set_winsize(master: &impl AsFd, size: TtySize) -> KennelResult<()> {
    let winsize = libc::winsize {
        ws_row: size.rows,
        ws_col: size.columns,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let fd = master.as_fd().as_raw_fd();
    if unsafe { libc::ioctl(fd, libc::TIOCSWINSZ, &winsize) } < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    tracing::debug!(columns = size.columns, rows = size.rows, "Resized terminal");
    Ok(())
}

/// Apply every `TtySize` JSON line read from `control` until it closes.
/// Malformed lines are logged and skipped.
pub fn relay_winsize(control: File, master: &impl AsFd) {
    for line in BufReader::new(control).lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "Window size control read failed");
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<TtySize>(&line) {
            Ok(size) => {
                if let Err(e) = set_winsize(master, size) {
                    tracing::warn!(error = %e, "Failed to resize terminal");
                }
            }
            Err(e) => tracing::warn!(line = %line, error = %e, "Ignoring malformed window size"),
        }
    }
}
