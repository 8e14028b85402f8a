//! Named pipes for process stdio.
//!
//! The runner opens every FIFO read-write before the supervisor starts.
//! On Linux that never blocks and it gives each FIFO both a reader and a
//! writer, so the supervisor's blocking opens return immediately whichever
//! end they ask for.

use std::fs::{File, OpenOptions};
use std::path::Path;

use kennel_common::{KennelResult, ProcessDir};
use rustix::fs::{CWD, FileType, Mode, mknodat};

/// Create a FIFO at `path`, owner read/write only.
///
/// # Errors
///
/// Returns an error if the FIFO cannot be created (missing directory,
/// existing file, full disk).
pub fn mkfifo(path: &Path) -> KennelResult<()> {
    mknodat(CWD, path, FileType::Fifo, Mode::RUSR | Mode::WUSR, 0).map_err(std::io::Error::from)?;
    Ok(())
}

/// Open a FIFO read-write without blocking.
///
/// # Errors
///
/// Returns an error if the FIFO cannot be opened.
pub fn open_placeholder(path: &Path) -> KennelResult<File> {
    Ok(OpenOptions::new().read(true).write(true).open(path)?)
}

/// Placeholder ends of a process's FIFOs.
#[derive(Debug)]
pub struct Fifos {
    /// Process stdin.
    pub stdin: File,
    /// Process stdout.
    pub stdout: File,
    /// Process stderr.
    pub stderr: File,
    /// Window size control.
    pub winsz: File,
}

impl Fifos {
    /// Create and open the four FIFOs of `dir`.
    ///
    /// # Errors
    ///
    /// Returns the first creation or open failure.
    pub fn create(dir: &ProcessDir) -> KennelResult<Self> {
        let paths = [dir.stdin(), dir.stdout(), dir.stderr(), dir.winsz()];
        for path in &paths {
            mkfifo(path)?;
        }
        let [stdin, stdout, stderr, winsz] = paths;
        Ok(Self {
            stdin: open_placeholder(&stdin)?,
            stdout: open_placeholder(&stdout)?,
            stderr: open_placeholder(&stderr)?,
            winsz: open_placeholder(&winsz)?,
        })
    }
}
