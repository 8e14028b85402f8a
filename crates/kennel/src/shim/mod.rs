//! The process supervisor behind `kennel-shim`.
//!
//! One supervisor runs per `create` or `exec`. It becomes a child subreaper,
//! binds the exit socket, starts the runtime and then reaps until the
//! process the runtime launched has exited. The launch outcome goes out as a
//! single byte on the status descriptor; the process's exit code becomes the
//! supervisor's own exit status and is also written to `<dir>/exitcode`.
//!
//! | status byte | supervisor exit | meaning                               |
//! |-------------|-----------------|---------------------------------------|
//! | `0`         | process code    | launched; the process ran and exited  |
//! | `2`         | `2`             | runtime could not be started          |
//! | runtime's   | `3`             | runtime ran and failed                |
//! | `127`       | `127`           | bad command line                      |
//! | `0`         | `255`           | launched but the pidfile was unusable |

pub mod args;
pub mod console;
pub mod reaper;
pub mod status;
pub mod supervisor;

use std::ffi::OsString;

use clap::Parser;

pub use args::{DEFAULT_STATUS_FD, Mode, ShimArgs};
pub use status::StatusWriter;
pub use supervisor::{ShimError, supervise};

/// Parse `argv`, supervise, and return the exit code for the process.
///
/// The status descriptor is adopted before anything else opens a file so
/// its number cannot be reused.
pub fn main<I, T>(argv: I) -> i32
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let args = match ShimArgs::try_parse_from(argv) {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            if !e.use_stderr() {
                return 0;
            }
            StatusWriter::adopt(DEFAULT_STATUS_FD).send(status::USAGE);
            return i32::from(status::USAGE);
        }
    };

    let mut status = StatusWriter::adopt(args.status_fd);
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "Failed to build runtime");
            status.send(status::SPAWN_FAILED);
            return i32::from(status::SPAWN_FAILED);
        }
    };
    runtime.block_on(supervise(args, status))
}
