//! # kennel-oci
//!
//! The pieces of the OCI runtime contract Kennel speaks:
//!
//! - [`process`]: the process specification piped to the runtime
//! - [`cli`]: argument vectors for a runc-compatible command line
//! - [`log`]: extracting errors from the runtime's JSON log

#![warn(missing_docs)]

pub mod cli;
pub mod log;
pub mod process;

pub use cli::RuntimeCli;
pub use process::{ConsoleSize, ProcessSpec, ResourceLimits, Rlimit, RuntimeProcess, TtySize, User};
