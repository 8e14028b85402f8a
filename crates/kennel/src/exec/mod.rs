//! Running processes under the supervisor.
//!
//! - [`fifo`]: the named pipes carrying a process's stdio
//! - [`pidfile`]: bounded pidfile polling
//! - [`process`]: handles to launched processes
//! - [`runner`]: the launch protocol

pub mod fifo;
pub mod pidfile;
pub mod process;
pub mod runner;

pub use pidfile::PidFileReader;
pub use process::{Process, ProcessIo, ProcessState, STREAM_DRAIN_TIMEOUT, Signal};
pub use runner::ExecRunner;
