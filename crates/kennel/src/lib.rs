//! # Kennel
//!
//! Process supervision and container orchestration on top of a
//! runc-compatible runtime.
//!
//! ## Features
//!
//! - **Exit relay**: every process runs under `kennel-shim`, a subreaper
//!   that reports the exact exit code across PID-namespace boundaries
//! - **Exit notification**: a Unix socket closed on exit, so any number of
//!   waiters park without polling
//! - **Named-pipe stdio**: FIFOs opened in an order that never blocks
//! - **Networking**: subnets, veths, DNS files and per-container iptables
//!   chains via [`kennel_network`]
//!
//! ## Usage
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use kennel::config::KennelConfig;
//! use kennel::exec::ProcessIo;
//! use kennel::orchestrator::Orchestrator;
//! use kennel_common::ContainerHandle;
//! use kennel_network::{NetworkSpec, SystemRunner};
//! use kennel_oci::ProcessSpec;
//!
//! # async fn example() -> kennel_common::KennelResult<()> {
//! let orchestrator = Orchestrator::new(KennelConfig::default(), Arc::new(SystemRunner))?;
//! orchestrator.setup().await?;
//!
//! let handle = ContainerHandle::new("web")?;
//! orchestrator
//!     .create(&handle, Path::new("/srv/bundles/web"), &NetworkSpec::default(), ProcessIo::default())
//!     .await?;
//!
//! let spec = ProcessSpec::new("/bin/echo", ["hello"]);
//! let code = orchestrator.run(&handle, &spec, ProcessIo::default()).await?.wait().await?;
//! assert_eq!(code, 0);
//!
//! orchestrator.destroy(&handle).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod exec;
pub mod notify;
pub mod orchestrator;
pub mod shim;

pub use config::KennelConfig;
pub use exec::{ExecRunner, Process, ProcessIo, Signal};
pub use notify::ExitNotifier;
pub use orchestrator::{Container, Orchestrator};
