//! # kennel-common
//!
//! Shared types for the Kennel container backend.
//!
//! This crate provides the pieces every other Kennel crate agrees on:
//! - Container handles and process identifiers
//! - Depot and per-process filesystem layout
//! - The common error taxonomy

#![warn(missing_docs)]

pub mod error;
pub mod id;
pub mod paths;

pub use error::{KennelError, KennelResult};
pub use id::{ContainerHandle, ProcessId};
pub use paths::{KennelPaths, ProcessDir};
