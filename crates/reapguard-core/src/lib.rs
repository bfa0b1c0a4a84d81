//! Reapguard Core - Platform-independent abstractions for resource teardown
//!
//! This crate provides the process traits, resource types, statistics,
//! configuration and error types shared by the platform crates and the
//! top-level `reapguard` crate.

pub mod config;
pub mod error;
pub mod process;
pub mod resources;
pub mod stats;
pub mod stdio;

pub use config::*;
pub use error::*;
pub use process::*;
pub use resources::*;
pub use stats::*;
pub use stdio::{OutputBuffer, stream};
