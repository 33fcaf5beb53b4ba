//! Control daemon brokering WPKG deployment runs for unprivileged users.

#![warn(unused_crate_dependencies)]
// These dependencies are only used in the binary (src/bin/main.rs)
// Test dependencies are only used in test code
#[cfg(test)]
use assert_cmd as _;
use ctrlc as _;
#[cfg(test)]
use predicates as _;
use strum as _;
#[cfg(test)]
use tempfile as _;
use tracing_subscriber as _;

/// Caller authorization.
pub mod authz;

/// Host blacklist gate.
pub mod blacklist;

/// CLI parsing.
pub mod cli;

/// Deployer command normalization.
pub mod command;

/// Config loading.
pub mod config;

/// Constants.
pub mod constants;

/// Errors.
pub mod error;

/// Deployer executor.
pub mod executor;

/// Control socket IPC.
pub mod ipc;

/// Deployer output parsing.
pub mod parser;

/// Reboot arbitration.
pub mod reboot;

/// Runtime paths and modes.
pub mod runtime;

/// Control daemon.
pub mod server;

/// Network share connector.
pub mod share;

/// Test utils.
#[doc(hidden)]
pub mod test_utils;
