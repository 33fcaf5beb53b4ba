//! Error handling for wpkgd.
use thiserror::Error;

use crate::share::MountError;

/// Defines all possible errors that can occur in the control service.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Error reading a configuration or state file.
    #[error("Failed to read config file: {0}")]
    ConfigReadError(#[from] std::io::Error),

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    ConfigParseError(#[from] serde_yaml::Error),

    /// The configured deployer command expanded to nothing.
    #[error("The configured deployer command is empty")]
    EmptyDeployerCommand,

    /// Error spawning the deployer child process.
    #[error("Failed to start the deployer: {source}")]
    DeployerStartError {
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Error from the share connector.
    #[error(transparent)]
    Mount(#[from] MountError),

    /// Error on the control socket.
    #[error(transparent)]
    Control(#[from] crate::ipc::ControlError),

    /// Error for the running marker or reboot counter.
    #[error("State file error: {0}")]
    StateFileError(#[from] StateFileError),

    /// Error from a system call while inspecting the peer.
    #[error("System call failed: {0}")]
    Errno(#[from] nix::errno::Errno),

    /// Error for poisoned mutex.
    #[error("Mutex is poisoned: {0}")]
    MutexPoisonError(String),
}

/// Error type for persistent state file operations (the running marker
/// and the reboot retry counter).
#[derive(Debug, Error)]
pub enum StateFileError {
    /// Error reading a state file.
    #[error("Failed to read state file: {0}")]
    ReadError(std::io::Error),

    /// Error writing a state file.
    #[error("Failed to write state file: {0}")]
    WriteError(std::io::Error),

    /// Error encoding or parsing JSON contents of a state file.
    #[error("Failed to parse state file: {0}")]
    ParseError(#[from] serde_json::Error),
}

/// Implement the `From` trait to convert a `std::sync::PoisonError` into a `BrokerError`.
impl<T> From<std::sync::PoisonError<T>> for BrokerError {
    /// Converts a `std::sync::PoisonError` into a `BrokerError`.
    fn from(err: std::sync::PoisonError<T>) -> Self {
        BrokerError::MutexPoisonError(err.to_string())
    }
}
