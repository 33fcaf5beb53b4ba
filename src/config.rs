//! Configuration management for wpkgd.
//!
//! The config file keeps the key names of the original service
//! (`WpkgCommand`, `WpkgNetworkUsername`, ...) so existing deployments can
//! be carried over. The persisted running indicator is also written through
//! this module.
use fs2::FileExt;
use serde::Deserialize;
use std::{
    collections::HashMap,
    fs,
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};
use tracing::debug;

use crate::{
    constants,
    error::{BrokerError, StateFileError},
    runtime,
};

/// Represents the structure of the configuration file.
#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct Config {
    /// Command line used to invoke the deployer.
    pub wpkg_command: String,
    /// Username used to mount the distribution share.
    #[serde(default)]
    pub wpkg_network_username: Option<String>,
    /// Password used to mount the distribution share.
    #[serde(default)]
    pub wpkg_network_password: Option<String>,
    /// Host probed with a TCP connect before mounting the share.
    #[serde(default)]
    pub test_connection_host: Option<String>,
    /// Port for the TCP liveness probe.
    #[serde(default = "default_test_connection_port")]
    pub test_connection_port: u16,
    /// Number of probe attempts before giving up.
    #[serde(default = "default_test_connection_tries")]
    pub test_connection_tries: u32,
    /// Seconds to sleep between probe attempts.
    #[serde(default = "default_test_connection_sleep")]
    pub test_connection_sleep_before_retry: u64,
    /// Number of mount attempts before giving up.
    #[serde(default = "default_connection_tries")]
    pub connection_tries: u32,
    /// Seconds to sleep between mount attempts.
    #[serde(default = "default_connection_sleep")]
    pub connection_sleep_before_retry: u64,
    /// Extra environment variables overlaid onto the deployer environment.
    #[serde(default)]
    pub environment_variables: Option<HashMap<String, String>>,
    /// Emit heartbeat frames during output inactivity (bool-as-int).
    #[serde(default = "default_one")]
    pub wpkg_activity_indicator: u8,
    /// Allow any local caller to run the deployer (bool-as-int).
    #[serde(default)]
    pub wpkg_execute_by_non_admins: u8,
    /// Allow callers with local accounts to run the deployer (bool-as-int).
    #[serde(default)]
    pub wpkg_execute_by_local_users: u8,
    /// Refuse `ExecuteFromGPE` requests issued by the boot hook (bool-as-int).
    #[serde(default)]
    pub disable_at_boot_up: u8,
    /// Logging verbosity: 3 debug, 2 info, 1 error, anything else off.
    #[serde(default = "default_one")]
    pub wpkg_verbosity: u8,
    /// Reboot requests honored before the reboot handler gives up.
    #[serde(default = "default_max_reboots")]
    pub wpkg_max_reboots: u32,

    /// Directory holding the running marker, reboot counter, and mount
    /// point. Resolved from the runtime context at load time.
    #[serde(skip, default = "runtime::state_dir")]
    pub state_dir: PathBuf,
}

fn default_test_connection_port() -> u16 {
    445
}

fn default_test_connection_tries() -> u32 {
    3
}

fn default_test_connection_sleep() -> u64 {
    10
}

fn default_connection_tries() -> u32 {
    5
}

fn default_connection_sleep() -> u64 {
    10
}

fn default_one() -> u8 {
    1
}

fn default_max_reboots() -> u32 {
    3
}

impl Config {
    /// Parses a config from YAML text. The state directory is taken from
    /// the active runtime context.
    pub fn from_yaml(yaml: &str) -> Result<Self, BrokerError> {
        let config: Config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Returns a copy rooted at an explicit state directory.
    pub fn with_state_dir(mut self, state_dir: impl Into<PathBuf>) -> Self {
        self.state_dir = state_dir.into();
        self
    }

    /// Whether heartbeat frames should be emitted.
    pub fn activity_indicator(&self) -> bool {
        self.wpkg_activity_indicator != 0
    }

    /// Whether any authenticated local caller may run the deployer.
    pub fn execute_by_non_admins(&self) -> bool {
        self.wpkg_execute_by_non_admins != 0
    }

    /// Whether callers with local accounts may run the deployer.
    pub fn execute_by_local_users(&self) -> bool {
        self.wpkg_execute_by_local_users != 0
    }

    /// Whether boot-time execution requests are refused.
    pub fn disabled_at_boot(&self) -> bool {
        self.disable_at_boot_up != 0
    }

    fn running_state_path(&self) -> PathBuf {
        self.state_dir.join(constants::RUNNING_STATE_FILE_NAME)
    }

    /// Persists the running indicator as `"true"`/`"false"`.
    pub fn set_running_state(&self, running: bool) -> Result<(), BrokerError> {
        fs::create_dir_all(&self.state_dir).map_err(StateFileError::WriteError)?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(self.running_state_path())
            .map_err(StateFileError::WriteError)?;
        FileExt::lock_exclusive(&file).map_err(StateFileError::WriteError)?;
        file.set_len(0).map_err(StateFileError::WriteError)?;
        file.seek(SeekFrom::Start(0))
            .map_err(StateFileError::WriteError)?;
        file.write_all(if running { b"true" } else { b"false" })
            .map_err(StateFileError::WriteError)?;
        FileExt::unlock(&file).map_err(StateFileError::WriteError)?;
        debug!("Persisted running state: {running}");
        Ok(())
    }

    /// Reads the persisted running indicator, if any.
    pub fn running_state(&self) -> Result<Option<bool>, BrokerError> {
        let path = self.running_state_path();
        if !path.exists() {
            return Ok(None);
        }
        let mut file = fs::File::open(path).map_err(StateFileError::ReadError)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(StateFileError::ReadError)?;
        Ok(match contents.trim() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        })
    }
}

/// Loads the configuration from an explicit path, or from the first
/// `wpkgd.yaml` found in the runtime config directories.
pub fn load_config(path: Option<&str>) -> Result<Config, BrokerError> {
    let path = match path {
        Some(path) => PathBuf::from(path),
        None => first_existing_config_path()?,
    };
    debug!("Loading config from {:?}", path);
    let contents = fs::read_to_string(&path)?;
    Config::from_yaml(&contents)
}

fn first_existing_config_path() -> Result<PathBuf, BrokerError> {
    for dir in runtime::config_dirs() {
        let candidate = dir.join(constants::CONFIG_FILE_NAME);
        if candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(BrokerError::ConfigReadError(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("no {} found in config directories", constants::CONFIG_FILE_NAME),
    )))
}

/// Returns a config suitable for tests, rooted at the given state dir.
#[doc(hidden)]
pub fn test_config(command: &str, state_dir: &Path) -> Config {
    Config::from_yaml(&format!("WpkgCommand: \"{command}\"\n"))
        .expect("test config parses")
        .with_state_dir(state_dir)
}
