//! Reboot arbitration for deployer-requested reboots.
//!
//! The handler keeps a retry counter in the state directory so reboot
//! loops are detected across service restarts. The actual reboot call sits
//! behind [`RebootBackend`] so tests can observe it.
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    io::{self, Seek, SeekFrom, Write},
    path::PathBuf,
    process::Command,
};
use tracing::{info, warn};

use crate::{
    config::Config,
    constants::{self, CODE_ERROR, CODE_PROGRESS},
    error::{BrokerError, StateFileError},
    ipc::Frame,
};

/// Platform reboot primitive.
pub trait RebootBackend: Send + Sync {
    /// Initiates a system reboot.
    fn initiate(&self) -> io::Result<()>;
}

/// Production backend: asks the init system to reboot.
pub struct SystemReboot;

impl RebootBackend for SystemReboot {
    fn initiate(&self) -> io::Result<()> {
        let status = Command::new("systemctl").arg("reboot").status()?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::other(format!(
                "systemctl reboot exited with {status}"
            )))
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RebootCounter {
    reboots: u32,
}

/// Decides whether a deployer reboot request is honored, deferred, or
/// given up on, and renders the resulting status frame.
pub struct RebootHandler {
    counter_path: PathBuf,
    max_reboots: u32,
    backend: Box<dyn RebootBackend>,
}

impl RebootHandler {
    /// Creates a handler persisting its counter under the config's state
    /// directory.
    pub fn new(config: &Config, backend: Box<dyn RebootBackend>) -> Self {
        Self {
            counter_path: config.state_dir.join(constants::REBOOT_COUNT_FILE_NAME),
            max_reboots: config.wpkg_max_reboots,
            backend,
        }
    }

    /// Handles a reboot request and returns the status frame to send.
    pub fn reboot(&self, cancel: bool) -> String {
        if cancel {
            info!("Deployer requested a reboot, but reboots are suppressed");
            return Frame::new(
                CODE_PROGRESS,
                "A reboot is required to continue the installation",
            )
            .to_string();
        }

        let count = self.read_counter();
        if count >= self.max_reboots {
            warn!("Reboot limit of {} reached; giving up", self.max_reboots);
            return Frame::new(
                CODE_ERROR,
                "Wpkg requested a reboot, but the reboot limit was reached",
            )
            .to_string();
        }

        if let Err(err) = self.write_counter(count + 1) {
            warn!("Failed to persist reboot counter: {err}");
        }

        info!("Initiating reboot {} of {}", count + 1, self.max_reboots);
        match self.backend.initiate() {
            Ok(()) => {
                Frame::new(CODE_PROGRESS, "Rebooting to continue the installation")
                    .to_string()
            }
            Err(err) => {
                Frame::new(CODE_ERROR, format!("Failed to initiate reboot: {err}"))
                    .to_string()
            }
        }
    }

    /// Resets the persistent retry counter.
    pub fn reset_reboot_number(&self) -> Result<(), BrokerError> {
        self.write_counter(0)?;
        Ok(())
    }

    fn read_counter(&self) -> u32 {
        let Ok(contents) = fs::read_to_string(&self.counter_path) else {
            return 0;
        };
        serde_json::from_str::<RebootCounter>(&contents)
            .map(|counter| counter.reboots)
            .unwrap_or(0)
    }

    fn write_counter(&self, reboots: u32) -> Result<(), BrokerError> {
        if let Some(parent) = self.counter_path.parent() {
            fs::create_dir_all(parent).map_err(StateFileError::WriteError)?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.counter_path)
            .map_err(StateFileError::WriteError)?;
        FileExt::lock_exclusive(&file).map_err(StateFileError::WriteError)?;
        file.set_len(0).map_err(StateFileError::WriteError)?;
        file.seek(SeekFrom::Start(0))
            .map_err(StateFileError::WriteError)?;
        let contents = serde_json::to_string(&RebootCounter { reboots })
            .map_err(StateFileError::ParseError)?;
        file.write_all(contents.as_bytes())
            .map_err(StateFileError::WriteError)?;
        FileExt::unlock(&file).map_err(StateFileError::WriteError)?;
        Ok(())
    }
}
