//! Host blacklist gate.
//!
//! A plain-text opt-out file beside the deployer script can block this
//! host, or every host, from invoking the deployer. An unreadable file
//! means no blacklist applies.
use std::{fs, path::Path};
use tracing::{debug, info};

use crate::{command::DeployerCommand, constants};

/// Checks the blacklist beside the deployer script against the local
/// computer name. Returns `true` when execution is allowed.
pub fn host_allowed(command: &DeployerCommand) -> bool {
    let Some(path) = command.blacklist_path() else {
        return true;
    };
    allowed_by_file(path, &local_hostname())
}

/// Applies the blacklist file to the given lowercased hostname.
pub fn allowed_by_file(path: &Path, hostname: &str) -> bool {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            debug!("No blacklist applies ({:?}: {err})", path);
            return true;
        }
    };

    let mut entries = Vec::new();
    for line in contents.lines() {
        let entry = line.trim();
        if entry.eq_ignore_ascii_case(constants::BLOCK_ALL_SENTINEL) {
            info!("Blacklist blocks all hosts");
            return false;
        }
        if !entry.starts_with('#') && !entry.is_empty() {
            entries.push(entry.to_ascii_lowercase());
        }
    }

    if entries.iter().any(|entry| entry == hostname) {
        info!("Host '{hostname}' is blacklisted");
        return false;
    }
    true
}

/// The local computer name, lowercased.
pub fn local_hostname() -> String {
    nix::unistd::gethostname()
        .map(|name| name.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}
