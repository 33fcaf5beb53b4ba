//! Credentialed mount/unmount of the deployer's distribution share.
//!
//! The connector owns the in-memory credential pair and a small state
//! machine around the platform mount primitive: a pre-connect TCP liveness
//! probe, a classified retry loop, and fallback to the service identity on
//! logon failure. The mount primitive itself sits behind [`MountBackend`]
//! so tests can script outcomes.
use std::{
    fs,
    net::{TcpStream, ToSocketAddrs},
    path::PathBuf,
    process::Command,
    sync::Arc,
    thread,
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, info};

use crate::{config::Config, constants};

/// Classified outcomes of the mount primitive.
#[derive(Debug, Error)]
pub enum MountError {
    /// The share rejected the supplied credentials.
    #[error("Logon failure while connecting to the share")]
    LogonFailure,
    /// The share is already mounted, possibly with conflicting credentials.
    #[error("The share is already mounted")]
    AlreadyMounted,
    /// The network path could not be found.
    #[error("Bad network path")]
    BadNetworkPath,
    /// The network location cannot be reached.
    #[error("Network unreachable")]
    NetworkUnreachable,
    /// The share is not currently connected.
    #[error("The share is not connected")]
    NotConnected,
    /// I/O failure invoking the mount primitive.
    #[error("Mount I/O failure: {0}")]
    Io(#[from] std::io::Error),
    /// Any other mount failure; treated as fatal.
    #[error("Mount failed: {0}")]
    Other(String),
}

/// The network credential pair used to mount the share.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    /// Username, or `None` for the service identity.
    pub username: Option<String>,
    /// Password matching the username.
    pub password: Option<String>,
}

impl Credentials {
    /// Reads the credential pair from config.
    pub fn from_config(config: &Config) -> Self {
        Self {
            username: config.wpkg_network_username.clone(),
            password: config.wpkg_network_password.clone(),
        }
    }

    /// The empty pair: mount as the service identity.
    pub fn service_identity() -> Self {
        Self::default()
    }
}

/// Platform mount primitive.
pub trait MountBackend: Send {
    /// Mounts `share` with the given credentials, no drive-letter mapping.
    fn mount(&self, share: &str, credentials: &Credentials) -> Result<(), MountError>;
    /// Force-unmounts `share`.
    fn unmount(&self, share: &str) -> Result<(), MountError>;
}

/// Production backend: `mount -t cifs` onto a mount point under the state
/// directory, `umount -f -l` to release it. Outcomes are classified from
/// the tool's stderr.
pub struct CifsMount {
    mount_point: PathBuf,
}

impl CifsMount {
    /// Creates a backend mounting onto the given directory.
    pub fn new(mount_point: PathBuf) -> Self {
        Self { mount_point }
    }
}

impl MountBackend for CifsMount {
    fn mount(&self, share: &str, credentials: &Credentials) -> Result<(), MountError> {
        fs::create_dir_all(&self.mount_point)?;
        let source = share.replace('\\', "/");

        let mut cmd = Command::new("mount");
        cmd.arg("-t").arg("cifs").arg(&source).arg(&self.mount_point);
        match &credentials.username {
            Some(username) => {
                cmd.arg("-o").arg(format!("username={username}"));
                // The password travels via the environment, not argv.
                cmd.env("PASSWD", credentials.password.as_deref().unwrap_or(""));
            }
            None => {
                cmd.arg("-o").arg("guest");
            }
        }

        let output = cmd.output()?;
        if output.status.success() {
            return Ok(());
        }
        Err(classify_mount_failure(&String::from_utf8_lossy(&output.stderr)))
    }

    fn unmount(&self, _share: &str) -> Result<(), MountError> {
        let output = Command::new("umount")
            .arg("-f")
            .arg("-l")
            .arg(&self.mount_point)
            .output()?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.to_ascii_lowercase().contains("not mounted") {
            return Err(MountError::NotConnected);
        }
        Err(MountError::Other(stderr.trim().to_string()))
    }
}

fn classify_mount_failure(stderr: &str) -> MountError {
    let lowered = stderr.to_ascii_lowercase();
    if lowered.contains("permission denied") || lowered.contains("logon failure") {
        MountError::LogonFailure
    } else if lowered.contains("device or resource busy") || lowered.contains("is busy") {
        MountError::AlreadyMounted
    } else if lowered.contains("could not resolve")
        || lowered.contains("no such device")
        || lowered.contains("bad unc")
    {
        MountError::BadNetworkPath
    } else if lowered.contains("no route to host")
        || lowered.contains("network is unreachable")
        || lowered.contains("connection timed out")
    {
        MountError::NetworkUnreachable
    } else {
        MountError::Other(stderr.trim().to_string())
    }
}

/// Mount state machine for the deployer's distribution share.
pub struct ShareConnector {
    config: Arc<Config>,
    share: Option<String>,
    credentials: Credentials,
    credentials_overridden: bool,
    connected: bool,
    backend: Box<dyn MountBackend>,
}

impl ShareConnector {
    /// Creates a disconnected connector for the given share.
    pub fn new(
        config: Arc<Config>,
        share: Option<String>,
        backend: Box<dyn MountBackend>,
    ) -> Self {
        let credentials = Credentials::from_config(&config);
        Self {
            config,
            share,
            credentials,
            credentials_overridden: false,
            connected: false,
            backend,
        }
    }

    /// Whether the share is currently mounted by this connector.
    pub fn connected(&self) -> bool {
        self.connected
    }

    /// Replaces the in-memory credentials. They stick until the service
    /// restarts; `connect` stops re-reading them from config.
    pub fn set_network_user(&mut self, username: String, password: String) {
        self.credentials = Credentials {
            username: Some(username),
            password: Some(password),
        };
        self.credentials_overridden = true;
        info!("Network credentials updated in memory");
    }

    /// Connects to the share. `Ok(true)` means mounted or not needed,
    /// `Ok(false)` means the classified retries were exhausted, and `Err`
    /// is reserved for unclassified fatal failures.
    pub fn connect(&mut self) -> Result<bool, MountError> {
        if self.connected {
            debug!("Share is already connected");
            return Ok(true);
        }
        if !self.credentials_overridden {
            self.credentials = Credentials::from_config(&self.config);
        }
        if self.credentials.username.is_none() {
            info!("No network username configured; using the service identity");
            return Ok(true);
        }
        let Some(share) = self.share.clone() else {
            info!("The deployer is not on the network; no share to connect");
            return Ok(true);
        };

        // Clear any stale mount left behind by a crashed run.
        self.disconnect()?;

        if self.config.test_connection_host.is_some() && !self.probe_test_host() {
            info!("Test host did not respond; not connecting to the share");
            return Ok(false);
        }

        let tries = self.config.connection_tries;
        let sleep = Duration::from_secs(self.config.connection_sleep_before_retry);
        let mut attempt = 0;
        while !self.connected && attempt < tries {
            attempt += 1;
            debug!("Connecting to share '{share}' ({attempt}/{tries})");
            match self.backend.mount(&share, &self.credentials) {
                Ok(()) => {
                    info!(
                        "Connected to {share} as {}",
                        self.credentials.username.as_deref().unwrap_or("<service>")
                    );
                    self.connected = true;
                }
                Err(MountError::LogonFailure) => {
                    if self.credentials.username.is_some() {
                        info!(
                            "Logon failure for '{}'; retrying as the service identity",
                            self.credentials.username.as_deref().unwrap_or_default()
                        );
                        self.credentials = Credentials::service_identity();
                    } else {
                        info!("Logon failure for the service identity; giving up");
                        break;
                    }
                }
                Err(MountError::AlreadyMounted) => {
                    info!("Share '{share}' is already mounted; disconnecting and retrying");
                    self.connected = true;
                    self.disconnect()?;
                }
                Err(err @ (MountError::BadNetworkPath | MountError::NetworkUnreachable)) => {
                    info!("Connecting to '{share}' failed: {err}; will retry");
                    thread::sleep(sleep);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(self.connected)
    }

    /// Releases the share. The "not connected" outcome is swallowed.
    pub fn disconnect(&mut self) -> Result<(), MountError> {
        if !self.connected {
            return Ok(());
        }
        let Some(share) = self.share.clone() else {
            self.connected = false;
            return Ok(());
        };
        info!("Disconnecting from share '{share}'");
        match self.backend.unmount(&share) {
            Ok(()) => {
                self.connected = false;
                Ok(())
            }
            Err(MountError::NotConnected) => {
                info!("Share was already disconnected");
                self.connected = false;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// TCP liveness probe against the configured test host.
    fn probe_test_host(&self) -> bool {
        let Some(host) = self.config.test_connection_host.as_deref() else {
            return true;
        };
        let port = self.config.test_connection_port;
        let tries = self.config.test_connection_tries;
        let sleep = Duration::from_secs(self.config.test_connection_sleep_before_retry);

        for attempt in 1..=tries {
            debug!("Probing {host}:{port} ({attempt}/{tries})");
            match probe_once(host, port) {
                Ok(()) => {
                    debug!("Probe successful");
                    return true;
                }
                Err(err) => debug!("Probe failed: {err}"),
            }
            thread::sleep(sleep);
        }
        false
    }
}

fn probe_once(host: &str, port: u16) -> std::io::Result<()> {
    let addrs = (host, port).to_socket_addrs()?;
    let mut last_err =
        std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses resolved");
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, constants::TCP_PROBE_TIMEOUT) {
            Ok(_) => return Ok(()),
            Err(err) => last_err = err,
        }
    }
    Err(last_err)
}
