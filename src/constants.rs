//! Constants and configuration values for the wpkgd daemon.
//!
//! This module centralizes the magic numbers, strings, and protocol values
//! used throughout the daemon to improve maintainability and clarity.

use std::time::Duration;

// ============================================================================
// Status Protocol
// ============================================================================

/// Progress frame carrying a formatted deployer output line.
pub const CODE_PROGRESS: u16 = 100;

/// Heartbeat frame: last progress line plus a spinner.
pub const CODE_HEARTBEAT: u16 = 101;

/// One pending task reported by a query run.
pub const CODE_QUERY_RESULT: u16 = 103;

/// A query run found no pending tasks.
pub const CODE_QUERY_EMPTY: u16 = 104;

/// Cancel acknowledged; the deployer process was killed.
pub const CODE_CANCELLED: u16 = 105;

/// Generic error / refusal reported to the caller.
pub const CODE_ERROR: u16 = 200;

/// A run is already in flight.
pub const CODE_BUSY: u16 = 201;

/// Cancel requested while nothing was running.
pub const CODE_CANCEL_IDLE: u16 = 202;

/// The command token was not recognized.
pub const CODE_UNKNOWN_COMMAND: u16 = 203;

/// Connecting to the network share failed.
pub const CODE_SHARE_FAILURE: u16 = 204;

/// This host is blacklisted from running the deployer.
pub const CODE_BLACKLISTED: u16 = 205;

// ============================================================================
// Deployer Child Process
// ============================================================================

/// Exit code the script host uses to report a deployer error.
pub const CHILD_ERROR_EXIT_CODE: i32 = 1;

/// Exit code the deployer uses to request a reboot.
pub const REBOOT_REQUESTED_EXIT_CODE: i32 = 770560;

/// Arguments appended to the deployer command for a dry-run query.
pub const QUERY_ARGS: [&str; 2] = ["/query:Iudr", "/dryrun"];

/// Number of header lines discarded from query output.
pub const QUERY_HEADER_LINES: usize = 4;

/// Script host binary that runs `.js` deployer scripts.
pub const SCRIPT_HOST: &str = "cscript";

/// Extension marking the configured command as a script invocation.
pub const SCRIPT_EXTENSION: &str = ".js";

/// Options every script invocation must carry; added when absent.
pub const SCRIPT_OPTIONS: [&str; 5] =
    ["/noreboot", "/synchronize", "/sendStatus", "/nonotify", "/quiet"];

// ============================================================================
// Output Hand-off and Heartbeat
// ============================================================================

/// Capacity of the bounded queue between the stdout producer and the
/// consumer loop.
pub const OUTPUT_QUEUE_CAPACITY: usize = 256;

/// Bounded wait applied to each dequeue attempt in the consumer loop.
pub const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(50);

/// Minimum inactivity before a heartbeat frame is emitted.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Spinner frames cycled through by heartbeat emissions. Each frame is
/// seven characters wide so successive heartbeats keep their width.
pub const SPINNER_FRAMES: [&str; 5] =
    ["...    ", " ...   ", "  ...  ", "   ... ", "    ..."];

/// Padding appended to progress frames so they overwrite a trailing spinner.
pub const PROGRESS_PADDING: &str = "      ";

/// Pause after a share failure so the message stays visible on a console.
pub const SHARE_FAILURE_PAUSE: Duration = Duration::from_secs(2);

/// Pause after a blacklist denial; longer, for visibility during boot.
pub const BLACKLIST_PAUSE: Duration = Duration::from_secs(4);

// ============================================================================
// Share Connector
// ============================================================================

/// Timeout for the pre-connect TCP liveness probe.
pub const TCP_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// Control Daemon
// ============================================================================

/// Poll interval of the accept loop while waiting for connections or stop.
pub const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// Grace period per drain round while waiting for connection workers.
pub const WORKER_DRAIN_WAIT: Duration = Duration::from_secs(3);

/// Poll interval within a drain round.
pub const WORKER_DRAIN_POLL: Duration = Duration::from_millis(100);

/// Groups whose members are treated as administrators.
pub const ADMIN_GROUPS: [&str; 2] = ["wheel", "sudo"];

// ============================================================================
// File System Constants
// ============================================================================

/// Name of the control socket in the state directory.
pub const SOCKET_FILE_NAME: &str = "control.sock";

/// Name of the persisted running indicator in the state directory.
pub const RUNNING_STATE_FILE_NAME: &str = "running_state";

/// Name of the persisted reboot retry counter in the state directory.
pub const REBOOT_COUNT_FILE_NAME: &str = "reboot_count.json";

/// Directory under the state directory where the share is mounted.
pub const MOUNT_POINT_DIR_NAME: &str = "mnt";

/// Blacklist file expected beside the deployer script.
pub const BLACKLIST_FILE_NAME: &str = "blacklist.txt";

/// Sentinel blacklist entry that blocks every host.
pub const BLOCK_ALL_SENTINEL: &str = "!all!";

/// Default config file name searched in the config directories.
pub const CONFIG_FILE_NAME: &str = "wpkgd.yaml";
