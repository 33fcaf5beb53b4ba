//! Command-line interface for wpkgd.
use clap::{Parser, Subcommand};
use std::str::FromStr;
use tracing::level_filters::LevelFilter;

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or the numeric verbosity levels
/// used by the config file (0-3).
#[derive(Clone, Copy, Debug)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

/// Maps the config verbosity levels onto tracing filters: 3 debug,
/// 2 info, 1 error, anything else off.
pub fn verbosity_filter(verbosity: u8) -> LevelFilter {
    match verbosity {
        3 => LevelFilter::DEBUG,
        2 => LevelFilter::INFO,
        1 => LevelFilter::ERROR,
        _ => LevelFilter::OFF,
    }
}

/// The `RUST_LOG`-style directive for a config verbosity level.
pub fn verbosity_directive(verbosity: u8) -> &'static str {
    match verbosity {
        3 => "debug",
        2 => "info",
        1 => "error",
        _ => "off",
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            if number > 3 {
                return Err(format!(
                    "unsupported verbosity number '{number}' (expected 0-3)"
                ));
            }
            return Ok(LogLevelArg(verbosity_filter(number)));
        }

        let lowercase = trimmed.to_ascii_lowercase();
        let level = match lowercase.as_str() {
            "off" => Some(LevelFilter::OFF),
            "error" | "err" => Some(LevelFilter::ERROR),
            "warn" | "warning" => Some(LevelFilter::WARN),
            "info" => Some(LevelFilter::INFO),
            "debug" => Some(LevelFilter::DEBUG),
            "trace" => Some(LevelFilter::TRACE),
            _ => None,
        }
        .ok_or_else(|| format!("invalid log level '{trimmed}'"))?;

        Ok(LogLevelArg(level))
    }
}

/// Command-line interface for wpkgd.
#[derive(Parser)]
#[command(name = "wpkgd", version, author)]
#[command(about = "Control daemon brokering WPKG deployment runs", long_about = None)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// Opt into privileged system mode. Requires running as root.
    #[arg(long = "sys", global = true)]
    pub sys: bool,

    /// Print raw status frames, three-digit code prefix included.
    #[arg(long, global = true)]
    pub debug: bool,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for wpkgd.
#[derive(Subcommand)]
pub enum Commands {
    /// Run the control daemon.
    Serve {
        /// Path to the configuration file (defaults to `wpkgd.yaml` in the
        /// config directory).
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Ask the daemon to run the deployer.
    Execute {
        /// Suppress any reboot the deployer requests.
        #[arg(long)]
        no_reboot: bool,

        /// Mark the request as coming from the boot-time policy hook.
        #[arg(long)]
        from_gpe: bool,
    },

    /// List pending deployer tasks without applying them.
    Query,

    /// Cancel a running deployer.
    Cancel,

    /// Update the network credentials the daemon mounts the share with.
    SetNetworkUser {
        /// Username for the distribution share.
        username: String,

        /// Password for the distribution share.
        password: String,
    },
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_like_the_original_service() {
        assert_eq!(verbosity_filter(3), LevelFilter::DEBUG);
        assert_eq!(verbosity_filter(2), LevelFilter::INFO);
        assert_eq!(verbosity_filter(1), LevelFilter::ERROR);
        assert_eq!(verbosity_filter(0), LevelFilter::OFF);
        assert_eq!(verbosity_filter(9), LevelFilter::OFF);
    }

    #[test]
    fn log_level_parses_names_and_numbers() {
        assert_eq!(LogLevelArg::from_str("debug").unwrap().as_str(), "debug");
        assert_eq!(LogLevelArg::from_str("3").unwrap().as_str(), "debug");
        assert_eq!(LogLevelArg::from_str("1").unwrap().as_str(), "error");
        assert!(LogLevelArg::from_str("7").is_err());
        assert!(LogLevelArg::from_str("noisy").is_err());
    }
}
