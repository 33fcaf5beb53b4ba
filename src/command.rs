//! Parsing and normalization of the configured deployer command.
//!
//! The configured command is expanded, tokenized preserving quoted spans,
//! and, when it is a script invocation, padded with the option set the
//! control service depends on. The normalized command is the canonical
//! string used for both Query and Execute. The UNC share prefix and the
//! script directory (home of `blacklist.txt`) are derived here as well.
use regex::Regex;
use std::{env, path::PathBuf};
use tracing::debug;

use crate::{constants, error::BrokerError};

/// The normalized deployer command and everything derived from it.
#[derive(Debug, Clone)]
pub struct DeployerCommand {
    tokens: Vec<String>,
    normalized: String,
    share: Option<String>,
    blacklist_path: Option<PathBuf>,
}

impl DeployerCommand {
    /// Expands and normalizes the configured command string.
    pub fn parse(configured: &str) -> Result<Self, BrokerError> {
        let expanded = expand_env_vars(configured);
        let mut tokens = tokenize(&expanded);
        if tokens.is_empty() {
            return Err(BrokerError::EmptyDeployerCommand);
        }

        if is_script_invocation(&tokens) {
            if !unquote(&tokens[0]).eq_ignore_ascii_case(constants::SCRIPT_HOST) {
                debug!("Deployer command is a script but is missing the script host, adding");
                tokens.insert(0, constants::SCRIPT_HOST.to_string());
            }
            for option in constants::SCRIPT_OPTIONS {
                if !tokens.iter().any(|t| t == option) {
                    debug!("Deployer command is missing {option}, adding");
                    tokens.push(option.to_string());
                }
            }
        }

        let normalized = tokens.join(" ");
        let share = extract_share(&normalized);
        let blacklist_path = blacklist_path(&tokens);

        Ok(Self {
            tokens,
            normalized,
            share,
            blacklist_path,
        })
    }

    /// The canonical command string.
    pub fn normalized(&self) -> &str {
        &self.normalized
    }

    /// The argument vector used to spawn the deployer, quotes stripped.
    pub fn argv(&self) -> Vec<String> {
        self.tokens.iter().map(|t| unquote(t).to_string()).collect()
    }

    /// The `\\host\share` prefix the deployer lives on, if any.
    pub fn share(&self) -> Option<&str> {
        self.share.as_deref()
    }

    /// Location of `blacklist.txt` beside the deployer script, if the
    /// command names a script.
    pub fn blacklist_path(&self) -> Option<&PathBuf> {
        self.blacklist_path.as_ref()
    }
}

/// Expands `$VAR` and `${VAR}` references from the service environment.
/// Unknown variables are left untouched.
fn expand_env_vars(input: &str) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
        .unwrap();
    re.replace_all(input, |caps: &regex::Captures| {
        let name = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str())
            .unwrap_or_default();
        env::var(name).unwrap_or_else(|_| caps[0].to_string())
    })
    .into_owned()
}

/// Splits a command line on whitespace while preserving quoted spans,
/// quotes included.
fn tokenize(input: &str) -> Vec<String> {
    let re = Regex::new(r#"(?:[^\s"]|"(?:\\.|[^"])*")+"#).unwrap();
    re.find_iter(input).map(|m| m.as_str().to_string()).collect()
}

fn unquote(token: &str) -> &str {
    token
        .strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .unwrap_or(token)
}

fn is_script_invocation(tokens: &[String]) -> bool {
    let head = unquote(&tokens[0]).to_ascii_lowercase();
    head == constants::SCRIPT_HOST || head.ends_with(constants::SCRIPT_EXTENSION)
}

/// Matches the leading `\\host\share` prefix of the command, if present.
fn extract_share(command: &str) -> Option<String> {
    let re = Regex::new(r"(\\\\[^\\]+\\[^\\]+)\\.*").unwrap();
    match re.captures(command) {
        Some(caps) => {
            let share = caps[1].to_string();
            debug!("Extracted share '{share}' from deployer command");
            Some(share)
        }
        None => {
            debug!("The deployer command does not contain a share name");
            None
        }
    }
}

/// Splits the script token at its filename and appends the blacklist file
/// name. Both separator styles are honored, since the script may live on a
/// UNC path or on an already-mounted local one.
fn blacklist_path(tokens: &[String]) -> Option<PathBuf> {
    let script = tokens
        .iter()
        .map(|t| unquote(t))
        .find(|t| t.to_ascii_lowercase().ends_with(constants::SCRIPT_EXTENSION))?;
    let split = script.rfind(['\\', '/']).map(|idx| idx + 1).unwrap_or(0);
    let mut path = script[..split].to_string();
    path.push_str(constants::BLACKLIST_FILE_NAME);
    Some(PathBuf::from(path))
}
