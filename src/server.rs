//! The control daemon: accepts connections on the control socket, routes
//! one command per connection, and guarantees worker termination on stop.
use std::{
    fs, io,
    os::unix::net::{UnixListener, UnixStream},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Instant,
};

use tracing::{debug, error, info, warn};

use crate::{
    authz,
    config::Config,
    constants::{
        ACCEPT_POLL, CODE_BUSY, CODE_ERROR, CODE_PROGRESS, CODE_UNKNOWN_COMMAND,
        WORKER_DRAIN_POLL, WORKER_DRAIN_WAIT,
    },
    error::BrokerError,
    executor::Executor,
    ipc,
};

/// One parsed client command. Tokens are exact, case-sensitive ASCII.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    /// Run the deployer; honor reboot requests per policy.
    Execute,
    /// Run the deployer with reboot requests suppressed.
    ExecuteNoReboot,
    /// Boot-path execution; refused when disabled by config.
    ExecuteFromGPE,
    /// Dry-run query for pending tasks.
    Query,
    /// Kill the running deployer, if any.
    Cancel,
    /// Update the in-memory network credentials.
    SetNetworkUser {
        /// Username for the distribution share.
        username: String,
        /// Password for the distribution share.
        password: String,
    },
    /// Anything else; echoed back in the refusal.
    Unknown(String),
}

impl ControlRequest {
    /// Parses the raw request bytes (already NUL-trimmed and decoded).
    pub fn parse(raw: &str) -> Self {
        match raw {
            "Execute" => Self::Execute,
            "ExecuteNoReboot" => Self::ExecuteNoReboot,
            "ExecuteFromGPE" => Self::ExecuteFromGPE,
            "Query" => Self::Query,
            "Cancel" => Self::Cancel,
            _ => {
                if let Some(args) = raw.strip_prefix("SetNetworkUser ") {
                    let mut parts = args.splitn(2, ' ');
                    if let (Some(username), Some(password)) =
                        (parts.next(), parts.next())
                    {
                        return Self::SetNetworkUser {
                            username: username.to_string(),
                            password: password.to_string(),
                        };
                    }
                }
                Self::Unknown(raw.to_string())
            }
        }
    }
}

/// Control daemon serving the command socket.
pub struct ControlServer {
    config: Arc<Config>,
    executor: Arc<Executor>,
    stop: Arc<AtomicBool>,
}

impl ControlServer {
    /// Creates a server around one executor instance.
    pub fn new(config: Arc<Config>, executor: Arc<Executor>, stop: Arc<AtomicBool>) -> Self {
        Self {
            config,
            executor,
            stop,
        }
    }

    /// Binds the control socket in the runtime state directory and serves
    /// until the stop flag is raised.
    pub fn run(&self) -> Result<(), BrokerError> {
        let socket_path = ipc::socket_path()?;
        if socket_path.exists() {
            fs::remove_file(&socket_path).map_err(ipc::ControlError::Io)?;
        }
        let listener =
            UnixListener::bind(&socket_path).map_err(ipc::ControlError::Io)?;
        info!("wpkgd control daemon listening on {:?}", socket_path);

        let result = self.serve(listener);
        let _ = fs::remove_file(&socket_path);
        result
    }

    /// Serves connections from an already-bound listener until the stop
    /// flag is raised, then drains in-flight workers.
    pub fn serve(&self, listener: UnixListener) -> Result<(), BrokerError> {
        listener
            .set_nonblocking(true)
            .map_err(ipc::ControlError::Io)?;
        let mut workers: Vec<JoinHandle<()>> = Vec::new();
        let mut connections: u64 = 0;

        while !self.stop.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, _addr)) => {
                    connections += 1;
                    let config = Arc::clone(&self.config);
                    let executor = Arc::clone(&self.executor);
                    workers.push(thread::spawn(move || {
                        if let Err(err) = handle_connection(stream, &config, &executor) {
                            error!("Connection worker failed: {err}");
                        }
                    }));
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    workers.retain(|worker| !worker.is_finished());
                    thread::sleep(ACCEPT_POLL);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!("Control listener error: {err}");
                    break;
                }
            }
        }

        while !workers.is_empty() {
            info!("Waiting for {} connection worker(s) to finish", workers.len());
            let deadline = Instant::now() + WORKER_DRAIN_WAIT;
            while Instant::now() < deadline
                && !workers.iter().all(|worker| worker.is_finished())
            {
                thread::sleep(WORKER_DRAIN_POLL);
            }
            let (finished, pending): (Vec<_>, Vec<_>) = workers
                .into_iter()
                .partition(|worker| worker.is_finished());
            for worker in finished {
                let _ = worker.join();
            }
            workers = pending;
        }

        info!("Control daemon stopped after serving {connections} connection(s)");
        Ok(())
    }
}

/// Per-connection worker: reads one command, authorizes the peer where
/// required, dispatches, and closes the stream.
fn handle_connection(
    mut stream: UnixStream,
    config: &Config,
    executor: &Executor,
) -> Result<(), BrokerError> {
    let raw = match ipc::read_request(&mut stream) {
        Ok(raw) if !raw.is_empty() => raw,
        Ok(_) => {
            info!("Client disconnected before sending a command");
            return Ok(());
        }
        Err(err) => {
            info!("Client disconnected: {err}");
            return Ok(());
        }
    };

    let request = ControlRequest::parse(&raw);
    debug!("Received control request: {request:?}");

    // A run in flight turns away every Execute and Query up front; the
    // executor's gate catches the race where one starts just after this.
    if executor.is_running()
        && !matches!(
            request,
            ControlRequest::Cancel
                | ControlRequest::SetNetworkUser { .. }
                | ControlRequest::Unknown(_)
        )
    {
        info!("A run is in flight; refusing '{raw}'");
        ipc::write_frame(&mut stream, CODE_BUSY, "Info: Wpkg is already running a task.");
        return Ok(());
    }

    match request {
        ControlRequest::Execute => {
            run_deployer(&mut stream, config, executor, false, false)?;
        }
        ControlRequest::ExecuteNoReboot => {
            run_deployer(&mut stream, config, executor, true, false)?;
        }
        ControlRequest::ExecuteFromGPE => {
            if config.disabled_at_boot() {
                info!("Execution at startup is disabled, will not run");
                ipc::write_frame(
                    &mut stream,
                    CODE_ERROR,
                    "Execution at startup is disabled, will not run",
                );
            } else {
                run_deployer(&mut stream, config, executor, false, true)?;
            }
        }
        ControlRequest::Query => {
            info!("Received 'Query', querying the deployer for updates");
            if authz::authorize(&stream, config)? {
                executor.query(&mut stream)?;
            } else {
                refuse_unauthorized(&mut stream);
            }
        }
        ControlRequest::Cancel => {
            info!("Received 'Cancel', cancelling the deployer");
            if authz::authorize(&stream, config)? {
                executor.cancel(&mut stream)?;
            } else {
                refuse_unauthorized(&mut stream);
            }
        }
        ControlRequest::SetNetworkUser { username, password } => {
            info!("Received 'SetNetworkUser' for '{username}'");
            executor.set_network_user(username, password)?;
            ipc::write_frame(&mut stream, CODE_PROGRESS, "Network credentials updated");
        }
        ControlRequest::Unknown(echo) => {
            let message = format!("Unknown command: {echo}");
            info!("Sending '{message}' to client");
            ipc::write_frame(&mut stream, CODE_UNKNOWN_COMMAND, &message);
        }
    }
    Ok(())
}

fn run_deployer(
    stream: &mut UnixStream,
    config: &Config,
    executor: &Executor,
    rebootcancel: bool,
    from_boot: bool,
) -> Result<(), BrokerError> {
    info!(
        "Received an execution request (rebootcancel: {rebootcancel}, boot: {from_boot})"
    );
    if authz::authorize(stream, config)? {
        executor.execute(stream, rebootcancel)?;
    } else {
        refuse_unauthorized(stream);
    }
    Ok(())
}

fn refuse_unauthorized(stream: &mut UnixStream) {
    warn!("The caller is not authorized to execute the deployer");
    ipc::write_frame(
        stream,
        CODE_ERROR,
        "Info: You are not authorized to execute Wpkg-GP",
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_exact_command_tokens() {
        assert_eq!(ControlRequest::parse("Execute"), ControlRequest::Execute);
        assert_eq!(
            ControlRequest::parse("ExecuteNoReboot"),
            ControlRequest::ExecuteNoReboot
        );
        assert_eq!(
            ControlRequest::parse("ExecuteFromGPE"),
            ControlRequest::ExecuteFromGPE
        );
        assert_eq!(ControlRequest::parse("Query"), ControlRequest::Query);
        assert_eq!(ControlRequest::parse("Cancel"), ControlRequest::Cancel);
    }

    #[test]
    fn tokens_are_case_sensitive() {
        assert_eq!(
            ControlRequest::parse("execute"),
            ControlRequest::Unknown("execute".to_string())
        );
        assert_eq!(
            ControlRequest::parse("QUERY"),
            ControlRequest::Unknown("QUERY".to_string())
        );
    }

    #[test]
    fn trailing_arguments_make_a_command_unknown() {
        assert_eq!(
            ControlRequest::parse("Execute now"),
            ControlRequest::Unknown("Execute now".to_string())
        );
    }

    #[test]
    fn set_network_user_carries_credentials() {
        assert_eq!(
            ControlRequest::parse("SetNetworkUser alice s3cr3t"),
            ControlRequest::SetNetworkUser {
                username: "alice".to_string(),
                password: "s3cr3t".to_string(),
            }
        );
        // The password keeps any embedded spaces.
        assert_eq!(
            ControlRequest::parse("SetNetworkUser alice pass with spaces"),
            ControlRequest::SetNetworkUser {
                username: "alice".to_string(),
                password: "pass with spaces".to_string(),
            }
        );
    }

    #[test]
    fn set_network_user_without_password_is_unknown() {
        assert_eq!(
            ControlRequest::parse("SetNetworkUser alice"),
            ControlRequest::Unknown("SetNetworkUser alice".to_string())
        );
    }
}
