//! The single-tenant deployer executor.
//!
//! Owns the run state (at most one Query or Execute in flight), assembles
//! the child invocation, streams stdout through a bounded hand-off queue
//! into status frames, and interprets the exit code, including the reboot
//! request sentinel.
use std::{
    io::{BufRead, BufReader, Write},
    process::{Child, ChildStdout, Command, Stdio},
    str::FromStr,
    sync::{
        Arc, Mutex, TryLockError,
        atomic::{AtomicUsize, Ordering},
        mpsc::{self, RecvTimeoutError, SyncSender},
    },
    thread,
    time::Instant,
};

use regex::Regex;
use strum_macros::{Display, EnumString};
use tracing::{debug, error, info, warn};

use crate::{
    blacklist,
    command::DeployerCommand,
    config::Config,
    constants::{
        BLACKLIST_PAUSE, CHILD_ERROR_EXIT_CODE, CODE_BLACKLISTED, CODE_BUSY,
        CODE_CANCEL_IDLE, CODE_CANCELLED, CODE_ERROR, CODE_HEARTBEAT, CODE_PROGRESS,
        CODE_QUERY_EMPTY, CODE_QUERY_RESULT, CODE_SHARE_FAILURE, DEQUEUE_TIMEOUT,
        HEARTBEAT_INTERVAL, MOUNT_POINT_DIR_NAME, OUTPUT_QUEUE_CAPACITY,
        PROGRESS_PADDING, QUERY_ARGS, QUERY_HEADER_LINES, REBOOT_REQUESTED_EXIT_CODE,
        SHARE_FAILURE_PAUSE, SPINNER_FRAMES,
    },
    error::BrokerError,
    ipc,
    parser::OutputParser,
    reboot::{RebootBackend, RebootHandler, SystemReboot},
    share::{CifsMount, MountBackend, ShareConnector},
};

/// Normalized actions for pending deployer tasks. `FromStr` accepts the
/// raw `Action:` values from query output; `Display` renders the short
/// form used in `103` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum QueryAction {
    /// A package will be installed.
    #[strum(serialize = "Installation pending", to_string = "install")]
    Install,
    /// A package will be upgraded.
    #[strum(serialize = "Upgrade pending", to_string = "update")]
    Update,
    /// A package will be downgraded.
    #[strum(serialize = "Downgrade pending", to_string = "downgrade")]
    Downgrade,
    /// A package will be removed.
    #[strum(serialize = "Remove pending", to_string = "remove")]
    Remove,
}

/// Prefixes of query output lines that carry no task information.
const QUERY_EXCLUDES: [&str; 6] =
    ["ID:", "Reboot:", "Execute:", "Priority:", "Status:", "Revision (old):"];

#[derive(Debug)]
enum QueryField {
    Text(String),
    Action(QueryAction),
    UnknownAction(String),
}

#[derive(Default)]
struct RunState {
    running: bool,
    child: Option<Child>,
}

/// Executes the deployer on behalf of authorized callers.
pub struct Executor {
    config: Arc<Config>,
    command: DeployerCommand,
    share: Mutex<ShareConnector>,
    parser: Mutex<OutputParser>,
    reboot: RebootHandler,
    run_gate: Mutex<()>,
    run: Mutex<RunState>,
    activity: AtomicUsize,
}

impl Executor {
    /// Creates an executor with explicit mount and reboot backends.
    pub fn new(
        config: Arc<Config>,
        mount: Box<dyn MountBackend>,
        reboot_backend: Box<dyn RebootBackend>,
    ) -> Result<Self, BrokerError> {
        let command = DeployerCommand::parse(&config.wpkg_command)?;
        let share = ShareConnector::new(
            Arc::clone(&config),
            command.share().map(String::from),
            mount,
        );
        let reboot = RebootHandler::new(&config, reboot_backend);
        Ok(Self {
            config,
            command,
            share: Mutex::new(share),
            parser: Mutex::new(OutputParser::new()),
            reboot,
            run_gate: Mutex::new(()),
            run: Mutex::new(RunState::default()),
            activity: AtomicUsize::new(0),
        })
    }

    /// Creates an executor with the production backends.
    pub fn with_defaults(config: Arc<Config>) -> Result<Self, BrokerError> {
        let mount_point = config.state_dir.join(MOUNT_POINT_DIR_NAME);
        Self::new(
            config,
            Box::new(CifsMount::new(mount_point)),
            Box::new(SystemReboot),
        )
    }

    /// The canonical deployer command this executor runs.
    pub fn command(&self) -> &DeployerCommand {
        &self.command
    }

    /// Whether a run is currently in flight.
    pub fn is_running(&self) -> bool {
        self.run.lock().map(|run| run.running).unwrap_or(false)
    }

    /// The last formatted progress line of the current run.
    pub fn status_line(&self) -> String {
        self.parser
            .lock()
            .map(|parser| parser.formatted_line().to_string())
            .unwrap_or_default()
    }

    /// Updates the in-memory network credentials used for share mounts.
    pub fn set_network_user(
        &self,
        username: String,
        password: String,
    ) -> Result<(), BrokerError> {
        self.share.lock()?.set_network_user(username, password);
        Ok(())
    }

    /// Runs the deployer, streaming status frames to `sink`. With
    /// `rebootcancel` set, a reboot request from the child is suppressed
    /// and the console pauses are skipped.
    pub fn execute(
        &self,
        sink: &mut dyn Write,
        rebootcancel: bool,
    ) -> Result<(), BrokerError> {
        let _gate = match self.try_enter() {
            Some(gate) => gate,
            None => {
                self.reply_busy(sink);
                return Ok(());
            }
        };

        let initial = "Initializing Wpkg-GP software installation";
        ipc::write_frame(sink, CODE_PROGRESS, initial);
        info!("Executing the deployer: {}", self.command.normalized());

        if !self.connect_share(sink, !rebootcancel)? {
            return Ok(());
        }
        if !self.check_blacklist(sink, !rebootcancel) {
            return Ok(());
        }

        self.begin_run()?;
        let outcome = self.stream_child(sink, initial);
        if let Ok(mut parser) = self.parser.lock() {
            parser.reset();
        }
        self.release_share();
        self.finish_run();
        info!("Finished executing the deployer");

        let (exit_code, last_line) = outcome?;
        self.interpret_exit(sink, exit_code, last_line, rebootcancel);
        Ok(())
    }

    /// Runs the deployer in dry-run query mode and reports pending tasks.
    pub fn query(&self, sink: &mut dyn Write) -> Result<(), BrokerError> {
        let _gate = match self.try_enter() {
            Some(gate) => gate,
            None => {
                self.reply_busy(sink);
                return Ok(());
            }
        };

        ipc::write_frame(sink, CODE_PROGRESS, "Initializing Wpkg-GP software query");
        info!("Querying the deployer: {}", self.command.normalized());

        if !self.connect_share(sink, false)? {
            return Ok(());
        }
        if !self.check_blacklist(sink, false) {
            return Ok(());
        }

        self.begin_run()?;
        let output = self.run_query_child();
        self.release_share();
        self.finish_run();
        info!("Finished the deployer query");

        let output = output?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let lines: Vec<String> = stdout.split('\n').map(String::from).collect();

        if output.status.code() == Some(CHILD_ERROR_EXIT_CODE) {
            let last = last_nonempty(&lines).unwrap_or_default();
            error!("The deployer query returned an error: {last}");
            ipc::write_frame(sink, CODE_ERROR, &format!("Wpkg returned an error: {last}"));
            return Ok(());
        }

        let tasks = group_query_tasks(&clean_query_lines(&lines));
        if tasks.is_empty() {
            ipc::write_frame(sink, CODE_QUERY_EMPTY, "No pending wpkg tasks");
        } else {
            for (name, version, action) in tasks {
                ipc::write_frame(
                    sink,
                    CODE_QUERY_RESULT,
                    &format!("TASK: {action}\tNAME: {name}\tREVISION: {version}"),
                );
            }
        }
        Ok(())
    }

    /// Kills the running child, if any. Frame write failures are
    /// swallowed; the caller may already be gone.
    pub fn cancel(&self, sink: &mut dyn Write) -> Result<(), BrokerError> {
        {
            let mut run = self.run.lock()?;
            if run.running && run.child.is_some() {
                if let Some(child) = run.child.as_mut()
                    && let Err(err) = child.kill()
                {
                    warn!("Failed to kill the deployer: {err}");
                }
                info!("Cancel called, the deployer process was killed");
                ipc::write_frame(sink, CODE_CANCELLED, "Cancel called, WPKG process was killed");
            } else {
                info!("Cancel called, but the deployer was not running");
                ipc::write_frame(
                    sink,
                    CODE_CANCEL_IDLE,
                    "Cancel called, WPKG process was not running",
                );
            }
        }
        if let Err(err) = self.config.set_running_state(false) {
            warn!("Failed to persist running state: {err}");
        }
        Ok(())
    }

    /// Enters the single-flight critical section, or reports busy.
    fn try_enter(&self) -> Option<std::sync::MutexGuard<'_, ()>> {
        match self.run_gate.try_lock() {
            Ok(gate) => Some(gate),
            Err(TryLockError::WouldBlock) => None,
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
        }
    }

    fn reply_busy(&self, sink: &mut dyn Write) {
        info!("A run was requested, but the deployer is already running");
        ipc::write_frame(sink, CODE_BUSY, "Info: Wpkg is already running a task.");
    }

    /// Mounts the share; on failure emits `204` and optionally pauses so
    /// the message stays visible on a boot console.
    fn connect_share(
        &self,
        sink: &mut dyn Write,
        pause_on_failure: bool,
    ) -> Result<bool, BrokerError> {
        let connected = self.share.lock()?.connect()?;
        if !connected {
            error!("Connecting to the network share failed");
            ipc::write_frame(
                sink,
                CODE_SHARE_FAILURE,
                "Error: Connecting to network share failed.",
            );
            if pause_on_failure {
                thread::sleep(SHARE_FAILURE_PAUSE);
            }
        }
        Ok(connected)
    }

    /// Applies the blacklist gate; on denial emits `205` and optionally
    /// pauses long enough to be read during boot.
    fn check_blacklist(&self, sink: &mut dyn Write, pause_on_failure: bool) -> bool {
        if blacklist::host_allowed(&self.command) {
            return true;
        }
        info!("This host is blocked from executing the deployer");
        ipc::write_frame(
            sink,
            CODE_BLACKLISTED,
            "Info: Client was blocked from server to execute wpkg.",
        );
        if pause_on_failure {
            thread::sleep(BLACKLIST_PAUSE);
        }
        false
    }

    fn begin_run(&self) -> Result<(), BrokerError> {
        self.config.set_running_state(true)?;
        self.run.lock()?.running = true;
        Ok(())
    }

    fn finish_run(&self) {
        if let Ok(mut run) = self.run.lock() {
            run.running = false;
            run.child = None;
        }
        if let Err(err) = self.config.set_running_state(false) {
            warn!("Failed to persist running state: {err}");
        }
    }

    fn release_share(&self) {
        match self.share.lock() {
            Ok(mut share) => {
                if let Err(err) = share.disconnect() {
                    error!("Failed to release the share: {err}");
                }
            }
            Err(err) => error!("Share connector lock poisoned: {err}"),
        }
    }

    fn deployer_command(&self, extra_args: &[&str]) -> Command {
        let argv = self.command.argv();
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd.args(extra_args);
        if let Some(extra) = &self.config.environment_variables {
            cmd.envs(extra);
        }
        cmd
    }

    /// Spawns the deployer and pumps stdout lines through the bounded
    /// queue, emitting progress and heartbeat frames, until the child has
    /// exited and one final line has been drained.
    fn stream_child(
        &self,
        sink: &mut dyn Write,
        initial: &str,
    ) -> Result<(Option<i32>, Option<String>), BrokerError> {
        let mut cmd = self.deployer_command(&[]);
        cmd.stdout(Stdio::piped());
        let mut child = cmd
            .spawn()
            .map_err(|source| BrokerError::DeployerStartError { source })?;
        let stdout =
            child
                .stdout
                .take()
                .ok_or_else(|| BrokerError::DeployerStartError {
                    source: std::io::Error::other("child stdout was not captured"),
                })?;
        self.run.lock()?.child = Some(child);

        let (tx, rx) = mpsc::sync_channel::<String>(OUTPUT_QUEUE_CAPACITY);
        let producer = thread::spawn(move || enqueue_output(stdout, tx));

        let show_activity = self.config.activity_indicator();
        let mut last_frame = initial.to_string();
        let mut last_emit = Instant::now();
        let mut lines: Vec<String> = Vec::new();
        let mut exit = None;
        let mut quit = false;

        loop {
            match rx.recv_timeout(DEQUEUE_TIMEOUT) {
                Ok(line) => {
                    if !quit {
                        let formatted = {
                            let mut parser = self.parser.lock()?;
                            parser.parse_line(&line);
                            parser
                                .updated()
                                .then(|| parser.formatted_line().to_string())
                        };
                        if let Some(formatted) = formatted {
                            last_frame = formatted;
                            ipc::write_frame(
                                sink,
                                CODE_PROGRESS,
                                &format!("{last_frame}{PROGRESS_PADDING}"),
                            );
                            last_emit = Instant::now();
                        }
                    }
                    lines.push(line);
                    if quit {
                        break; // the post-exit drain accepted its final line
                    }
                }
                Err(err) => {
                    if quit {
                        break;
                    }
                    if show_activity && last_emit.elapsed() >= HEARTBEAT_INTERVAL {
                        ipc::write_frame(
                            sink,
                            CODE_HEARTBEAT,
                            &format!("{last_frame}{}", self.spinner_frame()),
                        );
                        last_emit = Instant::now();
                    }
                    if matches!(err, RecvTimeoutError::Disconnected) {
                        thread::sleep(DEQUEUE_TIMEOUT);
                    }
                }
            }

            if exit.is_none() {
                let mut run = self.run.lock()?;
                match run.child.as_mut().map(Child::try_wait) {
                    Some(Ok(Some(status))) => {
                        debug!("The deployer exited with {status}");
                        exit = Some(status);
                        quit = true;
                    }
                    Some(Ok(None)) => {}
                    Some(Err(err)) => {
                        error!("Failed to poll the deployer: {err}");
                        quit = true;
                    }
                    None => quit = true,
                }
            }
        }

        drop(rx);
        let _ = producer.join();
        self.run.lock()?.child = None;

        Ok((exit.and_then(|status| status.code()), last_nonempty(&lines)))
    }

    /// Runs the query invocation to completion, output captured in one
    /// shot.
    fn run_query_child(&self) -> Result<std::process::Output, BrokerError> {
        let mut cmd = self.deployer_command(&QUERY_ARGS);
        cmd.stdout(Stdio::piped());
        let child = cmd
            .spawn()
            .map_err(|source| BrokerError::DeployerStartError { source })?;
        child
            .wait_with_output()
            .map_err(|source| BrokerError::DeployerStartError { source })
    }

    /// Interprets the child exit code after the run state has been reset.
    fn interpret_exit(
        &self,
        sink: &mut dyn Write,
        exit_code: Option<i32>,
        last_line: Option<String>,
        rebootcancel: bool,
    ) {
        match exit_code {
            Some(CHILD_ERROR_EXIT_CODE) => {
                let last = last_line.unwrap_or_default();
                let last = last.trim_end();
                error!("The deployer returned an error: {last}");
                ipc::write_frame(
                    sink,
                    CODE_ERROR,
                    &format!("Wpkg returned an error: {last}"),
                );
            }
            Some(REBOOT_REQUESTED_EXIT_CODE) => {
                info!("The deployer requested a reboot");
                let frame = self.reboot.reboot(rebootcancel);
                ipc::write_raw_frame(sink, &frame);
            }
            _ => {
                if let Err(err) = self.reboot.reset_reboot_number() {
                    warn!("Failed to reset the reboot counter: {err}");
                }
            }
        }
    }

    fn spinner_frame(&self) -> &'static str {
        let index = self.activity.fetch_add(1, Ordering::Relaxed) % SPINNER_FRAMES.len();
        SPINNER_FRAMES[index]
    }
}

/// Producer half of the stdout hand-off: reads raw lines until EOF,
/// decodes them as UTF-8 (lossily, like the query path), and enqueues
/// them for the consumer loop.
fn enqueue_output(stdout: ChildStdout, queue: SyncSender<String>) {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                    if buf.last() == Some(&b'\r') {
                        buf.pop();
                    }
                }
                let line = String::from_utf8_lossy(&buf).into_owned();
                if queue.send(line).is_err() {
                    break;
                }
            }
            Err(err) => {
                warn!("Reading deployer stdout failed: {err}");
                break;
            }
        }
    }
}

fn last_nonempty(lines: &[String]) -> Option<String> {
    lines
        .iter()
        .rev()
        .find(|line| !line.trim().is_empty())
        .cloned()
}

/// Filters and maps raw query output lines into task fields. The first
/// four lines are header noise.
fn clean_query_lines(lines: &[String]) -> Vec<QueryField> {
    let squeeze = Regex::new(r"\s{2,}").unwrap();
    let mut fields = Vec::new();
    for line in lines.iter().skip(QUERY_HEADER_LINES) {
        let line = squeeze.replace_all(line.trim_start(), "");
        if line.is_empty() {
            continue;
        }
        if QUERY_EXCLUDES.iter().any(|prefix| line.starts_with(prefix)) {
            continue;
        }
        if let Some(value) = line.strip_prefix("Revision (new):") {
            fields.push(QueryField::Text(value.trim().to_string()));
        } else if let Some(value) = line.strip_prefix("Revision:") {
            fields.push(QueryField::Text(value.trim().to_string()));
        } else if let Some(value) = line.strip_prefix("Action:") {
            let value = value.trim();
            match QueryAction::from_str(value) {
                Ok(action) => fields.push(QueryField::Action(action)),
                Err(_) => fields.push(QueryField::UnknownAction(value.to_string())),
            }
        } else {
            fields.push(QueryField::Text(line.into_owned()));
        }
    }
    fields
}

/// Groups cleaned fields into consecutive `(name, version, action)`
/// triples. Triples with unknown actions are dropped, not guessed.
fn group_query_tasks(fields: &[QueryField]) -> Vec<(String, String, QueryAction)> {
    let mut tasks = Vec::new();
    for chunk in fields.chunks(3) {
        match chunk {
            [
                QueryField::Text(name),
                QueryField::Text(version),
                QueryField::Action(action),
            ] => tasks.push((name.clone(), version.clone(), *action)),
            [_, _, QueryField::UnknownAction(value)] => {
                warn!("Dropping query entry with unknown action '{value}'");
            }
            _ => debug!("Dropping incomplete query entry: {chunk:?}"),
        }
    }
    tasks
}
