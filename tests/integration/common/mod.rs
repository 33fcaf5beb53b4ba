//! Shared helpers for the control-protocol integration tests.
#![allow(dead_code)]

use std::{
    fs,
    os::unix::net::UnixListener,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use wpkgd::{config::Config, executor::Executor, server::ControlServer};

/// A control daemon running on a scratch socket in its own thread.
pub struct TestServer {
    pub socket: PathBuf,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    /// Binds a listener under the config's state dir and serves on it.
    pub fn start(config: Config) -> Self {
        fs::create_dir_all(&config.state_dir).unwrap();
        let socket = config.state_dir.join("control.sock");
        let listener = UnixListener::bind(&socket).unwrap();

        let config = Arc::new(config);
        let executor = Arc::new(Executor::with_defaults(Arc::clone(&config)).unwrap());
        let stop = Arc::new(AtomicBool::new(false));
        let server = ControlServer::new(config, executor, Arc::clone(&stop));

        let handle = std::thread::spawn(move || {
            server.serve(listener).expect("server terminated with error");
        });

        Self {
            socket,
            stop,
            handle: Some(handle),
        }
    }

    /// Signals the stop flag and waits for the accept loop to drain.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.join().expect("server thread panicked");
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// A config that authorizes every caller and runs the given command.
pub fn base_config(command: &str, state_dir: &Path) -> Config {
    Config::from_yaml(&format!(
        "WpkgCommand: \"{command}\"\nWpkgExecuteByNonAdmins: 1\n"
    ))
    .unwrap()
    .with_state_dir(state_dir)
}

/// Writes a fake deployer script and returns the command invoking it.
pub fn write_script(dir: &Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    fs::write(&path, body).unwrap();
    format!("sh {}", path.display())
}

/// Polls `condition` until it holds or the timeout elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    condition()
}
