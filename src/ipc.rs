//! Control socket IPC: socket paths, the status-frame wire format, and the
//! client side used by the CLI.
//!
//! A client writes a single command, shuts down its write half, and reads
//! LF-terminated status frames until the server closes the socket. Each
//! frame is a three-digit code, one space, and a free-form payload.
use std::{
    fmt, fs,
    io::{self, BufRead, BufReader, Read, Write},
    net::Shutdown,
    os::unix::net::UnixStream,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::debug;

use crate::{constants, runtime};

/// Returns the unix socket path used to reach the control daemon.
pub fn socket_path() -> Result<PathBuf, ControlError> {
    let dir = runtime::state_dir();
    fs::create_dir_all(&dir)?;
    Ok(dir.join(constants::SOCKET_FILE_NAME))
}

/// One line of the status protocol: `DDD SP payload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Three-digit status code.
    pub code: u16,
    /// Free-form payload.
    pub payload: String,
}

impl Frame {
    /// Creates a frame from a code and payload.
    pub fn new(code: u16, payload: impl Into<String>) -> Self {
        Self {
            code,
            payload: payload.into(),
        }
    }

    /// Parses one wire line into a frame. Payload bytes are decoded as
    /// UTF-8 before this point; the code must be exactly three ASCII
    /// digits followed by a space.
    pub fn parse(line: &str) -> Result<Self, ControlError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.len() < 4 || !line.is_char_boundary(4) {
            return Err(ControlError::InvalidFrame(line.to_string()));
        }
        let (prefix, payload) = line.split_at(4);
        let code = prefix
            .strip_suffix(' ')
            .filter(|digits| digits.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|digits| digits.parse::<u16>().ok())
            .ok_or_else(|| ControlError::InvalidFrame(line.to_string()))?;
        Ok(Self::new(code, payload))
    }

    /// Whether this frame carries the given code.
    pub fn has_code(&self, code: u16) -> bool {
        self.code == code
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03} {}", self.code, self.payload)
    }
}

/// Errors raised by the control channel helpers.
#[derive(Debug, Error)]
pub enum ControlError {
    /// Control socket I/O error.
    #[error("control socket I/O failed: {0}")]
    Io(#[from] io::Error),
    /// A status line did not match the `DDD SP payload` grammar.
    #[error("malformed status frame: '{0}'")]
    InvalidFrame(String),
    /// Control socket not available or daemon not running.
    #[error("control socket not available")]
    NotAvailable,
}

/// Writes one frame and returns the I/O outcome.
pub fn try_write_frame(
    writer: &mut dyn Write,
    code: u16,
    payload: &str,
) -> io::Result<()> {
    writeln!(writer, "{}", Frame::new(code, payload))?;
    writer.flush()
}

/// Writes one frame, swallowing failures. A caller that disconnected
/// mid-run must not abort the run.
pub fn write_frame(writer: &mut dyn Write, code: u16, payload: &str) {
    if let Err(err) = try_write_frame(writer, code, payload) {
        debug!("Dropping status frame {code}: {err}");
    }
}

/// Writes one pre-rendered frame line, swallowing failures.
pub fn write_raw_frame(writer: &mut dyn Write, frame: &str) {
    if let Err(err) = writeln!(writer, "{frame}").and_then(|()| writer.flush()) {
        debug!("Dropping status frame: {err}");
    }
}

/// Reads a client request from the stream: accumulates bytes until the
/// peer closes its write half, then trims trailing NULs.
pub fn read_request(stream: &mut UnixStream) -> Result<String, ControlError> {
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw)?;
    while raw.last() == Some(&0) {
        raw.pop();
    }
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

/// Sends a command to the control daemon and collects the status frames
/// emitted until the server closes the connection.
pub fn send_request(path: &Path, request: &str) -> Result<Vec<Frame>, ControlError> {
    if !path.exists() {
        return Err(ControlError::NotAvailable);
    }

    let mut stream = UnixStream::connect(path)?;
    stream.write_all(request.as_bytes())?;
    stream.flush()?;
    stream.shutdown(Shutdown::Write)?;

    let mut frames = Vec::new();
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        frames.push(Frame::parse(&line)?);
    }
    Ok(frames)
}
