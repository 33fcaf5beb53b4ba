//! Line-oriented parsing of deployer stdout into displayable progress.
//!
//! The parser keeps the last formatted line and an `updated` edge that the
//! executor samples after each input line. Multiple raw lines may be
//! consolidated into one formatted line: continuation lines (indented in
//! the raw output) are appended to the previous one.
use regex::Regex;

/// Incremental deployer output parser.
#[derive(Debug)]
pub struct OutputParser {
    formatted: String,
    updated: bool,
    noise: Regex,
}

impl OutputParser {
    /// Creates an empty parser.
    pub fn new() -> Self {
        Self {
            formatted: String::new(),
            updated: false,
            // Clock/severity noise the script host prefixes to messages.
            noise: Regex::new(r"^(?:\d[\d:., /-]*)?(?:DEBUG|INFO|WARNING|ERROR)\s*:\s*")
                .unwrap(),
        }
    }

    /// Consumes one raw stdout line and updates the formatted state.
    pub fn parse_line(&mut self, raw: &str) {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            self.updated = false;
            return;
        }

        if raw.starts_with([' ', '\t']) && !self.formatted.is_empty() {
            self.formatted.push(' ');
            self.formatted.push_str(trimmed);
            self.updated = true;
            return;
        }

        let line = self.noise.replace(trimmed, "");
        if line.is_empty() {
            self.updated = false;
            return;
        }
        self.formatted = line.into_owned();
        self.updated = true;
    }

    /// Whether the last input line changed the formatted output.
    pub fn updated(&self) -> bool {
        self.updated
    }

    /// The current formatted progress line.
    pub fn formatted_line(&self) -> &str {
        &self.formatted
    }

    /// Clears all state between runs.
    pub fn reset(&mut self) {
        self.formatted.clear();
        self.updated = false;
    }
}

impl Default for OutputParser {
    fn default() -> Self {
        Self::new()
    }
}
