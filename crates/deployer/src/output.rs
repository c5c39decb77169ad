//! Append-only transcript of a rollout.
//!
//! This is what the operator watching a deploy sees. Structured operational
//! logging goes through `tracing` separately.

use std::io::Write;
use std::sync::{Arc, Mutex};

/// Line-oriented output stream for progress, status tables and diagnostics
pub trait OutputSink: Send + Sync {
    fn puts(&self, line: &str);
}

/// Writes transcript lines to stdout
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSink;

impl OutputSink for StdoutSink {
    fn puts(&self, line: &str) {
        let stdout = std::io::stdout();
        let mut handle = stdout.lock();
        // A closed stdout must not abort the rollout
        let _ = writeln!(handle, "{line}");
    }
}

/// Collects transcript lines in memory
#[derive(Debug, Default, Clone)]
pub struct BufferSink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl BufferSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .map(|lines| lines.clone())
            .unwrap_or_default()
    }

    /// Whole transcript joined with newlines
    pub fn transcript(&self) -> String {
        self.lines().join("\n")
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|line| line.contains(needle))
    }
}

impl OutputSink for BufferSink {
    fn puts(&self, line: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line.to_string());
        }
    }
}
