//! Reporting of failures that must not abort the rollout.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::error;

/// A failure that was caught and swallowed by the diagnostics or rollback layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportedError {
    pub message: String,
    pub context: BTreeMap<String, String>,
}

impl ReportedError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            context: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Error-tracking collaborator
pub trait ErrorReporter: Send + Sync {
    fn report(&self, error: ReportedError);
}

/// Emits reported errors as structured `tracing` events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, err: ReportedError) {
        error!(
            error = %err.message,
            context = ?err.context,
            "Swallowed rollout failure"
        );
    }
}

/// Keeps reported errors for later inspection
#[derive(Debug, Default, Clone)]
pub struct RecordingReporter {
    reported: Arc<Mutex<Vec<ReportedError>>>,
}

impl RecordingReporter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reported(&self) -> Vec<ReportedError> {
        self.reported
            .lock()
            .map(|errors| errors.clone())
            .unwrap_or_default()
    }
}

impl ErrorReporter for RecordingReporter {
    fn report(&self, err: ReportedError) {
        if let Ok(mut errors) = self.reported.lock() {
            errors.push(err);
        }
    }
}
