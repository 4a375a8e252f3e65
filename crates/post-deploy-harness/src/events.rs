// crates/post-deploy-harness/src/events.rs
// ============================================================================
// Module: Harness Event Logging
// Description: Structured events for suite phases, commands, and checks.
// Purpose: Emit JSON-line run logs without hard dependencies.
// Dependencies: serde, serde_json
// ============================================================================

//! ## Overview
//! This module defines the event payload and sinks used to log a functional
//! test run. Events are serialized as one JSON object per line so CI logs can
//! be filtered by phase or outcome. Secrets never enter event payloads.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs::OpenOptions;
use std::io;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use serde::Serialize;

// ============================================================================
// SECTION: Types
// ============================================================================

/// Suite lifecycle phase an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Materialization, apply, and idempotency check.
    Setup,
    /// Output reads, live lookups, and comparisons.
    Assert,
    /// Destroy of provisioned infrastructure.
    Teardown,
}

/// Outcome label attached to an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Action started.
    Started,
    /// Action completed successfully.
    Ok,
    /// Action failed and will be retried.
    Retrying,
    /// Action failed.
    Failed,
    /// Action was skipped.
    Skipped,
}

/// Harness event payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HarnessEvent {
    /// Event identifier.
    pub event: &'static str,
    /// Event timestamp (milliseconds since epoch).
    pub timestamp_ms: u128,
    /// Lifecycle phase.
    pub phase: Phase,
    /// Action label (command name, check name, or test name).
    pub action: String,
    /// Action outcome.
    pub outcome: Outcome,
    /// Attempt number for retried actions.
    pub attempt: Option<u32>,
    /// Free-form detail, such as an error message.
    pub detail: Option<String>,
}

impl HarnessEvent {
    /// Creates a new event with a consistent timestamp.
    #[must_use]
    pub fn new(
        event: &'static str,
        phase: Phase,
        action: impl Into<String>,
        outcome: Outcome,
    ) -> Self {
        let timestamp_ms =
            SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis();
        Self {
            event,
            timestamp_ms,
            phase,
            action: action.into(),
            outcome,
            attempt: None,
            detail: None,
        }
    }

    /// Attaches an attempt number.
    #[must_use]
    pub const fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    /// Attaches a detail message.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

// ============================================================================
// SECTION: Trait
// ============================================================================

/// Sink for harness events.
pub trait EventSink: Send + Sync {
    /// Record an event.
    fn record(&self, event: &HarnessEvent);
}

// ============================================================================
// SECTION: Sinks
// ============================================================================

/// Sink that logs JSON lines to stderr.
pub struct StderrEventSink;

impl EventSink for StderrEventSink {
    fn record(&self, event: &HarnessEvent) {
        if let Ok(payload) = serde_json::to_string(event) {
            let _ = writeln!(std::io::stderr(), "{payload}");
        }
    }
}

/// Sink that logs JSON lines to a file.
pub struct FileEventSink {
    /// File handle used for append-only logging.
    file: Mutex<std::fs::File>,
}

impl FileEventSink {
    /// Opens the event log file in append mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn new(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl EventSink for FileEventSink {
    fn record(&self, event: &HarnessEvent) {
        let Ok(payload) = serde_json::to_string(event) else {
            return;
        };
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "{payload}");
        }
    }
}

/// Sink that fans out every event to several sinks.
pub struct TeeEventSink {
    /// Downstream sinks, in recording order.
    sinks: Vec<Box<dyn EventSink>>,
}

impl TeeEventSink {
    /// Creates a tee over the given sinks.
    #[must_use]
    pub fn new(sinks: Vec<Box<dyn EventSink>>) -> Self {
        Self {
            sinks,
        }
    }
}

impl EventSink for TeeEventSink {
    fn record(&self, event: &HarnessEvent) {
        for sink in &self.sinks {
            sink.record(event);
        }
    }
}

/// Sink that discards events.
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn record(&self, _event: &HarnessEvent) {}
}

/// Sink that keeps events in memory for later inspection.
#[derive(Default)]
pub struct MemoryEventSink {
    /// Recorded events.
    events: Mutex<Vec<HarnessEvent>>,
}

impl MemoryEventSink {
    /// Returns a snapshot of recorded events.
    #[must_use]
    pub fn events(&self) -> Vec<HarnessEvent> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }
}

impl EventSink for MemoryEventSink {
    fn record(&self, event: &HarnessEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// Builds the default sink: stderr, plus a file when a path is configured.
///
/// # Errors
///
/// Returns an error when the event log file cannot be opened.
pub fn default_sink(event_log: Option<&Path>) -> io::Result<Box<dyn EventSink>> {
    match event_log {
        Some(path) => Ok(Box::new(TeeEventSink::new(vec![
            Box::new(StderrEventSink),
            Box::new(FileEventSink::new(path)?),
        ]))),
        None => Ok(Box::new(StderrEventSink)),
    }
}
