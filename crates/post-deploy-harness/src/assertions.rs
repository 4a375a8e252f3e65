// crates/post-deploy-harness/src/assertions.rs
// ============================================================================
// Module: Soft Assertions
// Description: Equality checks that collect every failure before reporting.
// Purpose: Report all mismatches of an assertion pass, not only the first.
// Dependencies: thiserror
// ============================================================================

//! ## Overview
//! [`SoftAssertions`] runs each comparison, records a [`CheckFailure`] for
//! every mismatch, and emits a `check_failed` event. [`SoftAssertions::finish`]
//! turns the collected failures into a single [`AssertionReport`].

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;
use std::fmt::Write as _;
use std::sync::Arc;

use thiserror::Error;

use crate::events::EventSink;
use crate::events::HarnessEvent;
use crate::events::Outcome;
use crate::events::Phase;

// ============================================================================
// SECTION: Types
// ============================================================================

/// One failed comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckFailure {
    /// Stable check identifier.
    pub check: String,
    /// Expected value.
    pub expected: String,
    /// Observed value.
    pub actual: String,
    /// Human-readable failure message.
    pub message: String,
}

impl fmt::Display for CheckFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: expected \"{}\", got \"{}\"",
            self.check, self.message, self.expected, self.actual
        )
    }
}

/// Every failure of an assertion pass.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{} of {} checks failed{}", .failures.len(), .checks, render_failures(.failures))]
pub struct AssertionReport {
    /// Number of checks evaluated.
    pub checks: usize,
    /// Failed checks, in evaluation order.
    pub failures: Vec<CheckFailure>,
}

/// Renders one indented line per failure.
fn render_failures(failures: &[CheckFailure]) -> String {
    let mut out = String::new();
    for failure in failures {
        let _ = write!(out, "\n  {failure}");
    }
    out
}

// ============================================================================
// SECTION: Collector
// ============================================================================

/// Collector of soft equality checks.
pub struct SoftAssertions {
    /// Event sink for failures.
    sink: Arc<dyn EventSink>,
    /// Number of checks evaluated.
    checks: usize,
    /// Failures collected so far.
    failures: Vec<CheckFailure>,
}

impl SoftAssertions {
    /// Creates an empty collector.
    #[must_use]
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            sink,
            checks: 0,
            failures: Vec::new(),
        }
    }

    /// Compares two values and records a failure when they differ. Returns
    /// whether the check passed.
    pub fn check_eq(&mut self, check: &str, expected: &str, actual: &str, message: &str) -> bool {
        self.checks += 1;
        if expected == actual {
            return true;
        }
        let failure = CheckFailure {
            check: check.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
            message: message.to_string(),
        };
        self.sink.record(
            &HarnessEvent::new("check_failed", Phase::Assert, check, Outcome::Failed)
                .with_detail(failure.to_string()),
        );
        self.failures.push(failure);
        false
    }

    /// Returns the failures collected so far.
    #[must_use]
    pub fn failures(&self) -> &[CheckFailure] {
        &self.failures
    }

    /// Returns the number of checks evaluated.
    #[must_use]
    pub const fn checks(&self) -> usize {
        self.checks
    }

    /// Consumes the collector.
    ///
    /// # Errors
    ///
    /// Returns [`AssertionReport`] when any check failed.
    pub fn finish(self) -> Result<(), AssertionReport> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(AssertionReport {
                checks: self.checks,
                failures: self.failures,
            })
        }
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
