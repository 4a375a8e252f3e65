// crates/post-deploy-harness/src/suite.rs
// ============================================================================
// Module: Functional Suite Lifecycle
// Description: Setup, per-test execution, and guaranteed teardown.
// Purpose: Own the provisioned fixture for exactly one suite run.
// Dependencies: thiserror
// ============================================================================

//! ## Overview
//! A [`SuiteFixture`] materializes the module, applies it, and verifies the
//! apply is idempotent. Tests then run against the fixture one at a time;
//! a failing or panicking test is recorded and later tests still run.
//! Teardown runs exactly once: from [`SuiteFixture::finish`], or from `Drop`
//! when the fixture is abandoned during unwinding.
//!
//! Setup that fails after apply was attempted destroys before returning, so
//! partially created infrastructure is not left behind.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::panic::catch_unwind;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::config::HarnessConfig;
use crate::events::EventSink;
use crate::events::HarnessEvent;
use crate::events::Outcome;
use crate::events::Phase;
use crate::fixture::CopyFilter;
use crate::fixture::FixtureError;
use crate::fixture::WorkingCopy;
use crate::fixture::copy_file;
use crate::fixture::copy_terraform_folder_to_temp;
use crate::terraform::TerraformDriver;
use crate::terraform::TerraformError;
use crate::terraform::TerraformOptions;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Version-pin file copied next to the module sources.
pub const TOOL_VERSIONS_FILE: &str = ".tool-versions";

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Suite lifecycle errors.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
/// - Teardown failures never replace test results; both are reported.
#[derive(Debug, Error)]
pub enum SuiteError {
    /// Configuration could not be loaded.
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    /// The working copy could not be prepared.
    #[error("materialize module: {0}")]
    Fixture(#[from] FixtureError),
    /// Terraform failed before any infrastructure could exist.
    #[error("setup failed: {0}")]
    Terraform(#[from] TerraformError),
    /// Apply or the idempotency check failed; destroy was attempted.
    #[error("setup failed after apply: {source}; teardown {teardown_summary}")]
    Setup {
        /// Apply or idempotency error.
        #[source]
        source: TerraformError,
        /// Destroy error, when destroy also failed.
        teardown: Option<TerraformError>,
        /// Rendered teardown outcome.
        teardown_summary: String,
    },
    /// One or more suite tests failed.
    #[error("{} suite test(s) failed: {}", .failed.len(), .summary)]
    TestsFailed {
        /// Names of the failed tests.
        failed: Vec<String>,
        /// Rendered failure messages, including any teardown failure.
        summary: String,
        /// Destroy error, when teardown also failed.
        #[source]
        teardown: Option<TerraformError>,
    },
    /// All tests passed but destroy failed.
    #[error("teardown failed: {0}")]
    Teardown(#[source] TerraformError),
}

/// Renders a teardown result for error messages.
fn teardown_summary(teardown: Option<&TerraformError>) -> String {
    teardown.map_or_else(|| "succeeded".to_string(), |err| format!("failed: {err}"))
}

// ============================================================================
// SECTION: Plan
// ============================================================================

/// Inputs for suite setup.
#[derive(Debug, Clone)]
pub struct SuitePlan {
    /// Module root copied into the temp directory.
    pub module_root: PathBuf,
    /// Module directory relative to the root (`.` for the root).
    pub module_subdir: PathBuf,
    /// Files relative to the root copied into the module working directory.
    pub aux_files: Vec<PathBuf>,
    /// Variable files; relative paths resolve against the current directory.
    pub var_files: Vec<PathBuf>,
    /// Copy filter for the module tree.
    pub copy_filter: CopyFilter,
    /// Terraform executable.
    pub terraform_binary: Option<PathBuf>,
    /// Retry budget override; the default table's budget otherwise.
    pub max_retries: Option<u32>,
    /// Pause between retries override.
    pub time_between_retries: Option<Duration>,
    /// Extra environment for Terraform.
    pub env_vars: BTreeMap<String, String>,
}

impl SuitePlan {
    /// Creates a plan for the module at `module_root`, copying the
    /// `.tool-versions` pin file.
    #[must_use]
    pub fn new(module_root: impl Into<PathBuf>) -> Self {
        Self {
            module_root: module_root.into(),
            module_subdir: PathBuf::from("."),
            aux_files: vec![PathBuf::from(TOOL_VERSIONS_FILE)],
            var_files: Vec::new(),
            copy_filter: CopyFilter::default(),
            terraform_binary: None,
            max_retries: None,
            time_between_retries: None,
            env_vars: BTreeMap::new(),
        }
    }

    /// Builds a plan from configuration, falling back to the given module
    /// root and variable file when they are not overridden.
    #[must_use]
    pub fn from_config(
        config: &HarnessConfig,
        default_module_root: &Path,
        default_var_file: &Path,
    ) -> Self {
        let module_root =
            config.module_dir.clone().unwrap_or_else(|| default_module_root.to_path_buf());
        let var_file = config.var_file.clone().unwrap_or_else(|| default_var_file.to_path_buf());
        let mut plan = Self::new(module_root).with_var_file(var_file);
        plan.terraform_binary.clone_from(&config.terraform_binary);
        plan.max_retries = config.max_retries;
        plan
    }

    /// Adds a variable file.
    #[must_use]
    pub fn with_var_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.var_files.push(path.into());
        self
    }

    /// Builds Terraform options for the materialized module directory.
    fn terraform_options(&self, module_dir: &Path) -> Result<TerraformOptions, FixtureError> {
        let mut options = TerraformOptions::new(module_dir).with_default_retryable_errors();
        for var_file in &self.var_files {
            let absolute = std::path::absolute(var_file).map_err(|source| FixtureError::Io {
                action: "resolve",
                path: var_file.clone(),
                source,
            })?;
            options = options.with_var_file(absolute);
        }
        if let Some(binary) = &self.terraform_binary {
            options = options.with_binary(binary);
        }
        if let Some(max_retries) = self.max_retries {
            options.max_retries = max_retries;
        }
        if let Some(pause) = self.time_between_retries {
            options.time_between_retries = pause;
        }
        options.env_vars.clone_from(&self.env_vars);
        Ok(options)
    }
}

// ============================================================================
// SECTION: Outcomes
// ============================================================================

/// Result of one suite test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestStatus {
    /// The test body returned `Ok`.
    Passed,
    /// The test body returned an error or panicked.
    Failed(String),
}

/// Recorded outcome of one suite test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestOutcome {
    /// Test name.
    pub name: String,
    /// Test result.
    pub status: TestStatus,
}

impl TestOutcome {
    /// Returns true when the test passed.
    #[must_use]
    pub const fn passed(&self) -> bool {
        matches!(self.status, TestStatus::Passed)
    }
}

/// Outcome of a whole suite run.
#[derive(Debug)]
pub struct SuiteReport {
    /// Test outcomes, in execution order.
    pub outcomes: Vec<TestOutcome>,
    /// Destroy result.
    pub teardown: Result<(), TerraformError>,
}

impl SuiteReport {
    /// Converts the report into a pass/fail result.
    ///
    /// # Errors
    ///
    /// Returns [`SuiteError::TestsFailed`] when any test failed (carrying
    /// any teardown error), or [`SuiteError::Teardown`] when only destroy
    /// failed.
    pub fn into_result(self) -> Result<(), SuiteError> {
        let failed: Vec<&TestOutcome> =
            self.outcomes.iter().filter(|outcome| !outcome.passed()).collect();
        if failed.is_empty() {
            return self.teardown.map_err(SuiteError::Teardown);
        }
        let mut summary = failed
            .iter()
            .map(|outcome| match &outcome.status {
                TestStatus::Failed(message) => format!("{}: {message}", outcome.name),
                TestStatus::Passed => outcome.name.clone(),
            })
            .collect::<Vec<_>>()
            .join("; ");
        let teardown = self.teardown.err();
        if let Some(err) = &teardown {
            summary.push_str("; teardown failed: ");
            summary.push_str(&err.to_string());
        }
        Err(SuiteError::TestsFailed {
            failed: failed.iter().map(|outcome| outcome.name.clone()).collect(),
            summary,
            teardown,
        })
    }
}

// ============================================================================
// SECTION: Fixture
// ============================================================================

/// Provisioned module owned by one suite run.
///
/// # Invariants
/// - Destroy runs at most once.
/// - The working copy outlives the destroy that uses it.
pub struct SuiteFixture {
    /// Temp copy of the module; removed when the fixture drops.
    working_copy: WorkingCopy,
    /// Driver bound to the working copy.
    driver: TerraformDriver,
    /// Event sink for lifecycle events.
    sink: Arc<dyn EventSink>,
    /// Outcomes of tests run so far.
    outcomes: Vec<TestOutcome>,
    /// Set once destroy has run.
    torn_down: bool,
}

impl fmt::Debug for SuiteFixture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuiteFixture")
            .field("module_dir", &self.working_copy.module_dir())
            .field("outcomes", &self.outcomes)
            .field("torn_down", &self.torn_down)
            .finish_non_exhaustive()
    }
}

impl SuiteFixture {
    /// Materializes, applies, and verifies the module.
    ///
    /// # Errors
    ///
    /// Returns [`SuiteError::Fixture`] or [`SuiteError::Terraform`] when
    /// setup fails before apply, and [`SuiteError::Setup`] when apply or the
    /// idempotency check fails (destroy has been attempted by then).
    pub fn setup(plan: &SuitePlan, sink: Arc<dyn EventSink>) -> Result<Self, SuiteError> {
        sink.record(&HarnessEvent::new("suite_phase", Phase::Setup, "setup", Outcome::Started));
        let result = Self::provision(plan, Arc::clone(&sink));
        let event = match &result {
            Ok(_) => HarnessEvent::new("suite_phase", Phase::Setup, "setup", Outcome::Ok),
            Err(err) => HarnessEvent::new("suite_phase", Phase::Setup, "setup", Outcome::Failed)
                .with_detail(err.to_string()),
        };
        sink.record(&event);
        result
    }

    /// Runs the setup steps.
    fn provision(plan: &SuitePlan, sink: Arc<dyn EventSink>) -> Result<Self, SuiteError> {
        let working_copy = copy_terraform_folder_to_temp(
            &plan.module_root,
            &plan.module_subdir,
            &plan.copy_filter,
        )?;
        for aux in &plan.aux_files {
            let source = plan.module_root.join(aux);
            if !source.is_file() {
                let action = aux.display().to_string();
                sink.record(
                    &HarnessEvent::new("aux_file", Phase::Setup, action, Outcome::Skipped)
                        .with_detail(format!("{} not found", source.display())),
                );
                continue;
            }
            copy_file(&source, &working_copy.module_dir().join(aux))?;
        }
        let options = plan.terraform_options(working_copy.module_dir())?;
        let driver = TerraformDriver::new(options, Arc::clone(&sink));
        driver.init()?;
        if let Err(source) = driver.apply_and_idempotent() {
            let teardown = destroy_with_events(&driver, sink.as_ref()).err();
            return Err(SuiteError::Setup {
                teardown_summary: teardown_summary(teardown.as_ref()),
                source,
                teardown,
            });
        }
        Ok(Self {
            working_copy,
            driver,
            sink,
            outcomes: Vec::new(),
            torn_down: false,
        })
    }

    /// Returns the Terraform driver bound to the working copy.
    #[must_use]
    pub const fn driver(&self) -> &TerraformDriver {
        &self.driver
    }

    /// Returns the directory Terraform runs in.
    #[must_use]
    pub fn module_dir(&self) -> &Path {
        self.working_copy.module_dir()
    }

    /// Returns the root of the temporary working copy.
    #[must_use]
    pub fn temp_root(&self) -> &Path {
        self.working_copy.temp_root()
    }

    /// Returns the event sink shared by the suite.
    #[must_use]
    pub fn sink(&self) -> Arc<dyn EventSink> {
        Arc::clone(&self.sink)
    }

    /// Returns the outcomes recorded so far.
    #[must_use]
    pub fn outcomes(&self) -> &[TestOutcome] {
        &self.outcomes
    }

    /// Runs one test body, recording its outcome. Errors and panics fail the
    /// test without stopping the suite.
    pub fn run_test<F, E>(&mut self, name: &str, test: F) -> &TestOutcome
    where
        F: FnOnce(&Self) -> Result<(), E>,
        E: fmt::Display,
    {
        self.sink.record(&HarnessEvent::new("suite_test", Phase::Assert, name, Outcome::Started));
        let fixture: &Self = self;
        let status = match catch_unwind(AssertUnwindSafe(|| test(fixture))) {
            Ok(Ok(())) => TestStatus::Passed,
            Ok(Err(err)) => TestStatus::Failed(err.to_string()),
            Err(payload) => TestStatus::Failed(format!("panicked: {}", panic_message(&*payload))),
        };
        let event = match &status {
            TestStatus::Passed => {
                HarnessEvent::new("suite_test", Phase::Assert, name, Outcome::Ok)
            }
            TestStatus::Failed(message) => {
                HarnessEvent::new("suite_test", Phase::Assert, name, Outcome::Failed)
                    .with_detail(message.clone())
            }
        };
        self.sink.record(&event);
        self.outcomes.push(TestOutcome {
            name: name.to_string(),
            status,
        });
        let index = self.outcomes.len() - 1;
        &self.outcomes[index]
    }

    /// Tears down the infrastructure and returns the run report.
    #[must_use]
    pub fn finish(mut self) -> SuiteReport {
        let teardown = self.teardown();
        SuiteReport {
            outcomes: std::mem::take(&mut self.outcomes),
            teardown,
        }
    }

    /// Runs destroy once.
    fn teardown(&mut self) -> Result<(), TerraformError> {
        if self.torn_down {
            return Ok(());
        }
        self.torn_down = true;
        destroy_with_events(&self.driver, self.sink.as_ref())
    }
}

impl Drop for SuiteFixture {
    fn drop(&mut self) {
        if !self.torn_down {
            // Failures are already recorded as teardown events.
            let _ = self.teardown();
        }
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Runs destroy wrapped in teardown phase events.
fn destroy_with_events(driver: &TerraformDriver, sink: &dyn EventSink) -> Result<(), TerraformError> {
    sink.record(&HarnessEvent::new("suite_phase", Phase::Teardown, "destroy", Outcome::Started));
    let result = driver.destroy().map(|_| ());
    let event = match &result {
        Ok(()) => HarnessEvent::new("suite_phase", Phase::Teardown, "destroy", Outcome::Ok),
        Err(err) => HarnessEvent::new("suite_phase", Phase::Teardown, "destroy", Outcome::Failed)
            .with_detail(err.to_string()),
    };
    sink.record(&event);
    result
}

/// Extracts a readable message from a panic payload.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

// ============================================================================
// SECTION: Tests
// ============================================================================
