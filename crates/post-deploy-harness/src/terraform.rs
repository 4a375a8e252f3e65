// crates/post-deploy-harness/src/terraform.rs
// ============================================================================
// Module: Terraform Driver
// Description: Blocking init/apply/plan/output/destroy over the Terraform CLI.
// Purpose: Provision the module under test and read its outputs.
// Dependencies: regex, serde_json, thiserror
// ============================================================================

//! ## Overview
//! The driver shells out to the Terraform binary inside the materialized
//! working directory. Every command is retried when its output matches a
//! known transient error pattern; other failures return immediately.
//! Idempotency is verified with `plan -detailed-exitcode` after apply: exit
//! code 0 means the second pass has nothing to change.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use crate::events::EventSink;
use crate::events::HarnessEvent;
use crate::events::Outcome;
use crate::events::Phase;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default Terraform executable name, resolved through `PATH`.
pub const DEFAULT_TERRAFORM_BINARY: &str = "terraform";

/// Default retry budget for retryable errors.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default pause between retries.
pub const DEFAULT_TIME_BETWEEN_RETRIES: Duration = Duration::from_secs(5);

/// Exit code `plan -detailed-exitcode` uses for a non-empty diff.
const PLAN_EXIT_CHANGES: i32 = 2;

/// Maximum bytes of command output kept in error messages.
const MAX_ERROR_OUTPUT_BYTES: usize = 4096;

/// Transient error patterns and the reason logged when they match.
const DEFAULT_RETRYABLE_ERRORS: [(&str, &str); 12] = [
    (".*read: connection reset by peer.*", "Failed to reach helm charts repository."),
    (".*transport is closing.*", "Failed to reach Kubernetes API."),
    (".*unable to verify signature.*", "Failed to retrieve plugin due to transient network error."),
    (".*unable to verify checksum.*", "Failed to retrieve plugin due to transient network error."),
    (
        ".*no provider exists with the given name.*",
        "Failed to retrieve plugin due to transient network error.",
    ),
    (
        ".*registry service is unreachable.*",
        "Failed to retrieve plugin due to transient network error.",
    ),
    (".*Error installing provider.*", "Failed to retrieve plugin due to transient network error."),
    (
        ".*Failed to query available provider packages.*",
        "Failed to retrieve plugin due to transient network error.",
    ),
    (
        ".*timeout while waiting for plugin to start.*",
        "Failed to retrieve plugin due to transient network error.",
    ),
    (
        ".*timed out waiting for server handshake.*",
        "Failed to retrieve plugin due to transient network error.",
    ),
    (
        "could not query provider registry for",
        "Failed to retrieve plugin due to transient network error.",
    ),
    (".*Provider produced inconsistent result after apply.*", "Provider eventual consistency error."),
];

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Terraform driver errors.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
/// - Messages name the subcommand only; variable values never appear.
#[derive(Debug, Error)]
pub enum TerraformError {
    /// The Terraform process could not be started.
    #[error("failed to start terraform {command}: {source}")]
    Spawn {
        /// Subcommand name.
        command: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// The command exited with a non-accepted status and no retryable match.
    #[error("terraform {command} failed with {exit_code}: {output}")]
    CommandFailed {
        /// Subcommand name.
        command: String,
        /// Process exit status.
        exit_code: ExitStatusCode,
        /// Trailing combined output.
        output: String,
    },
    /// Every attempt failed with a retryable error.
    #[error("terraform {command} still failing after {attempts} attempts ({reason}): {output}")]
    RetriesExhausted {
        /// Subcommand name.
        command: String,
        /// Number of attempts made.
        attempts: u32,
        /// Reason attached to the last matching pattern.
        reason: String,
        /// Trailing combined output of the last attempt.
        output: String,
    },
    /// The post-apply plan reported pending changes.
    #[error("terraform configuration not idempotent: {plan}")]
    NotIdempotent {
        /// Trailing plan output.
        plan: String,
    },
    /// A named output is not defined by the module.
    #[error("terraform output {0} not found")]
    OutputMissing(String),
    /// An output value could not be decoded.
    #[error("terraform output {name} is not valid JSON: {source}")]
    OutputDecode {
        /// Output name, or `*` for the full output map.
        name: String,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
}

/// Exit code of a finished process; `None` when it was killed by a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatusCode(pub Option<i32>);

impl fmt::Display for ExitStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(code) => write!(f, "exit code {code}"),
            None => f.write_str("no exit code (terminated by signal)"),
        }
    }
}

// ============================================================================
// SECTION: Options
// ============================================================================

/// Pattern marking a failure as transient.
#[derive(Debug, Clone)]
pub struct RetryableError {
    /// Pattern matched against combined stdout and stderr.
    pattern: Regex,
    /// Reason logged when the pattern matches.
    reason: String,
}

impl RetryableError {
    /// Compiles a retryable error pattern.
    ///
    /// # Errors
    ///
    /// Returns [`regex::Error`] when the pattern is not a valid expression.
    pub fn new(pattern: &str, reason: impl Into<String>) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            reason: reason.into(),
        })
    }

    /// Returns the reason logged for this pattern.
    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Returns true when the pattern matches the command output.
    #[must_use]
    pub fn matches(&self, output: &str) -> bool {
        self.pattern.is_match(output)
    }
}

/// Returns the built-in transient error table.
#[must_use]
pub fn default_retryable_errors() -> Vec<RetryableError> {
    DEFAULT_RETRYABLE_ERRORS
        .iter()
        .filter_map(|(pattern, reason)| RetryableError::new(pattern, *reason).ok())
        .collect()
}

/// Options for one Terraform working directory.
#[derive(Debug, Clone)]
pub struct TerraformOptions {
    /// Directory the commands run in.
    pub terraform_dir: PathBuf,
    /// Variable files passed with `-var-file`.
    pub var_files: Vec<PathBuf>,
    /// Variables passed with `-var`.
    pub vars: BTreeMap<String, String>,
    /// Extra environment for every command.
    pub env_vars: BTreeMap<String, String>,
    /// Terraform executable.
    pub binary: PathBuf,
    /// Transient error patterns.
    pub retryable_errors: Vec<RetryableError>,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Pause between attempts.
    pub time_between_retries: Duration,
    /// Pass `-no-color`.
    pub no_color: bool,
    /// Take the state lock; `-lock=false` is passed when disabled.
    pub lock: bool,
}

impl TerraformOptions {
    /// Creates options for a directory with no retryable errors.
    #[must_use]
    pub fn new(terraform_dir: impl Into<PathBuf>) -> Self {
        Self {
            terraform_dir: terraform_dir.into(),
            var_files: Vec::new(),
            vars: BTreeMap::new(),
            env_vars: BTreeMap::new(),
            binary: PathBuf::from(DEFAULT_TERRAFORM_BINARY),
            retryable_errors: Vec::new(),
            max_retries: 0,
            time_between_retries: Duration::ZERO,
            no_color: true,
            lock: false,
        }
    }

    /// Installs the default transient error table and retry budget, keeping
    /// any patterns already configured.
    #[must_use]
    pub fn with_default_retryable_errors(mut self) -> Self {
        self.retryable_errors.extend(default_retryable_errors());
        self.max_retries = DEFAULT_MAX_RETRIES;
        self.time_between_retries = DEFAULT_TIME_BETWEEN_RETRIES;
        self
    }

    /// Adds a variable file.
    #[must_use]
    pub fn with_var_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.var_files.push(path.into());
        self
    }

    /// Overrides the Terraform executable.
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Appends `-lock`, `-var`, and `-var-file` arguments.
    fn push_plan_args(&self, args: &mut Vec<String>) {
        if !self.lock {
            args.push("-lock=false".to_string());
        }
        for (name, value) in &self.vars {
            args.push("-var".to_string());
            args.push(format!("{name}={value}"));
        }
        for file in &self.var_files {
            args.push("-var-file".to_string());
            args.push(file.display().to_string());
        }
    }
}

// ============================================================================
// SECTION: Command Output
// ============================================================================

/// Captured result of one Terraform process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, when the process was not killed by a signal.
    pub exit_code: Option<i32>,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns stdout followed by stderr.
    #[must_use]
    pub fn combined(&self) -> String {
        let mut out = String::with_capacity(self.stdout.len() + self.stderr.len() + 1);
        out.push_str(&self.stdout);
        if !self.stdout.is_empty() && !self.stderr.is_empty() {
            out.push('\n');
        }
        out.push_str(&self.stderr);
        out
    }
}

/// Returns at most the last `max` bytes of `text`, on a char boundary.
fn output_tail(text: &str, max: usize) -> String {
    let trimmed = text.trim();
    if trimmed.len() <= max {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - max;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &trimmed[start..])
}

// ============================================================================
// SECTION: Driver
// ============================================================================

/// Blocking Terraform CLI driver.
pub struct TerraformDriver {
    /// Options for the working directory.
    options: TerraformOptions,
    /// Event sink for command attempts.
    sink: Arc<dyn EventSink>,
}

impl fmt::Debug for TerraformDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TerraformDriver")
            .field("terraform_dir", &self.options.terraform_dir)
            .field("binary", &self.options.binary)
            .finish_non_exhaustive()
    }
}

impl TerraformDriver {
    /// Creates a driver.
    #[must_use]
    pub fn new(options: TerraformOptions, sink: Arc<dyn EventSink>) -> Self {
        Self {
            options,
            sink,
        }
    }

    /// Returns the driver options.
    #[must_use]
    pub const fn options(&self) -> &TerraformOptions {
        &self.options
    }

    /// Returns the working directory.
    #[must_use]
    pub fn terraform_dir(&self) -> &Path {
        &self.options.terraform_dir
    }

    /// Runs `terraform init`.
    ///
    /// # Errors
    ///
    /// Returns [`TerraformError`] when the command fails.
    pub fn init(&self) -> Result<CommandOutput, TerraformError> {
        let mut args = vec!["init".to_string(), "-upgrade=false".to_string()];
        self.push_color_arg(&mut args);
        self.run(&args, &[0])
    }

    /// Runs `terraform apply` without prompting.
    ///
    /// # Errors
    ///
    /// Returns [`TerraformError`] when the command fails.
    pub fn apply(&self) -> Result<CommandOutput, TerraformError> {
        let mut args =
            vec!["apply".to_string(), "-input=false".to_string(), "-auto-approve".to_string()];
        self.options.push_plan_args(&mut args);
        self.push_color_arg(&mut args);
        self.run(&args, &[0])
    }

    /// Runs `terraform plan -detailed-exitcode` and returns its exit code:
    /// 0 when there is nothing to change, 2 when changes are pending.
    ///
    /// # Errors
    ///
    /// Returns [`TerraformError`] when the plan itself fails.
    pub fn plan_exit_code(&self) -> Result<(i32, CommandOutput), TerraformError> {
        let mut args =
            vec!["plan".to_string(), "-input=false".to_string(), "-detailed-exitcode".to_string()];
        self.options.push_plan_args(&mut args);
        self.push_color_arg(&mut args);
        let output = self.run(&args, &[0, PLAN_EXIT_CHANGES])?;
        Ok((output.exit_code.unwrap_or_default(), output))
    }

    /// Runs init then apply.
    ///
    /// # Errors
    ///
    /// Returns [`TerraformError`] when either command fails.
    pub fn init_and_apply(&self) -> Result<CommandOutput, TerraformError> {
        self.init()?;
        self.apply()
    }

    /// Runs init and apply, then fails unless a follow-up plan is empty.
    ///
    /// # Errors
    ///
    /// Returns [`TerraformError::NotIdempotent`] when the plan shows changes,
    /// or any command error.
    pub fn init_and_apply_and_idempotent(&self) -> Result<CommandOutput, TerraformError> {
        self.init()?;
        self.apply_and_idempotent()
    }

    /// Runs apply, then fails unless a follow-up plan is empty.
    ///
    /// # Errors
    ///
    /// Returns [`TerraformError::NotIdempotent`] when the plan shows changes,
    /// or any command error.
    pub fn apply_and_idempotent(&self) -> Result<CommandOutput, TerraformError> {
        let applied = self.apply()?;
        let (exit_code, plan) = self.plan_exit_code()?;
        if exit_code == PLAN_EXIT_CHANGES {
            self.sink.record(
                &HarnessEvent::new("terraform_idempotency", Phase::Setup, "plan", Outcome::Failed)
                    .with_detail("plan reported pending changes after apply"),
            );
            return Err(TerraformError::NotIdempotent {
                plan: output_tail(&plan.combined(), MAX_ERROR_OUTPUT_BYTES),
            });
        }
        self.sink.record(&HarnessEvent::new(
            "terraform_idempotency",
            Phase::Setup,
            "plan",
            Outcome::Ok,
        ));
        Ok(applied)
    }

    /// Reads one output. Strings are returned raw; other values as compact
    /// JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`TerraformError::OutputMissing`] when the output is not
    /// defined, or a command or decode error.
    pub fn output(&self, name: &str) -> Result<String, TerraformError> {
        let args = ["output", "-no-color", "-json", name].map(str::to_string);
        let output = self.run(&args, &[0]).map_err(|err| match err {
            TerraformError::CommandFailed {
                ref output, ..
            } if output.contains(&format!("Output \"{name}\" not found")) => {
                TerraformError::OutputMissing(name.to_string())
            }
            other => other,
        })?;
        let value: Value =
            serde_json::from_str(output.stdout.trim()).map_err(|source| {
                TerraformError::OutputDecode {
                    name: name.to_string(),
                    source,
                }
            })?;
        Ok(match value {
            Value::String(text) => text,
            other => other.to_string(),
        })
    }

    /// Reads every output as a name to value map.
    ///
    /// # Errors
    ///
    /// Returns [`TerraformError`] when the command fails or the output map
    /// cannot be decoded.
    pub fn output_all(&self) -> Result<BTreeMap<String, Value>, TerraformError> {
        /// Shape of one entry in `terraform output -json`.
        #[derive(serde::Deserialize)]
        struct OutputEntry {
            /// Output value.
            value: Value,
        }

        let args = ["output", "-no-color", "-json"].map(str::to_string);
        let output = self.run(&args, &[0])?;
        let entries: BTreeMap<String, OutputEntry> = serde_json::from_str(output.stdout.trim())
            .map_err(|source| TerraformError::OutputDecode {
                name: "*".to_string(),
                source,
            })?;
        Ok(entries.into_iter().map(|(name, entry)| (name, entry.value)).collect())
    }

    /// Runs `terraform destroy` without prompting.
    ///
    /// # Errors
    ///
    /// Returns [`TerraformError`] when the command fails.
    pub fn destroy(&self) -> Result<CommandOutput, TerraformError> {
        let mut args =
            vec!["destroy".to_string(), "-auto-approve".to_string(), "-input=false".to_string()];
        self.options.push_plan_args(&mut args);
        self.push_color_arg(&mut args);
        self.run(&args, &[0])
    }

    /// Appends `-no-color` when configured.
    fn push_color_arg(&self, args: &mut Vec<String>) {
        if self.options.no_color {
            args.push("-no-color".to_string());
        }
    }

    /// Runs a command, retrying on retryable errors, and accepts any exit
    /// code listed in `accepted`.
    fn run(&self, args: &[String], accepted: &[i32]) -> Result<CommandOutput, TerraformError> {
        let command = args.first().cloned().unwrap_or_default();
        let phase = phase_for(&command);
        let attempts = self.options.max_retries.saturating_add(1);
        let mut last_reason = String::new();
        let mut last_output = String::new();
        for attempt in 1..=attempts {
            self.sink.record(
                &HarnessEvent::new("terraform_command", phase, &command, Outcome::Started)
                    .with_attempt(attempt),
            );
            let output = self.run_once(&command, args)?;
            if output.exit_code.is_some_and(|code| accepted.contains(&code)) {
                self.sink.record(
                    &HarnessEvent::new("terraform_command", phase, &command, Outcome::Ok)
                        .with_attempt(attempt),
                );
                return Ok(output);
            }
            let combined = output.combined();
            let Some(retryable) =
                self.options.retryable_errors.iter().find(|candidate| candidate.matches(&combined))
            else {
                let tail = output_tail(&combined, MAX_ERROR_OUTPUT_BYTES);
                self.sink.record(
                    &HarnessEvent::new("terraform_command", phase, &command, Outcome::Failed)
                        .with_attempt(attempt)
                        .with_detail(tail.clone()),
                );
                return Err(TerraformError::CommandFailed {
                    command,
                    exit_code: ExitStatusCode(output.exit_code),
                    output: tail,
                });
            };
            last_reason = retryable.reason().to_string();
            last_output = output_tail(&combined, MAX_ERROR_OUTPUT_BYTES);
            if attempt < attempts {
                self.sink.record(
                    &HarnessEvent::new("terraform_command", phase, &command, Outcome::Retrying)
                        .with_attempt(attempt)
                        .with_detail(last_reason.clone()),
                );
                std::thread::sleep(self.options.time_between_retries);
            }
        }
        self.sink.record(
            &HarnessEvent::new("terraform_command", phase, &command, Outcome::Failed)
                .with_attempt(attempts)
                .with_detail(last_reason.clone()),
        );
        Err(TerraformError::RetriesExhausted {
            command,
            attempts,
            reason: last_reason,
            output: last_output,
        })
    }

    /// Spawns the Terraform process once and captures its output.
    fn run_once(&self, command: &str, args: &[String]) -> Result<CommandOutput, TerraformError> {
        let output = Command::new(&self.options.binary)
            .args(args)
            .current_dir(&self.options.terraform_dir)
            .env("TF_IN_AUTOMATION", "1")
            .envs(&self.options.env_vars)
            .output()
            .map_err(|source| TerraformError::Spawn {
                command: command.to_string(),
                source,
            })?;
        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Maps a subcommand to the lifecycle phase it runs in.
fn phase_for(command: &str) -> Phase {
    match command {
        "destroy" => Phase::Teardown,
        "output" => Phase::Assert,
        _ => Phase::Setup,
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
