// crates/post-deploy-harness/src/sql_server.rs
// ============================================================================
// Module: SQL Server Output Checks
// Description: Compares Terraform outputs, live ARM state, and expectations.
// Purpose: Verify that the provisioned SQL Server matches what was declared.
// Dependencies: thiserror
// ============================================================================

//! ## Overview
//! Reads the module's SQL Server outputs, fetches the live server from ARM,
//! and runs six soft equality checks so that every mismatch is reported in a
//! single pass. Output reads and the live lookup are hard failures: without
//! them no comparison is meaningful.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

use crate::assertions::AssertionReport;
use crate::assertions::SoftAssertions;
use crate::azure::AzureError;
use crate::azure::ResourceInspector;
use crate::azure::SqlServerRef;
use crate::events::EventSink;
use crate::events::HarnessEvent;
use crate::events::Outcome;
use crate::events::Phase;
use crate::terraform::TerraformDriver;
use crate::terraform::TerraformError;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Output holding the server's ARM resource id.
pub const OUTPUT_SERVER_ID: &str = "sql_server_id";

/// Output holding the server's fully qualified domain name.
pub const OUTPUT_SERVER_FQDN: &str = "sql_server_fqdn";

/// Output holding the server name.
pub const OUTPUT_SERVER_NAME: &str = "sql_server_name";

/// Output holding the administrator login.
pub const OUTPUT_ADMIN_LOGIN: &str = "admin_login_username";

/// Server name declared in the demo variable file.
pub const DEMO_SERVER_NAME: &str = "demodb-eus-shared-000-dbser-000";

/// Resource group declared in the demo variable file.
pub const DEMO_RESOURCE_GROUP: &str = "demodb-eus-shared-000-rg-000";

/// Administrator login declared in the demo variable file.
pub const DEMO_ADMIN_USERNAME: &str = "nexientadmin001";

// ============================================================================
// SECTION: Errors
// ============================================================================

/// SQL Server check errors.
#[derive(Debug, Error)]
pub enum SqlServerCheckError {
    /// A Terraform output could not be read.
    #[error("read outputs: {0}")]
    Output(#[from] TerraformError),
    /// The live server could not be fetched.
    #[error("look up sql server: {0}")]
    Lookup(#[from] AzureError),
    /// One or more comparisons failed.
    #[error("{0}")]
    Mismatch(#[from] AssertionReport),
}

// ============================================================================
// SECTION: Inputs
// ============================================================================

/// Source of Terraform output values.
pub trait OutputReader {
    /// Returns the value of a named output.
    ///
    /// # Errors
    ///
    /// Returns [`TerraformError`] when the output cannot be read.
    fn output(&self, name: &str) -> Result<String, TerraformError>;
}

impl OutputReader for TerraformDriver {
    fn output(&self, name: &str) -> Result<String, TerraformError> {
        Self::output(self, name)
    }
}

impl OutputReader for BTreeMap<String, String> {
    fn output(&self, name: &str) -> Result<String, TerraformError> {
        self.get(name).cloned().ok_or_else(|| TerraformError::OutputMissing(name.to_string()))
    }
}

/// Values the deployed server must carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlServerExpectations {
    /// Expected server name.
    pub server_name: String,
    /// Resource group the server lives in.
    pub resource_group: String,
    /// Expected administrator login.
    pub admin_username: String,
}

impl SqlServerExpectations {
    /// Returns the values declared by the demo variable file.
    #[must_use]
    pub fn demo() -> Self {
        Self {
            server_name: DEMO_SERVER_NAME.to_string(),
            resource_group: DEMO_RESOURCE_GROUP.to_string(),
            admin_username: DEMO_ADMIN_USERNAME.to_string(),
        }
    }
}

/// Terraform outputs read for one assertion pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedOutputs {
    /// `sql_server_id` output.
    pub server_id: String,
    /// `sql_server_fqdn` output.
    pub server_fqdn: String,
    /// `sql_server_name` output.
    pub server_name: String,
    /// `admin_login_username` output.
    pub admin_username: String,
}

impl ObservedOutputs {
    /// Reads the four SQL Server outputs.
    ///
    /// # Errors
    ///
    /// Returns [`TerraformError`] when any output is missing or unreadable.
    pub fn read(outputs: &dyn OutputReader) -> Result<Self, TerraformError> {
        Ok(Self {
            server_id: outputs.output(OUTPUT_SERVER_ID)?,
            server_fqdn: outputs.output(OUTPUT_SERVER_FQDN)?,
            server_name: outputs.output(OUTPUT_SERVER_NAME)?,
            admin_username: outputs.output(OUTPUT_ADMIN_LOGIN)?,
        })
    }
}

// ============================================================================
// SECTION: Checks
// ============================================================================

/// Verifies Terraform outputs against the live server and the expectations.
///
/// Each check takes the Terraform output or the expected literal as the
/// expected value and the observed value as the actual one. Attributes the
/// server does not report compare as empty strings.
///
/// # Errors
///
/// Returns [`SqlServerCheckError::Mismatch`] listing every failed check, or
/// an output or lookup error when the comparison cannot be made.
pub fn check_sql_server_outputs(
    outputs: &dyn OutputReader,
    inspector: &dyn ResourceInspector,
    subscription_id: &str,
    expected: &SqlServerExpectations,
    sink: Arc<dyn EventSink>,
) -> Result<(), SqlServerCheckError> {
    let observed = ObservedOutputs::read(outputs)?;
    let server = inspector.sql_server(&SqlServerRef {
        subscription_id: subscription_id.to_string(),
        resource_group: expected.resource_group.clone(),
        name: expected.server_name.clone(),
    })?;

    let mut soft = SoftAssertions::new(Arc::clone(&sink));
    soft.check_eq("server_id", &observed.server_id, &server.id, "The Server IDs should match");
    soft.check_eq(
        "server_name",
        &expected.server_name,
        &server.name,
        "The Server Name should match",
    );
    soft.check_eq(
        "admin_login",
        &expected.admin_username,
        server.administrator_login.as_deref().unwrap_or_default(),
        "The admin Server should match",
    );
    soft.check_eq(
        "server_fqdn",
        &observed.server_fqdn,
        server.fully_qualified_domain_name.as_deref().unwrap_or_default(),
        "The FQDNs should match",
    );
    soft.check_eq(
        "output_server_name",
        &expected.server_name,
        &observed.server_name,
        "The server Name tf output should match with input server name",
    );
    soft.check_eq(
        "output_admin_username",
        &expected.admin_username,
        &observed.admin_username,
        "The admin username tf output should match with input server admin username",
    );
    let checks = soft.checks();
    soft.finish()?;
    sink.record(
        &HarnessEvent::new("sql_server_checks", Phase::Assert, "sql_server", Outcome::Ok)
            .with_detail(format!("{checks} checks passed")),
    );
    Ok(())
}

// ============================================================================
// SECTION: Tests
// ============================================================================
