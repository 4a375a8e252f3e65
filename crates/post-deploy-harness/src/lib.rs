// crates/post-deploy-harness/src/lib.rs
// ============================================================================
// Module: Post-Deploy Harness
// Description: Functional test harness for Terraform-provisioned Azure resources.
// Purpose: Provision a module, compare its outputs with live state, tear down.
// Dependencies: regex, reqwest, serde, serde_json, tempfile, thiserror, url, walkdir
// ============================================================================

//! ## Overview
//! This crate drives a post-deployment functional test: it copies a Terraform
//! module into a temp directory, applies it idempotently, reads the module
//! outputs, fetches the deployed resource from Azure Resource Manager, and
//! compares the two with soft assertions before destroying everything.
//! Invariants:
//! - Teardown runs exactly once per provisioned [`SuiteFixture`].
//! - The Azure subscription is always an explicit input; see [`HarnessConfig`].
//! - Every command attempt, lookup, and failed check is emitted as a
//!   [`HarnessEvent`].
//!
//! Security posture: client secrets and bearer tokens never reach errors or
//! events.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod assertions;
pub mod azure;
pub mod config;
pub mod events;
pub mod fixture;
pub mod sql_server;
pub mod suite;
pub mod terraform;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use assertions::AssertionReport;
pub use assertions::CheckFailure;
pub use assertions::SoftAssertions;
pub use azure::ArmClient;
pub use azure::AzureError;
pub use azure::ResourceInspector;
pub use azure::SqlServer;
pub use azure::SqlServerRef;
pub use config::ConfigError;
pub use config::HarnessConfig;
pub use events::EventSink;
pub use events::HarnessEvent;
pub use fixture::CopyFilter;
pub use fixture::FixtureError;
pub use sql_server::SqlServerCheckError;
pub use sql_server::SqlServerExpectations;
pub use sql_server::check_sql_server_outputs;
pub use suite::SuiteError;
pub use suite::SuiteFixture;
pub use suite::SuitePlan;
pub use suite::SuiteReport;
pub use terraform::TerraformDriver;
pub use terraform::TerraformError;
pub use terraform::TerraformOptions;
