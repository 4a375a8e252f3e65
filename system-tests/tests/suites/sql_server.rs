// system-tests/tests/suites/sql_server.rs
// ============================================================================
// Module: SQL Server Functional Tests
// Description: Live post-deploy verification of the SQL Server module.
// Purpose: Compare Terraform outputs with the server Azure reports.
// Dependencies: system-tests helpers, post-deploy-harness
// ============================================================================

//! ## Overview
//! Provisions the module once with the demo variable file, reads its outputs,
//! fetches the server from Azure Resource Manager, and destroys everything.
//! Requires `ARM_SUBSCRIPTION_ID` and either service-principal credentials or a
//! signed-in Azure CLI.

use std::error::Error;
use std::sync::Arc;

use post_deploy_harness::ArmClient;
use post_deploy_harness::SqlServerExpectations;
use post_deploy_harness::SuiteFixture;
use post_deploy_harness::check_sql_server_outputs;
use post_deploy_harness::suite::TestStatus;

use crate::helpers::artifacts::TestReporter;
use crate::helpers::harness::RunContext;

#[test]
fn sql_server_outputs_match_azure_api() -> Result<(), Box<dyn Error>> {
    let mut reporter = TestReporter::new("sql_server_outputs_match_azure_api")?;
    let context = RunContext::load(&reporter)?;
    let artifacts = vec![context.event_log.display().to_string()];

    // Token is fetched before setup so bad credentials never provision anything.
    let inspector = ArmClient::from_config(&context.config, Arc::clone(&context.sink))?;
    inspector.verify_credentials()?;

    let mut fixture = match SuiteFixture::setup(&context.plan, Arc::clone(&context.sink)) {
        Ok(fixture) => fixture,
        Err(err) => {
            reporter.finish("setup_failed", vec![err.to_string()], artifacts)?;
            return Err(err.into());
        }
    };

    let expected = SqlServerExpectations::demo();
    fixture.run_test("outputs_with_azure_api", |fixture| {
        check_sql_server_outputs(
            fixture.driver(),
            &inspector,
            &context.config.subscription_id,
            &expected,
            fixture.sink(),
        )
    });

    let report = fixture.finish();
    let mut notes: Vec<String> = report
        .outcomes
        .iter()
        .map(|outcome| match &outcome.status {
            TestStatus::Passed => format!("{}: passed", outcome.name),
            TestStatus::Failed(message) => format!("{}: {message}", outcome.name),
        })
        .collect();
    if let Err(err) = &report.teardown {
        notes.push(format!("teardown failed: {err}"));
    }
    let passed = report.outcomes.iter().all(|outcome| outcome.passed()) && report.teardown.is_ok();
    reporter.finish(if passed { "pass" } else { "fail" }, notes, artifacts)?;

    report.into_result()?;
    Ok(())
}
