// system-tests/tests/helpers/harness.rs
// ============================================================================
// Module: Run Context
// Description: Wires harness configuration into a live functional run.
// Purpose: Resolve the module root, variable file, and event sink per run.
// Dependencies: post-deploy-harness
// ============================================================================

use std::error::Error;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use post_deploy_harness::EventSink;
use post_deploy_harness::HarnessConfig;
use post_deploy_harness::SuitePlan;
use post_deploy_harness::events::default_sink;

use super::artifacts::TestReporter;

/// Default variable file shipped next to this crate.
const DEMO_VAR_FILE: &str = "demo.tfvars";

/// Everything one live run needs before setup.
pub struct RunContext {
    /// Loaded harness configuration.
    pub config: HarnessConfig,
    /// Suite plan for the module under test.
    pub plan: SuitePlan,
    /// Sink shared by the fixture and the checks.
    pub sink: Arc<dyn EventSink>,
    /// Where the event log is written.
    pub event_log: PathBuf,
}

impl RunContext {
    /// Loads configuration and opens the event log under the reporter root.
    ///
    /// The module root defaults to the workspace root; the variable file
    /// defaults to `demo.tfvars` in this crate.
    pub fn load(reporter: &TestReporter) -> Result<Self, Box<dyn Error>> {
        let config = HarnessConfig::load()?;
        let crate_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
        let default_root = crate_dir.parent().unwrap_or(crate_dir);
        let plan = SuitePlan::from_config(&config, default_root, &crate_dir.join(DEMO_VAR_FILE));
        let event_log = config
            .event_log
            .clone()
            .unwrap_or_else(|| reporter.artifacts().root().join("events.jsonl"));
        let sink: Arc<dyn EventSink> = Arc::from(default_sink(Some(&event_log))?);
        Ok(Self {
            config,
            plan,
            sink,
            event_log,
        })
    }
}
