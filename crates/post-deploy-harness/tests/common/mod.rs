// crates/post-deploy-harness/tests/common/mod.rs
// ============================================================================
// Module: Common Test Utilities
// Description: Fake Terraform binary and local ARM stand-in.
// Purpose: Drive the harness end to end without cloud access.
// Dependencies: post-deploy-harness, tempfile, tiny_http, serde_json
// ============================================================================

//! ## Overview
//! [`FakeTerraform`] writes a POSIX shell script that records every
//! invocation and answers from files in a control directory. [`ArmMock`]
//! serves canned JSON on a loopback `tiny_http` server and records the
//! requests it receives.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    dead_code,
    reason = "Shared test helpers may be unused in some cases."
)]

use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::thread;

use post_deploy_harness::SqlServerExpectations;
use post_deploy_harness::suite::SuitePlan;
use serde_json::Value;
use serde_json::json;
use tempfile::TempDir;
use tiny_http::Header;
use tiny_http::Response;
use tiny_http::Server;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Environment variable pointing the fake binary at its control directory.
pub const CONTROL_ENV: &str = "FAKE_TF_CONTROL";

/// Subscription used by every test.
pub const SUBSCRIPTION: &str = "00000000-0000-0000-0000-000000000001";

/// Fake Terraform script.
const SCRIPT: &str = r#"#!/bin/sh
control="$FAKE_TF_CONTROL"
cmd="$1"
echo "$*" >> "$control/invocations.log"
if [ "$cmd" = "init" ] && [ -f .tool-versions ]; then
  cp .tool-versions "$control/tool_versions_seen"
fi
if [ -f "$control/fail_$cmd" ]; then
  remaining=1
  if [ -f "$control/fail_${cmd}_times" ]; then
    remaining=$(cat "$control/fail_${cmd}_times")
  fi
  if [ "$remaining" -gt 0 ]; then
    if [ -f "$control/fail_${cmd}_times" ]; then
      echo $((remaining - 1)) > "$control/fail_${cmd}_times"
    fi
    cat "$control/fail_$cmd" >&2
    exit 1
  fi
fi
case "$cmd" in
  plan)
    code=0
    if [ -f "$control/plan_exit" ]; then
      code=$(cat "$control/plan_exit")
    fi
    echo "plan complete"
    exit "$code"
    ;;
  output)
    if [ "$#" -lt 4 ]; then
      cat "$control/outputs_all.json"
      exit 0
    fi
    for name; do :; done
    if [ -f "$control/output_$name" ]; then
      cat "$control/output_$name"
      exit 0
    fi
    echo "Error: Output \"$name\" not found" >&2
    exit 1
    ;;
  *)
    echo "$cmd complete"
    exit 0
    ;;
esac
"#;

// ============================================================================
// SECTION: Fake Terraform
// ============================================================================

/// Scriptable stand-in for the Terraform binary.
pub struct FakeTerraform {
    /// Holds the control files.
    dir: TempDir,
}

impl FakeTerraform {
    /// Creates an empty control directory for the shared script.
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    /// Path of the fake binary.
    pub fn binary(&self) -> PathBuf {
        shared_script().to_path_buf()
    }

    /// Control directory read by the script.
    pub fn control(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    /// Sets the exit code `plan -detailed-exitcode` returns.
    pub fn plan_exit(&self, code: i32) {
        fs::write(self.control().join("plan_exit"), code.to_string()).unwrap();
    }

    /// Makes `command` fail with `stderr`, `times` times (always when `None`).
    pub fn fail(&self, command: &str, stderr: &str, times: Option<u32>) {
        fs::write(self.control().join(format!("fail_{command}")), stderr).unwrap();
        if let Some(times) = times {
            fs::write(self.control().join(format!("fail_{command}_times")), times.to_string())
                .unwrap();
        }
    }

    /// Defines a module output.
    pub fn output(&self, name: &str, value: &Value) {
        fs::write(self.control().join(format!("output_{name}")), value.to_string()).unwrap();
    }

    /// Defines the full `output -json` map.
    pub fn outputs_all(&self, value: &Value) {
        fs::write(self.control().join("outputs_all.json"), value.to_string()).unwrap();
    }

    /// Defines the four SQL Server outputs of a healthy deployment.
    pub fn sql_outputs(&self) {
        self.output("sql_server_id", &json!(server_id()));
        self.output("sql_server_fqdn", &json!(server_fqdn()));
        self.output("sql_server_name", &json!(SqlServerExpectations::demo().server_name));
        self.output("admin_login_username", &json!(SqlServerExpectations::demo().admin_username));
    }

    /// Recorded invocations, one argument string per call.
    pub fn invocations(&self) -> Vec<String> {
        fs::read_to_string(self.control().join("invocations.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    /// Subcommands invoked, in order.
    pub fn commands(&self) -> Vec<String> {
        self.invocations()
            .iter()
            .map(|line| line.split_whitespace().next().unwrap_or_default().to_string())
            .collect()
    }

    /// Contents of `.tool-versions` seen in the working directory at init.
    pub fn tool_versions_seen(&self) -> Option<String> {
        fs::read_to_string(self.control().join("tool_versions_seen")).ok()
    }
}

/// Writes the script once per test process. Every test shares it so no
/// thread forks while the file is still open for writing (`ETXTBSY`).
fn shared_script() -> &'static Path {
    static SCRIPT_PATH: OnceLock<PathBuf> = OnceLock::new();
    SCRIPT_PATH.get_or_init(|| {
        let dir = PathBuf::from(env!("CARGO_TARGET_TMPDIR"));
        fs::create_dir_all(&dir).unwrap();
        let staged = dir.join(format!("fake-terraform-{}.tmp", std::process::id()));
        let path = dir.join(format!("fake-terraform-{}", std::process::id()));
        fs::write(&staged, SCRIPT).unwrap();
        make_executable(&staged);
        fs::rename(&staged, &path).unwrap();
        path
    })
}

/// Marks the script executable.
#[cfg(unix)]
fn make_executable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
}

/// Scripts are not executable off unix; callers gate on `cfg(unix)`.
#[cfg(not(unix))]
fn make_executable(_path: &Path) {}

// ============================================================================
// SECTION: Module Fixture
// ============================================================================

/// Minimal module tree with a version pin and variable file.
pub fn module_tree() -> TempDir {
    let root = tempfile::Builder::new().prefix("sqlserver-module").tempdir().unwrap();
    fs::write(root.path().join("main.tf"), "resource \"azurerm_mssql_server\" \"this\" {}\n")
        .unwrap();
    fs::write(root.path().join("outputs.tf"), "output \"sql_server_id\" {}\n").unwrap();
    fs::write(root.path().join(".tool-versions"), "terraform 1.5.7\n").unwrap();
    fs::write(root.path().join("terraform.tfstate"), "{}").unwrap();
    fs::create_dir_all(root.path().join("tests")).unwrap();
    fs::write(root.path().join("tests/demo.tfvars"), "name = \"demo\"\n").unwrap();
    root
}

/// Suite plan wired to the fake binary with no retry pauses.
pub fn suite_plan(module_root: &Path, terraform: &FakeTerraform) -> SuitePlan {
    let mut plan =
        SuitePlan::new(module_root).with_var_file(module_root.join("tests/demo.tfvars"));
    plan.terraform_binary = Some(terraform.binary());
    plan.time_between_retries = Some(std::time::Duration::ZERO);
    plan.env_vars.insert(CONTROL_ENV.to_string(), terraform.control().display().to_string());
    plan
}

// ============================================================================
// SECTION: ARM Stand-In
// ============================================================================

/// ARM id and request path of the demo server.
pub fn server_id() -> String {
    let expected = SqlServerExpectations::demo();
    format!(
        "/subscriptions/{SUBSCRIPTION}/resourceGroups/{}/providers/Microsoft.Sql/servers/{}",
        expected.resource_group, expected.server_name
    )
}

/// FQDN of the demo server.
pub fn server_fqdn() -> String {
    format!("{}.database.windows.net", SqlServerExpectations::demo().server_name)
}

/// ARM payload of the demo server.
pub fn server_payload() -> Value {
    let expected = SqlServerExpectations::demo();
    json!({
        "id": server_id(),
        "name": expected.server_name,
        "type": "Microsoft.Sql/servers",
        "location": "eastus",
        "properties": {
            "administratorLogin": expected.admin_username,
            "version": "12.0",
            "state": "Ready",
            "fullyQualifiedDomainName": server_fqdn(),
            "publicNetworkAccess": "Enabled"
        }
    })
}

/// Request seen by the mock.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// HTTP method.
    pub method: String,
    /// Path and query.
    pub url: String,
    /// `Authorization` header value.
    pub authorization: Option<String>,
    /// Request body.
    pub body: String,
}

/// Canned response for requests whose path starts with a prefix.
#[derive(Debug, Clone)]
pub struct Route {
    /// Path prefix matched against the request URL.
    pub prefix: String,
    /// Response status.
    pub status: u16,
    /// Response body.
    pub body: String,
    /// Response content type.
    pub content_type: &'static str,
}

impl Route {
    /// Creates a route answering with a JSON body.
    pub fn new(prefix: impl Into<String>, status: u16, body: Value) -> Self {
        Self {
            prefix: prefix.into(),
            status,
            body: body.to_string(),
            content_type: "application/json",
        }
    }

    /// Creates a route answering with a raw HTML body.
    pub fn html(prefix: impl Into<String>, status: u16, body: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            status,
            body: body.into(),
            content_type: "text/html",
        }
    }
}

/// Loopback HTTP server answering from a route table.
pub struct ArmMock {
    /// Shared server handle, unblocked on drop.
    server: Arc<Server>,
    /// Requests received so far.
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    /// Serving thread.
    handle: Option<thread::JoinHandle<()>>,
}

impl ArmMock {
    /// Starts the mock. Unmatched requests get an ARM-style 404.
    pub fn start(routes: Vec<Route>) -> Self {
        let server = Arc::new(Server::http("127.0.0.1:0").unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));
        let handle = {
            let server = Arc::clone(&server);
            let requests = Arc::clone(&requests);
            thread::spawn(move || {
                for mut request in server.incoming_requests() {
                    let mut body = String::new();
                    let _ = request.as_reader().read_to_string(&mut body);
                    let url = request.url().to_string();
                    let authorization = request
                        .headers()
                        .iter()
                        .find(|header| header.field.equiv("Authorization"))
                        .map(|header| header.value.as_str().to_string());
                    requests.lock().unwrap().push(RecordedRequest {
                        method: request.method().to_string(),
                        url: url.clone(),
                        authorization,
                        body,
                    });
                    let route = routes
                        .iter()
                        .find(|route| url.starts_with(&route.prefix))
                        .cloned()
                        .unwrap_or_else(|| {
                            Route::new(
                                "/",
                                404,
                                json!({"error": {"code": "ResourceNotFound", "message": "not found"}}),
                            )
                        });
                    let content_type =
                        Header::from_bytes(&b"Content-Type"[..], route.content_type.as_bytes())
                            .unwrap();
                    let response = Response::from_string(route.body)
                        .with_status_code(route.status)
                        .with_header(content_type);
                    let _ = request.respond(response);
                }
            })
        };
        Self {
            server,
            requests,
            handle: Some(handle),
        }
    }

    /// Base URL of the mock.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.server.server_addr().to_ip().unwrap())
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for ArmMock {
    fn drop(&mut self) {
        self.server.unblock();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
