// crates/post-deploy-harness/src/azure.rs
// ============================================================================
// Module: Azure Resource Inspector
// Description: Reads live SQL Server state from Azure Resource Manager.
// Purpose: Provide the observed side of output-versus-live comparisons.
// Dependencies: reqwest, serde, serde_json, url, thiserror
// ============================================================================

//! ## Overview
//! The inspector issues bounded, blocking ARM `GET` requests authenticated
//! with a bearer token. Tokens come from a service principal
//! (client-credentials grant) when one is configured, otherwise from the
//! Azure CLI. The subscription is always passed explicitly by the caller.
//! Security posture: tokens and client secrets never appear in errors or
//! events.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::io::Read;
use std::process::Command;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use reqwest::StatusCode;
use reqwest::Url;
use reqwest::blocking::Client;
use reqwest::blocking::Response;
use reqwest::header::ACCEPT;
use reqwest::header::CONTENT_TYPE;
use reqwest::redirect::Policy;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::config::HarnessConfig;
use crate::config::ServicePrincipal;
use crate::events::EventSink;
use crate::events::HarnessEvent;
use crate::events::Outcome;
use crate::events::Phase;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Public-cloud Azure Resource Manager endpoint.
pub const DEFAULT_ARM_ENDPOINT: &str = "https://management.azure.com";

/// Public-cloud Entra ID login endpoint.
pub const DEFAULT_LOGIN_ENDPOINT: &str = "https://login.microsoftonline.com";

/// ARM API version used for `Microsoft.Sql/servers`.
pub const SQL_SERVER_API_VERSION: &str = "2021-11-01";

/// Request timeout for ARM and token calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on ARM response bodies.
const MAX_RESPONSE_BYTES: usize = 1024 * 1024;

/// Tokens are refreshed this long before they expire.
const TOKEN_EXPIRY_SKEW: Duration = Duration::from_secs(60);

/// Longest raw body excerpt carried in an error message.
const MAX_ERROR_EXCERPT_CHARS: usize = 200;

/// Lifetime assumed when a token response omits `expires_in`.
const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 3600;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Azure inspector errors.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
/// - Messages never include bearer tokens or client secrets.
#[derive(Debug, Error)]
pub enum AzureError {
    /// A configured endpoint is not a usable base URL.
    #[error("invalid endpoint {0}")]
    InvalidEndpoint(String),
    /// A bearer token could not be acquired.
    #[error("token acquisition failed: {0}")]
    Token(String),
    /// The HTTP request could not be completed.
    #[error("request to {url} failed: {message}")]
    Transport {
        /// Request URL without query string.
        url: String,
        /// Failure description.
        message: String,
    },
    /// The resource does not exist.
    #[error("resource not found: {0}")]
    NotFound(String),
    /// ARM answered with an error status.
    #[error("ARM returned {status} for {resource}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Resource path.
        resource: String,
        /// ARM error code and message.
        message: String,
    },
    /// The response body could not be decoded.
    #[error("failed to decode response for {resource}: {message}")]
    Decode {
        /// Resource path.
        resource: String,
        /// Failure description.
        message: String,
    },
}

// ============================================================================
// SECTION: Token Sources
// ============================================================================

/// Source of ARM bearer tokens.
pub trait TokenSource: Send + Sync {
    /// Returns a bearer token valid for ARM.
    ///
    /// # Errors
    ///
    /// Returns [`AzureError::Token`] when no token can be acquired.
    fn token(&self) -> Result<String, AzureError>;
}

/// Fixed token, used against local ARM stand-ins.
pub struct StaticToken(pub String);

impl TokenSource for StaticToken {
    fn token(&self) -> Result<String, AzureError> {
        Ok(self.0.clone())
    }
}

/// Token acquired with `az account get-access-token`.
pub struct AzureCliToken {
    /// Resource the token is issued for.
    resource: String,
    /// Optional tenant to request the token from.
    tenant_id: Option<String>,
}

impl AzureCliToken {
    /// Creates a CLI token source for the ARM endpoint.
    #[must_use]
    pub fn new(arm_endpoint: &str, tenant_id: Option<String>) -> Self {
        Self {
            resource: format!("{}/", arm_endpoint.trim_end_matches('/')),
            tenant_id,
        }
    }
}

impl TokenSource for AzureCliToken {
    fn token(&self) -> Result<String, AzureError> {
        let mut command = Command::new("az");
        command.args([
            "account",
            "get-access-token",
            "--resource",
            self.resource.as_str(),
            "--output",
            "json",
        ]);
        if let Some(tenant_id) = &self.tenant_id {
            command.args(["--tenant", tenant_id.as_str()]);
        }
        let output = command.output().map_err(|err| {
            AzureError::Token(format!(
                "az CLI not found: {err}; install the Azure CLI or configure a service principal"
            ))
        })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AzureError::Token(format!(
                "az account get-access-token failed: {}; run 'az login' first",
                stderr.trim()
            )));
        }
        let body: Value = serde_json::from_slice(&output.stdout)
            .map_err(|err| AzureError::Token(format!("az CLI output parse: {err}")))?;
        body.get("accessToken")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| AzureError::Token("az CLI: no accessToken in output".to_string()))
    }
}

/// Token acquired with the OAuth2 client-credentials grant.
pub struct ServicePrincipalToken {
    /// Credentials for the grant.
    principal: ServicePrincipal,
    /// Token endpoint URL.
    token_url: Url,
    /// Requested scope.
    scope: String,
    /// HTTP client for token requests.
    client: Client,
    /// Cached token and its refresh deadline.
    cache: Mutex<Option<(String, Instant)>>,
}

impl ServicePrincipalToken {
    /// Creates a token source for the ARM endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`AzureError`] when the login endpoint is invalid or the HTTP
    /// client cannot be built.
    pub fn new(
        principal: ServicePrincipal,
        login_endpoint: &str,
        arm_endpoint: &str,
    ) -> Result<Self, AzureError> {
        let mut token_url = parse_base_url(login_endpoint)?;
        token_url
            .path_segments_mut()
            .map_err(|()| AzureError::InvalidEndpoint(login_endpoint.to_string()))?
            .pop_if_empty()
            .extend([principal.tenant_id.as_str(), "oauth2", "v2.0", "token"]);
        Ok(Self {
            principal,
            token_url,
            scope: format!("{}/.default", arm_endpoint.trim_end_matches('/')),
            client: build_http_client()?,
            cache: Mutex::new(None),
        })
    }

    /// Returns the cached token when it is still fresh.
    fn cached(&self) -> Option<String> {
        let guard = self.cache.lock().ok()?;
        guard
            .as_ref()
            .filter(|(_, refresh_at)| Instant::now() < *refresh_at)
            .map(|(token, _)| token.clone())
    }
}

impl TokenSource for ServicePrincipalToken {
    fn token(&self) -> Result<String, AzureError> {
        if let Some(token) = self.cached() {
            return Ok(token);
        }
        let body = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("grant_type", "client_credentials")
            .append_pair("client_id", &self.principal.client_id)
            .append_pair("client_secret", &self.principal.client_secret)
            .append_pair("scope", &self.scope)
            .finish();
        let response = self
            .client
            .post(self.token_url.clone())
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(ACCEPT, "application/json")
            .body(body)
            .send()
            .map_err(|err| AzureError::Token(format!("token request failed: {err}")))?;
        let status = response.status();
        let body = read_body(response, "oauth2/token")
            .map_err(|err| AzureError::Token(err.to_string()))?;
        if !status.is_success() {
            return Err(AzureError::Token(format!(
                "token endpoint returned {}: {}",
                status.as_u16(),
                token_error_summary(&body)
            )));
        }
        let payload =
            decode_json(&body, "oauth2/token").map_err(|err| AzureError::Token(err.to_string()))?;
        let token = payload
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| AzureError::Token("no access_token in response".to_string()))?
            .to_string();
        let expires_in = payload
            .get("expires_in")
            .and_then(|value| {
                value.as_u64().or_else(|| value.as_str().and_then(|text| text.parse().ok()))
            })
            .unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);
        let refresh_at =
            Instant::now() + Duration::from_secs(expires_in).saturating_sub(TOKEN_EXPIRY_SKEW);
        if let Ok(mut cache) = self.cache.lock() {
            *cache = Some((token.clone(), refresh_at));
        }
        Ok(token)
    }
}

/// Selects the token source for a configuration: the service principal when
/// configured, otherwise the Azure CLI.
///
/// # Errors
///
/// Returns [`AzureError`] when the service principal source cannot be built.
pub fn token_source_for(config: &HarnessConfig) -> Result<Box<dyn TokenSource>, AzureError> {
    let arm_endpoint = config.arm_endpoint.as_deref().unwrap_or(DEFAULT_ARM_ENDPOINT);
    match &config.service_principal {
        Some(principal) => Ok(Box::new(ServicePrincipalToken::new(
            principal.clone(),
            config.login_endpoint.as_deref().unwrap_or(DEFAULT_LOGIN_ENDPOINT),
            arm_endpoint,
        )?)),
        None => Ok(Box::new(AzureCliToken::new(arm_endpoint, config.tenant_id.clone()))),
    }
}

// ============================================================================
// SECTION: Resource Types
// ============================================================================

/// Identity of a SQL Server resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlServerRef {
    /// Subscription identifier.
    pub subscription_id: String,
    /// Resource group name.
    pub resource_group: String,
    /// Server name.
    pub name: String,
}

impl SqlServerRef {
    /// Returns the ARM path segments for the server.
    fn segments(&self) -> [&str; 8] {
        [
            "subscriptions",
            self.subscription_id.as_str(),
            "resourceGroups",
            self.resource_group.as_str(),
            "providers",
            "Microsoft.Sql",
            "servers",
            self.name.as_str(),
        ]
    }

    /// Returns the ARM resource path, used in messages.
    #[must_use]
    pub fn resource_path(&self) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Sql/servers/{}",
            self.subscription_id, self.resource_group, self.name
        )
    }
}

/// Live SQL Server state as reported by ARM.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "ArmSqlServer")]
pub struct SqlServer {
    /// Fully qualified ARM resource identifier.
    pub id: String,
    /// Server name.
    pub name: String,
    /// Azure region.
    pub location: Option<String>,
    /// Administrator login name.
    pub administrator_login: Option<String>,
    /// Fully qualified DNS name.
    pub fully_qualified_domain_name: Option<String>,
    /// SQL engine version.
    pub version: Option<String>,
    /// Provisioning state.
    pub state: Option<String>,
    /// Public network access setting.
    pub public_network_access: Option<String>,
}

/// Wire shape of a `Microsoft.Sql/servers` resource.
#[derive(Deserialize)]
struct ArmSqlServer {
    /// Resource identifier.
    id: String,
    /// Resource name.
    name: String,
    /// Region.
    #[serde(default)]
    location: Option<String>,
    /// Resource properties.
    #[serde(default)]
    properties: ArmSqlServerProperties,
}

/// Wire shape of SQL Server properties.
#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArmSqlServerProperties {
    /// Administrator login name.
    administrator_login: Option<String>,
    /// Fully qualified DNS name.
    fully_qualified_domain_name: Option<String>,
    /// SQL engine version.
    version: Option<String>,
    /// Provisioning state.
    state: Option<String>,
    /// Public network access setting.
    public_network_access: Option<String>,
}

impl From<ArmSqlServer> for SqlServer {
    fn from(raw: ArmSqlServer) -> Self {
        Self {
            id: raw.id,
            name: raw.name,
            location: raw.location,
            administrator_login: raw.properties.administrator_login,
            fully_qualified_domain_name: raw.properties.fully_qualified_domain_name,
            version: raw.properties.version,
            state: raw.properties.state,
            public_network_access: raw.properties.public_network_access,
        }
    }
}

// ============================================================================
// SECTION: Inspector
// ============================================================================

/// Reader of live resource state.
pub trait ResourceInspector {
    /// Fetches a SQL Server resource.
    ///
    /// # Errors
    ///
    /// Returns [`AzureError`] when the lookup fails or the resource is absent.
    fn sql_server(&self, server: &SqlServerRef) -> Result<SqlServer, AzureError>;
}

/// Blocking ARM client.
pub struct ArmClient {
    /// ARM base URL.
    endpoint: Url,
    /// HTTP client for ARM requests.
    client: Client,
    /// Bearer token source.
    token: Box<dyn TokenSource>,
    /// Event sink for lookups.
    sink: Arc<dyn EventSink>,
}

impl ArmClient {
    /// Creates a client against an ARM endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`AzureError`] when the endpoint is invalid or the HTTP client
    /// cannot be built.
    pub fn new(
        endpoint: &str,
        token: Box<dyn TokenSource>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, AzureError> {
        Ok(Self {
            endpoint: parse_base_url(endpoint)?,
            client: build_http_client()?,
            token,
            sink,
        })
    }

    /// Creates a client from harness configuration.
    ///
    /// # Errors
    ///
    /// Returns [`AzureError`] when the endpoints or credentials are unusable.
    pub fn from_config(config: &HarnessConfig, sink: Arc<dyn EventSink>) -> Result<Self, AzureError> {
        let endpoint = config.arm_endpoint.as_deref().unwrap_or(DEFAULT_ARM_ENDPOINT);
        Self::new(endpoint, token_source_for(config)?, sink)
    }

    /// Acquires a token once so missing credentials surface before any
    /// infrastructure is created.
    ///
    /// # Errors
    ///
    /// Returns [`AzureError::Token`] when no token can be acquired.
    pub fn verify_credentials(&self) -> Result<(), AzureError> {
        let result = self.token.token().map(|_| ());
        let event = match &result {
            Ok(()) => HarnessEvent::new("arm_credentials", Phase::Setup, "token", Outcome::Ok),
            Err(err) => {
                HarnessEvent::new("arm_credentials", Phase::Setup, "token", Outcome::Failed)
                    .with_detail(err.to_string())
            }
        };
        self.sink.record(&event);
        result
    }

    /// Issues an authenticated `GET` and returns the decoded JSON body.
    fn get_json(
        &self,
        segments: &[&str],
        resource: &str,
        api_version: &str,
    ) -> Result<Value, AzureError> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|()| AzureError::InvalidEndpoint(self.endpoint.to_string()))?
            .pop_if_empty()
            .extend(segments);
        url.query_pairs_mut().append_pair("api-version", api_version);
        let token = self.token.token()?;
        let response = self
            .client
            .get(url.clone())
            .bearer_auth(token)
            .header(ACCEPT, "application/json")
            .send()
            .map_err(|err| AzureError::Transport {
                url: url_without_query(&url),
                message: err.to_string(),
            })?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(AzureError::NotFound(resource.to_string()));
        }
        let body = read_body(response, resource)?;
        if !status.is_success() {
            return Err(AzureError::Api {
                status: status.as_u16(),
                resource: resource.to_string(),
                message: arm_error_summary(&body),
            });
        }
        decode_json(&body, resource)
    }
}

impl ResourceInspector for ArmClient {
    fn sql_server(&self, server: &SqlServerRef) -> Result<SqlServer, AzureError> {
        let resource = server.resource_path();
        self.sink.record(&HarnessEvent::new(
            "arm_lookup",
            Phase::Assert,
            "sql_server",
            Outcome::Started,
        ));
        let result =
            self.get_json(&server.segments(), &resource, SQL_SERVER_API_VERSION).and_then(|body| {
                serde_json::from_value::<SqlServer>(body).map_err(|err| AzureError::Decode {
                    resource: resource.clone(),
                    message: err.to_string(),
                })
            });
        let event = match &result {
            Ok(_) => HarnessEvent::new("arm_lookup", Phase::Assert, "sql_server", Outcome::Ok)
                .with_detail(resource),
            Err(err) => {
                HarnessEvent::new("arm_lookup", Phase::Assert, "sql_server", Outcome::Failed)
                    .with_detail(err.to_string())
            }
        };
        self.sink.record(&event);
        result
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Parses a base URL, requiring an http(s) scheme.
fn parse_base_url(raw: &str) -> Result<Url, AzureError> {
    let url = Url::parse(raw).map_err(|_| AzureError::InvalidEndpoint(raw.to_string()))?;
    let supported = matches!(url.scheme(), "https" | "http") && !url.cannot_be_a_base();
    if supported { Ok(url) } else { Err(AzureError::InvalidEndpoint(raw.to_string())) }
}

/// Builds the blocking HTTP client shared by ARM and token calls.
fn build_http_client() -> Result<Client, AzureError> {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .user_agent(concat!("post-deploy-harness/", env!("CARGO_PKG_VERSION")))
        .redirect(Policy::none())
        .build()
        .map_err(|err| AzureError::Transport {
            url: String::new(),
            message: format!("http client build failed: {err}"),
        })
}

/// Renders a URL without its query string.
fn url_without_query(url: &Url) -> String {
    let mut clean = url.clone();
    clean.set_query(None);
    clean.to_string()
}

/// Reads a bounded response body.
fn read_body(response: Response, resource: &str) -> Result<Vec<u8>, AzureError> {
    let decode_err = |message: String| AzureError::Decode {
        resource: resource.to_string(),
        message,
    };
    let limit = u64::try_from(MAX_RESPONSE_BYTES)
        .map_err(|_| decode_err("response size limit exceeds u64".to_string()))?;
    let mut body = Vec::new();
    response
        .take(limit.saturating_add(1))
        .read_to_end(&mut body)
        .map_err(|err| decode_err(format!("failed to read response: {err}")))?;
    if body.len() > MAX_RESPONSE_BYTES {
        return Err(decode_err("response exceeds size limit".to_string()));
    }
    Ok(body)
}

/// Decodes a response body as JSON. Empty bodies decode to `null`.
fn decode_json(body: &[u8], resource: &str) -> Result<Value, AzureError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(body).map_err(|err| AzureError::Decode {
        resource: resource.to_string(),
        message: err.to_string(),
    })
}

/// Summarizes an ARM error response, JSON or not.
fn arm_error_summary(body: &[u8]) -> String {
    match serde_json::from_slice::<Value>(body) {
        Ok(value) => parse_arm_error(&value),
        Err(_) => body_excerpt(body),
    }
}

/// Summarizes a token endpoint error response, JSON or not.
fn token_error_summary(body: &[u8]) -> String {
    let Ok(payload) = serde_json::from_slice::<Value>(body) else {
        return body_excerpt(body);
    };
    payload
        .get("error_description")
        .or_else(|| payload.get("error"))
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string()
}

/// Returns a trimmed, truncated excerpt of a non-JSON body.
fn body_excerpt(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return "empty response body".to_string();
    }
    let mut excerpt: String = trimmed.chars().take(MAX_ERROR_EXCERPT_CHARS).collect();
    if trimmed.chars().count() > MAX_ERROR_EXCERPT_CHARS {
        excerpt.push_str("...");
    }
    excerpt
}

/// Extracts `code: message` from an ARM error body.
fn parse_arm_error(body: &Value) -> String {
    let error = body.get("error").or_else(|| body.get("Error")).unwrap_or(body);
    let code = error.get("code").and_then(Value::as_str).unwrap_or("Unknown");
    let message = error.get("message").and_then(Value::as_str).unwrap_or("unknown error");
    format!("{code}: {message}")
}

// ============================================================================
// SECTION: Tests
// ============================================================================
