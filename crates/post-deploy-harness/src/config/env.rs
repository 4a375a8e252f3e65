// crates/post-deploy-harness/src/config/env.rs
// ============================================================================
// Module: Harness Environment
// Description: Environment-backed configuration for post-deploy test runs.
// Purpose: Centralize env parsing with strict UTF-8 validation.
// Dependencies: std, thiserror
// ============================================================================

//! ## Overview
//! Environment values are parsed with strict UTF-8 enforcement to avoid silent
//! misconfiguration. Invalid UTF-8 fails closed. The Azure subscription is a
//! required input: a run never falls back to an implicit default.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

// ============================================================================
// SECTION: Environment Constants
// ============================================================================

/// Environment keys for harness configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarnessEnv {
    /// Required Azure subscription identifier.
    SubscriptionId,
    /// Optional Entra ID tenant identifier.
    TenantId,
    /// Optional service principal client identifier.
    ClientId,
    /// Optional service principal client secret.
    ClientSecret,
    /// Optional Terraform module root override.
    ModuleDir,
    /// Optional variable file override.
    VarFile,
    /// Optional Terraform binary override.
    TerraformBinary,
    /// Optional Azure Resource Manager base URL override.
    ArmEndpoint,
    /// Optional Entra ID login base URL override.
    LoginEndpoint,
    /// Optional JSON-lines event log path.
    EventLog,
    /// Optional retry budget for retryable Terraform errors.
    MaxRetries,
}

impl HarnessEnv {
    /// Every recognized key, in declaration order.
    pub const ALL: [Self; 11] = [
        Self::SubscriptionId,
        Self::TenantId,
        Self::ClientId,
        Self::ClientSecret,
        Self::ModuleDir,
        Self::VarFile,
        Self::TerraformBinary,
        Self::ArmEndpoint,
        Self::LoginEndpoint,
        Self::EventLog,
        Self::MaxRetries,
    ];

    /// Returns the canonical environment variable name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SubscriptionId => "ARM_SUBSCRIPTION_ID",
            Self::TenantId => "ARM_TENANT_ID",
            Self::ClientId => "ARM_CLIENT_ID",
            Self::ClientSecret => "ARM_CLIENT_SECRET",
            Self::ModuleDir => "SQLSERVER_FUNCTEST_MODULE_DIR",
            Self::VarFile => "SQLSERVER_FUNCTEST_VAR_FILE",
            Self::TerraformBinary => "SQLSERVER_FUNCTEST_TERRAFORM_BIN",
            Self::ArmEndpoint => "SQLSERVER_FUNCTEST_ARM_ENDPOINT",
            Self::LoginEndpoint => "SQLSERVER_FUNCTEST_LOGIN_ENDPOINT",
            Self::EventLog => "SQLSERVER_FUNCTEST_EVENT_LOG",
            Self::MaxRetries => "SQLSERVER_FUNCTEST_MAX_RETRIES",
        }
    }
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Configuration loading errors.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A required variable is not set.
    #[error("{0} must be set")]
    Missing(&'static str),
    /// A variable is set but empty or whitespace.
    #[error("{0} must not be empty")]
    Empty(&'static str),
    /// A variable is not valid UTF-8.
    #[error("{0} must be valid UTF-8")]
    InvalidUtf8(&'static str),
    /// A variable failed value validation.
    #[error("{name} {reason}")]
    Invalid {
        /// Variable name.
        name: &'static str,
        /// Validation failure description.
        reason: String,
    },
}

// ============================================================================
// SECTION: Config Types
// ============================================================================

/// Service principal credentials for client-credentials token requests.
#[derive(Clone, PartialEq, Eq)]
pub struct ServicePrincipal {
    /// Entra ID tenant identifier.
    pub tenant_id: String,
    /// Application (client) identifier.
    pub client_id: String,
    /// Client secret.
    pub client_secret: String,
}

impl fmt::Debug for ServicePrincipal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServicePrincipal")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

/// Typed harness configuration derived from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessConfig {
    /// Azure subscription that owns the provisioned resources.
    pub subscription_id: String,
    /// Optional tenant used for CLI token requests.
    pub tenant_id: Option<String>,
    /// Optional service principal credentials.
    pub service_principal: Option<ServicePrincipal>,
    /// Optional Terraform module root override.
    pub module_dir: Option<PathBuf>,
    /// Optional variable file override.
    pub var_file: Option<PathBuf>,
    /// Optional Terraform binary override.
    pub terraform_binary: Option<PathBuf>,
    /// Optional ARM base URL override.
    pub arm_endpoint: Option<String>,
    /// Optional login base URL override.
    pub login_endpoint: Option<String>,
    /// Optional JSON-lines event log path.
    pub event_log: Option<PathBuf>,
    /// Optional retry budget override.
    pub max_retries: Option<u32>,
}

impl HarnessConfig {
    /// Creates a configuration with only the required subscription set.
    #[must_use]
    pub fn new(subscription_id: impl Into<String>) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            tenant_id: None,
            service_principal: None,
            module_dir: None,
            var_file: None,
            terraform_binary: None,
            arm_endpoint: None,
            login_endpoint: None,
            event_log: None,
            max_retries: None,
        }
    }

    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the subscription is missing, a value is not
    /// valid UTF-8 or empty, service principal settings are incomplete, or the
    /// retry budget is not a non-negative integer.
    pub fn load() -> Result<Self, ConfigError> {
        let subscription_id = read_env_nonempty(HarnessEnv::SubscriptionId)?
            .ok_or(ConfigError::Missing(HarnessEnv::SubscriptionId.as_str()))?;
        let tenant_id = read_env_nonempty(HarnessEnv::TenantId)?;
        let client_id = read_env_nonempty(HarnessEnv::ClientId)?;
        let client_secret = read_env_nonempty(HarnessEnv::ClientSecret)?;
        let service_principal = match (client_id, client_secret) {
            (Some(client_id), Some(client_secret)) => {
                let tenant_id = tenant_id
                    .clone()
                    .ok_or(ConfigError::Missing(HarnessEnv::TenantId.as_str()))?;
                Some(ServicePrincipal {
                    tenant_id,
                    client_id,
                    client_secret,
                })
            }
            (None, None) => None,
            (Some(_), None) => {
                return Err(ConfigError::Missing(HarnessEnv::ClientSecret.as_str()));
            }
            (None, Some(_)) => return Err(ConfigError::Missing(HarnessEnv::ClientId.as_str())),
        };
        let max_retries = read_env_nonempty(HarnessEnv::MaxRetries)?
            .map(|value| parse_retries(HarnessEnv::MaxRetries.as_str(), &value))
            .transpose()?;
        Ok(Self {
            subscription_id,
            tenant_id,
            service_principal,
            module_dir: read_env_nonempty(HarnessEnv::ModuleDir)?.map(PathBuf::from),
            var_file: read_env_nonempty(HarnessEnv::VarFile)?.map(PathBuf::from),
            terraform_binary: read_env_nonempty(HarnessEnv::TerraformBinary)?.map(PathBuf::from),
            arm_endpoint: read_env_nonempty(HarnessEnv::ArmEndpoint)?,
            login_endpoint: read_env_nonempty(HarnessEnv::LoginEndpoint)?,
            event_log: read_env_nonempty(HarnessEnv::EventLog)?.map(PathBuf::from),
            max_retries,
        })
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Reads an environment variable and enforces UTF-8 validity.
///
/// # Errors
///
/// Returns an error when the environment variable contains invalid UTF-8.
pub fn read_env_strict(key: HarnessEnv) -> Result<Option<String>, ConfigError> {
    std::env::var_os(key.as_str()).map_or(Ok(None), |raw| {
        raw.into_string().map(Some).map_err(|_| ConfigError::InvalidUtf8(key.as_str()))
    })
}

/// Reads an environment variable and rejects empty values.
///
/// # Errors
///
/// Returns an error when the variable is set but empty or whitespace.
fn read_env_nonempty(key: HarnessEnv) -> Result<Option<String>, ConfigError> {
    match read_env_strict(key)? {
        Some(value) if value.trim().is_empty() => Err(ConfigError::Empty(key.as_str())),
        Some(value) => Ok(Some(value.trim().to_string())),
        None => Ok(None),
    }
}

/// Parses a non-negative retry count.
///
/// # Errors
///
/// Returns an error when the value is not a non-negative integer.
fn parse_retries(name: &'static str, raw: &str) -> Result<u32, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::Invalid {
        name,
        reason: "must be a non-negative integer".to_string(),
    })
}
