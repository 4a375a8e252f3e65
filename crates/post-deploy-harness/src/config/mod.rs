// crates/post-deploy-harness/src/config/mod.rs
// ============================================================================
// Module: Harness Configuration
// Description: Centralized configuration for post-deploy functional tests.
// Purpose: Provide typed access to run settings and credentials.
// Dependencies: std, thiserror
// ============================================================================

//! ## Overview
//! Harness configuration is read from environment variables and mapped into a
//! small typed structure shared by the Terraform driver and the ARM inspector.

// ============================================================================
// SECTION: Modules
// ============================================================================

mod env;

// ============================================================================
// SECTION: Tests
// ============================================================================


// ============================================================================
// SECTION: Re-exports
// ============================================================================

pub use env::ConfigError;
pub use env::HarnessConfig;
pub use env::HarnessEnv;
pub use env::ServicePrincipal;
pub use env::read_env_strict;
