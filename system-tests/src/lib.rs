// system-tests/src/lib.rs
// ============================================================================
// Module: SQL Server System Tests Library
// Description: Shared configuration for the live functional test binary.
// Purpose: Provide run-root settings for system-test artifacts.
// Dependencies: std
// ============================================================================

//! ## Overview
//! This crate hosts configuration used by the feature-gated functional test
//! binary in `system-tests/tests`, which provisions real Azure resources.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod config;
