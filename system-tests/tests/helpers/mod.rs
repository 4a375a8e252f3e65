// system-tests/tests/helpers/mod.rs
// ============================================================================
// Module: System Test Helpers
// Description: Shared helpers for the live SQL Server functional run.
// Purpose: Provide run context wiring and artifact utilities.
// Dependencies: system-tests, post-deploy-harness
// ============================================================================

//! ## Overview
//! Shared helpers for the live SQL Server functional run.
//! Invariants:
//! - Every run writes a summary, even when the test panics.
//! - Resources created by setup are destroyed before the test returns.

#![allow(dead_code, reason = "Shared helpers are reused across multiple test suites.")]

pub mod artifacts;
pub mod harness;
