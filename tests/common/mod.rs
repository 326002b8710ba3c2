//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - A master handler wrapper with failure injection and call recording
//! - Conflict handlers that count or refuse
//! - Document and polling helpers

pub mod fixtures;
pub mod mock_master;

pub use fixtures::*;
pub use mock_master::*;
