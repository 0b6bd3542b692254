//! Observability module for the session service.
//!
//! Provides metrics definitions and recording helpers.

pub mod metrics;
