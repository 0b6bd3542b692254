//! Session Lifecycle Scheduler Service Library
//!
//! Runs recurring group sessions through their lifecycle:
//!
//! - Role selection with capacity-safe admission
//! - Reminder, fill-deadline and completion timers per session
//! - Startup reconciliation of timers missed while the process was down
//! - An administrative HTTP API
//!
//! # Architecture
//!
//! ```text
//! routes/mod.rs -> handlers/*.rs -> services/*.rs -> repositories/*.rs
//!                                        |
//!                                   scheduler/*.rs
//! ```
//!
//! # Modules
//!
//! - `config` - Service configuration from environment
//! - `errors` - Error types with HTTP status code mapping
//! - `lifecycle` - Pure status transition rules
//! - `scheduler` - Timer registry, timer effects and reconciliation
//! - `services` - Store seam, lifecycle actions, role selection, collaborators
//! - `time` - Timeline arithmetic and timezone helpers

pub mod config;
pub mod errors;
pub mod handlers;
pub mod lifecycle;
pub mod models;
pub mod observability;
pub mod repositories;
pub mod routes;
pub mod scheduler;
pub mod services;
pub mod time;
