//! Repository layer for the session service.
//!
//! Database access follows the Handler -> Service -> Repository layering.
//! Every query records `ss_db_query*` metrics.

pub mod roster;
pub mod sessions;

pub use roster::RosterRepository;
pub use sessions::SessionsRepository;

use crate::errors::SessionError;
use crate::observability::metrics;
use std::time::Instant;

/// Record query metrics for `operation` and convert the sqlx error.
fn observe<T>(
    operation: &str,
    start: Instant,
    result: Result<T, sqlx::Error>,
) -> Result<T, SessionError> {
    let status = if result.is_ok() { "success" } else { "error" };
    metrics::record_db_query(operation, status, start.elapsed());
    Ok(result?)
}
