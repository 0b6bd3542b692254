//! Request bodies for the administrative API.

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};

/// A start far enough ahead that every timer is in the future.
pub fn start_in_hours(hours: i64) -> DateTime<Utc> {
    Utc::now() + Duration::hours(hours)
}

/// Body for `POST /v1/sessions`.
pub fn create_session_body(scope_id: &str, leader: &str, start: DateTime<Utc>) -> Value {
    json!({
        "scope_id": scope_id,
        "leader_user_id": leader,
        "scheduled_start": start,
    })
}

/// Body for `POST /v1/sessions/{id}/roles`.
pub fn select_role_body(user_id: &str, role: &str) -> Value {
    json!({
        "user_id": user_id,
        "role": role,
    })
}
