//! Metrics definitions for the session service.
//!
//! All metrics follow Prometheus naming conventions:
//! - `ss_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded by code:
//! - `operation`: repository operation names
//! - `status`: success, error
//! - `slot`: reminder, fill_deadline, completion
//! - `to`: session status values
//! - `outcome`: role selection outcomes
//! - `action`: reconciler actions

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize Prometheus metrics recorder and return the handle
/// for serving metrics via HTTP.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if Prometheus recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Prefix("ss_db_query".to_string()),
            &[
                0.001, 0.002, 0.005, 0.010, 0.020, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set DB query buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus recorder: {e}"))
}

// ============================================================================
// Database Metrics
// ============================================================================

/// Record database query execution.
///
/// Metric: `ss_db_query_duration_seconds`, `ss_db_queries_total`
/// Labels: `operation`, `status`
pub fn record_db_query(operation: &str, status: &str, duration: Duration) {
    histogram!("ss_db_query_duration_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());

    counter!("ss_db_queries_total",
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

// ============================================================================
// Lifecycle Metrics
// ============================================================================

/// Record a timer callback firing.
///
/// Metric: `ss_timer_fired_total`
/// Labels: `slot`
pub fn record_timer_fired(slot: &str) {
    counter!("ss_timer_fired_total", "slot" => slot.to_string()).increment(1);
}

/// Record a persisted status transition.
///
/// Metric: `ss_status_transitions_total`
/// Labels: `to`
pub fn record_transition(to: &str) {
    counter!("ss_status_transitions_total", "to" => to.to_string()).increment(1);
}

/// Record a role selection outcome.
///
/// Metric: `ss_role_selection_total`
/// Labels: `outcome`
pub fn record_role_selection(outcome: &str) {
    counter!("ss_role_selection_total", "outcome" => outcome.to_string()).increment(1);
}

/// Set the number of sessions holding live timers.
///
/// Metric: `ss_scheduled_task_sets`
pub fn set_scheduled_task_sets(count: usize) {
    gauge!("ss_scheduled_task_sets").set(count as f64);
}

/// Record one session handled by the startup reconciler.
///
/// Metric: `ss_reconciled_sessions_total`
/// Labels: `action` (scheduled, completion_timer, completed, activated, canceled, skipped, failed)
pub fn record_reconciled(action: &str) {
    counter!("ss_reconciled_sessions_total", "action" => action.to_string()).increment(1);
}
