//! Health check handler.

use crate::errors::SessionError;
use crate::models::HealthResponse;
use crate::routes::AppState;
use axum::extract::State;
use axum::Json;
use std::sync::Arc;
use tracing::instrument;

/// Handler for GET /v1/health
///
/// Pings the database and reports how many sessions hold live timers.
/// An unreachable database is reported in the body, not as an error status.
///
/// ```json
/// {
///   "status": "healthy",
///   "database": "healthy",
///   "scheduled_task_sets": 4
/// }
/// ```
#[instrument(skip_all, name = "ss.health.check")]
pub async fn health_check(
    State(state): State<Arc<AppState>>,
) -> Result<Json<HealthResponse>, SessionError> {
    let db_healthy = sqlx::query("SELECT 1").fetch_one(&state.pool).await.is_ok();
    let scheduled_task_sets = state.scheduler.scheduled_task_count().await;

    let (status, database) = if db_healthy {
        ("healthy", "healthy")
    } else {
        ("unhealthy", "unhealthy")
    };

    Ok(Json(HealthResponse {
        status: status.to_string(),
        database: Some(database.to_string()),
        scheduled_task_sets,
    }))
}
