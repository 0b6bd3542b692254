//! Scheduler introspection.

use crate::models::ScheduledTasksResponse;
use crate::routes::AppState;
use axum::extract::State;
use axum::Json;
use std::sync::Arc;

/// Handler for GET /v1/scheduler/tasks
#[tracing::instrument(skip_all, name = "ss.scheduler.tasks")]
pub async fn scheduled_tasks(State(state): State<Arc<AppState>>) -> Json<ScheduledTasksResponse> {
    Json(ScheduledTasksResponse {
        scheduled_task_sets: state.scheduler.scheduled_task_count().await,
    })
}
