//! HTTP routes for the session service.
//!
//! Defines the Axum router and application state.

use crate::config::Config;
use crate::handlers;
use crate::scheduler::SessionScheduler;
use crate::services::SessionService;
use axum::{
    routing::{delete, get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub pool: PgPool,

    /// Service configuration.
    pub config: Config,

    /// Timer registry, for health and introspection.
    pub scheduler: SessionScheduler,

    /// Command path for session administration.
    pub sessions: Arc<SessionService>,
}

/// Build the application routes.
///
/// Creates an Axum router with:
/// - `/v1/health` - DB ping and live timer count
/// - `/metrics` - Prometheus metrics endpoint
/// - `/v1/scheduler/tasks` - number of sessions holding timers
/// - `/v1/sessions` and `/v1/sessions/:id/...` - session administration
/// - TraceLayer for request logging
/// - 30 second request timeout
pub fn build_routes(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let api_routes = Router::new()
        .route("/v1/health", get(handlers::health_check))
        .route("/v1/scheduler/tasks", get(handlers::scheduled_tasks))
        .route("/v1/sessions", post(handlers::create_session))
        .route(
            "/v1/sessions/:id",
            get(handlers::get_session).patch(handlers::reschedule_session),
        )
        .route("/v1/sessions/:id/cancel", post(handlers::cancel_session))
        .route("/v1/sessions/:id/end", post(handlers::end_session))
        .route("/v1/sessions/:id/roles", post(handlers::select_role))
        .route(
            "/v1/sessions/:id/members/:user_id",
            delete(handlers::remove_member),
        )
        .with_state(state);

    // Metrics route with its own state
    let metrics_routes = Router::new()
        .route("/metrics", get(handlers::metrics_handler))
        .with_state(metrics_handle);

    api_routes
        .merge(metrics_routes)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
}
