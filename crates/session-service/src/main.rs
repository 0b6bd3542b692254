//! Session Service
//!
//! Entry point for the session lifecycle scheduler. Reconciles persisted
//! sessions, then serves the administrative API until shutdown.

use session_service::config::Config;
use session_service::observability::metrics::init_metrics_recorder;
use session_service::routes::{self, AppState};
use session_service::scheduler::SessionScheduler;
use session_service::services::{
    DisabledEventSync, EventSync, HttpEventSync, LifecycleActions, LogNotifier, Notifier,
    PgSessionStore, RoleSelectionEngine, SessionLifecycle, SessionService, SessionStore,
    WebhookNotifier,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "session_service=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Session Service");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        bind_address = %config.bind_address,
        default_timezone = %config.default_timezone.name(),
        notifier_webhook = config.notifier_webhook_url.is_some(),
        event_sync = config.event_sync_url.is_some(),
        "Configuration loaded successfully"
    );

    let metrics_handle = init_metrics_recorder().map_err(|e| {
        error!("Failed to initialize metrics recorder: {}", e);
        e
    })?;

    // Initialize database connection pool with query timeout
    info!("Connecting to database...");
    let db_url_with_timeout = add_query_timeout(&config.database_url, 5);
    let db_pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(&db_url_with_timeout)
        .await
        .map_err(|e| {
            error!("Failed to connect to database: {}", e);
            e
        })?;

    sqlx::migrate!("../../migrations")
        .run(&db_pool)
        .await
        .map_err(|e| {
            error!("Failed to run migrations: {}", e);
            e
        })?;

    info!("Database connection established");

    // Collaborators
    let notifier: Arc<dyn Notifier> = match &config.notifier_webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(
            url.clone(),
            config.notifier_webhook_token.clone(),
        )?),
        None => {
            warn!("NOTIFIER_WEBHOOK_URL not set, notifications will only be logged");
            Arc::new(LogNotifier)
        }
    };
    let events: Arc<dyn EventSync> = match &config.event_sync_url {
        Some(url) => Arc::new(HttpEventSync::new(url.clone())?),
        None => Arc::new(DisabledEventSync),
    };

    let store: Arc<dyn SessionStore> = Arc::new(PgSessionStore::new(db_pool.clone()));
    let lifecycle: Arc<dyn LifecycleActions> = Arc::new(SessionLifecycle::new(
        store.clone(),
        notifier.clone(),
        events.clone(),
    ));
    let scheduler = SessionScheduler::new(
        store.clone(),
        lifecycle.clone(),
        notifier,
        config.default_timezone,
    );
    let roles = RoleSelectionEngine::new(store.clone(), lifecycle.clone(), config.default_timezone);
    let sessions = Arc::new(SessionService::new(
        store,
        lifecycle,
        scheduler.clone(),
        events,
        roles,
    ));

    // Replay timers missed while the process was down
    let summary = scheduler.initialize_existing_sessions().await.map_err(|e| {
        error!("Failed to reconcile existing sessions: {}", e);
        e
    })?;
    info!(
        loaded = summary.loaded,
        scheduled = summary.scheduled,
        failed = summary.failed,
        "Existing sessions reconciled"
    );

    let bind_address = config.bind_address.clone();
    let drain_seconds = config.drain_seconds;

    let state = Arc::new(AppState {
        pool: db_pool,
        config,
        scheduler: scheduler.clone(),
        sessions,
    });

    let app = routes::build_routes(state, metrics_handle);

    let addr: SocketAddr = bind_address.parse().map_err(|e| {
        error!("Invalid bind address: {}", e);
        e
    })?;

    info!("Session Service listening on {}", addr);

    // Start server with graceful shutdown support
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(drain_seconds))
    .await?;

    scheduler.shutdown().await;

    info!("Session Service shutdown complete");

    Ok(())
}

/// Listens for shutdown signals (SIGTERM, SIGINT).
/// Returns when a shutdown signal is received and drain period is complete.
async fn shutdown_signal(drain_secs: u64) {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received SIGINT, starting graceful shutdown..."),
            Err(e) => error!("Failed to listen for SIGINT: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received SIGTERM, starting graceful shutdown...");
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    if drain_secs > 0 {
        warn!("Draining connections for {} seconds...", drain_secs);
        tokio::time::sleep(Duration::from_secs(drain_secs)).await;
        info!("Drain period complete");
    } else {
        info!("Skipping drain period (SS_DRAIN_SECONDS=0)");
    }
}

/// Adds statement_timeout to the database URL.
fn add_query_timeout(url: &str, timeout_secs: u32) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!(
        "{}{}options=-c%20statement_timeout%3D{}s",
        url, separator, timeout_secs
    )
}
