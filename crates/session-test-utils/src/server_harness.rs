//! Test server harness for E2E testing
//!
//! Provides `TestSessionServer` for spawning real session service instances
//! in tests, wired to recording collaborators instead of the webhook and
//! calendar services.

use metrics_exporter_prometheus::PrometheusBuilder;
use session_service::config::Config;
use session_service::routes::{self, AppState};
use session_service::scheduler::SessionScheduler;
use session_service::services::event_sync::mock::RecordingEventSync;
use session_service::services::notifier::mock::RecordingNotifier;
use session_service::services::{
    LifecycleActions, PgSessionStore, RoleSelectionEngine, SessionLifecycle, SessionService,
    SessionStore,
};
use sqlx::PgPool;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Test harness for spawning the session service in E2E tests.
///
/// # Example
/// ```rust,ignore
/// #[sqlx::test(migrations = "../../migrations")]
/// async fn test_create_flow(pool: PgPool) -> Result<()> {
///     let server = TestSessionServer::spawn(pool).await?;
///
///     let response = server
///         .client()
///         .post(format!("{}/v1/sessions", server.url()))
///         .json(&create_session_body("guild", "lead", start_in_hours(24)))
///         .send()
///         .await?;
///
///     assert_eq!(response.status(), 201);
///     Ok(())
/// }
/// ```
pub struct TestSessionServer {
    addr: SocketAddr,
    pool: PgPool,
    scheduler: SessionScheduler,
    notifier: Arc<RecordingNotifier>,
    events: Arc<RecordingEventSync>,
    client: reqwest::Client,
    _handle: JoinHandle<()>,
}

impl TestSessionServer {
    /// Spawn a new test server instance with isolated database.
    ///
    /// The server will:
    /// - Bind to a random available port (127.0.0.1:0)
    /// - Start the HTTP server in the background
    ///
    /// No global metrics recorder is installed, so any number of servers
    /// can run in one test binary.
    pub async fn spawn(pool: PgPool) -> Result<Self, anyhow::Error> {
        let vars = HashMap::from([
            (
                "DATABASE_URL".to_string(),
                "postgresql://test/test".to_string(),
            ),
            ("BIND_ADDRESS".to_string(), "127.0.0.1:0".to_string()),
            ("SS_DRAIN_SECONDS".to_string(), "0".to_string()),
        ]);

        let config = Config::from_vars(&vars)
            .map_err(|e| anyhow::anyhow!("Failed to create config: {}", e))?;

        let notifier = Arc::new(RecordingNotifier::new());
        let events = Arc::new(RecordingEventSync::new());

        let store: Arc<dyn SessionStore> = Arc::new(PgSessionStore::new(pool.clone()));
        let lifecycle: Arc<dyn LifecycleActions> = Arc::new(SessionLifecycle::new(
            store.clone(),
            notifier.clone(),
            events.clone(),
        ));
        let scheduler = SessionScheduler::new(
            store.clone(),
            lifecycle.clone(),
            notifier.clone(),
            config.default_timezone,
        );
        let roles =
            RoleSelectionEngine::new(store.clone(), lifecycle.clone(), config.default_timezone);
        let sessions = Arc::new(SessionService::new(
            store,
            lifecycle,
            scheduler.clone(),
            events.clone(),
            roles,
        ));

        let state = Arc::new(AppState {
            pool: pool.clone(),
            config,
            scheduler: scheduler.clone(),
            sessions,
        });

        let metrics_handle = PrometheusBuilder::new().build_recorder().handle();
        let app = routes::build_routes(state, metrics_handle);

        // Bind to random port
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind test server: {}", e))?;

        let addr = listener
            .local_addr()
            .map_err(|e| anyhow::anyhow!("Failed to get local address: {}", e))?;

        let handle = tokio::spawn(async move {
            let make_service = app.into_make_service_with_connect_info::<SocketAddr>();
            if let Err(e) = axum::serve(listener, make_service).await {
                eprintln!("Test server error: {}", e);
            }
        });

        Ok(Self {
            addr,
            pool,
            scheduler,
            notifier,
            events,
            client: reqwest::Client::new(),
            _handle: handle,
        })
    }

    /// Get reference to the database pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Get the base URL of the test server.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Get the socket address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Shared HTTP client.
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// The server's timer registry.
    pub fn scheduler(&self) -> &SessionScheduler {
        &self.scheduler
    }

    /// Notifications and published sessions recorded by the server.
    pub fn notifier(&self) -> &RecordingNotifier {
        &self.notifier
    }

    /// External event calls recorded by the server.
    pub fn events(&self) -> &RecordingEventSync {
        &self.events
    }
}

impl Drop for TestSessionServer {
    fn drop(&mut self) {
        // Abort the HTTP server task and drop live timers
        self._handle.abort();
        let scheduler = self.scheduler.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move { scheduler.shutdown().await });
        }
    }
}
