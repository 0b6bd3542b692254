//! External calendar event synchronization.
//!
//! Best-effort: callers log and swallow every error from this module.

use crate::errors::SessionError;
use crate::models::{Session, SessionStatus};
use crate::time;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, instrument, warn};
use uuid::Uuid;

/// Default timeout for event service requests in seconds.
const EVENT_SYNC_TIMEOUT_SECS: u64 = 10;

#[async_trait]
pub trait EventSync: Send + Sync {
    /// Create an event for `session`. Returns the external reference, or
    /// `None` when sync is disabled.
    async fn create_event(&self, session: &Session) -> Result<Option<String>, SessionError>;

    async fn update_event(&self, event_ref: &str, session: &Session) -> Result<(), SessionError>;

    async fn delete_event(&self, event_ref: &str) -> Result<(), SessionError>;
}

/// Event body sent to the calendar service.
#[derive(Debug, Clone, Serialize)]
pub struct EventPayload {
    pub session_id: Uuid,
    pub scope_id: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

impl From<&Session> for EventPayload {
    fn from(session: &Session) -> Self {
        Self {
            session_id: session.session_id,
            scope_id: session.scope_id.clone(),
            starts_at: session.scheduled_start,
            ends_at: time::hours_after(session.scheduled_start, time::COMPLETION_AFTER_HOURS),
            status: session.status,
            timezone: session.timezone.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreatedEvent {
    id: String,
}

/// HTTP client for the calendar event service.
#[derive(Clone)]
pub struct HttpEventSync {
    client: Client,
    base_url: String,
}

impl HttpEventSync {
    /// # Errors
    ///
    /// Returns `SessionError::Internal` if the HTTP client cannot be built.
    pub fn new(base_url: String) -> Result<Self, SessionError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(EVENT_SYNC_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| {
                error!(target: "ss.services.event_sync", error = %e, "Failed to build HTTP client");
                SessionError::Internal(format!("failed to build event sync client: {e}"))
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn check(response: &reqwest::Response) -> Result<(), SessionError> {
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            warn!(target: "ss.services.event_sync", status = %status, "Event service rejected request");
            Err(SessionError::ServiceUnavailable(format!(
                "Event service returned {status}"
            )))
        }
    }

    fn unavailable(e: reqwest::Error) -> SessionError {
        warn!(target: "ss.services.event_sync", error = %e, "Event service request failed");
        SessionError::ServiceUnavailable("Event service is unavailable".to_string())
    }
}

#[async_trait]
impl EventSync for HttpEventSync {
    #[instrument(skip_all, fields(session_id = %session.session_id))]
    async fn create_event(&self, session: &Session) -> Result<Option<String>, SessionError> {
        let response = self
            .client
            .post(format!("{}/events", self.base_url))
            .json(&EventPayload::from(session))
            .send()
            .await
            .map_err(Self::unavailable)?;
        Self::check(&response)?;

        let created: CreatedEvent = response.json().await.map_err(|e| {
            error!(target: "ss.services.event_sync", error = %e, "Failed to parse event response");
            SessionError::Internal(format!("invalid event service response: {e}"))
        })?;
        Ok(Some(created.id))
    }

    #[instrument(skip_all, fields(session_id = %session.session_id))]
    async fn update_event(&self, event_ref: &str, session: &Session) -> Result<(), SessionError> {
        let response = self
            .client
            .put(format!("{}/events/{}", self.base_url, event_ref))
            .json(&EventPayload::from(session))
            .send()
            .await
            .map_err(Self::unavailable)?;
        Self::check(&response)
    }

    #[instrument(skip_all)]
    async fn delete_event(&self, event_ref: &str) -> Result<(), SessionError> {
        let response = self
            .client
            .delete(format!("{}/events/{}", self.base_url, event_ref))
            .send()
            .await
            .map_err(Self::unavailable)?;

        // Already gone is fine.
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check(&response)
    }
}

/// No-op sync used when no event service is configured.
#[derive(Debug, Clone, Default)]
pub struct DisabledEventSync;

#[async_trait]
impl EventSync for DisabledEventSync {
    async fn create_event(&self, _session: &Session) -> Result<Option<String>, SessionError> {
        Ok(None)
    }

    async fn update_event(&self, _event_ref: &str, _session: &Session) -> Result<(), SessionError> {
        Ok(())
    }

    async fn delete_event(&self, _event_ref: &str) -> Result<(), SessionError> {
        Ok(())
    }
}

/// Recording event sync for tests.
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum EventCall {
        Create(Uuid),
        Update(String, SessionStatus),
        Delete(String),
    }

    #[derive(Default)]
    pub struct RecordingEventSync {
        calls: Mutex<Vec<EventCall>>,
        fail: AtomicBool,
    }

    impl RecordingEventSync {
        pub fn new() -> Self {
            Self::default()
        }

        /// A sync whose every call fails.
        pub fn failing() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail: AtomicBool::new(true),
            }
        }

        pub async fn calls(&self) -> Vec<EventCall> {
            self.calls.lock().await.clone()
        }

        async fn record(&self, call: EventCall) -> Result<(), SessionError> {
            self.calls.lock().await.push(call);
            if self.fail.load(Ordering::SeqCst) {
                return Err(SessionError::ServiceUnavailable(
                    "event service down".to_string(),
                ));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl EventSync for RecordingEventSync {
        async fn create_event(&self, session: &Session) -> Result<Option<String>, SessionError> {
            self.record(EventCall::Create(session.session_id)).await?;
            Ok(Some(format!("evt-{}", session.session_id)))
        }

        async fn update_event(
            &self,
            event_ref: &str,
            session: &Session,
        ) -> Result<(), SessionError> {
            self.record(EventCall::Update(event_ref.to_string(), session.status))
                .await
        }

        async fn delete_event(&self, event_ref: &str) -> Result<(), SessionError> {
            self.record(EventCall::Delete(event_ref.to_string())).await
        }
    }
}
