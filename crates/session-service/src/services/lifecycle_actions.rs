//! Persisted lifecycle transitions.
//!
//! [`LifecycleActions`] is the narrow seam through which timer callbacks and
//! the manual command path change session status. Each applied transition
//! syncs the external event and republishes the session; both are
//! best-effort. Timer bookkeeping stays with the caller.

use crate::errors::SessionError;
use crate::lifecycle::sources_for;
use crate::models::{Session, SessionStatus};
use crate::observability::metrics;
use crate::services::event_sync::EventSync;
use crate::services::notifier::Notifier;
use crate::services::session_store::SessionStore;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Result of a conditional transition.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionResult {
    /// The status changed; holds the updated session.
    Applied(Session),

    /// The session was missing or not in a legal source state.
    Skipped,
}

impl TransitionResult {
    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionResult::Applied(_))
    }
}

#[async_trait]
pub trait LifecycleActions: Send + Sync {
    /// `SCHEDULED | FULL -> ACTIVE`.
    async fn activate(&self, session_id: Uuid) -> Result<TransitionResult, SessionError>;

    /// Any non-terminal status `-> CANCELED`.
    async fn cancel(
        &self,
        session_id: Uuid,
        reason: Option<&str>,
    ) -> Result<TransitionResult, SessionError>;

    /// `ACTIVE -> COMPLETED`.
    async fn end(&self, session_id: Uuid) -> Result<TransitionResult, SessionError>;

    /// `SCHEDULED -> FULL`.
    async fn mark_full(&self, session_id: Uuid) -> Result<TransitionResult, SessionError>;

    /// Republish the session representation. Never fails.
    async fn regenerate(&self, session_id: Uuid);
}

/// Store-backed lifecycle actions.
pub struct SessionLifecycle {
    store: Arc<dyn SessionStore>,
    notifier: Arc<dyn Notifier>,
    events: Arc<dyn EventSync>,
}

impl SessionLifecycle {
    pub fn new(
        store: Arc<dyn SessionStore>,
        notifier: Arc<dyn Notifier>,
        events: Arc<dyn EventSync>,
    ) -> Self {
        Self {
            store,
            notifier,
            events,
        }
    }

    async fn transition(
        &self,
        session_id: Uuid,
        to: SessionStatus,
        reason: Option<&str>,
    ) -> Result<TransitionResult, SessionError> {
        let from = sources_for(to);

        let updated = self
            .store
            .transition_status(session_id, &from, to, reason)
            .await
            .map_err(|e| {
                error!(
                    target: "ss.lifecycle",
                    session_id = %session_id,
                    to = %to,
                    error = %e,
                    "Failed to persist status transition"
                );
                e
            })?;

        let Some(session) = updated else {
            debug!(
                target: "ss.lifecycle",
                session_id = %session_id,
                to = %to,
                "Transition skipped, session missing or not in a source state"
            );
            return Ok(TransitionResult::Skipped);
        };

        metrics::record_transition(to.as_str());
        info!(
            target: "ss.lifecycle",
            session_id = %session_id,
            to = %to,
            reason = reason.unwrap_or(""),
            "Session status changed"
        );

        self.sync_event(&session).await;
        self.regenerate(session_id).await;

        Ok(TransitionResult::Applied(session))
    }

    async fn sync_event(&self, session: &Session) {
        let Some(event_ref) = session.external_event_ref.as_deref() else {
            return;
        };

        let result = match session.status {
            SessionStatus::Canceled => self.events.delete_event(event_ref).await,
            _ => self.events.update_event(event_ref, session).await,
        };

        if let Err(e) = result {
            warn!(
                target: "ss.lifecycle",
                session_id = %session.session_id,
                error = %e,
                "External event sync failed"
            );
        }
    }
}

#[async_trait]
impl LifecycleActions for SessionLifecycle {
    #[instrument(skip_all, fields(session_id = %session_id))]
    async fn activate(&self, session_id: Uuid) -> Result<TransitionResult, SessionError> {
        self.transition(session_id, SessionStatus::Active, None).await
    }

    #[instrument(skip_all, fields(session_id = %session_id))]
    async fn cancel(
        &self,
        session_id: Uuid,
        reason: Option<&str>,
    ) -> Result<TransitionResult, SessionError> {
        self.transition(session_id, SessionStatus::Canceled, reason)
            .await
    }

    #[instrument(skip_all, fields(session_id = %session_id))]
    async fn end(&self, session_id: Uuid) -> Result<TransitionResult, SessionError> {
        self.transition(session_id, SessionStatus::Completed, None)
            .await
    }

    #[instrument(skip_all, fields(session_id = %session_id))]
    async fn mark_full(&self, session_id: Uuid) -> Result<TransitionResult, SessionError> {
        self.transition(session_id, SessionStatus::Full, None).await
    }

    async fn regenerate(&self, session_id: Uuid) {
        let view = match self.store.get_session_with_roster(session_id).await {
            Ok(Some(view)) => view,
            Ok(None) => return,
            Err(e) => {
                warn!(
                    target: "ss.lifecycle",
                    session_id = %session_id,
                    error = %e,
                    "Failed to load session for publishing"
                );
                return;
            }
        };

        if let Err(e) = self.notifier.publish_session(&view).await {
            warn!(
                target: "ss.lifecycle",
                session_id = %session_id,
                error = %e,
                "Failed to publish session"
            );
        }
    }
}
