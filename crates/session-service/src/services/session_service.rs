//! Session command path.
//!
//! Composes the store, lifecycle actions, scheduler and event sync so that
//! persisted status and in-memory timers stay consistent for every
//! externally triggered change.

use crate::errors::SessionError;
use crate::models::{NewSession, Role, SelectionOutcome, Session, SessionWithRoster};
use crate::scheduler::SessionScheduler;
use crate::services::event_sync::EventSync;
use crate::services::lifecycle_actions::{LifecycleActions, TransitionResult};
use crate::services::role_selection::{RoleRequest, RoleSelectionEngine};
use crate::services::session_store::SessionStore;
use crate::time::{self, SessionTimeline};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Reason recorded for a manual cancel without one.
pub const DEFAULT_CANCEL_REASON: &str = "Canceled by organizer";

pub struct SessionService {
    store: Arc<dyn SessionStore>,
    lifecycle: Arc<dyn LifecycleActions>,
    scheduler: SessionScheduler,
    events: Arc<dyn EventSync>,
    roles: RoleSelectionEngine,
}

/// Result of a manual lifecycle command.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub changed: bool,
    pub session: Session,
}

impl SessionService {
    pub fn new(
        store: Arc<dyn SessionStore>,
        lifecycle: Arc<dyn LifecycleActions>,
        scheduler: SessionScheduler,
        events: Arc<dyn EventSync>,
        roles: RoleSelectionEngine,
    ) -> Self {
        Self {
            store,
            lifecycle,
            scheduler,
            events,
            roles,
        }
    }

    /// Create a session with its leader and install its timers.
    ///
    /// # Errors
    ///
    /// - `SessionError::BadRequest` if the fill-deadline is not in the future
    /// - `SessionError::Database` on persistence failure
    #[instrument(skip_all, fields(scope_id = %new.scope_id))]
    pub async fn create_session(
        &self,
        new: NewSession,
        now: DateTime<Utc>,
    ) -> Result<SessionWithRoster, SessionError> {
        ensure_schedulable(new.scheduled_start, now)?;

        let mut created = self.store.create_session(&new).await?;
        let session_id = created.session.session_id;

        match self.events.create_event(&created.session).await {
            Ok(Some(event_ref)) => {
                let stored = self
                    .store
                    .set_external_event_ref(session_id, Some(&event_ref))
                    .await;
                match stored {
                    Ok(()) => created.session.external_event_ref = Some(event_ref),
                    Err(e) => warn!(
                        target: "ss.services.sessions",
                        session_id = %session_id,
                        error = %e,
                        "Failed to store external event reference"
                    ),
                }
            }
            Ok(None) => {}
            Err(e) => warn!(
                target: "ss.services.sessions",
                session_id = %session_id,
                error = %e,
                "External event creation failed"
            ),
        }

        self.scheduler
            .schedule_session_tasks(session_id, created.session.scheduled_start)
            .await;
        self.lifecycle.regenerate(session_id).await;

        info!(
            target: "ss.services.sessions",
            session_id = %session_id,
            scheduled_start = %created.session.scheduled_start,
            "Session created"
        );
        Ok(created)
    }

    /// Move an open session to a new start and reinstall its timers.
    ///
    /// # Errors
    ///
    /// - `SessionError::NotFound` if the session does not exist
    /// - `SessionError::Conflict` if the session is no longer open
    /// - `SessionError::BadRequest` if the new fill-deadline is not in the future
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn reschedule_session(
        &self,
        session_id: Uuid,
        scheduled_start: DateTime<Utc>,
        timezone: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Session, SessionError> {
        ensure_schedulable(scheduled_start, now)?;

        let Some(session) = self
            .store
            .update_schedule(session_id, scheduled_start, timezone)
            .await?
        else {
            return Err(match self.store.get_session(session_id).await? {
                None => SessionError::NotFound("Session not found".to_string()),
                Some(existing) => SessionError::Conflict(format!(
                    "Session is {} and can no longer be rescheduled",
                    existing.status
                )),
            });
        };

        self.scheduler
            .schedule_session_tasks(session_id, session.scheduled_start)
            .await;

        if let Some(event_ref) = session.external_event_ref.as_deref() {
            if let Err(e) = self.events.update_event(event_ref, &session).await {
                warn!(
                    target: "ss.services.sessions",
                    session_id = %session_id,
                    error = %e,
                    "External event update failed"
                );
            }
        }
        self.lifecycle.regenerate(session_id).await;

        info!(
            target: "ss.services.sessions",
            session_id = %session_id,
            scheduled_start = %session.scheduled_start,
            "Session rescheduled"
        );
        Ok(session)
    }

    /// Cancel a session manually and drop its timers.
    ///
    /// Cancelling a terminal session is a no-op reported as `changed: false`.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn cancel_session(
        &self,
        session_id: Uuid,
        reason: Option<&str>,
    ) -> Result<CommandResult, SessionError> {
        let reason = reason
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or(DEFAULT_CANCEL_REASON);

        let result = self.lifecycle.cancel(session_id, Some(reason)).await?;
        self.finish_command(session_id, result).await
    }

    /// End an active session manually and drop its timers.
    ///
    /// # Errors
    ///
    /// - `SessionError::Conflict` if the session is open but not yet active
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn end_session(&self, session_id: Uuid) -> Result<CommandResult, SessionError> {
        let result = self.lifecycle.end(session_id).await?;
        if let TransitionResult::Skipped = result {
            if let Some(existing) = self.store.get_session(session_id).await? {
                if !existing.status.is_terminal() {
                    return Err(SessionError::Conflict(format!(
                        "Session is {} and cannot be ended before it is active",
                        existing.status
                    )));
                }
            }
        }
        self.finish_command(session_id, result).await
    }

    async fn finish_command(
        &self,
        session_id: Uuid,
        result: TransitionResult,
    ) -> Result<CommandResult, SessionError> {
        match result {
            TransitionResult::Applied(session) => {
                self.scheduler.cancel_session_tasks(session_id).await;
                Ok(CommandResult {
                    changed: true,
                    session,
                })
            }
            TransitionResult::Skipped => {
                let session = self
                    .store
                    .get_session(session_id)
                    .await?
                    .ok_or_else(|| SessionError::NotFound("Session not found".to_string()))?;
                Ok(CommandResult {
                    changed: false,
                    session,
                })
            }
        }
    }

    /// Join, change or leave a role.
    pub async fn select_role(
        &self,
        session_id: Uuid,
        user_id: &str,
        role: Role,
        timezone: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(SelectionOutcome, SessionWithRoster), SessionError> {
        let request = RoleRequest {
            user_id: user_id.to_string(),
            role,
            timezone,
        };
        let outcome = self.roles.select(session_id, &request, now).await?;
        let view = self.get_session(session_id).await?;
        Ok((outcome, view))
    }

    /// Remove an ordinary member administratively.
    ///
    /// The session keeps its status; a `FULL` session that loses a member
    /// is re-evaluated at the fill-deadline.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn remove_member(
        &self,
        session_id: Uuid,
        user_id: &str,
    ) -> Result<SessionWithRoster, SessionError> {
        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| SessionError::NotFound("Session not found".to_string()))?;
        if session.status.is_terminal() {
            return Err(SessionError::Conflict(format!(
                "Session is {}",
                session.status
            )));
        }

        if !self.store.remove_member(session_id, user_id).await? {
            return Err(SessionError::NotFound(
                "Member not found or is the session leader".to_string(),
            ));
        }

        info!(target: "ss.services.sessions", session_id = %session_id, "Member removed");
        self.lifecycle.regenerate(session_id).await;
        self.get_session(session_id).await
    }

    pub async fn get_session(&self, session_id: Uuid) -> Result<SessionWithRoster, SessionError> {
        self.store
            .get_session_with_roster(session_id)
            .await?
            .ok_or_else(|| SessionError::NotFound("Session not found".to_string()))
    }

    pub fn scheduler(&self) -> &SessionScheduler {
        &self.scheduler
    }
}

/// A start is schedulable when its fill-deadline is still ahead.
fn ensure_schedulable(start: DateTime<Utc>, now: DateTime<Utc>) -> Result<(), SessionError> {
    let timeline = SessionTimeline::for_start(start);
    if time::is_future(timeline.fill_deadline_at, now) {
        Ok(())
    } else {
        Err(SessionError::BadRequest(format!(
            "scheduled_start must be more than {} minutes in the future",
            time::FILL_DEADLINE_LEAD_MINUTES
        )))
    }
}
