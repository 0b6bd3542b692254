//! Startup reconciliation.
//!
//! Runs once before live traffic. Loads every non-terminal session and
//! replays whatever its timers would have done while the process was down,
//! then installs timers for what is still ahead. Missed reminders are not
//! replayed. A failure on one session is logged and does not stop the rest.

use super::effects::{self, FillDeadlineOutcome};
use super::{SessionScheduler, TimerSlot};
use crate::errors::SessionError;
use crate::models::{Session, SessionFilter, SessionStatus};
use crate::observability::metrics;
use crate::time::{self, SessionTimeline};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, instrument};

/// What the reconciler did with one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Future session: full timer set installed.
    Scheduled,
    /// Active session: only the completion timer installed.
    CompletionTimer,
    /// Completion replayed immediately.
    Completed,
    /// Fill-deadline replayed with a full roster; completion timer installed.
    Activated,
    /// Fill-deadline replayed with a short roster.
    Canceled,
    /// Nothing to do (raced with another writer).
    Skipped,
}

impl ReconcileAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileAction::Scheduled => "scheduled",
            ReconcileAction::CompletionTimer => "completion_timer",
            ReconcileAction::Completed => "completed",
            ReconcileAction::Activated => "activated",
            ReconcileAction::Canceled => "canceled",
            ReconcileAction::Skipped => "skipped",
        }
    }
}

/// Counts of reconciler actions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub loaded: usize,
    pub scheduled: usize,
    pub completion_timers: usize,
    pub completed: usize,
    pub activated: usize,
    pub canceled: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl ReconcileSummary {
    fn record(&mut self, action: ReconcileAction) {
        let counter = match action {
            ReconcileAction::Scheduled => &mut self.scheduled,
            ReconcileAction::CompletionTimer => &mut self.completion_timers,
            ReconcileAction::Completed => &mut self.completed,
            ReconcileAction::Activated => &mut self.activated,
            ReconcileAction::Canceled => &mut self.canceled,
            ReconcileAction::Skipped => &mut self.skipped,
        };
        *counter += 1;
    }
}

impl SessionScheduler {
    /// Reconcile all non-terminal sessions against the current time.
    ///
    /// # Errors
    ///
    /// Returns an error only if the session list cannot be loaded.
    #[instrument(skip_all, name = "ss.reconciler.initialize")]
    pub async fn initialize_existing_sessions(&self) -> Result<ReconcileSummary, SessionError> {
        self.reconcile_at(Utc::now()).await
    }

    pub(crate) async fn reconcile_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<ReconcileSummary, SessionError> {
        let sessions = self
            .inner
            .store
            .list_sessions(&SessionFilter::non_terminal())
            .await?;

        let mut summary = ReconcileSummary {
            loaded: sessions.len(),
            ..Default::default()
        };

        for session in &sessions {
            match self.reconcile_one(session, now).await {
                Ok(action) => {
                    metrics::record_reconciled(action.as_str());
                    summary.record(action);
                }
                Err(e) => {
                    metrics::record_reconciled("failed");
                    summary.failed += 1;
                    error!(
                        target: "ss.reconciler",
                        session_id = %session.session_id,
                        error = %e,
                        "Failed to reconcile session"
                    );
                }
            }
        }

        info!(
            target: "ss.reconciler",
            loaded = summary.loaded,
            scheduled = summary.scheduled,
            completion_timers = summary.completion_timers,
            completed = summary.completed,
            activated = summary.activated,
            canceled = summary.canceled,
            skipped = summary.skipped,
            failed = summary.failed,
            "Startup reconciliation finished"
        );

        Ok(summary)
    }

    async fn reconcile_one(
        &self,
        session: &Session,
        now: DateTime<Utc>,
    ) -> Result<ReconcileAction, SessionError> {
        let id = session.session_id;
        let timeline = SessionTimeline::for_start(session.scheduled_start);
        let open = matches!(session.status, SessionStatus::Scheduled | SessionStatus::Full);

        // Future start with the fill-deadline still ahead (or already active):
        // a normal timer set covers everything.
        if time::is_future(session.scheduled_start, now)
            && (!open || time::is_future(timeline.fill_deadline_at, now))
        {
            self.install(
                id,
                &[
                    (TimerSlot::Reminder, timeline.reminder_at),
                    (TimerSlot::FillDeadline, timeline.fill_deadline_at),
                    (TimerSlot::Completion, timeline.completion_at),
                ],
                now,
            )
            .await;
            return Ok(ReconcileAction::Scheduled);
        }

        if session.status == SessionStatus::Active {
            return self.finish_active(session, &timeline, now).await;
        }

        // Open session whose fill-deadline has passed.
        let inner = &self.inner;
        match effects::apply_fill_deadline(inner.store.as_ref(), inner.lifecycle.as_ref(), id, None)
            .await?
        {
            FillDeadlineOutcome::Activated => {
                if time::is_future(timeline.completion_at, now) {
                    self.install(id, &[(TimerSlot::Completion, timeline.completion_at)], now)
                        .await;
                    Ok(ReconcileAction::Activated)
                } else {
                    effects::apply_completion(inner.store.as_ref(), inner.lifecycle.as_ref(), id)
                        .await?;
                    Ok(ReconcileAction::Completed)
                }
            }
            FillDeadlineOutcome::Canceled { .. } => Ok(ReconcileAction::Canceled),
            FillDeadlineOutcome::Skipped => Ok(ReconcileAction::Skipped),
        }
    }

    async fn finish_active(
        &self,
        session: &Session,
        timeline: &SessionTimeline,
        now: DateTime<Utc>,
    ) -> Result<ReconcileAction, SessionError> {
        let id = session.session_id;

        if time::is_future(timeline.completion_at, now) {
            self.install(id, &[(TimerSlot::Completion, timeline.completion_at)], now)
                .await;
            return Ok(ReconcileAction::CompletionTimer);
        }

        let inner = &self.inner;
        if effects::apply_completion(inner.store.as_ref(), inner.lifecycle.as_ref(), id).await? {
            Ok(ReconcileAction::Completed)
        } else {
            Ok(ReconcileAction::Skipped)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::services::event_sync::DisabledEventSync;
    use crate::services::lifecycle_actions::SessionLifecycle;
    use crate::services::notifier::mock::RecordingNotifier;
    use crate::services::session_store::mock::InMemorySessionStore;
    use chrono::Duration;
    use std::sync::Arc;
    use uuid::Uuid;

    struct Fixture {
        store: Arc<InMemorySessionStore>,
        notifier: Arc<RecordingNotifier>,
        scheduler: SessionScheduler,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemorySessionStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let lifecycle = Arc::new(SessionLifecycle::new(
            store.clone(),
            notifier.clone(),
            Arc::new(DisabledEventSync),
        ));
        let scheduler =
            SessionScheduler::new(store.clone(), lifecycle, notifier.clone(), chrono_tz::UTC);
        Fixture {
            store,
            notifier,
            scheduler,
        }
    }

    async fn seed(
        f: &Fixture,
        status: SessionStatus,
        start: DateTime<Utc>,
        ordinary: usize,
    ) -> Uuid {
        let session = InMemorySessionStore::sample_session("guild", status, start);
        f.store.seed(session, "lead", ordinary).await
    }

    async fn status(f: &Fixture, id: Uuid) -> SessionStatus {
        f.store.session(id).await.unwrap().status
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_with_past_completion_is_completed() {
        let f = fixture();
        let now = Utc::now();
        let id = seed(&f, SessionStatus::Active, now - Duration::hours(6), 5).await;

        let summary = f.scheduler.reconcile_at(now).await.unwrap();

        assert_eq!(summary.completed, 1);
        assert_eq!(status(&f, id).await, SessionStatus::Completed);
        assert_eq!(f.scheduler.scheduled_task_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_with_future_completion_gets_completion_timer_only() {
        let f = fixture();
        let now = Utc::now();
        let id = seed(&f, SessionStatus::Active, now - Duration::hours(1), 5).await;

        let summary = f.scheduler.reconcile_at(now).await.unwrap();

        assert_eq!(summary.completion_timers, 1);
        assert_eq!(status(&f, id).await, SessionStatus::Active);
        assert!(f.scheduler.has_slot(id, TimerSlot::Completion).await);
        assert!(!f.scheduler.has_slot(id, TimerSlot::FillDeadline).await);
        assert!(!f.scheduler.has_slot(id, TimerSlot::Reminder).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_past_full_roster_is_activated_with_completion_timer() {
        let f = fixture();
        let now = Utc::now();
        let id = seed(&f, SessionStatus::Full, now - Duration::hours(1), 5).await;

        let summary = f.scheduler.reconcile_at(now).await.unwrap();

        assert_eq!(summary.activated, 1);
        assert_eq!(status(&f, id).await, SessionStatus::Active);
        assert!(f.scheduler.has_slot(id, TimerSlot::Completion).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_past_full_roster_beyond_completion_goes_straight_to_completed() {
        let f = fixture();
        let now = Utc::now();
        let id = seed(&f, SessionStatus::Scheduled, now - Duration::hours(7), 5).await;

        let summary = f.scheduler.reconcile_at(now).await.unwrap();

        assert_eq!(summary.completed, 1);
        assert_eq!(status(&f, id).await, SessionStatus::Completed);
        assert_eq!(f.scheduler.scheduled_task_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_past_short_roster_is_canceled_with_reason() {
        let f = fixture();
        let now = Utc::now();
        let id = seed(&f, SessionStatus::Scheduled, now - Duration::hours(1), 1).await;

        let summary = f.scheduler.reconcile_at(now).await.unwrap();

        assert_eq!(summary.canceled, 1);
        let session = f.store.session(id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Canceled);
        assert_eq!(
            session.cancel_reason.as_deref(),
            Some("Insufficient players (2/6)")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_future_session_gets_full_timer_set_without_reminder_replay() {
        let f = fixture();
        let now = Utc::now();
        let id = seed(&f, SessionStatus::Scheduled, now + Duration::hours(2), 1).await;

        let summary = f.scheduler.reconcile_at(now).await.unwrap();

        assert_eq!(summary.scheduled, 1);
        for slot in TimerSlot::ALL {
            assert!(f.scheduler.has_slot(id, slot).await);
        }
        assert!(f.notifier.messages().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_future_start_inside_fill_window_applies_deadline_now() {
        let f = fixture();
        let now = Utc::now();
        let id = seed(&f, SessionStatus::Scheduled, now + Duration::minutes(2), 3).await;

        let summary = f.scheduler.reconcile_at(now).await.unwrap();

        assert_eq!(summary.canceled, 1);
        assert_eq!(status(&f, id).await, SessionStatus::Canceled);
        assert_eq!(f.scheduler.scheduled_task_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_isolated_per_session() {
        let f = fixture();
        let now = Utc::now();
        let broken = seed(&f, SessionStatus::Active, now - Duration::hours(6), 5).await;
        let healthy = seed(&f, SessionStatus::Active, now - Duration::hours(8), 5).await;
        f.store.fail_transitions_for(broken).await;

        let summary = f.scheduler.reconcile_at(now).await.unwrap();

        assert_eq!(summary.loaded, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.completed, 1);
        assert_eq!(status(&f, broken).await, SessionStatus::Active);
        assert_eq!(status(&f, healthy).await, SessionStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_sessions_are_not_loaded() {
        let f = fixture();
        let now = Utc::now();
        seed(&f, SessionStatus::Completed, now - Duration::hours(6), 5).await;
        seed(&f, SessionStatus::Canceled, now + Duration::hours(6), 1).await;

        let summary = f.scheduler.reconcile_at(now).await.unwrap();

        assert_eq!(summary, ReconcileSummary::default());
    }
}
