//! Timer effects.
//!
//! Each effect re-reads persisted state before acting, so it is safe to run
//! late, twice, or after its timer was cancelled. The reconciler calls the
//! same functions to replay missed timers.

use crate::errors::SessionError;
use crate::lifecycle::{fill_deadline_decision, FillDeadlineDecision};
use crate::models::{SessionStatus, SESSION_CAPACITY};
use crate::services::lifecycle_actions::{LifecycleActions, TransitionResult};
use crate::services::notifier::{notify_each_member, Notifier};
use crate::services::session_store::SessionStore;
use crate::time::{self, SessionTimeline};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tracing::{debug, info};
use uuid::Uuid;

/// What the fill-deadline effect did.
#[derive(Debug, Clone, PartialEq)]
pub enum FillDeadlineOutcome {
    Activated,
    Canceled { reason: String },
    /// Session missing, already past the fill-deadline, or raced.
    Skipped,
}

/// Notify every roster member that the session starts soon.
///
/// Returns the number of members notified. Terminal or missing sessions
/// are skipped.
pub async fn send_reminders(
    store: &dyn SessionStore,
    notifier: &dyn Notifier,
    default_timezone: Tz,
    session_id: Uuid,
) -> Result<usize, SessionError> {
    let Some(session) = store.get_session(session_id).await? else {
        return Ok(0);
    };
    if session.status.is_terminal() {
        debug!(target: "ss.scheduler", session_id = %session_id, "Reminder skipped for terminal session");
        return Ok(0);
    }

    let roster = store.get_roster(session_id).await?;
    let session_tz = session.display_timezone(default_timezone);
    let start = session.scheduled_start;

    let delivered = notify_each_member(notifier, &roster, |member| {
        let tz = time::resolve_timezone(member.timezone.as_deref(), session_tz);
        format!(
            "Reminder: your session starts {} ({} minutes from now).",
            time::format_local(start, tz),
            time::REMINDER_LEAD_MINUTES
        )
    })
    .await;

    info!(
        target: "ss.scheduler",
        session_id = %session_id,
        delivered,
        roster_size = roster.len(),
        "Reminders sent"
    );
    Ok(delivered)
}

/// Proceed or cancel based on the current roster size.
///
/// `due` is the fill-deadline the caller's timer was installed for. When
/// the session has since been moved to another start, the effect is
/// skipped and left to the timer installed for the new start.
pub async fn apply_fill_deadline(
    store: &dyn SessionStore,
    lifecycle: &dyn LifecycleActions,
    session_id: Uuid,
    due: Option<DateTime<Utc>>,
) -> Result<FillDeadlineOutcome, SessionError> {
    let Some(session) = store.get_session(session_id).await? else {
        return Ok(FillDeadlineOutcome::Skipped);
    };
    if !matches!(session.status, SessionStatus::Scheduled | SessionStatus::Full) {
        return Ok(FillDeadlineOutcome::Skipped);
    }
    if let Some(due) = due {
        let current = SessionTimeline::for_start(session.scheduled_start).fill_deadline_at;
        if current != due {
            debug!(
                target: "ss.scheduler",
                session_id = %session_id,
                due = %due,
                current = %current,
                "Fill-deadline skipped, session was rescheduled"
            );
            return Ok(FillDeadlineOutcome::Skipped);
        }
    }

    let size = store.count_members(session_id).await?;

    let outcome = match fill_deadline_decision(size, SESSION_CAPACITY) {
        FillDeadlineDecision::Activate => match lifecycle.activate(session_id).await? {
            TransitionResult::Applied(_) => FillDeadlineOutcome::Activated,
            TransitionResult::Skipped => FillDeadlineOutcome::Skipped,
        },
        FillDeadlineDecision::Cancel { reason } => {
            match lifecycle.cancel(session_id, Some(&reason)).await? {
                TransitionResult::Applied(_) => FillDeadlineOutcome::Canceled { reason },
                TransitionResult::Skipped => FillDeadlineOutcome::Skipped,
            }
        }
    };

    info!(
        target: "ss.scheduler",
        session_id = %session_id,
        roster_size = size,
        outcome = ?outcome,
        "Fill-deadline applied"
    );
    Ok(outcome)
}

/// Complete an `ACTIVE` session. Returns whether it transitioned.
pub async fn apply_completion(
    store: &dyn SessionStore,
    lifecycle: &dyn LifecycleActions,
    session_id: Uuid,
) -> Result<bool, SessionError> {
    let Some(session) = store.get_session(session_id).await? else {
        return Ok(false);
    };
    if session.status != SessionStatus::Active {
        debug!(
            target: "ss.scheduler",
            session_id = %session_id,
            status = %session.status,
            "Completion skipped, session not active"
        );
        return Ok(false);
    }

    Ok(lifecycle.end(session_id).await?.is_applied())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::models::Role;
    use crate::services::event_sync::DisabledEventSync;
    use crate::services::lifecycle_actions::SessionLifecycle;
    use crate::services::notifier::mock::RecordingNotifier;
    use crate::services::session_store::mock::InMemorySessionStore;
    use chrono::Duration;
    use std::sync::Arc;

    fn setup() -> (Arc<InMemorySessionStore>, Arc<RecordingNotifier>, SessionLifecycle) {
        let store = Arc::new(InMemorySessionStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let lifecycle =
            SessionLifecycle::new(store.clone(), notifier.clone(), Arc::new(DisabledEventSync));
        (store, notifier, lifecycle)
    }

    async fn seed(store: &InMemorySessionStore, status: SessionStatus, ordinary: usize) -> Uuid {
        let session = InMemorySessionStore::sample_session(
            "guild",
            status,
            Utc::now() + Duration::minutes(5),
        );
        store.seed(session, "lead", ordinary).await
    }

    #[tokio::test]
    async fn test_fill_deadline_full_roster_activates() {
        let (store, _, lifecycle) = setup();
        let id = seed(&store, SessionStatus::Full, 5).await;

        let outcome = apply_fill_deadline(store.as_ref(), &lifecycle, id, None)
            .await
            .unwrap();

        assert_eq!(outcome, FillDeadlineOutcome::Activated);
        assert_eq!(store.session(id).await.unwrap().status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn test_fill_deadline_short_roster_cancels_with_reason() {
        let (store, _, lifecycle) = setup();
        let id = seed(&store, SessionStatus::Scheduled, 2).await;

        let outcome = apply_fill_deadline(store.as_ref(), &lifecycle, id, None)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            FillDeadlineOutcome::Canceled {
                reason: "Insufficient players (3/6)".to_string()
            }
        );
        let session = store.session(id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Canceled);
        assert_eq!(
            session.cancel_reason.as_deref(),
            Some("Insufficient players (3/6)")
        );
    }

    #[tokio::test]
    async fn test_fill_deadline_ignores_active_and_terminal() {
        let (store, _, lifecycle) = setup();
        for status in [
            SessionStatus::Active,
            SessionStatus::Completed,
            SessionStatus::Canceled,
        ] {
            let id = seed(&store, status, 1).await;
            let outcome = apply_fill_deadline(store.as_ref(), &lifecycle, id, None)
                .await
                .unwrap();
            assert_eq!(outcome, FillDeadlineOutcome::Skipped);
            assert_eq!(store.session(id).await.unwrap().status, status);
        }
    }

    #[tokio::test]
    async fn test_fill_deadline_for_a_moved_start_is_skipped() {
        let (store, _, lifecycle) = setup();
        let id = seed(&store, SessionStatus::Scheduled, 1).await;
        let current = SessionTimeline::for_start(store.session(id).await.unwrap().scheduled_start)
            .fill_deadline_at;
        let stale = current - Duration::hours(2);

        let outcome = apply_fill_deadline(store.as_ref(), &lifecycle, id, Some(stale))
            .await
            .unwrap();
        assert_eq!(outcome, FillDeadlineOutcome::Skipped);
        assert_eq!(
            store.session(id).await.unwrap().status,
            SessionStatus::Scheduled
        );

        let outcome = apply_fill_deadline(store.as_ref(), &lifecycle, id, Some(current))
            .await
            .unwrap();
        assert!(matches!(outcome, FillDeadlineOutcome::Canceled { .. }));
    }

    #[tokio::test]
    async fn test_completion_guard_on_terminal_sessions() {
        let (store, notifier, lifecycle) = setup();
        for status in [SessionStatus::Canceled, SessionStatus::Completed] {
            let id = seed(&store, status, 5).await;
            assert!(!apply_completion(store.as_ref(), &lifecycle, id)
                .await
                .unwrap());
            assert_eq!(store.session(id).await.unwrap().status, status);
        }
        assert!(notifier.published().await.is_empty());
    }

    #[tokio::test]
    async fn test_completion_of_active_session() {
        let (store, _, lifecycle) = setup();
        let id = seed(&store, SessionStatus::Active, 5).await;

        assert!(apply_completion(store.as_ref(), &lifecycle, id)
            .await
            .unwrap());
        assert_eq!(
            store.session(id).await.unwrap().status,
            SessionStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_reminders_use_member_timezone() {
        let (store, notifier, _) = setup();
        let mut session = InMemorySessionStore::sample_session(
            "guild",
            SessionStatus::Scheduled,
            Utc::now() + Duration::hours(1),
        );
        session.timezone = Some("Asia/Tokyo".to_string());
        let id = store.seed(session, "lead", 0).await;
        store.insert_member(id, "tank", Role::Tank).await;

        let delivered = send_reminders(store.as_ref(), notifier.as_ref(), chrono_tz::UTC, id)
            .await
            .unwrap();

        assert_eq!(delivered, 2);
        let messages = notifier.messages().await;
        assert_eq!(messages.len(), 2);
        // Neither member has a preference, so the session timezone applies.
        assert!(messages.iter().all(|(_, text)| text.contains("JST")));
    }

    #[tokio::test]
    async fn test_reminders_skip_terminal_session() {
        let (store, notifier, _) = setup();
        let id = seed(&store, SessionStatus::Canceled, 3).await;

        let delivered = send_reminders(store.as_ref(), notifier.as_ref(), chrono_tz::UTC, id)
            .await
            .unwrap();

        assert_eq!(delivered, 0);
        assert!(notifier.messages().await.is_empty());
    }
}
