//! Role selection engine.
//!
//! A join/change/leave request is answered with a [`SelectionOutcome`].
//! Every check re-reads the store; only the final admission relies on the
//! store's atomic conditional insert. Outcomes are never faults: the only
//! errors returned are a missing session and persistence failures.

use crate::errors::SessionError;
use crate::models::{
    NewMember, Role, RosterMember, Session, SessionStatus, SelectionOutcome, SESSION_CAPACITY,
};
use crate::observability::metrics;
use crate::services::lifecycle_actions::LifecycleActions;
use crate::services::session_store::SessionStore;
use crate::time;
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Half-width of the window searched for same-day hosted sessions.
/// Wide enough to cover any calendar day in any timezone.
const SAME_DAY_WINDOW_HOURS: i64 = 36;

/// A member's request to take, change or drop a role.
#[derive(Debug, Clone)]
pub struct RoleRequest {
    pub user_id: String,
    pub role: Role,
    pub timezone: Option<String>,
}

/// What to do with a request before any cross-session checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Answer immediately without mutating anything.
    Reject(SelectionOutcome),

    /// Same role selected again: drop the member.
    Remove,

    /// Member present with another role: update in place.
    ChangeRole,

    /// Not on the roster: run eligibility checks, then admit.
    Admit,
}

/// Decide how to handle `requested` for `session`.
///
/// The exclusive-role check comes first so that requesting the leader role
/// is `INVALID` in every session state.
pub fn decide(
    session: &Session,
    existing: Option<&RosterMember>,
    requested: Role,
    now: DateTime<Utc>,
) -> Decision {
    if requested.is_exclusive() {
        return Decision::Reject(SelectionOutcome::Invalid);
    }
    if session.status != SessionStatus::Scheduled {
        return Decision::Reject(SelectionOutcome::Locked);
    }
    if !time::is_future(session.scheduled_start, now) {
        return Decision::Reject(SelectionOutcome::Expired);
    }

    match existing {
        // The leader keeps the exclusive role for the life of the session.
        Some(member) if member.role.is_exclusive() => {
            Decision::Reject(SelectionOutcome::Invalid)
        }
        Some(member) if member.role == requested => Decision::Remove,
        Some(_) => Decision::ChangeRole,
        None => Decision::Admit,
    }
}

/// Executes role selection against the store.
pub struct RoleSelectionEngine {
    store: Arc<dyn SessionStore>,
    lifecycle: Arc<dyn LifecycleActions>,
    default_timezone: Tz,
}

impl RoleSelectionEngine {
    pub fn new(
        store: Arc<dyn SessionStore>,
        lifecycle: Arc<dyn LifecycleActions>,
        default_timezone: Tz,
    ) -> Self {
        Self {
            store,
            lifecycle,
            default_timezone,
        }
    }

    /// Apply `request` to `session_id` as of `now`.
    ///
    /// # Errors
    ///
    /// - `SessionError::NotFound` if the session does not exist
    /// - `SessionError::Database` on persistence failure
    #[instrument(skip_all, fields(session_id = %session_id, role = %request.role))]
    pub async fn select(
        &self,
        session_id: Uuid,
        request: &RoleRequest,
        now: DateTime<Utc>,
    ) -> Result<SelectionOutcome, SessionError> {
        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| SessionError::NotFound("Session not found".to_string()))?;

        let roster = self.store.get_roster(session_id).await?;
        let existing = roster.iter().find(|m| m.user_id == request.user_id);

        let outcome = match decide(&session, existing, request.role, now) {
            Decision::Reject(outcome) => outcome,
            Decision::Remove => {
                self.store
                    .remove_member(session_id, &request.user_id)
                    .await?;
                SelectionOutcome::RemovedFromParty
            }
            Decision::ChangeRole => {
                self.store
                    .update_member_role(session_id, &request.user_id, request.role)
                    .await?;
                SelectionOutcome::RoleChanged
            }
            Decision::Admit => self.admit(&session, request).await?,
        };

        metrics::record_role_selection(outcome.as_str());
        debug!(
            target: "ss.roster",
            session_id = %session_id,
            outcome = outcome.as_str(),
            "Role selection evaluated"
        );

        if matches!(
            outcome,
            SelectionOutcome::RemovedFromParty
                | SelectionOutcome::RoleChanged
                | SelectionOutcome::AddedToParty
        ) {
            self.lifecycle.regenerate(session_id).await;
        }

        Ok(outcome)
    }

    async fn admit(
        &self,
        session: &Session,
        request: &RoleRequest,
    ) -> Result<SelectionOutcome, SessionError> {
        let session_id = session.session_id;

        if self
            .store
            .find_active_membership(&session.scope_id, &request.user_id, session_id)
            .await?
            .is_some()
        {
            return Ok(SelectionOutcome::AlreadyInSession);
        }

        if self.hosts_same_day(session, request).await? {
            return Ok(SelectionOutcome::HostingSameDay);
        }

        let candidate = NewMember {
            user_id: request.user_id.clone(),
            role: request.role,
            timezone: request.timezone.clone(),
        };
        if !self
            .store
            .conditional_admit(session_id, &candidate, SESSION_CAPACITY)
            .await?
        {
            return Ok(SelectionOutcome::PartyFull);
        }

        // The member is on the roster now. A failed FULL transition leaves the
        // session SCHEDULED at capacity, which the fill-deadline re-count handles.
        match self.store.count_members(session_id).await {
            Ok(size) if size >= SESSION_CAPACITY => {
                if let Err(e) = self.lifecycle.mark_full(session_id).await {
                    warn!(
                        target: "ss.roster",
                        session_id = %session_id,
                        error = %e,
                        "FULL transition failed after admission"
                    );
                }
            }
            Ok(_) => {}
            Err(e) => warn!(
                target: "ss.roster",
                session_id = %session_id,
                error = %e,
                "Roster count failed after admission"
            ),
        }

        Ok(SelectionOutcome::AddedToParty)
    }

    /// Whether the requester leads another session in the same scope on the
    /// same calendar day, as seen from the requester's timezone.
    async fn hosts_same_day(
        &self,
        session: &Session,
        request: &RoleRequest,
    ) -> Result<bool, SessionError> {
        let tz = time::resolve_timezone(request.timezone.as_deref(), self.default_timezone);
        let start = session.scheduled_start;
        let window = Duration::hours(SAME_DAY_WINDOW_HOURS);

        let hosted = self
            .store
            .find_leader_sessions_between(
                &session.scope_id,
                &request.user_id,
                session.session_id,
                start - window,
                start + window,
            )
            .await?;

        Ok(hosted
            .iter()
            .any(|other| time::same_calendar_day(other.scheduled_start, start, tz)))
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
    use chrono::TimeZone;

    fn session_at(status: SessionStatus, start: DateTime<Utc>) -> Session {
        InMemorySessionStore::sample_session("guild", status, start)
    }

    fn member(user_id: &str, role: Role) -> RosterMember {
        RosterMember {
            user_id: user_id.to_string(),
            role,
            timezone: None,
            joined_at: Utc::now(),
        }
    }

    fn request(user_id: &str, role: Role) -> RoleRequest {
        RoleRequest {
            user_id: user_id.to_string(),
            role,
            timezone: None,
        }
    }

    struct Fixture {
        store: Arc<InMemorySessionStore>,
        notifier: Arc<RecordingNotifier>,
        engine: RoleSelectionEngine,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemorySessionStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let lifecycle = Arc::new(SessionLifecycle::new(
            store.clone(),
            notifier.clone(),
            Arc::new(DisabledEventSync),
        ));
        let engine = RoleSelectionEngine::new(store.clone(), lifecycle, chrono_tz::UTC);
        Fixture {
            store,
            notifier,
            engine,
        }
    }

    // ------------------------------------------------------------------
    // decide
    // ------------------------------------------------------------------

    #[test]
    fn test_leader_role_is_invalid_in_every_state() {
        let now = Utc::now();
        for status in [
            SessionStatus::Scheduled,
            SessionStatus::Full,
            SessionStatus::Active,
            SessionStatus::Completed,
            SessionStatus::Canceled,
        ] {
            for start in [now + Duration::hours(1), now - Duration::hours(1)] {
                let session = session_at(status, start);
                assert_eq!(
                    decide(&session, None, Role::Leader, now),
                    Decision::Reject(SelectionOutcome::Invalid),
                    "status {status} start {start}"
                );
            }
        }
    }

    #[test]
    fn test_locked_before_expired() {
        let now = Utc::now();
        let session = session_at(SessionStatus::Full, now - Duration::hours(1));
        assert_eq!(
            decide(&session, None, Role::Tank, now),
            Decision::Reject(SelectionOutcome::Locked)
        );
    }

    #[test]
    fn test_expired_at_start_instant() {
        let now = Utc::now();
        let session = session_at(SessionStatus::Scheduled, now);
        assert_eq!(
            decide(&session, None, Role::Tank, now),
            Decision::Reject(SelectionOutcome::Expired)
        );
    }

    #[test]
    fn test_existing_member_paths() {
        let now = Utc::now();
        let session = session_at(SessionStatus::Scheduled, now + Duration::hours(3));
        let tank = member("u", Role::Tank);
        let leader = member("lead", Role::Leader);

        assert_eq!(
            decide(&session, Some(&tank), Role::Tank, now),
            Decision::Remove
        );
        assert_eq!(
            decide(&session, Some(&tank), Role::Healer, now),
            Decision::ChangeRole
        );
        assert_eq!(
            decide(&session, Some(&leader), Role::Healer, now),
            Decision::Reject(SelectionOutcome::Invalid)
        );
        assert_eq!(decide(&session, None, Role::Healer, now), Decision::Admit);
    }

    // ------------------------------------------------------------------
    // engine
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_toggle_law() {
        let f = fixture();
        let now = Utc::now();
        let id = f
            .store
            .seed(
                session_at(SessionStatus::Scheduled, now + Duration::hours(3)),
                "lead",
                0,
            )
            .await;
        let req = request("u", Role::Healer);

        let first = f.engine.select(id, &req, now).await.unwrap();
        let second = f.engine.select(id, &req, now).await.unwrap();
        let third = f.engine.select(id, &req, now).await.unwrap();

        assert_eq!(first, SelectionOutcome::AddedToParty);
        assert_eq!(second, SelectionOutcome::RemovedFromParty);
        assert_eq!(third, SelectionOutcome::AddedToParty);
        assert_eq!(f.store.roster(id).await.len(), 2);
        assert_eq!(f.notifier.published().await.len(), 3);
    }

    #[tokio::test]
    async fn test_role_change_updates_in_place() {
        let f = fixture();
        let now = Utc::now();
        let id = f
            .store
            .seed(
                session_at(SessionStatus::Scheduled, now + Duration::hours(3)),
                "lead",
                0,
            )
            .await;
        f.store.insert_member(id, "u", Role::Tank).await;

        let outcome = f
            .engine
            .select(id, &request("u", Role::Support), now)
            .await
            .unwrap();

        assert_eq!(outcome, SelectionOutcome::RoleChanged);
        let roster = f.store.roster(id).await;
        assert_eq!(roster.len(), 2);
        assert_eq!(
            roster.iter().find(|m| m.user_id == "u").unwrap().role,
            Role::Support
        );
    }

    #[tokio::test]
    async fn test_last_admission_marks_full_and_next_is_locked() {
        let f = fixture();
        let now = Utc::now();
        let id = f
            .store
            .seed(
                session_at(SessionStatus::Scheduled, now + Duration::hours(3)),
                "lead",
                4,
            )
            .await;

        let outcome = f
            .engine
            .select(id, &request("sixth", Role::Flex), now)
            .await
            .unwrap();
        assert_eq!(outcome, SelectionOutcome::AddedToParty);
        assert_eq!(f.store.session(id).await.unwrap().status, SessionStatus::Full);

        let late = f
            .engine
            .select(id, &request("seventh", Role::Flex), now)
            .await
            .unwrap();
        assert_eq!(late, SelectionOutcome::Locked);
    }

    #[tokio::test]
    async fn test_failed_full_transition_still_admits() {
        let f = fixture();
        let now = Utc::now();
        let id = f
            .store
            .seed(
                session_at(SessionStatus::Scheduled, now + Duration::hours(3)),
                "lead",
                4,
            )
            .await;
        f.store.fail_transitions_for(id).await;

        let outcome = f
            .engine
            .select(id, &request("sixth", Role::Tank), now)
            .await
            .unwrap();

        assert_eq!(outcome, SelectionOutcome::AddedToParty);
        assert_eq!(f.store.roster(id).await.len(), 6);
        assert_eq!(
            f.store.session(id).await.unwrap().status,
            SessionStatus::Scheduled
        );

        // The roster is at capacity even though the status stayed SCHEDULED.
        let retry = f
            .engine
            .select(id, &request("seventh", Role::Tank), now)
            .await
            .unwrap();
        assert_eq!(retry, SelectionOutcome::PartyFull);
        assert_eq!(f.store.roster(id).await.len(), 6);
    }

    #[tokio::test]
    async fn test_party_full_when_capacity_reached_without_status_change() {
        let f = fixture();
        let now = Utc::now();
        // Six on the roster but still SCHEDULED, as after a lost FULL transition.
        let id = f
            .store
            .seed(
                session_at(SessionStatus::Scheduled, now + Duration::hours(3)),
                "lead",
                5,
            )
            .await;

        let outcome = f
            .engine
            .select(id, &request("late", Role::Tank), now)
            .await
            .unwrap();
        assert_eq!(outcome, SelectionOutcome::PartyFull);
        assert_eq!(f.store.roster(id).await.len(), 6);
    }

    #[tokio::test]
    async fn test_already_in_active_session_in_scope() {
        let f = fixture();
        let now = Utc::now();
        let active = f
            .store
            .seed(
                session_at(SessionStatus::Active, now - Duration::minutes(30)),
                "other-lead",
                0,
            )
            .await;
        f.store.insert_member(active, "u", Role::Tank).await;
        let id = f
            .store
            .seed(
                session_at(SessionStatus::Scheduled, now + Duration::hours(3)),
                "lead",
                0,
            )
            .await;

        let outcome = f
            .engine
            .select(id, &request("u", Role::Tank), now)
            .await
            .unwrap();
        assert_eq!(outcome, SelectionOutcome::AlreadyInSession);
        assert_eq!(f.store.roster(id).await.len(), 1);
    }

    #[tokio::test]
    async fn test_hosting_same_day_in_requester_timezone() {
        let f = fixture();
        // Requester is in New York; both starts fall on March 14 there.
        let now = Utc.with_ymd_and_hms(2026, 3, 14, 12, 0, 0).unwrap();
        let hosted_start = Utc.with_ymd_and_hms(2026, 3, 14, 23, 30, 0).unwrap();
        let target_start = Utc.with_ymd_and_hms(2026, 3, 15, 0, 30, 0).unwrap();

        f.store
            .seed(session_at(SessionStatus::Scheduled, hosted_start), "host", 0)
            .await;
        let id = f
            .store
            .seed(session_at(SessionStatus::Scheduled, target_start), "lead", 0)
            .await;

        let mut req = request("host", Role::Damage);
        req.timezone = Some("America/New_York".to_string());
        let outcome = f.engine.select(id, &req, now).await.unwrap();

        assert_eq!(outcome, SelectionOutcome::HostingSameDay);
        assert_eq!(f.store.roster(id).await.len(), 1);
        assert!(f.notifier.published().await.is_empty());

        // In UTC the two starts are on different days.
        let outcome_utc = f
            .engine
            .select(id, &request("host", Role::Damage), now)
            .await
            .unwrap();
        assert_eq!(outcome_utc, SelectionOutcome::AddedToParty);
    }

    #[tokio::test]
    async fn test_missing_session_is_not_found() {
        let f = fixture();
        let result = f
            .engine
            .select(Uuid::new_v4(), &request("u", Role::Tank), Utc::now())
            .await;
        assert!(matches!(result, Err(SessionError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_concurrent_admissions_respect_capacity() {
        let f = fixture();
        let now = Utc::now();
        let id = f
            .store
            .seed(
                session_at(SessionStatus::Scheduled, now + Duration::hours(3)),
                "lead",
                2,
            )
            .await;
        let engine = Arc::new(f.engine);

        let handles: Vec<_> = (0..8)
            .map(|n| {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    engine
                        .select(id, &request(&format!("racer-{n}"), Role::Damage), now)
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut added = 0;
        for handle in handles {
            if handle.await.unwrap() == SelectionOutcome::AddedToParty {
                added += 1;
            }
        }

        assert_eq!(added, 3);
        assert_eq!(f.store.roster(id).await.len(), 6);
        assert_eq!(f.store.session(id).await.unwrap().status, SessionStatus::Full);
    }
}
