//! Session store abstraction.
//!
//! The scheduler, lifecycle actions and role selection engine talk to
//! persistence through [`SessionStore`]. [`PgSessionStore`] delegates to the
//! repositories; [`mock::InMemorySessionStore`] backs unit tests.

use crate::errors::SessionError;
use crate::models::{
    NewMember, NewSession, Role, RosterMember, Session, SessionFilter, SessionStatus,
    SessionWithRoster,
};
use crate::repositories::{RosterRepository, SessionsRepository};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

/// Persistence operations used by the lifecycle core.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(&self, new: &NewSession) -> Result<SessionWithRoster, SessionError>;

    async fn get_session(&self, session_id: Uuid) -> Result<Option<Session>, SessionError>;

    async fn get_roster(&self, session_id: Uuid) -> Result<Vec<RosterMember>, SessionError>;

    async fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<Session>, SessionError>;

    /// Conditional status update; `None` when the session is missing or
    /// its status is not in `from`.
    async fn transition_status(
        &self,
        session_id: Uuid,
        from: &[SessionStatus],
        to: SessionStatus,
        reason: Option<&str>,
    ) -> Result<Option<Session>, SessionError>;

    async fn update_schedule(
        &self,
        session_id: Uuid,
        scheduled_start: DateTime<Utc>,
        timezone: Option<&str>,
    ) -> Result<Option<Session>, SessionError>;

    async fn set_external_event_ref(
        &self,
        session_id: Uuid,
        event_ref: Option<&str>,
    ) -> Result<(), SessionError>;

    async fn find_active_membership(
        &self,
        scope_id: &str,
        user_id: &str,
        exclude: Uuid,
    ) -> Result<Option<Uuid>, SessionError>;

    async fn find_leader_sessions_between(
        &self,
        scope_id: &str,
        user_id: &str,
        exclude: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Session>, SessionError>;

    /// Atomic insert-only-if-under-capacity.
    async fn conditional_admit(
        &self,
        session_id: Uuid,
        member: &NewMember,
        capacity: i64,
    ) -> Result<bool, SessionError>;

    async fn update_member_role(
        &self,
        session_id: Uuid,
        user_id: &str,
        role: Role,
    ) -> Result<bool, SessionError>;

    async fn remove_member(&self, session_id: Uuid, user_id: &str) -> Result<bool, SessionError>;

    async fn count_members(&self, session_id: Uuid) -> Result<i64, SessionError>;

    async fn get_session_with_roster(
        &self,
        session_id: Uuid,
    ) -> Result<Option<SessionWithRoster>, SessionError> {
        let Some(session) = self.get_session(session_id).await? else {
            return Ok(None);
        };
        let roster = self.get_roster(session_id).await?;
        Ok(Some(SessionWithRoster::new(session, roster)))
    }
}

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn create_session(&self, new: &NewSession) -> Result<SessionWithRoster, SessionError> {
        SessionsRepository::create_session(&self.pool, new).await
    }

    async fn get_session(&self, session_id: Uuid) -> Result<Option<Session>, SessionError> {
        SessionsRepository::get_session(&self.pool, session_id).await
    }

    async fn get_roster(&self, session_id: Uuid) -> Result<Vec<RosterMember>, SessionError> {
        SessionsRepository::get_roster(&self.pool, session_id).await
    }

    async fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<Session>, SessionError> {
        SessionsRepository::list_sessions(&self.pool, filter).await
    }

    async fn transition_status(
        &self,
        session_id: Uuid,
        from: &[SessionStatus],
        to: SessionStatus,
        reason: Option<&str>,
    ) -> Result<Option<Session>, SessionError> {
        SessionsRepository::transition_status(&self.pool, session_id, from, to, reason).await
    }

    async fn update_schedule(
        &self,
        session_id: Uuid,
        scheduled_start: DateTime<Utc>,
        timezone: Option<&str>,
    ) -> Result<Option<Session>, SessionError> {
        SessionsRepository::update_schedule(&self.pool, session_id, scheduled_start, timezone)
            .await
    }

    async fn set_external_event_ref(
        &self,
        session_id: Uuid,
        event_ref: Option<&str>,
    ) -> Result<(), SessionError> {
        SessionsRepository::set_external_event_ref(&self.pool, session_id, event_ref).await
    }

    async fn find_active_membership(
        &self,
        scope_id: &str,
        user_id: &str,
        exclude: Uuid,
    ) -> Result<Option<Uuid>, SessionError> {
        SessionsRepository::find_active_membership(&self.pool, scope_id, user_id, exclude).await
    }

    async fn find_leader_sessions_between(
        &self,
        scope_id: &str,
        user_id: &str,
        exclude: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Session>, SessionError> {
        SessionsRepository::find_leader_sessions_between(
            &self.pool, scope_id, user_id, exclude, from, to,
        )
        .await
    }

    async fn conditional_admit(
        &self,
        session_id: Uuid,
        member: &NewMember,
        capacity: i64,
    ) -> Result<bool, SessionError> {
        RosterRepository::conditional_admit(&self.pool, session_id, member, capacity).await
    }

    async fn update_member_role(
        &self,
        session_id: Uuid,
        user_id: &str,
        role: Role,
    ) -> Result<bool, SessionError> {
        RosterRepository::update_member_role(&self.pool, session_id, user_id, role).await
    }

    async fn remove_member(&self, session_id: Uuid, user_id: &str) -> Result<bool, SessionError> {
        RosterRepository::remove_member(&self.pool, session_id, user_id).await
    }

    async fn count_members(&self, session_id: Uuid) -> Result<i64, SessionError> {
        RosterRepository::count_members(&self.pool, session_id).await
    }
}

/// In-memory store for tests.
pub mod mock {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct State {
        sessions: HashMap<Uuid, Session>,
        rosters: HashMap<Uuid, Vec<RosterMember>>,
        failing_transitions: HashSet<Uuid>,
        failing_reads: HashSet<Uuid>,
    }

    /// In-memory [`SessionStore`].
    ///
    /// A single mutex guards all state, which makes `conditional_admit`
    /// atomic in the same way the row lock does in PostgreSQL.
    #[derive(Default)]
    pub struct InMemorySessionStore {
        state: Mutex<State>,
    }

    impl InMemorySessionStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Build an unsaved session with the given status and start.
        pub fn sample_session(
            scope_id: &str,
            status: SessionStatus,
            scheduled_start: DateTime<Utc>,
        ) -> Session {
            let now = Utc::now();
            Session {
                session_id: Uuid::new_v4(),
                scope_id: scope_id.to_string(),
                scheduled_start,
                timezone: None,
                status,
                external_event_ref: None,
                cancel_reason: None,
                created_at: now,
                updated_at: now,
            }
        }

        /// Seed a session with a leader and `ordinary` members.
        ///
        /// Ordinary members are named `member-1..=ordinary` with role `damage`.
        pub async fn seed(&self, session: Session, leader: &str, ordinary: usize) -> Uuid {
            let id = session.session_id;
            let mut roster = vec![member(leader, Role::Leader)];
            roster.extend((1..=ordinary).map(|n| member(&format!("member-{n}"), Role::Damage)));

            let mut state = self.state.lock().await;
            state.sessions.insert(id, session);
            state.rosters.insert(id, roster);
            id
        }

        pub async fn insert_member(&self, session_id: Uuid, user_id: &str, role: Role) {
            let mut state = self.state.lock().await;
            state
                .rosters
                .entry(session_id)
                .or_default()
                .push(member(user_id, role));
        }

        pub async fn session(&self, session_id: Uuid) -> Option<Session> {
            self.state.lock().await.sessions.get(&session_id).cloned()
        }

        pub async fn roster(&self, session_id: Uuid) -> Vec<RosterMember> {
            self.state
                .lock()
                .await
                .rosters
                .get(&session_id)
                .cloned()
                .unwrap_or_default()
        }

        /// Make status transitions for `session_id` fail with a database error.
        pub async fn fail_transitions_for(&self, session_id: Uuid) {
            self.state
                .lock()
                .await
                .failing_transitions
                .insert(session_id);
        }

        /// Make reads of `session_id` fail with a database error.
        pub async fn fail_reads_for(&self, session_id: Uuid) {
            self.state.lock().await.failing_reads.insert(session_id);
        }
    }

    fn member(user_id: &str, role: Role) -> RosterMember {
        RosterMember {
            user_id: user_id.to_string(),
            role,
            timezone: None,
            joined_at: Utc::now(),
        }
    }

    fn injected(session_id: Uuid) -> SessionError {
        SessionError::Database(format!("injected failure for {session_id}"))
    }

    #[async_trait]
    impl SessionStore for InMemorySessionStore {
        async fn create_session(
            &self,
            new: &NewSession,
        ) -> Result<SessionWithRoster, SessionError> {
            let mut session = Self::sample_session(
                &new.scope_id,
                SessionStatus::Scheduled,
                new.scheduled_start,
            );
            session.timezone = new.timezone.clone();
            let mut leader = member(&new.leader_user_id, Role::Leader);
            leader.timezone = new.leader_timezone.clone();

            let mut state = self.state.lock().await;
            state.sessions.insert(session.session_id, session.clone());
            state
                .rosters
                .insert(session.session_id, vec![leader.clone()]);
            Ok(SessionWithRoster::new(session, vec![leader]))
        }

        async fn get_session(&self, session_id: Uuid) -> Result<Option<Session>, SessionError> {
            let state = self.state.lock().await;
            if state.failing_reads.contains(&session_id) {
                return Err(injected(session_id));
            }
            Ok(state.sessions.get(&session_id).cloned())
        }

        async fn get_roster(&self, session_id: Uuid) -> Result<Vec<RosterMember>, SessionError> {
            let state = self.state.lock().await;
            if state.failing_reads.contains(&session_id) {
                return Err(injected(session_id));
            }
            Ok(state.rosters.get(&session_id).cloned().unwrap_or_default())
        }

        async fn list_sessions(
            &self,
            filter: &SessionFilter,
        ) -> Result<Vec<Session>, SessionError> {
            let state = self.state.lock().await;
            let mut sessions: Vec<Session> = state
                .sessions
                .values()
                .filter(|s| filter.matches(s))
                .cloned()
                .collect();
            sessions.sort_by_key(|s| (s.scheduled_start, s.session_id));
            Ok(sessions)
        }

        async fn transition_status(
            &self,
            session_id: Uuid,
            from: &[SessionStatus],
            to: SessionStatus,
            reason: Option<&str>,
        ) -> Result<Option<Session>, SessionError> {
            let mut state = self.state.lock().await;
            if state.failing_transitions.contains(&session_id) {
                return Err(injected(session_id));
            }
            let Some(session) = state.sessions.get_mut(&session_id) else {
                return Ok(None);
            };
            if !from.contains(&session.status) {
                return Ok(None);
            }
            session.status = to;
            if let Some(reason) = reason {
                session.cancel_reason = Some(reason.to_string());
            }
            session.updated_at = Utc::now();
            Ok(Some(session.clone()))
        }

        async fn update_schedule(
            &self,
            session_id: Uuid,
            scheduled_start: DateTime<Utc>,
            timezone: Option<&str>,
        ) -> Result<Option<Session>, SessionError> {
            let mut state = self.state.lock().await;
            let Some(session) = state.sessions.get_mut(&session_id) else {
                return Ok(None);
            };
            if !matches!(session.status, SessionStatus::Scheduled | SessionStatus::Full) {
                return Ok(None);
            }
            session.scheduled_start = scheduled_start;
            if let Some(tz) = timezone {
                session.timezone = Some(tz.to_string());
            }
            session.updated_at = Utc::now();
            Ok(Some(session.clone()))
        }

        async fn set_external_event_ref(
            &self,
            session_id: Uuid,
            event_ref: Option<&str>,
        ) -> Result<(), SessionError> {
            let mut state = self.state.lock().await;
            if let Some(session) = state.sessions.get_mut(&session_id) {
                session.external_event_ref = event_ref.map(str::to_string);
            }
            Ok(())
        }

        async fn find_active_membership(
            &self,
            scope_id: &str,
            user_id: &str,
            exclude: Uuid,
        ) -> Result<Option<Uuid>, SessionError> {
            let state = self.state.lock().await;
            Ok(state
                .sessions
                .values()
                .filter(|s| {
                    s.session_id != exclude
                        && s.scope_id == scope_id
                        && s.status == SessionStatus::Active
                })
                .find(|s| {
                    state
                        .rosters
                        .get(&s.session_id)
                        .is_some_and(|r| r.iter().any(|m| m.user_id == user_id))
                })
                .map(|s| s.session_id))
        }

        async fn find_leader_sessions_between(
            &self,
            scope_id: &str,
            user_id: &str,
            exclude: Uuid,
            from: DateTime<Utc>,
            to: DateTime<Utc>,
        ) -> Result<Vec<Session>, SessionError> {
            let state = self.state.lock().await;
            Ok(state
                .sessions
                .values()
                .filter(|s| {
                    s.session_id != exclude
                        && s.scope_id == scope_id
                        && !s.status.is_terminal()
                        && s.scheduled_start >= from
                        && s.scheduled_start <= to
                })
                .filter(|s| {
                    state.rosters.get(&s.session_id).is_some_and(|r| {
                        r.iter()
                            .any(|m| m.user_id == user_id && m.role.is_exclusive())
                    })
                })
                .cloned()
                .collect())
        }

        async fn conditional_admit(
            &self,
            session_id: Uuid,
            candidate: &NewMember,
            capacity: i64,
        ) -> Result<bool, SessionError> {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let open = state
                .sessions
                .get(&session_id)
                .is_some_and(|s| s.status == SessionStatus::Scheduled);
            if !open {
                return Ok(false);
            }
            let roster = state.rosters.entry(session_id).or_default();
            if roster.len() as i64 >= capacity
                || roster.iter().any(|m| m.user_id == candidate.user_id)
            {
                return Ok(false);
            }
            let mut admitted = member(&candidate.user_id, candidate.role);
            admitted.timezone = candidate.timezone.clone();
            roster.push(admitted);
            Ok(true)
        }

        async fn update_member_role(
            &self,
            session_id: Uuid,
            user_id: &str,
            role: Role,
        ) -> Result<bool, SessionError> {
            let mut state = self.state.lock().await;
            let Some(existing) = state
                .rosters
                .get_mut(&session_id)
                .and_then(|r| r.iter_mut().find(|m| m.user_id == user_id))
            else {
                return Ok(false);
            };
            if existing.role.is_exclusive() {
                return Ok(false);
            }
            existing.role = role;
            Ok(true)
        }

        async fn remove_member(
            &self,
            session_id: Uuid,
            user_id: &str,
        ) -> Result<bool, SessionError> {
            let mut state = self.state.lock().await;
            let Some(roster) = state.rosters.get_mut(&session_id) else {
                return Ok(false);
            };
            let before = roster.len();
            roster.retain(|m| m.user_id != user_id || m.role.is_exclusive());
            Ok(roster.len() != before)
        }

        async fn count_members(&self, session_id: Uuid) -> Result<i64, SessionError> {
            let state = self.state.lock().await;
            if state.failing_reads.contains(&session_id) {
                return Err(injected(session_id));
            }
            Ok(state.rosters.get(&session_id).map_or(0, |r| r.len() as i64))
        }
    }
}
