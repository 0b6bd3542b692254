//! Sessions repository.
//!
//! Status changes are conditional updates: the caller names the statuses a
//! transition may start from and the update matches nothing otherwise.
//! A `None` result therefore means "not found or not in a legal source state",
//! which callers treat as a no-op.

use super::observe;
use crate::errors::SessionError;
use crate::models::{
    NewSession, Role, RosterMember, Session, SessionFilter, SessionStatus, SessionWithRoster,
};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::time::Instant;
use tracing::instrument;
use uuid::Uuid;

const SESSION_COLUMNS: &str = "session_id, scope_id, scheduled_start, timezone, status, \
     external_event_ref, cancel_reason, created_at, updated_at";

/// Sessions repository for database operations.
pub struct SessionsRepository;

impl SessionsRepository {
    /// Create a session and seed its leader in one transaction.
    #[instrument(skip_all, name = "ss.repo.create_session", fields(scope_id = %new.scope_id))]
    pub async fn create_session(
        pool: &PgPool,
        new: &NewSession,
    ) -> Result<SessionWithRoster, SessionError> {
        let start = Instant::now();
        let result = Self::create_session_tx(pool, new).await;
        let (session, leader) = observe("create_session", start, result)?;

        Ok(SessionWithRoster::new(session.try_into()?, vec![leader.try_into()?]))
    }

    async fn create_session_tx(
        pool: &PgPool,
        new: &NewSession,
    ) -> Result<(SessionRow, RosterRow), sqlx::Error> {
        let mut tx = pool.begin().await?;

        let session: SessionRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO sessions (scope_id, scheduled_start, timezone, status)
            VALUES ($1, $2, $3, 'scheduled')
            RETURNING {SESSION_COLUMNS}
            "#
        ))
        .bind(&new.scope_id)
        .bind(new.scheduled_start)
        .bind(new.timezone.as_deref())
        .fetch_one(&mut *tx)
        .await?;

        let leader: RosterRow = sqlx::query_as(
            r#"
            INSERT INTO roster_members (session_id, user_id, role, timezone)
            VALUES ($1, $2, 'leader', $3)
            RETURNING user_id, role, timezone, joined_at
            "#,
        )
        .bind(session.session_id)
        .bind(&new.leader_user_id)
        .bind(new.leader_timezone.as_deref())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((session, leader))
    }

    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn get_session(
        pool: &PgPool,
        session_id: Uuid,
    ) -> Result<Option<Session>, SessionError> {
        let start = Instant::now();

        let result: Result<Option<SessionRow>, sqlx::Error> = sqlx::query_as(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE session_id = $1"
        ))
        .bind(session_id)
        .fetch_optional(pool)
        .await;

        observe("get_session", start, result)?
            .map(Session::try_from)
            .transpose()
    }

    /// Current roster ordered by admission time.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn get_roster(
        pool: &PgPool,
        session_id: Uuid,
    ) -> Result<Vec<RosterMember>, SessionError> {
        let start = Instant::now();

        let result: Result<Vec<RosterRow>, sqlx::Error> = sqlx::query_as(
            r#"
            SELECT user_id, role, timezone, joined_at
            FROM roster_members
            WHERE session_id = $1
            ORDER BY joined_at, user_id
            "#,
        )
        .bind(session_id)
        .fetch_all(pool)
        .await;

        observe("get_roster", start, result)?
            .into_iter()
            .map(RosterMember::try_from)
            .collect()
    }

    /// List sessions matching `filter`, earliest start first.
    #[instrument(skip_all)]
    pub async fn list_sessions(
        pool: &PgPool,
        filter: &SessionFilter,
    ) -> Result<Vec<Session>, SessionError> {
        let start = Instant::now();

        let statuses: Option<Vec<String>> = if filter.statuses.is_empty() {
            None
        } else {
            Some(
                filter
                    .statuses
                    .iter()
                    .map(|s| s.as_str().to_string())
                    .collect(),
            )
        };

        let result: Result<Vec<SessionRow>, sqlx::Error> = sqlx::query_as(&format!(
            r#"
            SELECT {SESSION_COLUMNS}
            FROM sessions
            WHERE ($1::text[] IS NULL OR status = ANY($1))
              AND ($2::text IS NULL OR scope_id = $2)
            ORDER BY scheduled_start, session_id
            "#
        ))
        .bind(statuses)
        .bind(filter.scope_id.as_deref())
        .fetch_all(pool)
        .await;

        observe("list_sessions", start, result)?
            .into_iter()
            .map(Session::try_from)
            .collect()
    }

    /// Move a session to `to` if its current status is one of `from`.
    ///
    /// `reason` is recorded as the cancel reason when present.
    #[instrument(skip_all, fields(session_id = %session_id, to = %to))]
    pub async fn transition_status(
        pool: &PgPool,
        session_id: Uuid,
        from: &[SessionStatus],
        to: SessionStatus,
        reason: Option<&str>,
    ) -> Result<Option<Session>, SessionError> {
        let start = Instant::now();

        let from: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();

        let result: Result<Option<SessionRow>, sqlx::Error> = sqlx::query_as(&format!(
            r#"
            UPDATE sessions
            SET status = $2,
                cancel_reason = COALESCE($3, cancel_reason),
                updated_at = NOW()
            WHERE session_id = $1 AND status = ANY($4)
            RETURNING {SESSION_COLUMNS}
            "#
        ))
        .bind(session_id)
        .bind(to.as_str())
        .bind(reason)
        .bind(from)
        .fetch_optional(pool)
        .await;

        observe("transition_status", start, result)?
            .map(Session::try_from)
            .transpose()
    }

    /// Change the start instant and display timezone of an open session.
    ///
    /// Only `scheduled` and `full` sessions can be rescheduled.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn update_schedule(
        pool: &PgPool,
        session_id: Uuid,
        scheduled_start: DateTime<Utc>,
        timezone: Option<&str>,
    ) -> Result<Option<Session>, SessionError> {
        let start = Instant::now();

        let result: Result<Option<SessionRow>, sqlx::Error> = sqlx::query_as(&format!(
            r#"
            UPDATE sessions
            SET scheduled_start = $2,
                timezone = COALESCE($3, timezone),
                updated_at = NOW()
            WHERE session_id = $1 AND status IN ('scheduled', 'full')
            RETURNING {SESSION_COLUMNS}
            "#
        ))
        .bind(session_id)
        .bind(scheduled_start)
        .bind(timezone)
        .fetch_optional(pool)
        .await;

        observe("update_schedule", start, result)?
            .map(Session::try_from)
            .transpose()
    }

    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn set_external_event_ref(
        pool: &PgPool,
        session_id: Uuid,
        event_ref: Option<&str>,
    ) -> Result<(), SessionError> {
        let start = Instant::now();

        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET external_event_ref = $2, updated_at = NOW()
            WHERE session_id = $1
            "#,
        )
        .bind(session_id)
        .bind(event_ref)
        .execute(pool)
        .await;

        observe("set_external_event_ref", start, result)?;
        Ok(())
    }

    /// An `active` session in `scope_id`, other than `exclude`, that has
    /// `user_id` on its roster.
    #[instrument(skip_all, fields(scope_id = %scope_id))]
    pub async fn find_active_membership(
        pool: &PgPool,
        scope_id: &str,
        user_id: &str,
        exclude: Uuid,
    ) -> Result<Option<Uuid>, SessionError> {
        let start = Instant::now();

        let result: Result<Option<(Uuid,)>, sqlx::Error> = sqlx::query_as(
            r#"
            SELECT s.session_id
            FROM sessions s
            JOIN roster_members r ON r.session_id = s.session_id
            WHERE s.scope_id = $1
              AND r.user_id = $2
              AND s.status = 'active'
              AND s.session_id <> $3
            LIMIT 1
            "#,
        )
        .bind(scope_id)
        .bind(user_id)
        .bind(exclude)
        .fetch_optional(pool)
        .await;

        Ok(observe("find_active_membership", start, result)?.map(|(id,)| id))
    }

    /// Non-terminal sessions in `scope_id`, other than `exclude`, led by
    /// `user_id` and starting within `[from, to]`.
    #[instrument(skip_all, fields(scope_id = %scope_id))]
    pub async fn find_leader_sessions_between(
        pool: &PgPool,
        scope_id: &str,
        user_id: &str,
        exclude: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Session>, SessionError> {
        let start = Instant::now();

        let result: Result<Vec<SessionRow>, sqlx::Error> = sqlx::query_as(
            r#"
            SELECT s.session_id, s.scope_id, s.scheduled_start, s.timezone, s.status,
                   s.external_event_ref, s.cancel_reason, s.created_at, s.updated_at
            FROM sessions s
            JOIN roster_members r ON r.session_id = s.session_id
            WHERE s.scope_id = $1
              AND r.user_id = $2
              AND r.role = 'leader'
              AND s.status IN ('scheduled', 'full', 'active')
              AND s.session_id <> $3
              AND s.scheduled_start BETWEEN $4 AND $5
            ORDER BY s.scheduled_start
            "#,
        )
        .bind(scope_id)
        .bind(user_id)
        .bind(exclude)
        .bind(from)
        .bind(to)
        .fetch_all(pool)
        .await;

        observe("find_leader_sessions_between", start, result)?
            .into_iter()
            .map(Session::try_from)
            .collect()
    }
}

/// Database row for sessions.
#[derive(sqlx::FromRow)]
pub(crate) struct SessionRow {
    session_id: Uuid,
    scope_id: String,
    scheduled_start: DateTime<Utc>,
    timezone: Option<String>,
    status: String,
    external_event_ref: Option<String>,
    cancel_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SessionRow> for Session {
    type Error = SessionError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        Ok(Session {
            session_id: row.session_id,
            scope_id: row.scope_id,
            scheduled_start: row.scheduled_start,
            timezone: row.timezone,
            status: row.status.parse()?,
            external_event_ref: row.external_event_ref,
            cancel_reason: row.cancel_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Database row for roster members.
#[derive(sqlx::FromRow)]
pub(crate) struct RosterRow {
    user_id: String,
    role: String,
    timezone: Option<String>,
    joined_at: DateTime<Utc>,
}

impl TryFrom<RosterRow> for RosterMember {
    type Error = SessionError;

    fn try_from(row: RosterRow) -> Result<Self, Self::Error> {
        Ok(RosterMember {
            user_id: row.user_id,
            role: row.role.parse::<Role>()?,
            timezone: row.timezone,
            joined_at: row.joined_at,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn new_session(scope: &str, leader: &str, start: DateTime<Utc>) -> NewSession {
        NewSession {
            scope_id: scope.to_string(),
            scheduled_start: start,
            timezone: Some("Europe/Berlin".to_string()),
            leader_user_id: leader.to_string(),
            leader_timezone: None,
        }
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_create_session_seeds_leader(pool: PgPool) {
        let start = Utc::now() + Duration::days(1);
        let created = SessionsRepository::create_session(&pool, &new_session("guild", "lead", start))
            .await
            .unwrap();

        assert_eq!(created.session.status, SessionStatus::Scheduled);
        assert_eq!(created.roster.len(), 1);
        assert_eq!(created.leader().unwrap().user_id, "lead");

        let loaded = SessionsRepository::get_session(&pool, created.session.session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.timezone.as_deref(), Some("Europe/Berlin"));
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_get_session_missing_returns_none(pool: PgPool) {
        let result = SessionsRepository::get_session(&pool, Uuid::new_v4())
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_transition_status_respects_source_states(pool: PgPool) {
        let start = Utc::now() + Duration::days(1);
        let created = SessionsRepository::create_session(&pool, &new_session("guild", "lead", start))
            .await
            .unwrap();
        let id = created.session.session_id;

        // scheduled -> completed is not a legal source set.
        let none = SessionsRepository::transition_status(
            &pool,
            id,
            &[SessionStatus::Active],
            SessionStatus::Completed,
            None,
        )
        .await
        .unwrap();
        assert!(none.is_none());

        let canceled = SessionsRepository::transition_status(
            &pool,
            id,
            &[SessionStatus::Scheduled, SessionStatus::Full],
            SessionStatus::Canceled,
            Some("Insufficient players (1/6)"),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(canceled.status, SessionStatus::Canceled);
        assert_eq!(
            canceled.cancel_reason.as_deref(),
            Some("Insufficient players (1/6)")
        );

        // Terminal: nothing moves it.
        let again = SessionsRepository::transition_status(
            &pool,
            id,
            &SessionStatus::NON_TERMINAL,
            SessionStatus::Canceled,
            Some("again"),
        )
        .await
        .unwrap();
        assert!(again.is_none());
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_list_sessions_filters_by_status(pool: PgPool) {
        let start = Utc::now() + Duration::days(1);
        let a = SessionsRepository::create_session(&pool, &new_session("guild", "a", start))
            .await
            .unwrap();
        SessionsRepository::create_session(&pool, &new_session("guild", "b", start))
            .await
            .unwrap();
        SessionsRepository::transition_status(
            &pool,
            a.session.session_id,
            &[SessionStatus::Scheduled],
            SessionStatus::Canceled,
            None,
        )
        .await
        .unwrap();

        let open = SessionsRepository::list_sessions(&pool, &SessionFilter::non_terminal())
            .await
            .unwrap();
        assert_eq!(open.len(), 1);

        let all = SessionsRepository::list_sessions(&pool, &SessionFilter::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_update_schedule_only_open_sessions(pool: PgPool) {
        let start = Utc::now() + Duration::days(1);
        let created = SessionsRepository::create_session(&pool, &new_session("guild", "lead", start))
            .await
            .unwrap();
        let id = created.session.session_id;
        let moved = start + Duration::hours(2);

        let updated = SessionsRepository::update_schedule(&pool, id, moved, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.scheduled_start.timestamp(), moved.timestamp());
        assert_eq!(updated.timezone.as_deref(), Some("Europe/Berlin"));

        SessionsRepository::transition_status(
            &pool,
            id,
            &[SessionStatus::Scheduled],
            SessionStatus::Canceled,
            None,
        )
        .await
        .unwrap();
        let refused = SessionsRepository::update_schedule(&pool, id, start, None)
            .await
            .unwrap();
        assert!(refused.is_none());
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_find_leader_sessions_between(pool: PgPool) {
        let start = Utc::now() + Duration::days(1);
        let hosted = SessionsRepository::create_session(&pool, &new_session("guild", "lead", start))
            .await
            .unwrap();
        SessionsRepository::create_session(&pool, &new_session("other", "lead", start))
            .await
            .unwrap();

        let found = SessionsRepository::find_leader_sessions_between(
            &pool,
            "guild",
            "lead",
            Uuid::new_v4(),
            start - Duration::hours(1),
            start + Duration::hours(1),
        )
        .await
        .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found.first().unwrap().session_id, hosted.session.session_id);

        let excluded = SessionsRepository::find_leader_sessions_between(
            &pool,
            "guild",
            "lead",
            hosted.session.session_id,
            start - Duration::hours(1),
            start + Duration::hours(1),
        )
        .await
        .unwrap();
        assert!(excluded.is_empty());
    }
}
