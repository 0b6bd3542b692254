//! Roster repository.
//!
//! # Concurrency
//!
//! `conditional_admit` is the only capacity-critical write. It runs in a
//! transaction that first locks the session row (`FOR UPDATE`), then counts
//! and inserts in a single statement. Concurrent admits to the same session
//! serialize on the row lock, and the insert statement takes its snapshot
//! after the lock is granted, so it always sees the rows committed by the
//! previous holder.
//!
//! The leader row is never modified through this repository.

use super::observe;
use crate::errors::SessionError;
use crate::models::{NewMember, Role};
use sqlx::PgPool;
use std::time::Instant;
use tracing::instrument;
use uuid::Uuid;

/// Roster repository for database operations.
pub struct RosterRepository;

impl RosterRepository {
    /// Insert `member` only if the session is `scheduled` and its roster
    /// holds fewer than `capacity` members.
    ///
    /// Returns `false` when the roster is full, the session is not open,
    /// or the user is already on the roster.
    #[instrument(skip_all, fields(session_id = %session_id, role = %member.role))]
    pub async fn conditional_admit(
        pool: &PgPool,
        session_id: Uuid,
        member: &NewMember,
        capacity: i64,
    ) -> Result<bool, SessionError> {
        let start = Instant::now();
        let result = Self::conditional_admit_tx(pool, session_id, member, capacity).await;
        let admitted = observe("conditional_admit", start, result)?;

        tracing::debug!(
            target: "ss.roster",
            session_id = %session_id,
            admitted,
            "Conditional admit evaluated"
        );

        Ok(admitted)
    }

    async fn conditional_admit_tx(
        pool: &PgPool,
        session_id: Uuid,
        member: &NewMember,
        capacity: i64,
    ) -> Result<bool, sqlx::Error> {
        let mut tx = pool.begin().await?;

        let open: Option<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT session_id
            FROM sessions
            WHERE session_id = $1 AND status = 'scheduled'
            FOR UPDATE
            "#,
        )
        .bind(session_id)
        .fetch_optional(&mut *tx)
        .await?;

        if open.is_none() {
            tx.rollback().await?;
            return Ok(false);
        }

        let inserted: Option<(String,)> = sqlx::query_as(
            r#"
            WITH current_count AS (
                SELECT COUNT(*) AS cnt
                FROM roster_members
                WHERE session_id = $1
            )
            INSERT INTO roster_members (session_id, user_id, role, timezone)
            SELECT $1, $2, $3, $4
            FROM current_count
            WHERE current_count.cnt < $5
            ON CONFLICT (session_id, user_id) DO NOTHING
            RETURNING user_id
            "#,
        )
        .bind(session_id) // $1
        .bind(&member.user_id) // $2
        .bind(member.role.as_str()) // $3
        .bind(member.timezone.as_deref()) // $4
        .bind(capacity) // $5
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(inserted.is_some())
    }

    /// Change an ordinary member's role. Returns `false` if no such member.
    #[instrument(skip_all, fields(session_id = %session_id, role = %role))]
    pub async fn update_member_role(
        pool: &PgPool,
        session_id: Uuid,
        user_id: &str,
        role: Role,
    ) -> Result<bool, SessionError> {
        let start = Instant::now();

        let result = sqlx::query(
            r#"
            UPDATE roster_members
            SET role = $3
            WHERE session_id = $1 AND user_id = $2 AND role <> 'leader'
            "#,
        )
        .bind(session_id)
        .bind(user_id)
        .bind(role.as_str())
        .execute(pool)
        .await;

        Ok(observe("update_member_role", start, result)?.rows_affected() > 0)
    }

    /// Remove an ordinary member. Returns `false` if no such member.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn remove_member(
        pool: &PgPool,
        session_id: Uuid,
        user_id: &str,
    ) -> Result<bool, SessionError> {
        let start = Instant::now();

        let result = sqlx::query(
            r#"
            DELETE FROM roster_members
            WHERE session_id = $1 AND user_id = $2 AND role <> 'leader'
            "#,
        )
        .bind(session_id)
        .bind(user_id)
        .execute(pool)
        .await;

        Ok(observe("remove_member", start, result)?.rows_affected() > 0)
    }

    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn count_members(pool: &PgPool, session_id: Uuid) -> Result<i64, SessionError> {
        let start = Instant::now();

        let result: Result<(i64,), sqlx::Error> =
            sqlx::query_as("SELECT COUNT(*) FROM roster_members WHERE session_id = $1")
                .bind(session_id)
                .fetch_one(pool)
                .await;

        Ok(observe("count_members", start, result)?.0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::models::{NewSession, SessionStatus, SESSION_CAPACITY};
    use crate::repositories::SessionsRepository;
    use chrono::{Duration, Utc};

    async fn open_session(pool: &PgPool) -> Uuid {
        let new = NewSession {
            scope_id: "guild".to_string(),
            scheduled_start: Utc::now() + Duration::days(1),
            timezone: None,
            leader_user_id: "lead".to_string(),
            leader_timezone: None,
        };
        SessionsRepository::create_session(pool, &new)
            .await
            .unwrap()
            .session
            .session_id
    }

    fn member(user_id: &str, role: Role) -> NewMember {
        NewMember {
            user_id: user_id.to_string(),
            role,
            timezone: None,
        }
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_admit_until_capacity(pool: PgPool) {
        let id = open_session(&pool).await;

        for n in 1..SESSION_CAPACITY {
            let admitted = RosterRepository::conditional_admit(
                &pool,
                id,
                &member(&format!("user-{n}"), Role::Damage),
                SESSION_CAPACITY,
            )
            .await
            .unwrap();
            assert!(admitted, "member {n} should be admitted");
        }

        let overflow = RosterRepository::conditional_admit(
            &pool,
            id,
            &member("late", Role::Tank),
            SESSION_CAPACITY,
        )
        .await
        .unwrap();
        assert!(!overflow);
        assert_eq!(
            RosterRepository::count_members(&pool, id).await.unwrap(),
            SESSION_CAPACITY
        );
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_admit_duplicate_user_is_refused(pool: PgPool) {
        let id = open_session(&pool).await;

        assert!(RosterRepository::conditional_admit(&pool, id, &member("u", Role::Tank), 6)
            .await
            .unwrap());
        assert!(!RosterRepository::conditional_admit(&pool, id, &member("u", Role::Healer), 6)
            .await
            .unwrap());
        assert_eq!(RosterRepository::count_members(&pool, id).await.unwrap(), 2);
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_admit_refused_when_not_scheduled(pool: PgPool) {
        let id = open_session(&pool).await;
        SessionsRepository::transition_status(
            &pool,
            id,
            &[SessionStatus::Scheduled],
            SessionStatus::Canceled,
            None,
        )
        .await
        .unwrap();

        let admitted =
            RosterRepository::conditional_admit(&pool, id, &member("u", Role::Tank), 6)
                .await
                .unwrap();
        assert!(!admitted);
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_leader_row_is_not_mutable(pool: PgPool) {
        let id = open_session(&pool).await;

        assert!(!RosterRepository::update_member_role(&pool, id, "lead", Role::Tank)
            .await
            .unwrap());
        assert!(!RosterRepository::remove_member(&pool, id, "lead").await.unwrap());
        assert_eq!(RosterRepository::count_members(&pool, id).await.unwrap(), 1);
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_update_and_remove_member(pool: PgPool) {
        let id = open_session(&pool).await;
        RosterRepository::conditional_admit(&pool, id, &member("u", Role::Tank), 6)
            .await
            .unwrap();

        assert!(RosterRepository::update_member_role(&pool, id, "u", Role::Healer)
            .await
            .unwrap());
        let roster = SessionsRepository::get_roster(&pool, id).await.unwrap();
        let updated = roster.iter().find(|m| m.user_id == "u").unwrap();
        assert_eq!(updated.role, Role::Healer);

        assert!(RosterRepository::remove_member(&pool, id, "u").await.unwrap());
        assert!(!RosterRepository::remove_member(&pool, id, "u").await.unwrap());
    }
}
