//! Session service models.
//!
//! Contains data types used across the service: persisted session and roster
//! shapes, selection outcomes, and the admin API request/response bodies.

use crate::errors::SessionError;
use crate::time;
use chrono::{DateTime, Datelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Maximum roster size, leader included.
pub const SESSION_CAPACITY: i64 = 6;

/// Maximum length of a scope or user identifier.
pub const MAX_IDENTIFIER_LENGTH: usize = 64;

/// Maximum length of a manual cancel reason.
pub const MAX_CANCEL_REASON_LENGTH: usize = 200;

/// Latest calendar year accepted for a scheduled start.
pub const MAX_SCHEDULE_YEAR: i32 = 9999;

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Open for sign-ups.
    Scheduled,

    /// Roster reached capacity before the fill-deadline.
    Full,

    /// Fill-deadline passed with a full roster.
    Active,

    /// Completion deadline reached or ended manually.
    Completed,

    /// Canceled manually or for lack of players.
    Canceled,
}

impl SessionStatus {
    /// Statuses from which a session can still change.
    pub const NON_TERMINAL: [SessionStatus; 3] = [
        SessionStatus::Scheduled,
        SessionStatus::Full,
        SessionStatus::Active,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Scheduled => "scheduled",
            SessionStatus::Full => "full",
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Canceled)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(SessionStatus::Scheduled),
            "full" => Ok(SessionStatus::Full),
            "active" => Ok(SessionStatus::Active),
            "completed" => Ok(SessionStatus::Completed),
            "canceled" => Ok(SessionStatus::Canceled),
            other => Err(SessionError::Internal(format!(
                "unknown session status '{other}'"
            ))),
        }
    }
}

/// Roster role. `Leader` is the exclusive role; the rest are ordinary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Leader,
    Tank,
    Healer,
    Damage,
    Support,
    Flex,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Leader => "leader",
            Role::Tank => "tank",
            Role::Healer => "healer",
            Role::Damage => "damage",
            Role::Support => "support",
            Role::Flex => "flex",
        }
    }

    /// Whether this is the single exclusive (leader) role.
    pub fn is_exclusive(&self) -> bool {
        matches!(self, Role::Leader)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "leader" => Ok(Role::Leader),
            "tank" => Ok(Role::Tank),
            "healer" => Ok(Role::Healer),
            "damage" => Ok(Role::Damage),
            "support" => Ok(Role::Support),
            "flex" => Ok(Role::Flex),
            other => Err(SessionError::Internal(format!("unknown role '{other}'"))),
        }
    }
}

/// A persisted session instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: Uuid,
    pub scope_id: String,
    pub scheduled_start: DateTime<Utc>,
    /// Display timezone (IANA name); `None` means the service default.
    pub timezone: Option<String>,
    pub status: SessionStatus,
    pub external_event_ref: Option<String>,
    pub cancel_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Display timezone, resolved against `fallback`.
    pub fn display_timezone(&self, fallback: Tz) -> Tz {
        time::resolve_timezone(self.timezone.as_deref(), fallback)
    }
}

/// A member admitted to a session roster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterMember {
    pub user_id: String,
    pub role: Role,
    /// Preferred timezone of the member (IANA name).
    pub timezone: Option<String>,
    pub joined_at: DateTime<Utc>,
}

/// Session plus its current roster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionWithRoster {
    #[serde(flatten)]
    pub session: Session,
    pub roster: Vec<RosterMember>,
    pub capacity: i64,
}

impl SessionWithRoster {
    pub fn new(session: Session, roster: Vec<RosterMember>) -> Self {
        Self {
            session,
            roster,
            capacity: SESSION_CAPACITY,
        }
    }

    pub fn leader(&self) -> Option<&RosterMember> {
        self.roster.iter().find(|m| m.role.is_exclusive())
    }
}

/// Input for creating a session with its leader seeded.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub scope_id: String,
    pub scheduled_start: DateTime<Utc>,
    pub timezone: Option<String>,
    pub leader_user_id: String,
    pub leader_timezone: Option<String>,
}

/// Candidate member for conditional admission.
#[derive(Debug, Clone)]
pub struct NewMember {
    pub user_id: String,
    pub role: Role,
    pub timezone: Option<String>,
}

/// Filter for listing sessions.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    /// Statuses to include; empty means all.
    pub statuses: Vec<SessionStatus>,
    pub scope_id: Option<String>,
}

impl SessionFilter {
    /// All sessions that can still change.
    pub fn non_terminal() -> Self {
        Self {
            statuses: SessionStatus::NON_TERMINAL.to_vec(),
            scope_id: None,
        }
    }

    pub fn matches(&self, session: &Session) -> bool {
        let status_ok = self.statuses.is_empty() || self.statuses.contains(&session.status);
        let scope_ok = self
            .scope_id
            .as_deref()
            .map_or(true, |scope| scope == session.scope_id);
        status_ok && scope_ok
    }
}

/// Outcome of a role selection request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SelectionOutcome {
    Locked,
    Expired,
    Invalid,
    RemovedFromParty,
    RoleChanged,
    AlreadyInSession,
    HostingSameDay,
    AddedToParty,
    PartyFull,
}

impl SelectionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionOutcome::Locked => "locked",
            SelectionOutcome::Expired => "expired",
            SelectionOutcome::Invalid => "invalid",
            SelectionOutcome::RemovedFromParty => "removed_from_party",
            SelectionOutcome::RoleChanged => "role_changed",
            SelectionOutcome::AlreadyInSession => "already_in_session",
            SelectionOutcome::HostingSameDay => "hosting_same_day",
            SelectionOutcome::AddedToParty => "added_to_party",
            SelectionOutcome::PartyFull => "party_full",
        }
    }
}

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Service health status ("healthy" or "unhealthy").
    pub status: String,

    /// Database connectivity status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,

    /// Number of sessions with live timers.
    pub scheduled_task_sets: usize,
}

// ============================================================================
// Admin API Models
// ============================================================================

/// Request body for `POST /v1/sessions`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateSessionRequest {
    pub scope_id: String,
    pub leader_user_id: String,
    pub scheduled_start: DateTime<Utc>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub leader_timezone: Option<String>,
}

impl CreateSessionRequest {
    /// Validate identifiers and timezones.
    ///
    /// The start instant is validated by the service against the clock.
    pub fn validate(&self) -> Result<(), String> {
        validate_identifier("scope_id", &self.scope_id)?;
        validate_identifier("leader_user_id", &self.leader_user_id)?;
        validate_start(self.scheduled_start)?;
        validate_timezone("timezone", self.timezone.as_deref())?;
        validate_timezone("leader_timezone", self.leader_timezone.as_deref())?;
        Ok(())
    }

    pub fn into_new_session(self) -> NewSession {
        NewSession {
            scope_id: self.scope_id.trim().to_string(),
            scheduled_start: self.scheduled_start,
            timezone: self.timezone,
            leader_user_id: self.leader_user_id.trim().to_string(),
            leader_timezone: self.leader_timezone,
        }
    }
}

/// Request body for `PATCH /v1/sessions/{id}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RescheduleSessionRequest {
    pub scheduled_start: DateTime<Utc>,
    #[serde(default)]
    pub timezone: Option<String>,
}

impl RescheduleSessionRequest {
    pub fn validate(&self) -> Result<(), String> {
        validate_start(self.scheduled_start)?;
        validate_timezone("timezone", self.timezone.as_deref())
    }
}

/// Request body for `POST /v1/sessions/{id}/cancel`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CancelSessionRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

impl CancelSessionRequest {
    pub fn validate(&self) -> Result<(), String> {
        match &self.reason {
            Some(reason) if reason.chars().count() > MAX_CANCEL_REASON_LENGTH => Err(format!(
                "reason must be at most {MAX_CANCEL_REASON_LENGTH} characters"
            )),
            _ => Ok(()),
        }
    }
}

/// Request body for `POST /v1/sessions/{id}/roles`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SelectRoleRequest {
    pub user_id: String,
    pub role: Role,
    #[serde(default)]
    pub timezone: Option<String>,
}

impl SelectRoleRequest {
    pub fn validate(&self) -> Result<(), String> {
        validate_identifier("user_id", &self.user_id)?;
        validate_timezone("timezone", self.timezone.as_deref())
    }
}

/// Response for role selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectRoleResponse {
    pub outcome: SelectionOutcome,
    pub session: SessionWithRoster,
}

/// Response for manual lifecycle operations (cancel, end).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTransitionResponse {
    /// Whether this request changed the status.
    pub changed: bool,
    pub session: Session,
}

/// Response for `GET /v1/scheduler/tasks`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTasksResponse {
    pub scheduled_task_sets: usize,
}

fn validate_identifier(field: &str, value: &str) -> Result<(), String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(format!("{field} must not be empty"));
    }
    if trimmed.chars().count() > MAX_IDENTIFIER_LENGTH {
        return Err(format!(
            "{field} must be at most {MAX_IDENTIFIER_LENGTH} characters"
        ));
    }
    Ok(())
}

fn validate_start(start: DateTime<Utc>) -> Result<(), String> {
    if start.year() > MAX_SCHEDULE_YEAR {
        return Err(format!(
            "scheduled_start must not be later than the year {MAX_SCHEDULE_YEAR}"
        ));
    }
    Ok(())
}

fn validate_timezone(field: &str, value: Option<&str>) -> Result<(), String> {
    match value {
        Some(name) if name.parse::<Tz>().is_err() => {
            Err(format!("{field} must be an IANA timezone name"))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            SessionStatus::Scheduled,
            SessionStatus::Full,
            SessionStatus::Active,
            SessionStatus::Completed,
            SessionStatus::Canceled,
        ] {
            assert_eq!(status.as_str().parse::<SessionStatus>().unwrap(), status);
        }
        assert!("cancelled".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Canceled.is_terminal());
        for status in SessionStatus::NON_TERMINAL {
            assert!(!status.is_terminal());
        }
    }

    #[test]
    fn test_only_leader_is_exclusive() {
        assert!(Role::Leader.is_exclusive());
        for role in [Role::Tank, Role::Healer, Role::Damage, Role::Support, Role::Flex] {
            assert!(!role.is_exclusive());
        }
    }

    #[test]
    fn test_selection_outcome_serializes_screaming_snake() {
        let json = serde_json::to_string(&SelectionOutcome::HostingSameDay).unwrap();
        assert_eq!(json, "\"HOSTING_SAME_DAY\"");
    }

    #[test]
    fn test_select_role_request_rejects_unknown_role() {
        let result: Result<SelectRoleRequest, _> =
            serde_json::from_str(r#"{"user_id":"u1","role":"wizard"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_create_request_validation() {
        let mut request = CreateSessionRequest {
            scope_id: "guild-1".to_string(),
            leader_user_id: "user-1".to_string(),
            scheduled_start: Utc::now(),
            timezone: Some("Europe/Paris".to_string()),
            leader_timezone: None,
        };
        assert!(request.validate().is_ok());

        request.scope_id = "   ".to_string();
        assert!(request.validate().unwrap_err().contains("scope_id"));

        request.scope_id = "guild-1".to_string();
        request.timezone = Some("Europe/Atlantis".to_string());
        assert!(request.validate().unwrap_err().contains("timezone"));
    }

    #[test]
    fn test_far_future_start_is_rejected() {
        let create: CreateSessionRequest = serde_json::from_str(
            r#"{"scope_id":"guild-1","leader_user_id":"user-1","scheduled_start":"+262142-12-31T22:00:00Z"}"#,
        )
        .unwrap();
        assert!(create.validate().unwrap_err().contains("scheduled_start"));

        let reschedule: RescheduleSessionRequest =
            serde_json::from_str(r#"{"scheduled_start":"+262142-12-31T22:00:00Z"}"#).unwrap();
        assert!(reschedule.validate().is_err());

        let ok: RescheduleSessionRequest =
            serde_json::from_str(r#"{"scheduled_start":"9999-12-31T12:00:00Z"}"#).unwrap();
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_cancel_request_reason_length() {
        let ok = CancelSessionRequest {
            reason: Some("Leader unavailable".to_string()),
        };
        assert!(ok.validate().is_ok());

        let too_long = CancelSessionRequest {
            reason: Some("x".repeat(MAX_CANCEL_REASON_LENGTH + 1)),
        };
        assert!(too_long.validate().is_err());
    }

    #[test]
    fn test_filter_matches() {
        let now = Utc::now();
        let session = Session {
            session_id: Uuid::new_v4(),
            scope_id: "guild-1".to_string(),
            scheduled_start: now,
            timezone: None,
            status: SessionStatus::Full,
            external_event_ref: None,
            cancel_reason: None,
            created_at: now,
            updated_at: now,
        };

        assert!(SessionFilter::non_terminal().matches(&session));
        assert!(SessionFilter::default().matches(&session));
        assert!(!SessionFilter {
            statuses: vec![SessionStatus::Active],
            scope_id: None,
        }
        .matches(&session));
        assert!(!SessionFilter {
            statuses: vec![],
            scope_id: Some("guild-2".to_string()),
        }
        .matches(&session));
    }
}
