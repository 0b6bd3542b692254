//! Session administration handlers.
//!
//! - `POST /v1/sessions` - Create a session with its leader
//! - `GET /v1/sessions/{id}` - Session with roster
//! - `PATCH /v1/sessions/{id}` - Reschedule an open session
//! - `POST /v1/sessions/{id}/cancel` - Manual cancel
//! - `POST /v1/sessions/{id}/end` - Manual end of an active session
//! - `POST /v1/sessions/{id}/roles` - Role selection
//! - `DELETE /v1/sessions/{id}/members/{user_id}` - Remove an ordinary member
//!
//! Handlers validate the request body, read the clock once and delegate to
//! [`SessionService`](crate::services::SessionService).

use crate::errors::SessionError;
use crate::models::{
    CancelSessionRequest, CreateSessionRequest, RescheduleSessionRequest, SelectRoleRequest,
    SelectRoleResponse, Session, SessionTransitionResponse, SessionWithRoster,
};
use crate::routes::AppState;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

// ============================================================================
// Handler: POST /v1/sessions
// ============================================================================

/// Handler for POST /v1/sessions
///
/// # Response
///
/// - 201 Created: session with its leader on the roster
/// - 400 Bad Request: invalid identifiers, timezone, or a start too close
///   to allow a fill-deadline
#[instrument(skip_all, fields(scope_id = %request.scope_id))]
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<SessionWithRoster>), SessionError> {
    request.validate().map_err(SessionError::BadRequest)?;

    let created = state
        .sessions
        .create_session(request.into_new_session(), Utc::now())
        .await?;

    Ok((StatusCode::CREATED, Json(created)))
}

// ============================================================================
// Handler: GET /v1/sessions/{id}
// ============================================================================

/// Handler for GET /v1/sessions/{id}
#[instrument(skip_all, fields(session_id = %session_id))]
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<SessionWithRoster>, SessionError> {
    Ok(Json(state.sessions.get_session(session_id).await?))
}

// ============================================================================
// Handler: PATCH /v1/sessions/{id}
// ============================================================================

/// Handler for PATCH /v1/sessions/{id}
///
/// # Response
///
/// - 200 OK: updated session
/// - 404 Not Found: unknown session
/// - 409 Conflict: session is active or terminal
#[instrument(skip_all, fields(session_id = %session_id))]
pub async fn reschedule_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
    Json(request): Json<RescheduleSessionRequest>,
) -> Result<Json<Session>, SessionError> {
    request.validate().map_err(SessionError::BadRequest)?;

    let session = state
        .sessions
        .reschedule_session(
            session_id,
            request.scheduled_start,
            request.timezone.as_deref(),
            Utc::now(),
        )
        .await?;

    Ok(Json(session))
}

// ============================================================================
// Handler: POST /v1/sessions/{id}/cancel
// ============================================================================

/// Handler for POST /v1/sessions/{id}/cancel
///
/// The body is optional. An empty body cancels with the default reason.
/// Cancelling a terminal session returns 200 with `changed: false`.
#[instrument(skip_all, fields(session_id = %session_id))]
pub async fn cancel_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
    body: Bytes,
) -> Result<Json<SessionTransitionResponse>, SessionError> {
    let request = parse_optional_body(&body)?;
    request.validate().map_err(SessionError::BadRequest)?;

    let result = state
        .sessions
        .cancel_session(session_id, request.reason.as_deref())
        .await?;

    info!(
        target: "ss.handlers.sessions",
        session_id = %session_id,
        changed = result.changed,
        "Manual cancel handled"
    );

    Ok(Json(SessionTransitionResponse {
        changed: result.changed,
        session: result.session,
    }))
}

// ============================================================================
// Handler: POST /v1/sessions/{id}/end
// ============================================================================

/// Handler for POST /v1/sessions/{id}/end
///
/// # Response
///
/// - 200 OK: `changed: true` when the session completed, `false` if it was
///   already terminal
/// - 409 Conflict: session has not started yet
#[instrument(skip_all, fields(session_id = %session_id))]
pub async fn end_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<SessionTransitionResponse>, SessionError> {
    let result = state.sessions.end_session(session_id).await?;

    Ok(Json(SessionTransitionResponse {
        changed: result.changed,
        session: result.session,
    }))
}

// ============================================================================
// Handler: POST /v1/sessions/{id}/roles
// ============================================================================

/// Handler for POST /v1/sessions/{id}/roles
///
/// Rejections (locked, expired, full, ...) are outcomes, not errors: the
/// response is 200 with the outcome and the current session view.
#[instrument(skip_all, fields(session_id = %session_id, role = %request.role))]
pub async fn select_role(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
    Json(request): Json<SelectRoleRequest>,
) -> Result<Json<SelectRoleResponse>, SessionError> {
    request.validate().map_err(SessionError::BadRequest)?;

    let (outcome, session) = state
        .sessions
        .select_role(
            session_id,
            request.user_id.trim(),
            request.role,
            request.timezone,
            Utc::now(),
        )
        .await?;

    Ok(Json(SelectRoleResponse { outcome, session }))
}

// ============================================================================
// Handler: DELETE /v1/sessions/{id}/members/{user_id}
// ============================================================================

/// Handler for DELETE /v1/sessions/{id}/members/{user_id}
///
/// The leader cannot be removed.
#[instrument(skip_all, fields(session_id = %session_id))]
pub async fn remove_member(
    State(state): State<Arc<AppState>>,
    Path((session_id, user_id)): Path<(Uuid, String)>,
) -> Result<Json<SessionWithRoster>, SessionError> {
    Ok(Json(
        state.sessions.remove_member(session_id, &user_id).await?,
    ))
}

fn parse_optional_body(body: &[u8]) -> Result<CancelSessionRequest, SessionError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(CancelSessionRequest::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| SessionError::BadRequest(format!("Invalid request body: {e}")))
}
