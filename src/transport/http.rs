//! REST handlers: sessions, accounts and skip

use crate::error::{pairing_error, PairingError};
use crate::transport::ApiState;
use crate::types::ParticipantId;
use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};

/// Error returned by API handlers, rendered as `{"error": "..."}`
#[derive(Debug)]
pub struct ApiError(anyhow::Error);

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match pairing_error(&self.0) {
            Some(PairingError::SkipRateLimited { retry_after_ms, .. }) => (
                StatusCode::TOO_MANY_REQUESTS,
                json!({ "error": "skip_rate_limited", "retry_after_ms": retry_after_ms }),
            ),
            Some(PairingError::UsernameTaken { .. }) => {
                (StatusCode::CONFLICT, json!({ "error": "username_exists" }))
            }
            Some(PairingError::InvalidUsername { reason, .. }) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": "invalid_username", "reason": reason }),
            ),
            Some(PairingError::InvalidCredentials) => (
                StatusCode::UNAUTHORIZED,
                json!({ "error": "invalid_credentials" }),
            ),
            Some(PairingError::SessionExpired) => {
                (StatusCode::UNAUTHORIZED, json!({ "error": "session_expired" }))
            }
            Some(PairingError::ParticipantNotFound { .. }) => (
                StatusCode::NOT_FOUND,
                json!({ "error": "participant_not_found" }),
            ),
            _ => {
                error!("Request failed: {:#}", self.0);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "internal_error" }),
                )
            }
        };

        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PongResponse {
    pub pong: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AnonymousSessionResponse {
    pub token: String,
    pub websocket_url: String,
    pub expires_in_seconds: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UsernameRequest {
    pub username: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthResponse {
    pub token: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MeResponse {
    pub id: ParticipantId,
    pub username: Option<String>,
}

/// Extract a bearer token from the Authorization header
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

async fn authenticate(state: &ApiState, headers: &HeaderMap) -> Result<ParticipantId, ApiError> {
    let token = bearer_token(headers).ok_or(PairingError::InvalidCredentials)?;
    Ok(state.resolver.resolve(token).await?)
}

fn websocket_url(state: &ApiState, headers: &HeaderMap, token: &str) -> String {
    let base = match &state.public_base_url {
        Some(base) => base.trim_end_matches('/').to_string(),
        None => {
            let host = headers
                .get(header::HOST)
                .and_then(|host| host.to_str().ok())
                .unwrap_or("localhost");
            format!("ws://{}", host)
        }
    };
    format!("{}/ws/chat?token={}", base, token)
}

/// GET /ping
pub async fn ping() -> Json<PongResponse> {
    Json(PongResponse {
        pong: "pong".to_string(),
    })
}

/// POST /session/anonymous
pub async fn create_anonymous_session(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let session = state.sessions.create_anonymous()?;
    state
        .engine
        .register_participant(&session.participant_id, None)?;
    state.metrics.record_session_issued(session.kind.as_str());

    let response = AnonymousSessionResponse {
        websocket_url: websocket_url(&state, &headers, &session.token),
        expires_in_seconds: session.expires_in.as_secs(),
        token: session.token,
    };
    Ok((StatusCode::CREATED, Json(response)))
}

/// POST /account/register
///
/// With a valid bearer token the username is attached to that participant,
/// otherwise a new participant is created.
pub async fn register(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<UsernameRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state
        .sessions
        .register(&request.username, bearer_token(&headers))?;
    let username = state.sessions.username_of(&session.participant_id)?;
    state
        .engine
        .register_participant(&session.participant_id, username.as_deref())?;
    state.metrics.record_session_issued(session.kind.as_str());

    Ok((
        StatusCode::CREATED,
        Json(AuthResponse {
            token: session.token,
        }),
    ))
}

/// POST /login
pub async fn login(
    State(state): State<ApiState>,
    Json(request): Json<UsernameRequest>,
) -> Result<Json<AuthResponse>, ApiError> {
    let session = match state.sessions.login(&request.username) {
        Ok(session) => session,
        Err(e) => {
            warn!("Login failed for '{}'", request.username);
            return Err(e.into());
        }
    };
    let username = state.sessions.username_of(&session.participant_id)?;
    state
        .engine
        .register_participant(&session.participant_id, username.as_deref())?;
    state.metrics.record_session_issued(session.kind.as_str());

    Ok(Json(AuthResponse {
        token: session.token,
    }))
}

/// GET /me
pub async fn me(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<MeResponse>, ApiError> {
    let participant_id = authenticate(&state, &headers).await?;
    let username = state.sessions.username_of(&participant_id)?;
    Ok(Json(MeResponse {
        id: participant_id,
        username,
    }))
}

/// POST /session/skip
pub async fn skip(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let participant_id = authenticate(&state, &headers).await?;
    let outcome = state.engine.skip(&participant_id)?;
    info!(
        "Participant '{}' skipped via API (ended: {:?})",
        participant_id, outcome.ended
    );
    Ok(StatusCode::NO_CONTENT)
}
