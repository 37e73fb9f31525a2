//! Error taxonomy shared by the runtime components and HTTP handlers
//!
//! Idempotency replays never land here: a dedup is a successful no-op that
//! returns the prior result with a flag. This enum covers the cases that are
//! actual failures from the caller's point of view.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;

/// Failures that map onto HTTP status codes.
#[derive(Debug)]
pub enum ApiError {
    /// Unknown session, config, or group.
    NotFound(&'static str),
    /// The config requires sign-in and the caller is anonymous.
    AuthRequired,
    /// The participant already completed this study.
    SessionBlocked { message: String },
    /// Mutating call on a session whose `endedAt` is set.
    SessionEnded,
    /// Chat operation from a non-member session.
    NotAMember,
    /// Request validation failure.
    InvalidInput(String),
    /// Anything else; details are logged, not leaked.
    Internal(anyhow::Error),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::AuthRequired => StatusCode::UNAUTHORIZED,
            Self::SessionBlocked { .. } | Self::SessionEnded => StatusCode::CONFLICT,
            Self::NotAMember => StatusCode::FORBIDDEN,
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            Self::NotFound(what) => json!({ "error": what }),
            Self::AuthRequired => json!({ "error": "authentication_required" }),
            Self::SessionBlocked { message } => json!({
                "status": "blocked",
                "error": "session_blocked",
                "message": message,
            }),
            Self::SessionEnded => json!({ "error": "session_ended" }),
            Self::NotAMember => json!({ "error": "not_a_member" }),
            Self::InvalidInput(message) => json!({
                "error": "invalid_input",
                "message": message,
            }),
            Self::Internal(e) => {
                tracing::error!("Internal error: {:?}", e);
                json!({ "error": "internal_error" })
            }
        };

        if status.is_client_error() {
            tracing::debug!("Request failed: {} {:?}", status, body);
        }
        (status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self::Internal(e)
    }
}
