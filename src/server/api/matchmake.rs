// Matchmaking endpoints: enqueue and cancel
//
// Enqueue answers synchronously: 202 while waiting, 200 when this call
// completed a group. Everyone else in the group hears about the match on
// their SSE stream.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use crate::error::ApiError;
use crate::matchmaking::{CancelOutcome, EnqueueOutcome, PoolConfig};
use crate::server::state::AppState;
use crate::treatment::AssignmentStrategy;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchmakeRequest {
    pub pool_id: String,
    #[serde(rename = "num_users")]
    pub num_users: usize,
    pub timeout_seconds: u64,
    #[serde(default)]
    pub timeout_target: Option<String>,
    #[serde(default)]
    pub assignment: AssignmentStrategy,
    #[serde(default)]
    pub conditions: Vec<String>,
}

pub async fn matchmake(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<MatchmakeRequest>,
) -> Result<Response, ApiError> {
    // The session id is the bearer of authority; unknown ids get nothing.
    let snapshot = state.sessions.get(&session_id).await?;
    if snapshot.session.is_ended() {
        return Err(ApiError::SessionEnded);
    }

    let outcome = state
        .matchmaker
        .enqueue(
            &session_id,
            &snapshot.session.config_id,
            &request.pool_id,
            PoolConfig {
                num_users: request.num_users,
                timeout: Duration::from_secs(request.timeout_seconds),
                timeout_target: request.timeout_target,
                assignment: request.assignment,
                conditions: request.conditions,
            },
        )
        .await?;

    Ok(match outcome {
        EnqueueOutcome::Waiting { position } => (
            StatusCode::ACCEPTED,
            Json(json!({ "status": "waiting", "position": position })),
        )
            .into_response(),
        EnqueueOutcome::Matched {
            group_id,
            treatment,
        } => Json(json!({
            "status": "matched",
            "groupId": group_id,
            "treatment": treatment,
        }))
        .into_response(),
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequest {
    pub pool_id: String,
}

pub async fn cancel(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<CancelRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.sessions.get(&session_id).await?;

    let outcome = state
        .matchmaker
        .remove_session(&session_id, Some(&request.pool_id))
        .await;
    Ok(Json(json!({
        "status": match outcome {
            CancelOutcome::Cancelled => "cancelled",
            CancelOutcome::NotFound => "not_found",
        }
    })))
}
