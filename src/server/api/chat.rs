// Chat endpoints: send, history, start-agents

use axum::extract::{Path, Query, State};
use axum::response::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::server::state::AppState;
use crate::store::{ChatMessage, SenderType};

fn message_body(message: &ChatMessage) -> Value {
    json!({
        "messageId": message.id,
        "groupId": message.group_id,
        "senderId": message.sender_id,
        "senderType": message.sender_type,
        "content": message.content,
        "createdAt": message.created_at.to_rfc3339(),
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// POST /chat/:group_id/send
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub session_id: String,
    pub content: String,
    #[serde(default)]
    pub sender_type: Option<SenderType>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

pub async fn send(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    Json(request): Json<SendRequest>,
) -> Result<Json<Value>, ApiError> {
    if request.content.trim().is_empty() {
        return Err(ApiError::InvalidInput("content must not be empty".into()));
    }

    let (message, deduplicated) = state
        .chat
        .send(
            &group_id,
            &request.session_id,
            &request.content,
            request.sender_type,
            request.idempotency_key,
        )
        .await?;

    let mut body = json!({
        "messageId": message.id,
        "createdAt": message.created_at.to_rfc3339(),
    });
    if deduplicated {
        body["deduplicated"] = json!(true);
    }
    Ok(Json(body))
}

// ─────────────────────────────────────────────────────────────────────────────
// GET /chat/:group_id/history?sessionId=...
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    pub session_id: String,
}

pub async fn history(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Value>, ApiError> {
    let messages = state.chat.history(&group_id, &query.session_id).await?;
    let messages: Vec<Value> = messages.iter().map(message_body).collect();
    Ok(Json(json!({ "messages": messages })))
}

// ─────────────────────────────────────────────────────────────────────────────
// POST /chat/:group_id/start-agents
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartAgentsRequest {
    pub session_id: String,
}

pub async fn start_agents(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    Json(request): Json<StartAgentsRequest>,
) -> Result<Json<Value>, ApiError> {
    state
        .chat
        .start_agents(&group_id, &request.session_id)
        .await?;
    Ok(Json(json!({})))
}
