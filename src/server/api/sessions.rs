// Session endpoints: start, get, advance, state, events, randomize

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::error::ApiError;
use crate::server::state::AppState;
use crate::session::{NewEvent, Snapshot, StartStatus};
use crate::store::ProlificInfo;
use crate::treatment::AssignmentStrategy;

/// Authenticated user id as installed by the fronting auth layer.
fn auth_user(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// The session snapshot shared by start/get/advance responses.
fn snapshot_body(snapshot: &Snapshot) -> Map<String, Value> {
    let mut body = Map::new();
    body.insert("sessionId".into(), json!(snapshot.session.id));
    body.insert("configId".into(), json!(snapshot.session.config_id));
    body.insert(
        "currentPageId".into(),
        json!(snapshot.session.current_page_id),
    );
    body.insert(
        "page".into(),
        serde_json::to_value(&snapshot.page).unwrap_or(Value::Null),
    );
    body.insert(
        "user_state".into(),
        Value::Object(snapshot.session.user_state.clone()),
    );
    body.insert(
        "endedAt".into(),
        snapshot
            .session
            .ended_at
            .map(|t| json!(t.to_rfc3339()))
            .unwrap_or(Value::Null),
    );
    body
}

// ─────────────────────────────────────────────────────────────────────────────
// POST /sessions/start
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub config_id: String,
    #[serde(default)]
    pub prolific: Option<ProlificInfo>,
}

pub async fn start(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<StartRequest>,
) -> Result<Json<Value>, ApiError> {
    let user_id = auth_user(&headers);
    let (status, snapshot) = state
        .sessions
        .start(&request.config_id, user_id.as_deref(), request.prolific)
        .await?;

    let mut body = snapshot_body(&snapshot);
    body.insert(
        "status".into(),
        json!(match status {
            StartStatus::Created => "created",
            StartStatus::Resumed => "resumed",
        }),
    );
    Ok(Json(Value::Object(body)))
}

// ─────────────────────────────────────────────────────────────────────────────
// GET /sessions/:id
// ─────────────────────────────────────────────────────────────────────────────

pub async fn get(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let snapshot = state.sessions.get(&session_id).await?;
    Ok(Json(Value::Object(snapshot_body(&snapshot))))
}

// ─────────────────────────────────────────────────────────────────────────────
// POST /sessions/:id/advance
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvanceRequest {
    pub target: String,
    pub idempotency_key: String,
}

pub async fn advance(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<AdvanceRequest>,
) -> Result<Json<Value>, ApiError> {
    let snapshot = state
        .sessions
        .advance(&session_id, &request.target, &request.idempotency_key)
        .await?;

    let mut body = snapshot_body(&snapshot);
    if snapshot.deduplicated {
        body.insert("deduplicated".into(), json!(true));
    }
    Ok(Json(Value::Object(body)))
}

// ─────────────────────────────────────────────────────────────────────────────
// POST /sessions/:id/state
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStateRequest {
    pub updates: Map<String, Value>,
    pub idempotency_key: String,
}

pub async fn update_state(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<UpdateStateRequest>,
) -> Result<Json<Value>, ApiError> {
    let deduplicated = state
        .sessions
        .update_state(&session_id, request.updates, &request.idempotency_key)
        .await?;

    let mut body = json!({ "success": true });
    if deduplicated {
        body["deduplicated"] = json!(true);
    }
    Ok(Json(body))
}

// ─────────────────────────────────────────────────────────────────────────────
// POST /sessions/:id/events
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitEventRequest {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub component_type: Option<String>,
    #[serde(default)]
    pub component_id: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

pub async fn submit_event(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<SubmitEventRequest>,
) -> Result<Json<Value>, ApiError> {
    let (event_id, deduplicated) = state
        .sessions
        .submit_event(
            &session_id,
            NewEvent {
                event_type: request.event_type,
                component_type: request.component_type,
                component_id: request.component_id,
                data: request.data,
                timestamp: request.timestamp,
                idempotency_key: request.idempotency_key,
            },
        )
        .await?;

    let mut body = json!({ "eventId": event_id });
    if deduplicated {
        body["deduplicated"] = json!(true);
    }
    Ok(Json(body))
}

// ─────────────────────────────────────────────────────────────────────────────
// POST /sessions/:id/randomize
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RandomizeRequest {
    #[serde(default)]
    pub assignment_type: AssignmentStrategy,
    #[serde(default)]
    pub conditions: Vec<String>,
    #[serde(default = "default_state_key")]
    pub state_key: String,
}

fn default_state_key() -> String {
    "treatment".to_string()
}

pub async fn randomize(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<RandomizeRequest>,
) -> Result<Json<Value>, ApiError> {
    let (condition, existing) = state
        .sessions
        .randomize(
            &session_id,
            request.assignment_type,
            &request.conditions,
            &request.state_key,
        )
        .await?;
    Ok(Json(json!({ "condition": condition, "existing": existing })))
}
