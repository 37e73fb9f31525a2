// Built-in agent tools
//
// Agents mutate participant state only through these named tools. Dispatch
// patches every non-agent member of the group first, then broadcasts the
// matching state_updated events, so an observer never sees an event for a
// mutation that wasn't persisted. Unknown tool names are logged and dropped.

use serde_json::{json, Value};
use std::sync::Arc;

use crate::bus::EventBus;
use crate::events::SessionEvent;
use crate::session::paths;
use crate::store::Store;

use crate::llm::ToolSchema;

/// Resolve configured tool names to schemas for the provider request.
pub fn builtin_schemas(names: &[String]) -> Vec<ToolSchema> {
    names
        .iter()
        .filter_map(|name| match name.as_str() {
            "end_chat" => Some(end_chat_schema()),
            "assign_state" => Some(assign_state_schema()),
            other => {
                tracing::warn!(tool = other, "Unknown tool in agent config");
                None
            }
        })
        .collect()
}

fn end_chat_schema() -> ToolSchema {
    ToolSchema {
        name: "end_chat".to_string(),
        description: "End the conversation for every participant. Optionally record \
                      whether a deal was reached and at what price."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "deal_reached": {
                    "type": "boolean",
                    "description": "Whether the participants reached an agreement"
                },
                "agreed_price": {
                    "type": "number",
                    "description": "The agreed price, if any"
                }
            }
        }),
    }
}

fn assign_state_schema() -> ToolSchema {
    ToolSchema {
        name: "assign_state".to_string(),
        description: "Set a field in every participant's state.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Dotted state path, e.g. \"survey.verdict\""
                },
                "value": {
                    "description": "The value to assign"
                }
            },
            "required": ["path", "value"]
        }),
    }
}

/// Execute one tool call emitted by an agent.
pub async fn dispatch(
    store: &Arc<dyn Store>,
    bus: &Arc<EventBus>,
    group_id: &str,
    name: &str,
    args: &Value,
) {
    match name {
        "end_chat" => end_chat(store, bus, group_id, args).await,
        "assign_state" => assign_state(store, bus, group_id, args).await,
        other => {
            tracing::warn!(group_id, tool = other, "Dropping unknown tool call");
        }
    }
}

/// The participant sessions a tool call applies to. Agents are not sessions,
/// so group membership already excludes them; the degenerate solo group maps
/// to the session with the group's id.
async fn member_sessions(store: &Arc<dyn Store>, group_id: &str) -> Vec<String> {
    match store.sessions_in_group(group_id).await {
        Ok(sessions) if !sessions.is_empty() => sessions.into_iter().map(|s| s.id).collect(),
        Ok(_) => match store.get_session(group_id).await {
            Ok(Some(session)) => vec![session.id],
            _ => Vec::new(),
        },
        Err(e) => {
            tracing::error!(group_id, "Failed to resolve tool targets: {:?}", e);
            Vec::new()
        }
    }
}

async fn end_chat(store: &Arc<dyn Store>, bus: &Arc<EventBus>, group_id: &str, args: &Value) {
    let mut updates: Vec<(String, Value)> = vec![("chat_ended".to_string(), json!(true))];
    if let Some(fields) = args.as_object() {
        for (key, value) in fields {
            if paths::validate_path(key).is_ok() {
                updates.push((key.clone(), value.clone()));
            } else {
                tracing::warn!(group_id, field = %key, "Skipping invalid end_chat field");
            }
        }
    }

    for session_id in member_sessions(store, group_id).await {
        if let Err(e) = store.patch_user_state(&session_id, &updates).await {
            tracing::error!(session_id = %session_id, "Failed to apply end_chat state: {:?}", e);
        }
    }
    for (path, value) in &updates {
        bus.broadcast_to_group(
            group_id,
            SessionEvent::StateUpdated {
                path: path.clone(),
                value: value.clone(),
            },
        )
        .await;
    }
    bus.broadcast_to_group(
        group_id,
        SessionEvent::ChatEnded {
            group_id: group_id.to_string(),
        },
    )
    .await;
    tracing::info!(group_id, "Chat ended by agent");
}

async fn assign_state(store: &Arc<dyn Store>, bus: &Arc<EventBus>, group_id: &str, args: &Value) {
    let Some(path) = args.get("path").and_then(Value::as_str) else {
        tracing::warn!(group_id, "assign_state without a path; dropping");
        return;
    };
    if let Err(reason) = paths::validate_path(path) {
        tracing::warn!(group_id, path, "assign_state rejected: {reason}");
        return;
    }
    let value = args.get("value").cloned().unwrap_or(Value::Null);

    let updates = [(path.to_string(), value.clone())];
    for session_id in member_sessions(store, group_id).await {
        if let Err(e) = store.patch_user_state(&session_id, &updates).await {
            tracing::error!(session_id = %session_id, "Failed to apply assign_state: {:?}", e);
        }
    }
    bus.broadcast_to_group(
        group_id,
        SessionEvent::StateUpdated {
            path: path.to_string(),
            value,
        },
    )
    .await;
}
