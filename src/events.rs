// Events that flow from the runtime to connected SSE clients
//
// Each variant maps to a named SSE event; the variant's fields are the JSON
// payload. Using an enum keeps the event vocabulary closed and lets the bus
// and tests pattern-match instead of comparing strings.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::store::{ChatMessage, SenderType};

/// An event addressed to one session's subscribers.
///
/// Serializes untagged: the SSE `event:` field carries the name, the `data:`
/// field carries just the payload object.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum SessionEvent {
    /// First event on every stream.
    #[serde(rename_all = "camelCase")]
    Connected { session_id: String },

    /// Emitted every 30 s while a stream is open.
    Heartbeat {},

    /// A persisted chat message (participant, agent final, or system).
    #[serde(rename_all = "camelCase")]
    ChatMessage {
        message_id: String,
        group_id: String,
        sender_id: String,
        sender_type: SenderType,
        content: String,
        created_at: DateTime<Utc>,
    },

    /// Incremental agent output. `full_text` carries the accumulated reply so
    /// late-joining tabs can render the bubble without replaying deltas.
    #[serde(rename_all = "camelCase")]
    ChatMessageDelta {
        stream_id: String,
        group_id: String,
        sender_id: String,
        sender_type: SenderType,
        delta: String,
        full_text: String,
    },

    /// An agent ended the conversation via the end_chat tool.
    #[serde(rename_all = "camelCase")]
    ChatEnded { group_id: String },

    /// A `user_state` field changed as a side effect (tool dispatch,
    /// matchmaking patch). Always follows the persisted mutation.
    #[serde(rename_all = "camelCase")]
    StateUpdated { path: String, value: Value },

    /// The session was matched into a group.
    #[serde(rename_all = "camelCase")]
    MatchFound {
        group_id: String,
        treatment: String,
        member_count: usize,
    },

    /// The session's matchmaking wait expired before a group formed.
    #[serde(rename_all = "camelCase")]
    MatchTimeout {
        pool_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        timeout_target: Option<String>,
    },

    /// The session advanced to another page.
    #[serde(rename_all = "camelCase")]
    PageChange {
        current_page_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        ended_at: Option<DateTime<Utc>>,
    },

    /// The session applied a client-driven state patch.
    #[serde(rename_all = "camelCase")]
    UserStateChange { updates: Value },
}

impl SessionEvent {
    /// The SSE event name for this payload.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Heartbeat {} => "heartbeat",
            Self::ChatMessage { .. } => "chat_message",
            Self::ChatMessageDelta { .. } => "chat_message_delta",
            Self::ChatEnded { .. } => "chat_ended",
            Self::StateUpdated { .. } => "state_updated",
            Self::MatchFound { .. } => "match_found",
            Self::MatchTimeout { .. } => "match_timeout",
            Self::PageChange { .. } => "page_change",
            Self::UserStateChange { .. } => "user_state_change",
        }
    }

    /// Build the broadcastable form of a persisted message.
    pub fn from_message(message: &ChatMessage) -> Self {
        Self::ChatMessage {
            message_id: message.id.clone(),
            group_id: message.group_id.clone(),
            sender_id: message.sender_id.clone(),
            sender_type: message.sender_type,
            content: message.content.clone(),
            created_at: message.created_at,
        }
    }
}
