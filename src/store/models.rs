// Persisted document types for the six collections
//
// Field names follow the wire layout exactly: camelCase keys except
// `user_state`, which is stored verbatim. These structs are the storage-side
// shapes; HTTP responses build their own DTOs from them, so serde here only
// has to agree with the database.

use chrono::{DateTime, Utc};
use mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Serialize `Option<DateTime<Utc>>` as an optional BSON date.
///
/// The bson helpers only cover the non-optional case; nullable timestamps
/// (`endedAt`) go through this shim so queries and indexes see real dates.
mod opt_chrono_as_bson {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        value
            .map(mongodb::bson::DateTime::from_chrono)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let value = Option::<mongodb::bson::DateTime>::deserialize(deserializer)?;
        Ok(value.map(mongodb::bson::DateTime::to_chrono))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Study configuration (read-only at runtime)
// ─────────────────────────────────────────────────────────────────────────────

/// A compiled study configuration as written by the uploader.
///
/// The page-graph compiler lives outside this service; by the time a config
/// reaches the `configs` collection it is already in canonical form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudyConfig {
    pub config_id: String,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub require_auth: bool,
    pub graph: PageGraph,
    /// Agent personas addressable from chat components, keyed by agent id.
    #[serde(default)]
    pub agents: HashMap<String, AgentConfig>,
}

/// The compiled page graph: an entry point plus a page map.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageGraph {
    pub initial_page_id: String,
    pub pages: HashMap<String, Page>,
}

/// One page of a study: an ordered component list, optionally terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub id: String,
    #[serde(default)]
    pub components: Vec<Component>,
    #[serde(default)]
    pub end: bool,
    #[serde(default)]
    pub end_redirect_url: Option<String>,
}

impl Page {
    /// Substitute page for targets that don't exist in the graph. Advancing
    /// to an unknown page degrades to an empty page rather than failing.
    pub fn placeholder(id: &str) -> Self {
        Self {
            id: id.to_string(),
            components: Vec::new(),
            end: false,
            end_redirect_url: None,
        }
    }
}

/// A renderable component instance on a page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Component {
    #[serde(rename = "type")]
    pub component_type: String,
    pub id: String,
    #[serde(default)]
    pub props: Map<String, Value>,
}

/// An LLM persona configured for chat pages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    pub id: String,
    pub model: String,
    #[serde(default)]
    pub system: String,
    /// Names of built-in tools exposed to this agent (e.g. "end_chat").
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub reasoning_effort: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

/// One participant's progress through one config.
///
/// The session id doubles as the bearer of authority for all session-scoped
/// operations, so it is always a v4 UUID from the OS RNG.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub config_id: String,
    pub current_page_id: String,
    #[serde(rename = "user_state", default)]
    pub user_state: Map<String, Value>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub prolific: Option<ProlificInfo>,
    #[serde(default, with = "opt_chrono_as_bson")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(config_id: &str, initial_page_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            config_id: config_id.to_string(),
            current_page_id: initial_page_id.to_string(),
            user_state: Map::new(),
            user_id: None,
            prolific: None,
            ended_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_ended(&self) -> bool {
        self.ended_at.is_some()
    }

    /// The chat group this session belongs to, if any.
    pub fn chat_group_id(&self) -> Option<&str> {
        self.user_state.get("chat_group_id").and_then(Value::as_str)
    }
}

/// Prolific recruitment identifiers captured at session start.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProlificInfo {
    pub prolific_pid: String,
    #[serde(default)]
    pub study_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Event (append-only)
// ─────────────────────────────────────────────────────────────────────────────

/// Append-only record of something a component reported.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub component_type: Option<String>,
    #[serde(default)]
    pub component_id: Option<String>,
    pub page_id: String,
    pub session_id: String,
    pub config_id: String,
    #[serde(default)]
    pub data: Value,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Chat message
// ─────────────────────────────────────────────────────────────────────────────

/// Who authored a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderType {
    Participant,
    Agent,
    System,
}

impl Default for SenderType {
    fn default() -> Self {
        Self::Participant
    }
}

/// One message in a group's chat, ordered by `created_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub group_id: String,
    pub sender_id: String,
    pub sender_type: SenderType,
    pub content: String,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl ChatMessage {
    pub fn new(
        group_id: &str,
        sender_id: &str,
        sender_type: SenderType,
        content: &str,
        idempotency_key: Option<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            group_id: group_id.to_string(),
            sender_id: sender_id.to_string(),
            sender_type,
            content: content.to_string(),
            created_at: Utc::now(),
            idempotency_key,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Group
// ─────────────────────────────────────────────────────────────────────────────

/// N sessions matched together for a multi-party stage. Created atomically
/// when a pool reaches target size and never resized afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub group_id: String,
    pub config_id: String,
    pub pool_id: String,
    pub member_session_ids: Vec<String>,
    pub treatment: String,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub matched_at: DateTime<Utc>,
    pub status: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Idempotency record
// ─────────────────────────────────────────────────────────────────────────────

/// Reservation row for advance/state dedup. A TTL index expires these after a
/// day, so replays beyond that window behave as first-time requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyRecord {
    pub key: String,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
}
