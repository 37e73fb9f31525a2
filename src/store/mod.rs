// Persistence gateway - typed access to the six collections
//
// All mutating operations are idempotent at the storage layer: unique indexes
// back every dedup path, and a duplicate key surfaces as the distinguished
// `InsertOutcome::Duplicate` instead of an error. Callers decide what a replay
// means; the gateway only reports it.
//
// Two implementations share the `Store` trait:
// - `MongoStore`: the production backend (MONGODB_URI)
// - `MemoryStore`: in-process maps for local development and the test suite

pub mod memory;
pub mod models;
pub mod mongo;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

pub use memory::MemoryStore;
pub use models::{
    AgentConfig, ChatMessage, Component, EventRecord, Group, Page, PageGraph, ProlificInfo,
    SenderType, Session, StudyConfig,
};
pub use mongo::MongoStore;

/// Result of an insert guarded by a unique index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The document was written; carries its id.
    Inserted(String),
    /// A document with the same idempotency key already exists.
    Duplicate,
}

/// Typed operations over the persisted collections.
#[async_trait]
pub trait Store: Send + Sync {
    /// Create the unique / sparse / TTL indexes the dedup paths rely on.
    /// Called once at startup; a no-op for backends without indexes.
    async fn ensure_indexes(&self) -> Result<()>;

    // Configs
    async fn get_config(&self, config_id: &str) -> Result<Option<StudyConfig>>;

    // Sessions
    async fn insert_session(&self, session: &Session) -> Result<()>;
    async fn get_session(&self, id: &str) -> Result<Option<Session>>;
    /// Newest session for an authenticated user on a config, if any.
    async fn latest_session_for_user(
        &self,
        user_id: &str,
        config_id: &str,
    ) -> Result<Option<Session>>;
    /// Newest session for a Prolific participant on a config, if any.
    async fn latest_session_for_prolific(
        &self,
        prolific_pid: &str,
        config_id: &str,
    ) -> Result<Option<Session>>;
    /// Move a session to a page, optionally stamping `endedAt`.
    async fn set_current_page(
        &self,
        id: &str,
        page_id: &str,
        ended_at: Option<DateTime<Utc>>,
    ) -> Result<()>;
    /// Apply dotted-path assignments to `user_state`. Paths are validated by
    /// the caller; the gateway writes them as given.
    async fn patch_user_state(&self, id: &str, updates: &[(String, Value)]) -> Result<()>;
    /// Every session whose `user_state.chat_group_id` names this group.
    async fn sessions_in_group(&self, group_id: &str) -> Result<Vec<Session>>;

    // Idempotency reservations (advance / state)
    /// Returns false when the key was already reserved within the TTL window.
    async fn reserve_idempotency_key(&self, key: &str) -> Result<bool>;
    /// Read-only check; used where a replay must be recognized without
    /// reserving anything on the failure path.
    async fn idempotency_key_exists(&self, key: &str) -> Result<bool>;

    // Events
    async fn insert_event(&self, event: &EventRecord) -> Result<InsertOutcome>;

    // Chat messages
    async fn insert_message(&self, message: &ChatMessage) -> Result<InsertOutcome>;
    async fn find_message_by_key(
        &self,
        group_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<ChatMessage>>;
    /// Group history in `createdAt` order, ties broken by insertion order.
    async fn list_messages(&self, group_id: &str) -> Result<Vec<ChatMessage>>;

    // Groups
    async fn insert_group(&self, group: &Group) -> Result<()>;
    async fn get_group(&self, group_id: &str) -> Result<Option<Group>>;
}
