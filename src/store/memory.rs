// In-memory persistence gateway
//
// Backs local development (no MONGODB_URI) and the test suite. Semantics
// mirror the Mongo gateway: unique-key collisions report Duplicate, message
// order is createdAt with insertion-order tie-break, and resumption lookups
// return the newest matching session. Nothing here survives a restart.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

use super::models::{ChatMessage, EventRecord, Group, Session, StudyConfig};
use super::{InsertOutcome, Store};

#[derive(Default)]
struct Collections {
    configs: HashMap<String, StudyConfig>,
    sessions: HashMap<String, Session>,
    /// Insertion order of session ids, for newest-first resumption scans.
    session_order: Vec<String>,
    events: Vec<EventRecord>,
    event_keys: HashSet<String>,
    messages: Vec<(u64, ChatMessage)>,
    message_keys: HashSet<String>,
    groups: HashMap<String, Group>,
    idempotency_keys: HashSet<String>,
    message_seq: u64,
}

/// Process-local gateway with the same contract as `MongoStore`.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Collections>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a config. The uploader service owns this path in production;
    /// local development and tests write configs directly.
    pub async fn insert_config(&self, config: StudyConfig) {
        let mut inner = self.inner.write().await;
        inner.configs.insert(config.config_id.clone(), config);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ensure_indexes(&self) -> Result<()> {
        Ok(())
    }

    async fn get_config(&self, config_id: &str) -> Result<Option<StudyConfig>> {
        Ok(self.inner.read().await.configs.get(config_id).cloned())
    }

    async fn insert_session(&self, session: &Session) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .sessions
            .insert(session.id.clone(), session.clone());
        inner.session_order.push(session.id.clone());
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        Ok(self.inner.read().await.sessions.get(id).cloned())
    }

    async fn latest_session_for_user(
        &self,
        user_id: &str,
        config_id: &str,
    ) -> Result<Option<Session>> {
        let inner = self.inner.read().await;
        Ok(inner
            .session_order
            .iter()
            .rev()
            .filter_map(|id| inner.sessions.get(id))
            .find(|s| s.user_id.as_deref() == Some(user_id) && s.config_id == config_id)
            .cloned())
    }

    async fn latest_session_for_prolific(
        &self,
        prolific_pid: &str,
        config_id: &str,
    ) -> Result<Option<Session>> {
        let inner = self.inner.read().await;
        Ok(inner
            .session_order
            .iter()
            .rev()
            .filter_map(|id| inner.sessions.get(id))
            .find(|s| {
                s.config_id == config_id
                    && s.prolific
                        .as_ref()
                        .is_some_and(|p| p.prolific_pid == prolific_pid)
            })
            .cloned())
    }

    async fn set_current_page(
        &self,
        id: &str,
        page_id: &str,
        ended_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(session) = inner.sessions.get_mut(id) {
            session.current_page_id = page_id.to_string();
            if ended_at.is_some() {
                session.ended_at = ended_at;
            }
            session.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn patch_user_state(&self, id: &str, updates: &[(String, Value)]) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(session) = inner.sessions.get_mut(id) {
            for (path, value) in updates {
                crate::session::paths::set_path(&mut session.user_state, path, value.clone());
            }
            session.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn sessions_in_group(&self, group_id: &str) -> Result<Vec<Session>> {
        let inner = self.inner.read().await;
        Ok(inner
            .sessions
            .values()
            .filter(|s| s.chat_group_id() == Some(group_id))
            .cloned()
            .collect())
    }

    async fn reserve_idempotency_key(&self, key: &str) -> Result<bool> {
        let mut inner = self.inner.write().await;
        Ok(inner.idempotency_keys.insert(key.to_string()))
    }

    async fn idempotency_key_exists(&self, key: &str) -> Result<bool> {
        Ok(self.inner.read().await.idempotency_keys.contains(key))
    }

    async fn insert_event(&self, event: &EventRecord) -> Result<InsertOutcome> {
        let mut inner = self.inner.write().await;
        if let Some(key) = &event.idempotency_key {
            if !inner.event_keys.insert(key.clone()) {
                return Ok(InsertOutcome::Duplicate);
            }
        }
        inner.events.push(event.clone());
        Ok(InsertOutcome::Inserted(event.id.clone()))
    }

    async fn insert_message(&self, message: &ChatMessage) -> Result<InsertOutcome> {
        let mut inner = self.inner.write().await;
        if let Some(key) = &message.idempotency_key {
            if !inner.message_keys.insert(key.clone()) {
                return Ok(InsertOutcome::Duplicate);
            }
        }
        inner.message_seq += 1;
        let seq = inner.message_seq;
        inner.messages.push((seq, message.clone()));
        Ok(InsertOutcome::Inserted(message.id.clone()))
    }

    async fn find_message_by_key(
        &self,
        group_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<ChatMessage>> {
        let inner = self.inner.read().await;
        Ok(inner
            .messages
            .iter()
            .map(|(_, m)| m)
            .find(|m| {
                m.group_id == group_id && m.idempotency_key.as_deref() == Some(idempotency_key)
            })
            .cloned())
    }

    async fn list_messages(&self, group_id: &str) -> Result<Vec<ChatMessage>> {
        let inner = self.inner.read().await;
        let mut messages: Vec<(u64, ChatMessage)> = inner
            .messages
            .iter()
            .filter(|(_, m)| m.group_id == group_id)
            .cloned()
            .collect();
        messages.sort_by(|(seq_a, a), (seq_b, b)| {
            a.created_at.cmp(&b.created_at).then(seq_a.cmp(seq_b))
        });
        Ok(messages.into_iter().map(|(_, m)| m).collect())
    }

    async fn insert_group(&self, group: &Group) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.groups.insert(group.group_id.clone(), group.clone());
        Ok(())
    }

    async fn get_group(&self, group_id: &str) -> Result<Option<Group>> {
        Ok(self.inner.read().await.groups.get(group_id).cloned())
    }
}
