// MongoDB-backed persistence gateway
//
// Collections: sessions, events, chat_messages, groups, idempotency_keys,
// configs. Dedup everywhere rides on unique indexes; error code 11000 is the
// only storage error the gateway interprets, mapping it to
// `InsertOutcome::Duplicate` (or `false` for reservations).

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::bson::{doc, Document};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::IndexOptions;
use mongodb::{Client, Collection, Database, IndexModel};
use serde_json::Value;
use std::time::Duration;

use super::models::{ChatMessage, EventRecord, Group, IdempotencyRecord, Session, StudyConfig};
use super::{InsertOutcome, Store};

/// Idempotency reservations expire after a day.
const IDEMPOTENCY_TTL: Duration = Duration::from_secs(86_400);

/// Gateway over a single MongoDB database.
#[derive(Clone)]
pub struct MongoStore {
    db: Database,
}

impl MongoStore {
    /// Connect using a MongoDB connection string. The database name comes
    /// from the URI path, falling back to "parley".
    pub async fn connect(uri: &str) -> Result<Self> {
        let client = Client::with_uri_str(uri)
            .await
            .context("Failed to connect to MongoDB")?;
        let db = client
            .default_database()
            .unwrap_or_else(|| client.database("parley"));
        tracing::info!("Connected to MongoDB database '{}'", db.name());
        Ok(Self { db })
    }

    fn sessions(&self) -> Collection<Session> {
        self.db.collection("sessions")
    }

    fn events(&self) -> Collection<EventRecord> {
        self.db.collection("events")
    }

    fn messages(&self) -> Collection<ChatMessage> {
        self.db.collection("chat_messages")
    }

    fn groups(&self) -> Collection<Group> {
        self.db.collection("groups")
    }

    fn idempotency_keys(&self) -> Collection<IdempotencyRecord> {
        self.db.collection("idempotency_keys")
    }

    fn configs(&self) -> Collection<StudyConfig> {
        self.db.collection("configs")
    }
}

/// True when the error is a unique-index violation (code 11000).
fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(
        *err.kind,
        ErrorKind::Write(WriteFailure::WriteError(ref we)) if we.code == 11000
    )
}

fn unique(keys: Document) -> IndexModel {
    IndexModel::builder()
        .keys(keys)
        .options(IndexOptions::builder().unique(true).build())
        .build()
}

fn unique_sparse(keys: Document) -> IndexModel {
    IndexModel::builder()
        .keys(keys)
        .options(IndexOptions::builder().unique(true).sparse(true).build())
        .build()
}

fn plain(keys: Document) -> IndexModel {
    IndexModel::builder().keys(keys).build()
}

#[async_trait]
impl Store for MongoStore {
    async fn ensure_indexes(&self) -> Result<()> {
        self.sessions()
            .create_indexes(vec![
                unique(doc! { "id": 1 }),
                // Resumption lookups, newest first. Sparse: most sessions are
                // anonymous and carry neither field.
                IndexModel::builder()
                    .keys(doc! { "userId": 1, "configId": 1, "createdAt": -1 })
                    .options(IndexOptions::builder().sparse(true).build())
                    .build(),
                IndexModel::builder()
                    .keys(doc! { "prolific.prolificPid": 1, "configId": 1, "createdAt": -1 })
                    .options(IndexOptions::builder().sparse(true).build())
                    .build(),
            ])
            .await
            .context("Failed to create session indexes")?;

        self.events()
            .create_indexes(vec![
                plain(doc! { "sessionId": 1, "createdAt": 1 }),
                unique_sparse(doc! { "idempotencyKey": 1 }),
            ])
            .await
            .context("Failed to create event indexes")?;

        self.messages()
            .create_indexes(vec![
                plain(doc! { "groupId": 1, "createdAt": 1 }),
                unique_sparse(doc! { "idempotencyKey": 1 }),
            ])
            .await
            .context("Failed to create chat message indexes")?;

        self.groups()
            .create_index(unique(doc! { "groupId": 1 }))
            .await
            .context("Failed to create group index")?;

        self.idempotency_keys()
            .create_indexes(vec![
                unique(doc! { "key": 1 }),
                IndexModel::builder()
                    .keys(doc! { "createdAt": 1 })
                    .options(
                        IndexOptions::builder()
                            .expire_after(IDEMPOTENCY_TTL)
                            .build(),
                    )
                    .build(),
            ])
            .await
            .context("Failed to create idempotency indexes")?;

        self.configs()
            .create_index(unique(doc! { "configId": 1 }))
            .await
            .context("Failed to create config index")?;

        tracing::debug!("MongoDB indexes ensured");
        Ok(())
    }

    async fn get_config(&self, config_id: &str) -> Result<Option<StudyConfig>> {
        self.configs()
            .find_one(doc! { "configId": config_id })
            .await
            .context("Failed to load config")
    }

    async fn insert_session(&self, session: &Session) -> Result<()> {
        self.sessions()
            .insert_one(session)
            .await
            .context("Failed to insert session")?;
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        self.sessions()
            .find_one(doc! { "id": id })
            .await
            .context("Failed to load session")
    }

    async fn latest_session_for_user(
        &self,
        user_id: &str,
        config_id: &str,
    ) -> Result<Option<Session>> {
        self.sessions()
            .find_one(doc! { "userId": user_id, "configId": config_id })
            .sort(doc! { "createdAt": -1 })
            .await
            .context("Failed to query sessions by user")
    }

    async fn latest_session_for_prolific(
        &self,
        prolific_pid: &str,
        config_id: &str,
    ) -> Result<Option<Session>> {
        self.sessions()
            .find_one(doc! { "prolific.prolificPid": prolific_pid, "configId": config_id })
            .sort(doc! { "createdAt": -1 })
            .await
            .context("Failed to query sessions by prolific pid")
    }

    async fn set_current_page(
        &self,
        id: &str,
        page_id: &str,
        ended_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut set = doc! {
            "currentPageId": page_id,
            "updatedAt": mongodb::bson::DateTime::now(),
        };
        if let Some(ended) = ended_at {
            set.insert("endedAt", mongodb::bson::DateTime::from_chrono(ended));
        }
        self.sessions()
            .update_one(doc! { "id": id }, doc! { "$set": set })
            .await
            .context("Failed to update session page")?;
        Ok(())
    }

    async fn patch_user_state(&self, id: &str, updates: &[(String, Value)]) -> Result<()> {
        let mut set = doc! { "updatedAt": mongodb::bson::DateTime::now() };
        for (path, value) in updates {
            let bson = mongodb::bson::to_bson(value).context("Unserializable state value")?;
            set.insert(format!("user_state.{path}"), bson);
        }
        self.sessions()
            .update_one(doc! { "id": id }, doc! { "$set": set })
            .await
            .context("Failed to patch user_state")?;
        Ok(())
    }

    async fn sessions_in_group(&self, group_id: &str) -> Result<Vec<Session>> {
        let cursor = self
            .sessions()
            .find(doc! { "user_state.chat_group_id": group_id })
            .await
            .context("Failed to query group members")?;
        cursor
            .try_collect()
            .await
            .context("Failed to read group members")
    }

    async fn reserve_idempotency_key(&self, key: &str) -> Result<bool> {
        let record = IdempotencyRecord {
            key: key.to_string(),
            created_at: Utc::now(),
        };
        match self.idempotency_keys().insert_one(&record).await {
            Ok(_) => Ok(true),
            Err(e) if is_duplicate_key(&e) => Ok(false),
            Err(e) => Err(e).context("Failed to reserve idempotency key"),
        }
    }

    async fn idempotency_key_exists(&self, key: &str) -> Result<bool> {
        let found = self
            .idempotency_keys()
            .find_one(doc! { "key": key })
            .await
            .context("Failed to check idempotency key")?;
        Ok(found.is_some())
    }

    async fn insert_event(&self, event: &EventRecord) -> Result<InsertOutcome> {
        match self.events().insert_one(event).await {
            Ok(_) => Ok(InsertOutcome::Inserted(event.id.clone())),
            Err(e) if is_duplicate_key(&e) => Ok(InsertOutcome::Duplicate),
            Err(e) => Err(e).context("Failed to insert event"),
        }
    }

    async fn insert_message(&self, message: &ChatMessage) -> Result<InsertOutcome> {
        match self.messages().insert_one(message).await {
            Ok(_) => Ok(InsertOutcome::Inserted(message.id.clone())),
            Err(e) if is_duplicate_key(&e) => Ok(InsertOutcome::Duplicate),
            Err(e) => Err(e).context("Failed to insert chat message"),
        }
    }

    async fn find_message_by_key(
        &self,
        group_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<ChatMessage>> {
        self.messages()
            .find_one(doc! { "groupId": group_id, "idempotencyKey": idempotency_key })
            .await
            .context("Failed to look up message by idempotency key")
    }

    async fn list_messages(&self, group_id: &str) -> Result<Vec<ChatMessage>> {
        let cursor = self
            .messages()
            .find(doc! { "groupId": group_id })
            // _id carries insertion order and breaks createdAt ties
            .sort(doc! { "createdAt": 1, "_id": 1 })
            .await
            .context("Failed to query chat history")?;
        cursor
            .try_collect()
            .await
            .context("Failed to read chat history")
    }

    async fn insert_group(&self, group: &Group) -> Result<()> {
        self.groups()
            .insert_one(group)
            .await
            .context("Failed to insert group")?;
        Ok(())
    }

    async fn get_group(&self, group_id: &str) -> Result<Option<Group>> {
        self.groups()
            .find_one(doc! { "groupId": group_id })
            .await
            .context("Failed to load group")
    }
}
