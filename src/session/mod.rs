// Session runtime - drives a participant's progress through a page graph
//
// Operations: start (with resumption and completed-participant blocking),
// get, advance (idempotent, end-page aware), state patches, event submission,
// and treatment randomization. Mutations that matter twice are guarded by
// idempotency reservations; replays return the current snapshot with a
// `deduplicated` flag instead of re-applying.

pub mod expr;
pub mod paths;

use chrono::Utc;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::bus::EventBus;
use crate::error::ApiError;
use crate::events::SessionEvent;
use crate::store::{
    EventRecord, Page, ProlificInfo, Session, Store, StudyConfig,
};
use crate::treatment::{AssignmentStrategy, TreatmentAssigner};

/// How a start call resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartStatus {
    Created,
    Resumed,
}

/// A session together with its rendered current page.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub session: Session,
    pub page: Page,
    pub deduplicated: bool,
}

/// A component-reported event as submitted by the client.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub event_type: String,
    pub component_type: Option<String>,
    pub component_id: Option<String>,
    pub data: Value,
    pub timestamp: Option<chrono::DateTime<Utc>>,
    pub idempotency_key: Option<String>,
}

pub struct SessionRuntime {
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    treatments: Arc<TreatmentAssigner>,
    /// FORCE_AUTH: treat every config as requireAuth.
    force_auth: bool,
}

impl SessionRuntime {
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<EventBus>,
        treatments: Arc<TreatmentAssigner>,
        force_auth: bool,
    ) -> Self {
        Self {
            store,
            bus,
            treatments,
            force_auth,
        }
    }

    /// Start a session, or resume/block based on the caller's identity.
    ///
    /// Resumption looks up the newest prior session for the authenticated
    /// user (or, failing that, the Prolific participant). A prior session
    /// that already ended blocks a restart; one still in flight is resumed
    /// where it left off. Anonymous callers always get a fresh session.
    pub async fn start(
        &self,
        config_id: &str,
        user_id: Option<&str>,
        prolific: Option<ProlificInfo>,
    ) -> Result<(StartStatus, Snapshot), ApiError> {
        let config = self
            .store
            .get_config(config_id)
            .await?
            .ok_or(ApiError::NotFound("config_not_found"))?;

        if (config.require_auth || self.force_auth) && user_id.is_none() && prolific.is_none() {
            return Err(ApiError::AuthRequired);
        }

        let prior = if let Some(uid) = user_id {
            self.store.latest_session_for_user(uid, config_id).await?
        } else if let Some(p) = &prolific {
            self.store
                .latest_session_for_prolific(&p.prolific_pid, config_id)
                .await?
        } else {
            None
        };

        if let Some(session) = prior {
            if session.is_ended() {
                return Err(ApiError::SessionBlocked {
                    message: "You have already completed this study".to_string(),
                });
            }
            tracing::info!(session_id = %session.id, config_id, "Session resumed");
            let page = page_for(&config, &session.current_page_id);
            return Ok((
                StartStatus::Resumed,
                Snapshot {
                    session,
                    page,
                    deduplicated: false,
                },
            ));
        }

        let mut session = Session::new(config_id, &config.graph.initial_page_id);
        session.user_id = user_id.map(str::to_string);
        session.prolific = prolific;
        self.store.insert_session(&session).await?;
        tracing::info!(session_id = %session.id, config_id, "Session created");

        let page = page_for(&config, &session.current_page_id);
        Ok((
            StartStatus::Created,
            Snapshot {
                session,
                page,
                deduplicated: false,
            },
        ))
    }

    /// Load a session with its current page.
    pub async fn get(&self, session_id: &str) -> Result<Snapshot, ApiError> {
        let session = self.require_session(session_id).await?;
        let page = self.page_for_session(&session).await?;
        Ok(Snapshot {
            session,
            page,
            deduplicated: false,
        })
    }

    /// Move a session to a target page.
    ///
    /// The target is not validated against the page set; unknown ids get an
    /// empty placeholder page so the renderer can degrade gracefully.
    /// Reaching a page flagged `end` stamps `endedAt`, after which further
    /// advances fail. The idempotency key makes retries safe: a replay
    /// returns the current snapshot without moving anything.
    pub async fn advance(
        &self,
        session_id: &str,
        target: &str,
        idempotency_key: &str,
    ) -> Result<Snapshot, ApiError> {
        let session = self.require_session(session_id).await?;

        if session.is_ended() {
            // Only a replayed key (necessarily from the advance that ended
            // the session) gets the final snapshot back. A fresh key fails
            // without reserving anything, so its own retries keep failing
            // with the same error instead of turning into a fake success.
            if self.store.idempotency_key_exists(idempotency_key).await? {
                tracing::debug!(session_id, idempotency_key, "Duplicate advance");
                let page = self.page_for_session(&session).await?;
                return Ok(Snapshot {
                    session,
                    page,
                    deduplicated: true,
                });
            }
            return Err(ApiError::SessionEnded);
        }

        if !self.store.reserve_idempotency_key(idempotency_key).await? {
            tracing::debug!(session_id, idempotency_key, "Duplicate advance");
            let session = self.require_session(session_id).await?;
            let page = self.page_for_session(&session).await?;
            return Ok(Snapshot {
                session,
                page,
                deduplicated: true,
            });
        }

        let config = self.store.get_config(&session.config_id).await?;
        let page = config
            .as_ref()
            .map(|c| page_for(c, target))
            .unwrap_or_else(|| Page::placeholder(target));

        let ended_at = page.end.then(Utc::now);
        self.store
            .set_current_page(session_id, target, ended_at)
            .await?;

        self.bus.broadcast_to_session(
            session_id,
            SessionEvent::PageChange {
                current_page_id: target.to_string(),
                ended_at,
            },
        );

        let mut session = session;
        session.current_page_id = target.to_string();
        session.ended_at = ended_at;
        Ok(Snapshot {
            session,
            page,
            deduplicated: false,
        })
    }

    /// Apply client-driven `user_state` assignments.
    pub async fn update_state(
        &self,
        session_id: &str,
        updates: Map<String, Value>,
        idempotency_key: &str,
    ) -> Result<bool, ApiError> {
        self.require_session(session_id).await?;

        for path in updates.keys() {
            paths::validate_path(path).map_err(ApiError::InvalidInput)?;
        }

        if !self.store.reserve_idempotency_key(idempotency_key).await? {
            tracing::debug!(session_id, idempotency_key, "Duplicate state update");
            return Ok(true);
        }

        let pairs: Vec<(String, Value)> = updates
            .iter()
            .map(|(path, value)| (path.clone(), value.clone()))
            .collect();
        self.store.patch_user_state(session_id, &pairs).await?;

        self.bus.broadcast_to_session(
            session_id,
            SessionEvent::UserStateChange {
                updates: Value::Object(updates),
            },
        );
        Ok(false)
    }

    /// Record a component event. Returns the event id, or the literal
    /// "duplicate" when the idempotency key has been seen before.
    pub async fn submit_event(
        &self,
        session_id: &str,
        event: NewEvent,
    ) -> Result<(String, bool), ApiError> {
        let session = self.require_session(session_id).await?;

        let record = EventRecord {
            id: uuid::Uuid::new_v4().to_string(),
            event_type: event.event_type,
            component_type: event.component_type,
            component_id: event.component_id,
            page_id: session.current_page_id.clone(),
            session_id: session.id.clone(),
            config_id: session.config_id.clone(),
            data: event.data,
            timestamp: event.timestamp.unwrap_or_else(Utc::now),
            idempotency_key: event.idempotency_key,
            created_at: Utc::now(),
        };

        match self.store.insert_event(&record).await? {
            crate::store::InsertOutcome::Inserted(id) => Ok((id, false)),
            crate::store::InsertOutcome::Duplicate => Ok(("duplicate".to_string(), true)),
        }
    }

    /// Assign (or return the previously assigned) condition under a state
    /// key. Idempotent per (session, stateKey): the stored value wins.
    pub async fn randomize(
        &self,
        session_id: &str,
        strategy: AssignmentStrategy,
        conditions: &[String],
        state_key: &str,
    ) -> Result<(String, bool), ApiError> {
        let session = self.require_session(session_id).await?;
        paths::validate_path(state_key).map_err(ApiError::InvalidInput)?;

        if let Some(existing) = paths::get_path(&session.user_state, state_key) {
            let condition = existing
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| existing.to_string());
            return Ok((condition, true));
        }

        let balance_key = format!("{}:{}", session.config_id, state_key);
        let condition = self.treatments.assign(strategy, &balance_key, conditions);

        self.store
            .patch_user_state(
                session_id,
                &[(state_key.to_string(), Value::String(condition.clone()))],
            )
            .await?;
        self.bus.broadcast_to_session(
            session_id,
            SessionEvent::StateUpdated {
                path: state_key.to_string(),
                value: Value::String(condition.clone()),
            },
        );

        tracing::debug!(session_id, state_key, condition = %condition, "Condition assigned");
        Ok((condition, false))
    }

    async fn require_session(&self, session_id: &str) -> Result<Session, ApiError> {
        self.store
            .get_session(session_id)
            .await?
            .ok_or(ApiError::NotFound("session_not_found"))
    }

    async fn page_for_session(&self, session: &Session) -> Result<Page, ApiError> {
        let config = self.store.get_config(&session.config_id).await?;
        Ok(config
            .as_ref()
            .map(|c| page_for(c, &session.current_page_id))
            .unwrap_or_else(|| Page::placeholder(&session.current_page_id)))
    }
}

/// Look a page up in the graph, substituting an empty page for unknown ids.
pub fn page_for(config: &StudyConfig, page_id: &str) -> Page {
    config
        .graph
        .pages
        .get(page_id)
        .cloned()
        .unwrap_or_else(|| Page::placeholder(page_id))
}
