// Chat orchestrator - membership, message persistence, fan-out, agent kicks
//
// A session belongs to a group when its `user_state.chat_group_id` says so,
// or trivially when the session id *is* the group id (solo AI chat). Send
// persists first, fans out second, and only then pokes the agent runner; the
// agent reply is always asynchronous to the HTTP call.

use std::sync::Arc;

use crate::agent::AgentRunner;
use crate::bus::EventBus;
use crate::error::ApiError;
use crate::events::SessionEvent;
use crate::store::{ChatMessage, InsertOutcome, SenderType, Store};

pub struct ChatService {
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    agents: Arc<AgentRunner>,
}

impl ChatService {
    pub fn new(store: Arc<dyn Store>, bus: Arc<EventBus>, agents: Arc<AgentRunner>) -> Self {
        Self { store, bus, agents }
    }

    /// True iff the session may read and write this group's chat.
    pub async fn verify_membership(
        &self,
        session_id: &str,
        group_id: &str,
    ) -> Result<bool, ApiError> {
        if session_id == group_id {
            return Ok(true);
        }
        let Some(session) = self.store.get_session(session_id).await? else {
            return Ok(false);
        };
        Ok(session.chat_group_id() == Some(group_id))
    }

    /// Persist and fan out a message, then trigger agents.
    ///
    /// With an idempotency key, a replay returns the originally stored
    /// message and triggers nothing.
    pub async fn send(
        &self,
        group_id: &str,
        session_id: &str,
        content: &str,
        sender_type: Option<SenderType>,
        idempotency_key: Option<String>,
    ) -> Result<(ChatMessage, bool), ApiError> {
        if !self.verify_membership(session_id, group_id).await? {
            return Err(ApiError::NotAMember);
        }

        if let Some(key) = &idempotency_key {
            if let Some(prior) = self.store.find_message_by_key(group_id, key).await? {
                tracing::debug!(group_id, key = %key, "Duplicate chat send");
                return Ok((prior, true));
            }
        }

        let message = ChatMessage::new(
            group_id,
            session_id,
            sender_type.unwrap_or(SenderType::Participant),
            content,
            idempotency_key.clone(),
        );
        match self.store.insert_message(&message).await? {
            InsertOutcome::Inserted(_) => {}
            // Lost a race with an identical replay; hand back the winner.
            InsertOutcome::Duplicate => {
                if let Some(key) = &idempotency_key {
                    if let Some(prior) = self.store.find_message_by_key(group_id, key).await? {
                        return Ok((prior, true));
                    }
                }
                return Ok((message, true));
            }
        }

        self.bus
            .broadcast_to_group(group_id, SessionEvent::from_message(&message))
            .await;

        self.agents.trigger(group_id, session_id, true);
        Ok((message, false))
    }

    /// Group history, oldest first.
    pub async fn history(
        &self,
        group_id: &str,
        session_id: &str,
    ) -> Result<Vec<ChatMessage>, ApiError> {
        if !self.verify_membership(session_id, group_id).await? {
            return Err(ApiError::NotAMember);
        }
        Ok(self.store.list_messages(group_id).await?)
    }

    /// First-mount agent kick: lets agents open the conversation, so the
    /// empty-history suppression is off.
    pub async fn start_agents(&self, group_id: &str, session_id: &str) -> Result<(), ApiError> {
        if !self.verify_membership(session_id, group_id).await? {
            return Err(ApiError::NotAMember);
        }
        self.agents.trigger(group_id, session_id, false);
        Ok(())
    }
}
