// Event bus - per-session SSE fan-out
//
// Every open stream registers one subscriber: a bounded queue whose receiver
// side is owned by the SSE handler. Pushing never blocks the runtime; a full
// or closed queue drops the event for that subscriber only (the client will
// resync from persisted state on reconnect). Group fan-out resolves members
// through the store, plus the degenerate session==group case used for solo
// AI chat.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;

use crate::events::SessionEvent;
use crate::store::Store;

/// Events buffered per subscriber before pushes start dropping.
const SUBSCRIBER_QUEUE_DEPTH: usize = 256;

/// One open SSE stream's registration. The receiver half lives in the stream
/// handler; dropping it (client disconnect) closes the queue.
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<SessionEvent>,
}

/// Per-session multi-subscriber event queues.
pub struct EventBus {
    store: Arc<dyn Store>,
    /// sessionId -> subscriberId -> queue. Guarded by one short-lived lock;
    /// sends happen after the lock is released. A poisoned lock still holds
    /// a usable map, so the guard is recovered rather than panicking.
    subscribers: Mutex<HashMap<String, HashMap<u64, mpsc::Sender<SessionEvent>>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a new subscriber for a session.
    pub fn subscribe(&self, session_id: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut subs = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subs.entry(session_id.to_string()).or_default().insert(id, tx);
        tracing::debug!(session_id, subscriber = id, "SSE subscriber added");

        Subscription { id, rx }
    }

    /// Remove a subscriber; empty sessions are dropped from the map.
    pub fn unsubscribe(&self, session_id: &str, subscriber_id: u64) {
        let mut subs = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(session_subs) = subs.get_mut(session_id) {
            session_subs.remove(&subscriber_id);
            if session_subs.is_empty() {
                subs.remove(session_id);
            }
        }
        tracing::debug!(session_id, subscriber = subscriber_id, "SSE subscriber removed");
    }

    /// Number of open streams for a session.
    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .map_or(0, HashMap::len)
    }

    /// Enqueue an event to every current subscriber of a session. A session
    /// with no subscribers is not an error.
    pub fn broadcast_to_session(&self, session_id: &str, event: SessionEvent) {
        let senders: Vec<mpsc::Sender<SessionEvent>> = {
            let subs = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
            match subs.get(session_id) {
                Some(session_subs) => session_subs.values().cloned().collect(),
                None => return,
            }
        };

        for tx in senders {
            if let Err(e) = tx.try_send(event.clone()) {
                tracing::warn!(session_id, event = event.name(), "Dropping SSE event: {}", e);
            }
        }
    }

    /// Fan an event out to every member session of a group. Membership is
    /// whoever's `user_state.chat_group_id` names the group; if the group id
    /// itself is not among them it is also addressed as a session id, which
    /// covers solo AI chat where the session talks to agents directly.
    pub async fn broadcast_to_group(&self, group_id: &str, event: SessionEvent) {
        let mut targets: Vec<String> = match self.store.sessions_in_group(group_id).await {
            Ok(sessions) => sessions.into_iter().map(|s| s.id).collect(),
            Err(e) => {
                tracing::error!(group_id, "Failed to resolve group members: {:?}", e);
                Vec::new()
            }
        };
        if !targets.iter().any(|id| id == group_id) {
            targets.push(group_id.to_string());
        }

        for session_id in targets {
            self.broadcast_to_session(&session_id, event.clone());
        }
    }
}
