// Matchmaking scheduler - FIFO pools that form groups of N under timeout
//
// Pools are keyed by configId:poolId. Every waiting entry owns exactly one
// live timer, released on every exit path: match, cancel, timeout, or SSE
// disconnect. All mutation of a pool list happens under that pool's own
// mutex; the outer map lock is only ever held long enough to fetch or drop a
// pool handle, so pools never block each other.
//
// Because empty pools are deleted eagerly, a task can hold a handle to a
// pool that has since been dropped from the map. Every lock acquisition
// re-checks the map and retries on a stale handle.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use crate::bus::EventBus;
use crate::error::ApiError;
use crate::events::SessionEvent;
use crate::store::{Group, Store};
use crate::treatment::{AssignmentStrategy, TreatmentAssigner};

/// Parameters of one matchmaking request. Entries in the same pool may carry
/// different parameters; the enqueue that fills the pool decides group size
/// and treatment settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub num_users: usize,
    pub timeout: Duration,
    pub timeout_target: Option<String>,
    pub assignment: AssignmentStrategy,
    pub conditions: Vec<String>,
}

/// What an enqueue call resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Still waiting; position is 1-based within the pool.
    Waiting { position: usize },
    /// This enqueue completed a group.
    Matched { group_id: String, treatment: String },
}

/// Result of an explicit cancel or disconnect cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    NotFound,
}

struct WaitingEntry {
    session_id: String,
    #[allow(dead_code)]
    enqueued_at: DateTime<Utc>,
    timer: JoinHandle<()>,
}

type Pool = Arc<AsyncMutex<Vec<WaitingEntry>>>;

pub struct Matchmaker {
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    treatments: Arc<TreatmentAssigner>,
    /// Both maps recover the guard from a poisoned lock; the state stays
    /// usable after a panicked writer.
    pools: Mutex<HashMap<String, Pool>>,
    /// sessionId -> poolKey. A session waits in at most one pool.
    by_session: Mutex<HashMap<String, String>>,
}

fn pool_key(config_id: &str, pool_id: &str) -> String {
    format!("{config_id}:{pool_id}")
}

impl Matchmaker {
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<EventBus>,
        treatments: Arc<TreatmentAssigner>,
    ) -> Self {
        Self {
            store,
            bus,
            treatments,
            pools: Mutex::new(HashMap::new()),
            by_session: Mutex::new(HashMap::new()),
        }
    }

    /// Add a session to a pool, forming a group if it reaches target size.
    ///
    /// Re-enqueueing a session already waiting in the same pool reports its
    /// current position. A session waiting in a *different* pool is pulled
    /// out of it first; a session does one thing at a time.
    pub async fn enqueue(
        self: &Arc<Self>,
        session_id: &str,
        config_id: &str,
        pool_id: &str,
        cfg: PoolConfig,
    ) -> Result<EnqueueOutcome, ApiError> {
        if cfg.num_users == 0 {
            return Err(ApiError::InvalidInput(
                "num_users must be at least 1".to_string(),
            ));
        }

        let key = pool_key(config_id, pool_id);

        let previous = self.by_session.lock().unwrap_or_else(PoisonError::into_inner).get(session_id).cloned();
        if let Some(previous_key) = previous {
            if previous_key != key {
                tracing::debug!(session_id, from = %previous_key, to = %key, "Switching pools");
                self.remove(session_id, None).await;
            }
        }

        loop {
            let pool = {
                let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
                pools.entry(key.clone()).or_default().clone()
            };
            let mut entries = pool.lock().await;
            if !self.is_current(&key, &pool) {
                continue; // pool was deleted while we waited; re-fetch
            }

            if let Some(position) = entries
                .iter()
                .position(|e| e.session_id == session_id)
            {
                return Ok(EnqueueOutcome::Waiting {
                    position: position + 1,
                });
            }

            let timer = self.spawn_timer(
                session_id.to_string(),
                key.clone(),
                pool_id.to_string(),
                cfg.timeout,
                cfg.timeout_target.clone(),
            );
            entries.push(WaitingEntry {
                session_id: session_id.to_string(),
                enqueued_at: Utc::now(),
                timer,
            });
            self.by_session
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(session_id.to_string(), key.clone());
            tracing::debug!(session_id, pool = %key, waiting = entries.len(), "Enqueued");

            if entries.len() >= cfg.num_users {
                let outcome = self
                    .form_group(&mut entries, config_id, pool_id, &cfg)
                    .await?;
                self.drop_pool_if_empty(&key, &pool, &entries);
                return Ok(outcome);
            }

            let position = entries.len();
            return Ok(EnqueueOutcome::Waiting { position });
        }
    }

    /// Splice the head of the pool into a group: release timers, persist the
    /// group, patch every member's state, and notify every member. Runs with
    /// the pool lock held, so group formations on one pool never overlap.
    async fn form_group(
        &self,
        entries: &mut Vec<WaitingEntry>,
        config_id: &str,
        pool_id: &str,
        cfg: &PoolConfig,
    ) -> Result<EnqueueOutcome, ApiError> {
        let members: Vec<WaitingEntry> = entries.drain(..cfg.num_users).collect();
        let member_ids: Vec<String> = members.iter().map(|e| e.session_id.clone()).collect();
        {
            let mut index = self.by_session.lock().unwrap_or_else(PoisonError::into_inner);
            for entry in &members {
                entry.timer.abort();
                index.remove(&entry.session_id);
            }
        }

        let group_id = uuid::Uuid::new_v4().to_string();
        let treatment = self.treatments.assign(
            cfg.assignment,
            &pool_key(config_id, pool_id),
            &cfg.conditions,
        );

        let group = Group {
            group_id: group_id.clone(),
            config_id: config_id.to_string(),
            pool_id: pool_id.to_string(),
            member_session_ids: member_ids.clone(),
            treatment: treatment.clone(),
            matched_at: Utc::now(),
            status: "active".to_string(),
        };
        self.store.insert_group(&group).await?;

        for session_id in &member_ids {
            self.store
                .patch_user_state(
                    session_id,
                    &[
                        ("group_id".to_string(), Value::String(group_id.clone())),
                        ("chat_group_id".to_string(), Value::String(group_id.clone())),
                        ("treatment".to_string(), Value::String(treatment.clone())),
                    ],
                )
                .await?;
        }
        for session_id in &member_ids {
            self.bus.broadcast_to_session(
                session_id,
                SessionEvent::MatchFound {
                    group_id: group_id.clone(),
                    treatment: treatment.clone(),
                    member_count: member_ids.len(),
                },
            );
        }

        tracing::info!(
            group_id = %group_id,
            pool = %pool_key(config_id, pool_id),
            members = member_ids.len(),
            treatment = %treatment,
            "Group formed"
        );
        Ok(EnqueueOutcome::Matched {
            group_id,
            treatment,
        })
    }

    /// Explicit cancellation. `pool_id` narrows the cancel to one pool; the
    /// session's actual pool wins when it is omitted.
    pub async fn remove_session(
        &self,
        session_id: &str,
        pool_id: Option<&str>,
    ) -> CancelOutcome {
        self.remove(session_id, pool_id).await
    }

    /// SSE disconnect hook: fire-and-forget cleanup of any waiting entry.
    pub fn handle_disconnect(self: &Arc<Self>, session_id: &str) {
        let matchmaker = self.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            if matchmaker.remove(&session_id, None).await == CancelOutcome::Cancelled {
                tracing::debug!(session_id = %session_id, "Removed from pool after disconnect");
            }
        });
    }

    async fn remove(&self, session_id: &str, pool_id: Option<&str>) -> CancelOutcome {
        let key = {
            let index = self.by_session.lock().unwrap_or_else(PoisonError::into_inner);
            match index.get(session_id) {
                Some(key) => key.clone(),
                None => return CancelOutcome::NotFound,
            }
        };
        if let Some(pool_id) = pool_id {
            if !key.ends_with(&format!(":{pool_id}")) {
                return CancelOutcome::NotFound;
            }
        }

        loop {
            let pool = {
                let pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
                match pools.get(&key) {
                    Some(pool) => pool.clone(),
                    None => return CancelOutcome::NotFound,
                }
            };
            let mut entries = pool.lock().await;
            if !self.is_current(&key, &pool) {
                continue;
            }

            let Some(position) = entries.iter().position(|e| e.session_id == session_id)
            else {
                return CancelOutcome::NotFound;
            };
            let entry = entries.remove(position);
            entry.timer.abort();
            self.by_session
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(session_id);
            self.drop_pool_if_empty(&key, &pool, &entries);
            tracing::debug!(session_id, pool = %key, "Left pool");
            return CancelOutcome::Cancelled;
        }
    }

    /// One-shot timer per waiting entry. On expiry the session leaves the
    /// pool (if still present) and hears `match_timeout`.
    fn spawn_timer(
        self: &Arc<Self>,
        session_id: String,
        key: String,
        pool_id: String,
        timeout: Duration,
        timeout_target: Option<String>,
    ) -> JoinHandle<()> {
        let matchmaker = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if matchmaker.remove(&session_id, None).await == CancelOutcome::Cancelled {
                tracing::debug!(session_id = %session_id, pool = %key, "Matchmaking wait timed out");
                matchmaker.bus.broadcast_to_session(
                    &session_id,
                    SessionEvent::MatchTimeout {
                        pool_id,
                        timeout_target,
                    },
                );
            }
        })
    }

    /// True when `pool` is still the map's pool for `key`.
    fn is_current(&self, key: &str, pool: &Pool) -> bool {
        self.pools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, pool))
    }

    fn drop_pool_if_empty(&self, key: &str, pool: &Pool, entries: &[WaitingEntry]) {
        if entries.is_empty() {
            let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
            if pools.get(key).is_some_and(|current| Arc::ptr_eq(current, pool)) {
                pools.remove(key);
            }
        }
    }

    /// Number of sessions currently waiting across all pools.
    #[cfg(test)]
    pub fn waiting_count(&self) -> usize {
        self.by_session.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, Session};

    fn cfg(num_users: usize, timeout_secs: u64) -> PoolConfig {
        PoolConfig {
            num_users,
            timeout: Duration::from_secs(timeout_secs),
            timeout_target: None,
            assignment: AssignmentStrategy::Random,
            conditions: vec!["control".to_string(), "treatment".to_string()],
        }
    }

    async fn setup() -> (Arc<MemoryStore>, Arc<EventBus>, Arc<Matchmaker>) {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(EventBus::new(store.clone()));
        let matchmaker = Arc::new(Matchmaker::new(
            store.clone(),
            bus.clone(),
            Arc::new(TreatmentAssigner::new()),
        ));
        (store, bus, matchmaker)
    }

    async fn seed_session(store: &MemoryStore, id: &str) {
        let mut session = Session::new("c", "lobby");
        session.id = id.to_string();
        store.insert_session(&session).await.unwrap();
    }

    #[tokio::test]
    async fn two_sessions_match_and_both_hear_about_it() {
        let (store, bus, mm) = setup().await;
        seed_session(&store, "a").await;
        seed_session(&store, "b").await;
        let mut sub_a = bus.subscribe("a");
        let mut sub_b = bus.subscribe("b");

        let first = mm.enqueue("a", "c", "p", cfg(2, 120)).await.unwrap();
        assert_eq!(first, EnqueueOutcome::Waiting { position: 1 });

        let second = mm.enqueue("b", "c", "p", cfg(2, 120)).await.unwrap();
        let EnqueueOutcome::Matched { group_id, treatment } = second else {
            panic!("second enqueue should match, got {second:?}");
        };

        // Exactly one match_found per member, with the same group.
        for sub in [&mut sub_a, &mut sub_b] {
            match sub.rx.recv().await.unwrap() {
                SessionEvent::MatchFound {
                    group_id: gid,
                    treatment: t,
                    member_count,
                } => {
                    assert_eq!(gid, group_id);
                    assert_eq!(t, treatment);
                    assert_eq!(member_count, 2);
                }
                other => panic!("expected match_found, got {other:?}"),
            }
        }

        // Both sessions are patched into the group.
        for id in ["a", "b"] {
            let session = store.get_session(id).await.unwrap().unwrap();
            assert_eq!(session.chat_group_id(), Some(group_id.as_str()));
            assert_eq!(
                session.user_state["treatment"],
                serde_json::json!(treatment)
            );
        }

        let group = store.get_group(&group_id).await.unwrap().unwrap();
        assert_eq!(group.member_session_ids, vec!["a", "b"]);

        // The pool is gone and nobody is waiting.
        assert_eq!(mm.waiting_count(), 0);
    }

    #[tokio::test]
    async fn re_enqueue_reports_position_without_duplicating() {
        let (store, _, mm) = setup().await;
        seed_session(&store, "a").await;

        assert_eq!(
            mm.enqueue("a", "c", "p", cfg(3, 120)).await.unwrap(),
            EnqueueOutcome::Waiting { position: 1 }
        );
        assert_eq!(
            mm.enqueue("a", "c", "p", cfg(3, 120)).await.unwrap(),
            EnqueueOutcome::Waiting { position: 1 }
        );
        assert_eq!(mm.waiting_count(), 1);
    }

    #[tokio::test]
    async fn cancel_releases_the_entry_and_its_timer() {
        let (store, _, mm) = setup().await;
        seed_session(&store, "a").await;

        mm.enqueue("a", "c", "p", cfg(2, 120)).await.unwrap();
        assert_eq!(
            mm.remove_session("a", Some("p")).await,
            CancelOutcome::Cancelled
        );
        assert_eq!(
            mm.remove_session("a", Some("p")).await,
            CancelOutcome::NotFound
        );
        assert_eq!(mm.waiting_count(), 0);
    }

    #[tokio::test]
    async fn cancel_for_the_wrong_pool_is_not_found() {
        let (store, _, mm) = setup().await;
        seed_session(&store, "a").await;

        mm.enqueue("a", "c", "p", cfg(2, 120)).await.unwrap();
        assert_eq!(
            mm.remove_session("a", Some("other")).await,
            CancelOutcome::NotFound
        );
        assert_eq!(mm.waiting_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_evicts_and_notifies_the_session() {
        let (store, bus, mm) = setup().await;
        seed_session(&store, "a").await;
        let mut sub = bus.subscribe("a");

        let outcome = mm
            .enqueue(
                "a",
                "c",
                "p",
                PoolConfig {
                    timeout_target: Some("solo".to_string()),
                    ..cfg(2, 1)
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome, EnqueueOutcome::Waiting { position: 1 });

        tokio::time::sleep(Duration::from_secs(2)).await;

        match sub.rx.recv().await.unwrap() {
            SessionEvent::MatchTimeout {
                pool_id,
                timeout_target,
            } => {
                assert_eq!(pool_id, "p");
                assert_eq!(timeout_target.as_deref(), Some("solo"));
            }
            other => panic!("expected match_timeout, got {other:?}"),
        }

        assert_eq!(
            mm.remove_session("a", Some("p")).await,
            CancelOutcome::NotFound
        );
    }

    #[tokio::test(start_paused = true)]
    async fn matched_sessions_never_hear_a_timeout() {
        let (store, bus, mm) = setup().await;
        seed_session(&store, "a").await;
        seed_session(&store, "b").await;
        let mut sub = bus.subscribe("a");

        mm.enqueue("a", "c", "p", cfg(2, 1)).await.unwrap();
        mm.enqueue("b", "c", "p", cfg(2, 1)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;

        // The only event on the stream is the match itself.
        match sub.rx.try_recv().unwrap() {
            SessionEvent::MatchFound { .. } => {}
            other => panic!("expected match_found, got {other:?}"),
        }
        assert!(sub.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn switching_pools_leaves_the_old_one() {
        let (store, _, mm) = setup().await;
        seed_session(&store, "a").await;
        seed_session(&store, "b").await;

        mm.enqueue("a", "c", "p1", cfg(2, 120)).await.unwrap();
        mm.enqueue("a", "c", "p2", cfg(2, 120)).await.unwrap();
        assert_eq!(mm.waiting_count(), 1);

        // "b" joining p1 alone must not match with the departed "a".
        assert_eq!(
            mm.enqueue("b", "c", "p1", cfg(2, 120)).await.unwrap(),
            EnqueueOutcome::Waiting { position: 1 }
        );
    }

    #[tokio::test]
    async fn disconnect_cleans_up_like_a_cancel() {
        let (store, _, mm) = setup().await;
        seed_session(&store, "a").await;

        mm.enqueue("a", "c", "p", cfg(2, 120)).await.unwrap();
        mm.handle_disconnect("a");
        // The cleanup task runs asynchronously.
        tokio::task::yield_now().await;
        for _ in 0..10 {
            if mm.waiting_count() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(mm.waiting_count(), 0);
    }
}
