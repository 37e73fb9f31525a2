// Agent runner - bounded, single-flight LLM turns per chat group
//
// One run per group at a time: a trigger while a run is active is a no-op.
// Each agent turn is bounded by a 60 second wall clock enforced through a
// cancellation token the provider stream cooperates with. A cancelled run
// leaves no final message (clients discard the dangling stream bubble); a
// failed run leaves a system apology so the group is not left hanging.
//
// Nothing in here propagates errors upward. The runner is always fired
// asynchronously from a request path that has already returned.

pub mod tools;

use futures::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::bus::EventBus;
use crate::events::SessionEvent;
use crate::llm::{ChatTurn, LanguageModel, Role, StreamEvent};
use crate::session::page_for;
use crate::store::{
    AgentConfig, ChatMessage, EventRecord, SenderType, Session, Store,
};

/// Wall-clock bound for one agent turn.
pub const AGENT_TIMEOUT: Duration = Duration::from_secs(60);

const APOLOGY: &str = "Sorry, I ran into a problem while responding. Please continue.";

pub struct AgentRunner {
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    llm: Arc<dyn LanguageModel>,
    /// groupId -> cancellation handle of the active run. A poisoned lock is
    /// recovered; the map stays usable after a panicked writer.
    active: Mutex<HashMap<String, CancellationToken>>,
}

impl AgentRunner {
    pub fn new(store: Arc<dyn Store>, bus: Arc<EventBus>, llm: Arc<dyn LanguageModel>) -> Self {
        Self {
            store,
            bus,
            llm,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Kick off the agents configured on the triggering session's current
    /// page. No-op when a run is already active for the group.
    ///
    /// `require_history` suppresses the run when the group has no messages
    /// yet; the first-mount path passes false so agents can speak first.
    pub fn trigger(self: &Arc<Self>, group_id: &str, session_id: &str, require_history: bool) {
        let token = CancellationToken::new();
        {
            let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
            if active.contains_key(group_id) {
                tracing::debug!(group_id, "Agent run already active; trigger ignored");
                return;
            }
            active.insert(group_id.to_string(), token.clone());
        }

        let runner = self.clone();
        let group_id = group_id.to_string();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            runner
                .run_group(&group_id, &session_id, require_history, &token)
                .await;
            runner
                .active
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&group_id);
        });
    }

    /// Cancel the active run for a group, if any.
    pub fn cancel(&self, group_id: &str) {
        if let Some(token) = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(group_id)
        {
            token.cancel();
        }
    }

    /// Cancel every active run; used during shutdown.
    pub fn cancel_all(&self) {
        for token in self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
        {
            token.cancel();
        }
    }

    /// Number of groups with an active run.
    #[cfg(test)]
    pub fn active_runs(&self) -> usize {
        self.active.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    async fn run_group(
        &self,
        group_id: &str,
        session_id: &str,
        require_history: bool,
        token: &CancellationToken,
    ) {
        let session = match self.store.get_session(session_id).await {
            Ok(Some(session)) => session,
            Ok(None) => {
                tracing::warn!(session_id, "Agent trigger for unknown session");
                return;
            }
            Err(e) => {
                tracing::error!(session_id, "Failed to load session: {:?}", e);
                return;
            }
        };
        let config = match self.store.get_config(&session.config_id).await {
            Ok(Some(config)) => config,
            _ => {
                tracing::warn!(config_id = %session.config_id, "Agent trigger without config");
                return;
            }
        };

        let page = page_for(&config, &session.current_page_id);
        let Some(chat) = page
            .components
            .iter()
            .find(|c| c.component_type == "chat")
        else {
            tracing::debug!(
                page = %session.current_page_id,
                "No chat component on current page"
            );
            return;
        };
        let agent_ids: Vec<&str> = chat
            .props
            .get("agents")
            .and_then(Value::as_array)
            .map(|ids| ids.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        for agent_id in agent_ids {
            if token.is_cancelled() {
                break;
            }
            let Some(agent) = config.agents.get(agent_id) else {
                tracing::warn!(agent_id, config_id = %config.config_id, "Unknown agent id");
                continue;
            };
            self.run_agent(agent, group_id, &session, require_history, token)
                .await;
        }
    }

    /// One bounded agent turn: stream, fan out deltas, persist the final
    /// message, then dispatch any tool calls.
    async fn run_agent(
        &self,
        agent: &AgentConfig,
        group_id: &str,
        session: &Session,
        require_history: bool,
        parent: &CancellationToken,
    ) {
        let token = parent.child_token();
        let timer = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(AGENT_TIMEOUT).await;
                tracing::warn!("Agent run hit the {}s bound; cancelling", AGENT_TIMEOUT.as_secs());
                token.cancel();
            })
        };

        self.run_agent_inner(agent, group_id, session, require_history, &token)
            .await;
        timer.abort();
    }

    async fn run_agent_inner(
        &self,
        agent: &AgentConfig,
        group_id: &str,
        session: &Session,
        require_history: bool,
        token: &CancellationToken,
    ) {
        let history = match self.store.list_messages(group_id).await {
            Ok(history) => history,
            Err(e) => {
                tracing::error!(group_id, "Failed to load history: {:?}", e);
                return;
            }
        };
        if require_history && history.is_empty() {
            tracing::debug!(group_id, "No history yet; agent stays quiet");
            return;
        }
        if self.bus.subscriber_count(&session.id) == 0 {
            tracing::debug!(session_id = %session.id, "No subscribers; skipping agent run");
            return;
        }

        let turns: Vec<ChatTurn> = history
            .iter()
            .filter_map(|message| {
                let role = match message.sender_type {
                    SenderType::Participant => Role::User,
                    SenderType::Agent => Role::Assistant,
                    SenderType::System => return None,
                };
                Some(ChatTurn {
                    role,
                    content: message.content.clone(),
                })
            })
            .collect();

        let schemas = tools::builtin_schemas(&agent.tools);
        let stream_id = uuid::Uuid::new_v4().to_string();
        let sender_id = format!("agent:{}", agent.id);
        tracing::info!(group_id, agent = %agent.id, model = %agent.model, "Agent run started");

        let mut stream = self.llm.stream(agent, &schemas, turns, token.clone());
        let mut full_text = String::new();
        let mut tool_calls: Vec<(String, Value)> = Vec::new();
        let mut completed = false;
        let mut failed = false;

        loop {
            let item = tokio::select! {
                _ = token.cancelled() => break,
                item = stream.next() => item,
            };
            let Some(item) = item else { break };

            match item {
                Ok(StreamEvent::TextDelta { text }) => {
                    full_text.push_str(&text);
                    self.bus
                        .broadcast_to_group(
                            group_id,
                            SessionEvent::ChatMessageDelta {
                                stream_id: stream_id.clone(),
                                group_id: group_id.to_string(),
                                sender_id: sender_id.clone(),
                                sender_type: SenderType::Agent,
                                delta: text,
                                full_text: full_text.clone(),
                            },
                        )
                        .await;
                }
                Ok(StreamEvent::ToolCall { name, args }) => {
                    tool_calls.push((name, args));
                }
                Ok(StreamEvent::Done { full_text: text }) => {
                    full_text = text;
                    completed = true;
                }
                Err(e) => {
                    tracing::error!(group_id, agent = %agent.id, "Provider stream failed: {:?}", e);
                    failed = true;
                    break;
                }
            }
        }

        if failed {
            let apology =
                ChatMessage::new(group_id, &sender_id, SenderType::System, APOLOGY, None);
            match self.store.insert_message(&apology).await {
                Ok(_) => {
                    self.bus
                        .broadcast_to_group(group_id, SessionEvent::from_message(&apology))
                        .await;
                }
                Err(e) => tracing::error!(group_id, "Failed to persist apology: {:?}", e),
            }
            return;
        }
        if token.is_cancelled() && !completed {
            // Deltas may have gone out; clients discard the unterminated
            // stream bubble. Buffered tool calls are not dispatched.
            tracing::debug!(group_id, agent = %agent.id, "Agent run cancelled mid-stream");
            return;
        }

        let final_text = full_text.trim();
        if !final_text.is_empty() {
            let message =
                ChatMessage::new(group_id, &sender_id, SenderType::Agent, final_text, None);
            match self.store.insert_message(&message).await {
                Ok(_) => {
                    self.bus
                        .broadcast_to_group(group_id, SessionEvent::from_message(&message))
                        .await;
                }
                Err(e) => {
                    tracing::error!(group_id, "Failed to persist agent message: {:?}", e);
                    return;
                }
            }
        }

        for (name, args) in tool_calls {
            self.log_tool_call(session, &name, &args).await;
            tools::dispatch(&self.store, &self.bus, group_id, &name, &args).await;
        }
        tracing::info!(group_id, agent = %agent.id, "Agent run finished");
    }

    /// Audit record per tool call. Best effort: a failed write is logged and
    /// the dispatch proceeds.
    async fn log_tool_call(&self, session: &Session, name: &str, args: &Value) {
        let record = EventRecord {
            id: uuid::Uuid::new_v4().to_string(),
            event_type: "agent_tool_call".to_string(),
            component_type: Some("chat".to_string()),
            component_id: None,
            page_id: session.current_page_id.clone(),
            session_id: session.id.clone(),
            config_id: session.config_id.clone(),
            data: serde_json::json!({ "name": name, "args": args }),
            timestamp: chrono::Utc::now(),
            idempotency_key: Some(uuid::Uuid::new_v4().to_string()),
            created_at: chrono::Utc::now(),
        };
        if let Err(e) = self.store.insert_event(&record).await {
            tracing::error!(session_id = %session.id, "Failed to log tool call: {:?}", e);
        }
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::llm::ToolSchema;
    use crate::store::{Component, MemoryStore, Page, PageGraph, StudyConfig};
    use anyhow::Result;
    use futures::stream::BoxStream;
    use serde_json::json;

    /// Scripted model: each call pops the next script, or ends immediately
    /// once the scripts run out.
    pub struct ScriptedModel {
        scripts: Mutex<Vec<Vec<Result<StreamEvent>>>>,
    }

    impl ScriptedModel {
        pub fn new(scripts: Vec<Vec<Result<StreamEvent>>>) -> Self {
            Self {
                scripts: Mutex::new(scripts),
            }
        }
    }

    impl LanguageModel for ScriptedModel {
        fn stream(
            &self,
            _agent: &AgentConfig,
            _tools: &[ToolSchema],
            _history: Vec<ChatTurn>,
            _cancel: CancellationToken,
        ) -> BoxStream<'static, Result<StreamEvent>> {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                Box::pin(futures::stream::empty())
            } else {
                Box::pin(futures::stream::iter(scripts.remove(0)))
            }
        }
    }

    /// A model whose stream never produces anything; used to exercise the
    /// wall-clock bound.
    struct StuckModel;

    impl LanguageModel for StuckModel {
        fn stream(
            &self,
            _agent: &AgentConfig,
            _tools: &[ToolSchema],
            _history: Vec<ChatTurn>,
            _cancel: CancellationToken,
        ) -> BoxStream<'static, Result<StreamEvent>> {
            Box::pin(futures::stream::pending())
        }
    }

    /// Runner that never streams anything; enough for tests that only need
    /// the trigger surface.
    pub fn idle_runner(store: Arc<MemoryStore>, bus: Arc<EventBus>) -> Arc<AgentRunner> {
        Arc::new(AgentRunner::new(
            store,
            bus,
            Arc::new(ScriptedModel::new(Vec::new())),
        ))
    }

    fn chat_config() -> StudyConfig {
        let mut props = serde_json::Map::new();
        props.insert("agents".to_string(), json!(["alice"]));
        let page = Page {
            id: "chat".into(),
            components: vec![Component {
                component_type: "chat".into(),
                id: "chat-1".into(),
                props,
            }],
            end: false,
            end_redirect_url: None,
        };
        let mut pages = std::collections::HashMap::new();
        pages.insert("chat".to_string(), page);

        let mut agents = std::collections::HashMap::new();
        agents.insert(
            "alice".to_string(),
            AgentConfig {
                id: "alice".into(),
                model: "claude-sonnet-4-5".into(),
                system: "You are a negotiation partner.".into(),
                tools: vec!["end_chat".into()],
                reasoning_effort: None,
            },
        );

        StudyConfig {
            config_id: "c".into(),
            owner: None,
            require_auth: false,
            graph: PageGraph {
                initial_page_id: "chat".into(),
                pages,
            },
            agents,
        }
    }

    async fn seed_member(store: &MemoryStore, id: &str, group_id: &str) {
        let mut session = Session::new("c", "chat");
        session.id = id.to_string();
        session
            .user_state
            .insert("chat_group_id".into(), json!(group_id));
        store.insert_session(&session).await.unwrap();
    }

    async fn seed_participant_message(store: &MemoryStore, group_id: &str, text: &str) {
        let message = ChatMessage::new(group_id, "a", SenderType::Participant, text, None);
        store.insert_message(&message).await.unwrap();
    }

    async fn wait_until_idle(runner: &AgentRunner) {
        for _ in 0..200 {
            if runner.active_runs() == 0 {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("agent run did not finish");
    }

    fn runner_with(
        store: Arc<MemoryStore>,
        bus: Arc<EventBus>,
        model: impl LanguageModel + 'static,
    ) -> Arc<AgentRunner> {
        Arc::new(AgentRunner::new(store, bus, Arc::new(model)))
    }

    #[tokio::test]
    async fn streams_persists_and_dispatches_tools() {
        let store = Arc::new(MemoryStore::new());
        store.insert_config(chat_config()).await;
        seed_member(&store, "a", "g1").await;
        seed_member(&store, "b", "g1").await;
        seed_participant_message(&store, "g1", "done").await;

        let bus = Arc::new(EventBus::new(store.clone()));
        let mut sub_a = bus.subscribe("a");
        let mut sub_b = bus.subscribe("b");

        let runner = runner_with(
            store.clone(),
            bus.clone(),
            ScriptedModel::new(vec![vec![
                Ok(StreamEvent::TextDelta { text: "Deal".into() }),
                Ok(StreamEvent::TextDelta { text: "!".into() }),
                Ok(StreamEvent::ToolCall {
                    name: "end_chat".into(),
                    args: json!({ "deal_reached": true, "agreed_price": 10 }),
                }),
                Ok(StreamEvent::Done {
                    full_text: "Deal!".into(),
                }),
            ]]),
        );
        runner.trigger("g1", "a", true);
        wait_until_idle(&runner).await;

        // Both members observe the same sequence of named events.
        for sub in [&mut sub_a, &mut sub_b] {
            let mut names = Vec::new();
            while let Ok(event) = sub.rx.try_recv() {
                names.push(event.name());
            }
            assert_eq!(
                names,
                vec![
                    "chat_message_delta",
                    "chat_message_delta",
                    "chat_message",
                    "state_updated", // chat_ended, then one per tool field
                    "state_updated",
                    "state_updated",
                    "chat_ended",
                ]
            );
        }

        // The final message is persisted under the agent sender id.
        let history = store.list_messages("g1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].sender_id, "agent:alice");
        assert_eq!(history[1].sender_type, SenderType::Agent);
        assert_eq!(history[1].content, "Deal!");

        // Every member's state carries the tool results.
        for id in ["a", "b"] {
            let session = store.get_session(id).await.unwrap().unwrap();
            assert_eq!(session.user_state["chat_ended"], json!(true));
            assert_eq!(session.user_state["deal_reached"], json!(true));
            assert_eq!(session.user_state["agreed_price"], json!(10));
        }
    }

    #[tokio::test]
    async fn triggers_are_single_flight_per_group() {
        let store = Arc::new(MemoryStore::new());
        store.insert_config(chat_config()).await;
        seed_member(&store, "a", "g1").await;
        seed_participant_message(&store, "g1", "hello").await;

        let bus = Arc::new(EventBus::new(store.clone()));
        let _sub = bus.subscribe("a");

        // One script only: a second concurrent run would consume a second
        // (empty) script and leave a second message.
        let model = ScriptedModel::new(vec![vec![Ok(StreamEvent::Done {
            full_text: "hi".into(),
        })]]);
        let runner = runner_with(store.clone(), bus, model);

        runner.trigger("g1", "a", true);
        runner.trigger("g1", "a", true); // while the first is active
        wait_until_idle(&runner).await;

        let history = store.list_messages("g1").await.unwrap();
        let agent_messages: Vec<_> = history
            .iter()
            .filter(|m| m.sender_type == SenderType::Agent)
            .collect();
        assert_eq!(agent_messages.len(), 1);
    }

    #[tokio::test]
    async fn empty_history_suppresses_the_reply_path() {
        let store = Arc::new(MemoryStore::new());
        store.insert_config(chat_config()).await;
        seed_member(&store, "a", "g1").await;

        let bus = Arc::new(EventBus::new(store.clone()));
        let _sub = bus.subscribe("a");

        let runner = runner_with(
            store.clone(),
            bus,
            ScriptedModel::new(vec![vec![Ok(StreamEvent::Done {
                full_text: "eager".into(),
            })]]),
        );
        runner.trigger("g1", "a", true);
        wait_until_idle(&runner).await;

        assert!(store.list_messages("g1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn no_subscribers_means_no_run() {
        let store = Arc::new(MemoryStore::new());
        store.insert_config(chat_config()).await;
        seed_member(&store, "a", "g1").await;
        seed_participant_message(&store, "g1", "hello").await;

        let bus = Arc::new(EventBus::new(store.clone()));
        let model = ScriptedModel::new(vec![vec![Ok(StreamEvent::Done {
            full_text: "nobody listening".into(),
        })]]);
        let runner = runner_with(store.clone(), bus, model);

        runner.trigger("g1", "a", true);
        wait_until_idle(&runner).await;

        assert_eq!(store.list_messages("g1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn provider_failure_leaves_an_apology() {
        let store = Arc::new(MemoryStore::new());
        store.insert_config(chat_config()).await;
        seed_member(&store, "a", "g1").await;
        seed_participant_message(&store, "g1", "hello").await;

        let bus = Arc::new(EventBus::new(store.clone()));
        let mut sub = bus.subscribe("a");

        let runner = runner_with(
            store.clone(),
            bus,
            ScriptedModel::new(vec![vec![
                Ok(StreamEvent::TextDelta { text: "par".into() }),
                Err(anyhow::anyhow!("connection reset")),
            ]]),
        );
        runner.trigger("g1", "a", true);
        wait_until_idle(&runner).await;

        let history = store.list_messages("g1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].sender_type, SenderType::System);
        assert_eq!(history[1].content, APOLOGY);

        // The subscriber saw the delta, then the apology as a chat_message.
        assert_eq!(sub.rx.recv().await.unwrap().name(), "chat_message_delta");
        assert_eq!(sub.rx.recv().await.unwrap().name(), "chat_message");
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_streams_are_cancelled_at_the_bound() {
        let store = Arc::new(MemoryStore::new());
        store.insert_config(chat_config()).await;
        seed_member(&store, "a", "g1").await;
        seed_participant_message(&store, "g1", "hello").await;

        let bus = Arc::new(EventBus::new(store.clone()));
        let _sub = bus.subscribe("a");

        let runner = runner_with(store.clone(), bus, StuckModel);
        runner.trigger("g1", "a", true);

        // Paused time fast-forwards through the 60 s bound.
        tokio::time::sleep(AGENT_TIMEOUT + Duration::from_secs(1)).await;
        wait_until_idle(&runner).await;

        // No final message from a cancelled run.
        assert_eq!(store.list_messages("g1").await.unwrap().len(), 1);
    }
}
