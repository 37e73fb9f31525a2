//! Shared state handed to every handler
//!
//! All components are Arc'd once at startup; handlers stay cheap and push
//! real work into the components.

use std::sync::Arc;

use crate::agent::AgentRunner;
use crate::bus::EventBus;
use crate::chat::ChatService;
use crate::matchmaking::Matchmaker;
use crate::session::SessionRuntime;

#[derive(Clone)]
pub struct AppState {
    pub bus: Arc<EventBus>,
    pub sessions: Arc<SessionRuntime>,
    pub matchmaker: Arc<Matchmaker>,
    pub chat: Arc<ChatService>,
    pub agents: Arc<AgentRunner>,
}
