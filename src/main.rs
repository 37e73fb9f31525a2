// Parley - experiment orchestration server
//
// Drives participants through declarative multi-stage studies: surveys,
// matchmaking into groups, multi-party chat with LLM agents, and treatment
// randomization.
//
// Architecture:
// - Server (axum): REST endpoints plus a per-session SSE stream
// - Store: MongoDB collections (or in-memory for local development)
// - Bus: per-session subscriber queues fanning events out to open streams
// - Session runtime: page-graph advancement with idempotent mutation
// - Matchmaker: FIFO pools forming groups of N under per-entry timeouts
// - Agent runner: bounded, single-flight LLM turns streamed to the group

mod agent;
mod bus;
mod chat;
mod cli;
mod config;
mod error;
mod events;
mod llm;
mod matchmaking;
mod server;
mod session;
mod store;
mod treatment;

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use agent::AgentRunner;
use bus::EventBus;
use chat::ChatService;
use config::Config;
use llm::LlmClient;
use matchmaking::Matchmaker;
use server::state::AppState;
use session::SessionRuntime;
use store::{MemoryStore, MongoStore, Store};
use treatment::TreatmentAssigner;

#[tokio::main]
async fn main() -> Result<()> {
    // Handle CLI commands first (config --show, --path)
    // If a command was handled, exit early
    if cli::handle_cli() {
        return Ok(());
    }

    let config = Config::from_env();

    // Precedence: RUST_LOG env var > config level > default "info"
    let default_filter = format!(
        "parley={},tower_http=info,axum=info",
        config.log_level
    );
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Parley {} starting", config::VERSION);

    // Storage backend: MongoDB in production, in-memory when no URI is set.
    let store: Arc<dyn Store> = match &config.mongodb_uri {
        Some(uri) => {
            let mongo = MongoStore::connect(uri).await?;
            Arc::new(mongo)
        }
        None => {
            tracing::warn!("MONGODB_URI not set; using the in-memory store (nothing persists)");
            let memory = MemoryStore::new();
            seed_local_configs(&memory).await;
            Arc::new(memory)
        }
    };
    store
        .ensure_indexes()
        .await
        .context("Failed to ensure indexes")?;

    // Wire the components. Everything shares the store and the event bus.
    let bus = Arc::new(EventBus::new(store.clone()));
    let treatments = Arc::new(TreatmentAssigner::new());
    let llm = Arc::new(LlmClient::new(config.providers.clone())?);
    let agents = Arc::new(AgentRunner::new(store.clone(), bus.clone(), llm));
    let sessions = Arc::new(SessionRuntime::new(
        store.clone(),
        bus.clone(),
        treatments.clone(),
        config.force_auth,
    ));
    let matchmaker = Arc::new(Matchmaker::new(
        store.clone(),
        bus.clone(),
        treatments.clone(),
    ));
    let chat = Arc::new(ChatService::new(
        store.clone(),
        bus.clone(),
        agents.clone(),
    ));

    let state = AppState {
        bus,
        sessions,
        matchmaker,
        chat,
        agents: agents.clone(),
    };

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Shutting down...");
    };
    server::serve(&config, state, shutdown).await?;

    // In-flight agent runs observe their tokens and stop streaming.
    agents.cancel_all();

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Local development runs without the config uploader; any compiled configs
/// dropped into ./configs/*.json are loaded into the in-memory store.
async fn seed_local_configs(store: &MemoryStore) {
    let Ok(entries) = std::fs::read_dir("configs") else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match std::fs::read_to_string(&path).map_err(anyhow::Error::from).and_then(|text| {
            serde_json::from_str::<store::StudyConfig>(&text).map_err(anyhow::Error::from)
        }) {
            Ok(config) => {
                tracing::info!(config_id = %config.config_id, "Seeded local config");
                store.insert_config(config).await;
            }
            Err(e) => {
                tracing::warn!("Skipping {}: {e}", path.display());
            }
        }
    }
}
