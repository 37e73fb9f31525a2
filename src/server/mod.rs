//! HTTP server setup and initialization

pub mod api;
pub mod state;

use anyhow::{Context, Result};
use axum::http::HeaderValue;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use self::state::AppState;

/// Build the route table over the shared component state.
pub fn build_router(state: AppState, config: &Config) -> Router {
    let cors = cors_layer(&config.cors_origins);

    Router::new()
        // Session lifecycle
        .route("/sessions/start", post(api::sessions::start))
        .route("/sessions/:id", get(api::sessions::get))
        .route("/sessions/:id/advance", post(api::sessions::advance))
        .route("/sessions/:id/state", post(api::sessions::update_state))
        .route("/sessions/:id/events", post(api::sessions::submit_event))
        .route("/sessions/:id/randomize", post(api::sessions::randomize))
        // Matchmaking
        .route("/sessions/:id/matchmake", post(api::matchmake::matchmake))
        .route(
            "/sessions/:id/matchmake/cancel",
            post(api::matchmake::cancel),
        )
        // Real-time stream
        .route("/sessions/:id/stream", get(api::stream::stream))
        // Group chat
        .route("/chat/:group_id/send", post(api::chat::send))
        .route("/chat/:group_id/history", get(api::chat::history))
        .route("/chat/:group_id/start-agents", post(api::chat::start_agents))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// CORS from CORS_ORIGINS: explicit origins when configured, otherwise any.
fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Start the server and run until the shutdown future resolves.
pub async fn serve(
    config: &Config,
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = build_router(state, config);

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .context("Failed to bind to address")?;
    tracing::info!("Listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("Server error")?;

    tracing::info!("Server shut down gracefully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::tests::idle_runner;
    use crate::bus::EventBus;
    use crate::chat::ChatService;
    use crate::matchmaking::Matchmaker;
    use crate::session::SessionRuntime;
    use crate::store::{MemoryStore, Page, PageGraph, Store, StudyConfig};
    use crate::treatment::TreatmentAssigner;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::Arc;
    use tower::util::ServiceExt;

    fn study_config(config_id: &str, require_auth: bool) -> StudyConfig {
        let mut pages = HashMap::new();
        pages.insert(
            "intro".to_string(),
            Page {
                id: "intro".into(),
                components: Vec::new(),
                end: false,
                end_redirect_url: None,
            },
        );
        pages.insert(
            "outro".to_string(),
            Page {
                id: "outro".into(),
                components: Vec::new(),
                end: true,
                end_redirect_url: Some("https://example.org/done".into()),
            },
        );
        StudyConfig {
            config_id: config_id.into(),
            owner: None,
            require_auth,
            graph: PageGraph {
                initial_page_id: "intro".into(),
                pages,
            },
            agents: HashMap::new(),
        }
    }

    async fn test_app() -> (Arc<MemoryStore>, Router) {
        let store = Arc::new(MemoryStore::new());
        store.insert_config(study_config("c", false)).await;
        store.insert_config(study_config("locked", true)).await;

        let bus = Arc::new(EventBus::new(store.clone()));
        let treatments = Arc::new(TreatmentAssigner::new());
        let agents = idle_runner(store.clone(), bus.clone());
        let sessions = Arc::new(SessionRuntime::new(
            store.clone(),
            bus.clone(),
            treatments.clone(),
            false,
        ));
        let matchmaker = Arc::new(Matchmaker::new(store.clone(), bus.clone(), treatments));
        let chat = Arc::new(ChatService::new(store.clone(), bus.clone(), agents.clone()));

        let state = AppState {
            bus,
            sessions,
            matchmaker,
            chat,
            agents,
        };
        (store, build_router(state, &Config::default()))
    }

    async fn call(
        app: &Router,
        method: Method,
        uri: &str,
        user: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(user) = user {
            request = request.header("x-user-id", user);
        }
        let body = match body {
            Some(value) => Body::from(value.to_string()),
            None => Body::empty(),
        };
        let response = app
            .clone()
            .oneshot(request.body(body).expect("request build"))
            .await
            .expect("request dispatch");

        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body read");
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("json body")
        };
        (status, value)
    }

    #[tokio::test]
    async fn start_advance_end_and_replay() {
        let (_, app) = test_app().await;

        let (status, body) = call(
            &app,
            Method::POST,
            "/sessions/start",
            None,
            Some(json!({ "configId": "c" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "created");
        assert_eq!(body["currentPageId"], "intro");
        let session_id = body["sessionId"].as_str().unwrap().to_string();

        let advance_uri = format!("/sessions/{session_id}/advance");
        let (status, body) = call(
            &app,
            Method::POST,
            &advance_uri,
            None,
            Some(json!({ "target": "outro", "idempotencyKey": "k1" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["currentPageId"], "outro");
        assert!(!body["endedAt"].is_null());
        assert!(body.get("deduplicated").is_none());

        // Same key: same final state, flagged as a replay.
        let (status, body) = call(
            &app,
            Method::POST,
            &advance_uri,
            None,
            Some(json!({ "target": "outro", "idempotencyKey": "k1" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["currentPageId"], "outro");
        assert_eq!(body["deduplicated"], json!(true));
    }

    #[tokio::test]
    async fn completed_participants_get_409() {
        let (_, app) = test_app().await;

        let (_, body) = call(
            &app,
            Method::POST,
            "/sessions/start",
            Some("user-1"),
            Some(json!({ "configId": "c" })),
        )
        .await;
        let session_id = body["sessionId"].as_str().unwrap().to_string();
        call(
            &app,
            Method::POST,
            &format!("/sessions/{session_id}/advance"),
            Some("user-1"),
            Some(json!({ "target": "outro", "idempotencyKey": "k1" })),
        )
        .await;

        let (status, body) = call(
            &app,
            Method::POST,
            "/sessions/start",
            Some("user-1"),
            Some(json!({ "configId": "c" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["status"], "blocked");
        assert_eq!(body["error"], "session_blocked");
    }

    #[tokio::test]
    async fn missing_things_are_404_and_anonymous_locked_starts_401() {
        let (_, app) = test_app().await;

        let (status, body) = call(
            &app,
            Method::POST,
            "/sessions/start",
            None,
            Some(json!({ "configId": "nope" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "config_not_found");

        let (status, _) = call(&app, Method::GET, "/sessions/unknown", None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(
            &app,
            Method::POST,
            "/sessions/start",
            None,
            Some(json!({ "configId": "locked" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "authentication_required");
    }

    #[tokio::test]
    async fn matchmaking_waits_then_matches() {
        let (store, app) = test_app().await;

        let mut ids = Vec::new();
        for _ in 0..2 {
            let (_, body) = call(
                &app,
                Method::POST,
                "/sessions/start",
                None,
                Some(json!({ "configId": "c" })),
            )
            .await;
            ids.push(body["sessionId"].as_str().unwrap().to_string());
        }

        let request = json!({ "poolId": "p", "num_users": 2, "timeoutSeconds": 120 });
        let (status, body) = call(
            &app,
            Method::POST,
            &format!("/sessions/{}/matchmake", ids[0]),
            None,
            Some(request.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "waiting");
        assert_eq!(body["position"], 1);

        let (status, body) = call(
            &app,
            Method::POST,
            &format!("/sessions/{}/matchmake", ids[1]),
            None,
            Some(request),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "matched");
        let group_id = body["groupId"].as_str().unwrap();

        for id in &ids {
            let session = store.get_session(id).await.unwrap().unwrap();
            assert_eq!(session.chat_group_id(), Some(group_id));
        }

        // Nobody is left waiting, so cancelling reports not_found.
        let (_, body) = call(
            &app,
            Method::POST,
            &format!("/sessions/{}/matchmake/cancel", ids[0]),
            None,
            Some(json!({ "poolId": "p" })),
        )
        .await;
        assert_eq!(body["status"], "not_found");
    }

    #[tokio::test]
    async fn randomize_sticks_per_state_key() {
        let (_, app) = test_app().await;
        let (_, body) = call(
            &app,
            Method::POST,
            "/sessions/start",
            None,
            Some(json!({ "configId": "c" })),
        )
        .await;
        let session_id = body["sessionId"].as_str().unwrap().to_string();
        let uri = format!("/sessions/{session_id}/randomize");
        let request = json!({ "conditions": ["A", "B"], "stateKey": "t" });

        let (status, first) = call(&app, Method::POST, &uri, None, Some(request.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["existing"], json!(false));

        let (_, second) = call(&app, Method::POST, &uri, None, Some(request)).await;
        assert_eq!(second["existing"], json!(true));
        assert_eq!(second["condition"], first["condition"]);
    }

    #[tokio::test]
    async fn chat_requires_membership() {
        let (_, app) = test_app().await;
        let (_, body) = call(
            &app,
            Method::POST,
            "/sessions/start",
            None,
            Some(json!({ "configId": "c" })),
        )
        .await;
        let session_id = body["sessionId"].as_str().unwrap().to_string();

        let (status, body) = call(
            &app,
            Method::POST,
            "/chat/other-group/send",
            None,
            Some(json!({ "sessionId": session_id, "content": "hi" })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "not_a_member");

        // The degenerate solo group (session id == group id) works.
        let (status, body) = call(
            &app,
            Method::POST,
            &format!("/chat/{session_id}/send"),
            None,
            Some(json!({ "sessionId": session_id, "content": "hi" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["messageId"].is_string());

        let (status, body) = call(
            &app,
            Method::GET,
            &format!("/chat/{session_id}/history?sessionId={session_id}"),
            None,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn submitted_events_dedup() {
        let (_, app) = test_app().await;
        let (_, body) = call(
            &app,
            Method::POST,
            "/sessions/start",
            None,
            Some(json!({ "configId": "c" })),
        )
        .await;
        let session_id = body["sessionId"].as_str().unwrap().to_string();
        let uri = format!("/sessions/{session_id}/events");
        let event = json!({
            "type": "click",
            "componentType": "button",
            "componentId": "next",
            "data": { "x": 3 },
            "idempotencyKey": "e1"
        });

        let (status, first) = call(&app, Method::POST, &uri, None, Some(event.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert!(first.get("deduplicated").is_none());

        let (_, second) = call(&app, Method::POST, &uri, None, Some(event)).await;
        assert_eq!(second["eventId"], "duplicate");
        assert_eq!(second["deduplicated"], json!(true));
    }
}
