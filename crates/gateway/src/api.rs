//! HTTP surface: the client WebSocket route plus the terminal settings
//! endpoints.

use axum::extract::State;
use axum::http::Method;
use axum::routing::{delete, get, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use valet_domain::config::AskLevel;

use crate::state::AppState;
use crate::ws;

/// Assemble the application router.
pub fn router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.server.cors_origins);
    Router::new()
        .route("/ws", get(ws::client_ws))
        .route("/api/terminal/settings", get(terminal_settings))
        .route("/api/terminal/settings/ask-level", put(set_ask_level))
        .route("/api/terminal/approvals", delete(clear_approvals))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let parsed: Vec<_> = origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(parsed))
        .allow_methods([Method::GET, Method::PUT, Method::DELETE])
        .allow_headers([axum::http::header::CONTENT_TYPE])
}

/// GET /api/terminal/settings
async fn terminal_settings(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "ask_level": state.terminal.ask_level().as_str(),
        "session_mode": state.terminal.session_mode(),
        "approval_count": state.terminal.approvals().approval_count(),
    }))
}

#[derive(Debug, Deserialize)]
struct AskLevelRequest {
    level: String,
}

/// PUT /api/terminal/settings/ask-level
async fn set_ask_level(
    State(state): State<AppState>,
    Json(request): Json<AskLevelRequest>,
) -> Json<Value> {
    match AskLevel::parse(&request.level) {
        Some(level) => {
            state.terminal.set_ask_level(level);
            Json(json!({ "ask_level": level.as_str() }))
        }
        None => Json(json!({
            "error": "Invalid ask level. Must be 'always', 'on-miss', or 'off'"
        })),
    }
}

/// DELETE /api/terminal/approvals
async fn clear_approvals(State(state): State<AppState>) -> Json<Value> {
    state.terminal.approvals().clear();
    Json(json!({ "cleared": true, "approval_count": 0 }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use valet_domain::config::Config;
    use valet_domain::sysenv::StartupEnv;
    use valet_providers::ProviderRegistry;
    use valet_retriever::Retriever;

    use crate::capture::{NoopCapture, NoopTranscriber};
    use crate::storage::MemoryStore;

    fn test_state() -> (AppState, tempfile::TempDir) {
        let mut config = Config::default();
        let dir = tempfile::tempdir().unwrap();
        config.terminal.user_data_dir = dir.path().to_path_buf();
        let state = AppState::build(
            config,
            StartupEnv::capture(),
            ProviderRegistry::new(),
            Arc::new(MemoryStore::new()),
            Arc::new(NoopCapture),
            Arc::new(NoopTranscriber),
            Retriever::with_backend(None),
        );
        (state, dir)
    }

    #[tokio::test]
    async fn settings_report_current_state() {
        let (state, _dir) = test_state();
        let Json(value) = terminal_settings(State(state)).await;
        assert_eq!(value["ask_level"], "on-miss");
        assert_eq!(value["session_mode"], false);
        assert_eq!(value["approval_count"], 0);
    }

    #[tokio::test]
    async fn ask_level_updates_and_validates() {
        let (state, _dir) = test_state();
        let Json(ok) = set_ask_level(
            State(state.clone()),
            Json(AskLevelRequest { level: "always".into() }),
        )
        .await;
        assert_eq!(ok["ask_level"], "always");
        assert_eq!(state.terminal.ask_level(), AskLevel::Always);

        let Json(err) = set_ask_level(
            State(state.clone()),
            Json(AskLevelRequest { level: "sometimes".into() }),
        )
        .await;
        assert!(err["error"].as_str().unwrap().contains("Invalid ask level"));
        assert_eq!(state.terminal.ask_level(), AskLevel::Always);
    }

    #[tokio::test]
    async fn clear_approvals_empties_the_store() {
        let (state, _dir) = test_state();
        state.terminal.approvals().remember_approval("npm install");
        assert_eq!(state.terminal.approvals().approval_count(), 1);

        let Json(value) = clear_approvals(State(state.clone())).await;
        assert_eq!(value["cleared"], true);
        assert_eq!(state.terminal.approvals().approval_count(), 0);
    }

    #[tokio::test]
    async fn router_builds() {
        let (state, _dir) = test_state();
        let _router = router(state);
    }
}
