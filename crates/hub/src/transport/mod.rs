// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP + WebSocket transport for the hub.

pub mod auth;
pub mod channel_ws;
pub mod control_ws;
pub mod http;
pub mod rich_ws;
pub mod ws;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post, put};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::HubConfig;
use crate::manager::SessionManager;
use crate::registry::ExecutorRegistry;

/// Shared application state passed to all handlers via axum `State`.
pub struct AppState {
    pub config: HubConfig,
    pub manager: Arc<SessionManager>,
    pub registry: Arc<ExecutorRegistry>,
    pub shutdown: CancellationToken,
}

/// Build the axum `Router` with all hub routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health (no auth)
        .route("/api/health", get(http::health))
        // Sessions
        .route("/api/sessions", get(http::list_sessions).post(http::create_session))
        .route("/api/sessions/fork", post(http::fork_session))
        .route("/api/sessions/job", post(http::create_job))
        .route("/api/sessions/reorder", put(http::reorder_sessions))
        .route("/api/sessions/{name}", delete(http::delete_session))
        .route("/api/sessions/{name}/snapshot", get(http::snapshot_session))
        .route("/api/sessions/{name}/summarize", post(http::summarize_session))
        .route("/api/sessions/{name}/diagnose", get(http::diagnose_session))
        // Owner config
        .route("/api/config", get(http::get_config).put(http::put_config))
        // Executors
        .route("/api/executors", get(http::list_executors))
        .route("/api/executors/upgrade", post(http::upgrade_executors))
        .route("/api/executors/logs", get(http::executor_logs))
        .route("/api/executor-keys", get(http::list_keys).post(http::create_key))
        .route("/api/executor-keys/{id}", delete(http::delete_key))
        // WebSockets
        .route("/ws/sessions/{name}", get(ws::terminal_ws_handler))
        .route("/ws/rich/{name}", get(rich_ws::rich_ws_handler))
        .route("/ws/executor/control", get(control_ws::control_ws_handler))
        .route("/ws/executor/terminal/{channel_id}", get(channel_ws::channel_ws_handler))
        .fallback(fallback)
        // Middleware
        .layer(middleware::from_fn_with_state(state.clone(), auth::auth_layer))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Unmatched routes. Dev mode answers WS upgrade probes with a plain 404
/// so hot-reload clients retry politely; prod severs them.
async fn fallback(
    state: axum::extract::State<Arc<AppState>>,
    req: axum::http::Request<axum::body::Body>,
) -> impl IntoResponse {
    let upgrade = req.headers().contains_key(axum::http::header::UPGRADE);
    if upgrade && !state.config.dev {
        return (StatusCode::UPGRADE_REQUIRED, "unknown upgrade target").into_response();
    }
    (StatusCode::NOT_FOUND, "not found").into_response()
}
