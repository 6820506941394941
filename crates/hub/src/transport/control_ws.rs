// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Executor control endpoint: hands the socket to the registry, which
//! owns the handshake and the connection loop.

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use crate::transport::AppState;

#[derive(Debug, Clone, Deserialize)]
pub struct ControlWsQuery {
    pub token: Option<String>,
}

/// `GET /ws/executor/control`
///
/// The bearer token travels inside the `hello` message, with a header or
/// `?token=` fallback; the registry validates it against issued keys or
/// the static executor token and closes unauthenticated connections with
/// a typed reason.
pub async fn control_ws_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ControlWsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let transport_token = query.token.or_else(|| {
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_owned)
    });

    let registry = Arc::clone(&state.registry);
    ws.on_upgrade(move |socket| registry.handle_control_socket(socket, transport_token))
        .into_response()
}
