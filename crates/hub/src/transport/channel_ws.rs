// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Side-channel endpoint dialed by agents in response to
//! `open_*_channel` RPCs. The socket is handed to the browser task that
//! allocated the channel, which splices the two together.

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use crate::transport::ws::close_socket;
use crate::transport::AppState;

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelWsQuery {
    pub token: Option<String>,
}

/// `GET /ws/executor/terminal/{channel_id}?token=…`
pub async fn channel_ws_handler(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<String>,
    Query(query): Query<ChannelWsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let token = query.token.unwrap_or_default();
    ws.on_upgrade(move |socket| async move {
        // One-shot: a successful resolve consumes the pending entry.
        match state.registry.resolve_terminal_channel(&channel_id, &token) {
            Some((_kind, socket_tx)) => {
                if socket_tx.send(socket).is_err() {
                    tracing::debug!(channel = %channel_id, "browser side gave up before splice");
                }
            }
            None => {
                close_socket(socket, 4404, "unknown or already-used channel".to_owned()).await;
            }
        }
    })
    .into_response()
}
