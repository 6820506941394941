// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Rich WebSocket: event replay/tail plus the prompt write path, locally
//! against the filesystem or remotely through a spliced side-channel.

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use roost_core::record::SessionMode;
use roost_core::LOCAL;

use crate::error::ErrorCode;
use crate::registry::ChannelKind;
use crate::rich;
use crate::transport::ws::run_remote_channel;
use crate::transport::{auth, AppState};

#[derive(Debug, Clone, Deserialize)]
pub struct RichWsQuery {
    pub token: Option<String>,
}

/// `GET /ws/rich/{name}`
pub async fn rich_ws_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<RichWsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let owner = match auth::resolve_owner(&state.config, &headers, query.token.as_deref()) {
        Ok(o) => o,
        Err(code) => return code.to_http_response("unauthorized").into_response(),
    };

    let record = match state.manager.get(&name, &owner) {
        Ok(r) => r,
        Err(e) => return e.to_http_response().into_response(),
    };
    if record.mode != SessionMode::Rich {
        return ErrorCode::BadRequest
            .to_http_response(format!("'{name}' is not a rich session"))
            .into_response();
    }

    if record.executor_id == LOCAL {
        let session = state.manager.rich_session(&record.name);
        ws.on_upgrade(move |socket| rich::run_channel(socket, session)).into_response()
    } else {
        ws.on_upgrade(move |socket| {
            run_remote_channel(
                state,
                socket,
                record.executor_id,
                record.name,
                ChannelKind::Rich,
                Some(record.command),
            )
        })
        .into_response()
    }
}
