// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Terminal WebSocket: bridges a browser to the backing emulator session,
//! locally through the PTY bridge or remotely through a spliced
//! side-channel.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;

use roost_core::protocol::parse_resize_frame;

use crate::bridge::BridgeRead;
use crate::manager::AttachTarget;
use crate::registry::{ChannelKind, CHANNEL_DIAL_TIMEOUT};
use crate::transport::{auth, AppState};

/// Query parameters for the terminal WS upgrade; `cols`/`rows` seed the
/// client's initial size.
#[derive(Debug, Clone, Deserialize)]
pub struct TerminalWsQuery {
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    pub token: Option<String>,
}

/// `GET /ws/sessions/{name}`
pub async fn terminal_ws_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<TerminalWsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let owner = match auth::resolve_owner(&state.config, &headers, query.token.as_deref()) {
        Ok(o) => o,
        Err(code) => return code.to_http_response("unauthorized").into_response(),
    };

    let target = match state.manager.attach_target(&name, &owner) {
        Ok(t) => t,
        Err(e) => return e.to_http_response().into_response(),
    };

    let cols = query.cols.unwrap_or(80);
    let rows = query.rows.unwrap_or(24);

    match target {
        AttachTarget::Local { emulator_name } => ws
            .on_upgrade(move |socket| run_local_terminal(state, socket, emulator_name, cols, rows))
            .into_response(),
        AttachTarget::Remote { executor_id, session_name } => ws
            .on_upgrade(move |socket| {
                run_remote_channel(
                    state,
                    socket,
                    executor_id,
                    session_name,
                    ChannelKind::Terminal,
                    None,
                )
            })
            .into_response(),
    }
}

/// Local path: fan through the PTY bridge.
async fn run_local_terminal(
    state: Arc<AppState>,
    socket: WebSocket,
    emulator_name: String,
    cols: u16,
    rows: u16,
) {
    let mut client = match state.manager.bridges().attach(&emulator_name, cols, rows).await {
        Ok(c) => c,
        Err(e) => {
            close_socket(socket, 4000 + e.code.http_status(), e.message).await;
            return;
        }
    };

    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            read = client.recv() => {
                match read {
                    BridgeRead::Data(data) => {
                        if ws_tx.send(Message::Binary(data)).await.is_err() {
                            break;
                        }
                    }
                    BridgeRead::Lagged => {
                        // Slow client: disconnect rather than stall the
                        // broadcast for everyone else.
                        let _ = ws_tx
                            .send(Message::Close(Some(CloseFrame {
                                code: 1013,
                                reason: Utf8Bytes::from_static("client too slow"),
                            })))
                            .await;
                        break;
                    }
                    BridgeRead::Closed => {
                        let _ = ws_tx
                            .send(Message::Close(Some(CloseFrame {
                                code: 1000,
                                reason: Utf8Bytes::from_static("session ended"),
                            })))
                            .await;
                        break;
                    }
                }
            }
            msg = ws_rx.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(_)) | None => break,
                };
                match msg {
                    Message::Text(text) => {
                        if let Some((cols, rows)) = parse_resize_frame(&text) {
                            client.request_resize(cols, rows);
                        } else if client.send_input(Bytes::from(text.as_bytes().to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Message::Binary(data) => {
                        if client.send_input(data).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    // A clean client close never kills the backing session.
    client.detach();
}

/// Remote path: allocate a side-channel, wait for the agent dial, splice.
pub(crate) async fn run_remote_channel(
    state: Arc<AppState>,
    socket: WebSocket,
    executor_id: String,
    session_name: String,
    kind: ChannelKind,
    command: Option<String>,
) {
    let opened = state
        .registry
        .open_channel(&executor_id, &session_name, kind, command)
        .await;
    let (channel_id, socket_rx) = match opened {
        Ok(pair) => pair,
        Err(e) => {
            close_socket(socket, 4000 + e.code.http_status(), e.message).await;
            return;
        }
    };

    match tokio::time::timeout(CHANNEL_DIAL_TIMEOUT, socket_rx).await {
        Ok(Ok(agent_socket)) => splice(socket, agent_socket).await,
        _ => {
            state.registry.abandon_channel(&channel_id);
            close_socket(socket, 4504, "executor never opened the channel".to_owned()).await;
        }
    }
}

/// Pump two WebSockets into each other byte-for-byte. Resize control
/// frames and OSC-52 sequences pass through unchanged.
async fn splice(browser: WebSocket, agent: WebSocket) {
    let (mut browser_tx, mut browser_rx) = browser.split();
    let (mut agent_tx, mut agent_rx) = agent.split();

    loop {
        tokio::select! {
            msg = browser_rx.next() => {
                match msg {
                    Some(Ok(Message::Close(frame))) => {
                        let _ = agent_tx.send(Message::Close(frame)).await;
                        break;
                    }
                    None => {
                        let _ = agent_tx.send(Message::Close(None)).await;
                        break;
                    }
                    Some(Ok(msg @ (Message::Text(_) | Message::Binary(_)))) => {
                        if agent_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
            msg = agent_rx.next() => {
                match msg {
                    Some(Ok(Message::Close(frame))) => {
                        let _ = browser_tx.send(Message::Close(frame)).await;
                        break;
                    }
                    None => {
                        let _ = browser_tx.send(Message::Close(None)).await;
                        break;
                    }
                    Some(Ok(msg @ (Message::Text(_) | Message::Binary(_)))) => {
                        if browser_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }
}

/// Close a not-yet-split socket with a descriptive reason.
pub(crate) async fn close_socket(mut socket: WebSocket, code: u16, reason: String) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame { code, reason: reason.into() })))
        .await;
}
