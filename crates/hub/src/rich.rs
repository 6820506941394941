// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Rich channel: per-connection replay + tail of a session's event log
//! plus the user-prompt write path, spoken over a browser WebSocket.

use axum::extract::ws::{Message, Utf8Bytes, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio_util::sync::CancellationToken;

use roost_core::protocol::{RichClientMessage, RichServerMessage};
use roost_core::richlog::RichSession;

/// Drive one rich WebSocket to completion.
///
/// Protocol: one `session_state` on open, then every admitted event line
/// as an `event` message; the replay prefix fully precedes tailed events.
/// Inbound prompts go to the FIFO (dropped when no reader); interrupts
/// send Ctrl-C. Socket errors tear the channel down; a malformed inbound
/// message closes the socket with a typed reason.
pub async fn run_channel(socket: WebSocket, session: RichSession) {
    let shutdown = CancellationToken::new();
    let _guard = shutdown.clone().drop_guard();

    let (mut ws_tx, mut ws_rx) = socket.split();

    let state = RichServerMessage::SessionState {
        streaming: false,
        process_alive: session.process_alive().await,
    };
    if send_json(&mut ws_tx, &state).await.is_err() {
        return;
    }

    let mut events = session.spawn_event_stream(shutdown.clone());

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let msg = RichServerMessage::Event { event };
                if send_json(&mut ws_tx, &msg).await.is_err() {
                    break;
                }
            }
            msg = ws_rx.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(_)) | None => break,
                };
                match msg {
                    Message::Text(text) => {
                        let client_msg: RichClientMessage = match serde_json::from_str(&text) {
                            Ok(m) => m,
                            Err(_) => {
                                let _ = ws_tx
                                    .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                                        code: 1008,
                                        reason: Utf8Bytes::from_static("PROTOCOL_ERROR: bad message"),
                                    })))
                                    .await;
                                break;
                            }
                        };
                        handle_client_message(&session, client_msg).await;
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }
}

async fn handle_client_message(session: &RichSession, msg: RichClientMessage) {
    match msg {
        RichClientMessage::Prompt { text } => match session.send_prompt(&text) {
            Ok(true) => {}
            Ok(false) => tracing::debug!("prompt dropped: no fifo reader"),
            Err(e) => tracing::warn!(err = %e, "prompt write failed"),
        },
        RichClientMessage::Interrupt {} => {
            if let Err(e) = session.interrupt().await {
                tracing::warn!(err = %e, "interrupt failed");
            }
        }
    }
}

async fn send_json<S>(tx: &mut S, msg: &RichServerMessage) -> Result<(), ()>
where
    S: SinkExt<Message> + Unpin,
{
    let text = match serde_json::to_string(msg) {
        Ok(t) => t,
        Err(_) => return Err(()),
    };
    tx.send(Message::Text(text.into())).await.map_err(|_| ())
}

#[cfg(test)]
#[path = "rich_tests.rs"]
mod tests;
