// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Side-channel dialing: in response to `open_*_channel` RPCs the agent
//! opens its own WebSocket back to the hub, which splices it with the
//! waiting browser socket.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use roost_core::protocol::{
    parse_resize_frame, RichClientMessage, RichServerMessage,
};
use roost_core::pty::NativePty;
use roost_core::record::SessionMode;
use roost_core::richlog::RichSession;

use crate::handlers::AgentContext;

/// Dial the channel endpoint and bridge a local PTY attach over it.
///
/// Resize control frames translate into PTY resizes; everything else is
/// raw bytes in per-connection order. The PTY fronts `tmux
/// attach-session`, so OSC-52 passthrough and scrollback behave exactly
/// as they do for local sessions on the hub.
pub async fn open_terminal(ctx: Arc<AgentContext>, channel_id: String, session_name: String) {
    let url = ctx.config.channel_url(&channel_id);
    let ws = match connect_async(&url).await {
        Ok((ws, _)) => ws,
        Err(e) => {
            tracing::warn!(channel = %channel_id, err = %e, "terminal channel dial failed");
            return;
        }
    };
    let (mut ws_tx, mut ws_rx) = ws.split();

    if !ctx.tmux.exists(&session_name).await {
        let _ = ws_tx.send(Message::Close(None)).await;
        return;
    }

    let argv = ctx.tmux.attach_argv(&session_name);
    let mut pty = match NativePty::spawn(&argv, 80, 24) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(session = %session_name, err = %e, "terminal channel attach failed");
            let _ = ws_tx.send(Message::Close(None)).await;
            return;
        }
    };

    let (output_tx, mut output_rx) = mpsc::channel::<Bytes>(64);
    let (input_tx, input_rx) = mpsc::channel::<Bytes>(64);
    let (size_tx, size_rx) = watch::channel((80u16, 24u16));

    let mut run = std::pin::pin!(pty.run(output_tx, input_rx, size_rx));

    loop {
        tokio::select! {
            status = &mut run => {
                tracing::debug!(session = %session_name, ?status, "terminal channel attach ended");
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }

            data = output_rx.recv() => {
                match data {
                    Some(bytes) => {
                        if ws_tx.send(Message::Binary(bytes)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            msg = ws_rx.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(_)) | None => break,
                };
                match msg {
                    Message::Text(text) => {
                        if let Some((cols, rows)) = parse_resize_frame(text.as_str()) {
                            let _ = size_tx.send((cols, rows));
                        } else if input_tx
                            .send(Bytes::copy_from_slice(text.as_bytes()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Message::Binary(data) => {
                        if input_tx.send(data).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }
}

/// Dial the channel endpoint and serve the rich protocol over it:
/// `session_state`, full replay, tail, prompts, interrupts.
pub async fn open_rich(
    ctx: Arc<AgentContext>,
    channel_id: String,
    session_name: String,
    command: String,
) {
    let url = ctx.config.channel_url(&channel_id);
    let ws = match connect_async(&url).await {
        Ok((ws, _)) => ws,
        Err(e) => {
            tracing::warn!(channel = %channel_id, err = %e, "rich channel dial failed");
            return;
        }
    };
    let (mut ws_tx, mut ws_rx) = ws.split();

    let dir = ctx.rich_dir(&session_name);
    let emulator = SessionMode::Rich.emulator_name(&session_name);
    let session = RichSession::new(dir, ctx.tmux.clone(), emulator.clone());

    // The hub passes the session command so a dead backing process can be
    // revived on attach.
    if !session.process_alive().await && !command.is_empty() {
        if let Err(e) = session.dir().ensure() {
            tracing::warn!(session = %session_name, err = %e, "rich dir provisioning failed");
        } else {
            let wrapped = roost_core::richlog::wrap_command(&command, session.dir());
            if let Err(e) = ctx.tmux.spawn(&emulator, &wrapped, None, &[]).await {
                tracing::warn!(session = %session_name, err = %e, "rich respawn failed");
            }
        }
    }

    let state = RichServerMessage::SessionState {
        streaming: false,
        process_alive: session.process_alive().await,
    };
    if send_json(&mut ws_tx, &state).await.is_err() {
        return;
    }

    let shutdown = CancellationToken::new();
    let _guard = shutdown.clone().drop_guard();
    let mut events = session.spawn_event_stream(shutdown.clone());

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if send_json(&mut ws_tx, &RichServerMessage::Event { event }).await.is_err() {
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
                        match serde_json::from_str::<RichClientMessage>(text.as_str()) {
                            Ok(RichClientMessage::Prompt { text }) => {
                                match session.send_prompt(&text) {
                                    Ok(true) => {}
                                    Ok(false) => {
                                        tracing::debug!("prompt dropped: no fifo reader")
                                    }
                                    Err(e) => tracing::warn!(err = %e, "prompt write failed"),
                                }
                            }
                            Ok(RichClientMessage::Interrupt {}) => {
                                if let Err(e) = session.interrupt().await {
                                    tracing::warn!(err = %e, "interrupt failed");
                                }
                            }
                            Err(_) => {
                                let _ = ws_tx.send(Message::Close(None)).await;
                                break;
                            }
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
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
