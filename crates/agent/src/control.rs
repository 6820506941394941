// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The agent's control connection: hello handshake, heartbeats,
//! inventory reports, RPC dispatch, and the upgrade trigger. Reconnects
//! with exponential backoff capped at 30 seconds.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use roost_core::epoch_ms;
use roost_core::protocol::ControlMessage;

use crate::handlers::{self, AgentContext};

const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// How often the agent re-reports inventory even without local changes,
/// catching sessions that died on their own.
const INVENTORY_REFRESH: Duration = Duration::from_secs(30);

/// Why the control loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Shutdown was requested locally.
    Shutdown,
    /// The server asked us to upgrade; caller fetches and exits 42.
    Upgrade,
}

enum ServeEnd {
    Shutdown,
    Upgrade,
    Disconnected,
}

/// Run the control connection until shutdown or an upgrade request.
pub async fn run(ctx: Arc<AgentContext>, shutdown: CancellationToken) -> Outcome {
    let mut backoff = BACKOFF_START;

    loop {
        if shutdown.is_cancelled() {
            return Outcome::Shutdown;
        }

        match connect_and_serve(&ctx, &shutdown).await {
            Ok((ServeEnd::Shutdown, _)) => return Outcome::Shutdown,
            Ok((ServeEnd::Upgrade, _)) => return Outcome::Upgrade,
            Ok((ServeEnd::Disconnected, handshook)) => {
                if handshook {
                    backoff = BACKOFF_START;
                }
                tracing::info!(backoff_secs = backoff.as_secs(), "control connection lost, reconnecting");
            }
            Err(e) => {
                tracing::warn!(err = %e, backoff_secs = backoff.as_secs(), "control connect failed");
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => return Outcome::Shutdown,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(BACKOFF_CAP);
    }
}

/// One connection lifetime. The bool reports whether the handshake
/// completed (successful connections reset the backoff).
async fn connect_and_serve(
    ctx: &Arc<AgentContext>,
    shutdown: &CancellationToken,
) -> anyhow::Result<(ServeEnd, bool)> {
    let url = ctx.config.control_url();
    let (ws, _) = connect_async(&url).await?;
    let (mut ws_tx, mut ws_rx) = ws.split();

    let hello = ControlMessage::Hello {
        id: ctx.config.effective_id(),
        name: ctx.config.effective_name(),
        labels: ctx.config.labels_vec(),
        version: env!("CARGO_PKG_VERSION").to_owned(),
        token: ctx.config.token.clone().unwrap_or_default(),
    };
    send(&mut ws_tx, &hello)
        .await
        .map_err(|()| anyhow::anyhow!("handshake write failed"))?;

    // The ack carries the heartbeat cadence.
    let heartbeat_ms = match tokio::time::timeout(Duration::from_secs(10), ws_rx.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<ControlMessage>(&text) {
            Ok(ControlMessage::HelloAck { heartbeat_interval_ms, server_version }) => {
                tracing::info!(%server_version, "control connection established");
                heartbeat_interval_ms.max(1_000)
            }
            Ok(other) => anyhow::bail!("expected hello_ack, got {other:?}"),
            Err(e) => anyhow::bail!("malformed hello_ack: {e}"),
        },
        Ok(Some(Ok(Message::Close(frame)))) => {
            anyhow::bail!("server closed during handshake: {frame:?}")
        }
        _ => anyhow::bail!("no hello_ack within deadline"),
    };

    send_inventory(ctx, &mut ws_tx)
        .await
        .map_err(|()| anyhow::anyhow!("inventory write failed"))?;

    let mut heartbeat = tokio::time::interval(Duration::from_millis(heartbeat_ms));
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut refresh = tokio::time::interval(INVENTORY_REFRESH);
    refresh.reset();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                return Ok((ServeEnd::Shutdown, true));
            }

            _ = heartbeat.tick() => {
                let msg = ControlMessage::Heartbeat { ts: epoch_ms() };
                if send(&mut ws_tx, &msg).await.is_err() {
                    return Ok((ServeEnd::Disconnected, true));
                }
            }

            _ = refresh.tick() => {
                if send_inventory(ctx, &mut ws_tx).await.is_err() {
                    return Ok((ServeEnd::Disconnected, true));
                }
            }

            msg = ws_rx.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(_)) | None => return Ok((ServeEnd::Disconnected, true)),
                };
                match msg {
                    Message::Text(text) => {
                        let parsed = match serde_json::from_str::<ControlMessage>(&text) {
                            Ok(m) => m,
                            Err(e) => {
                                tracing::debug!(err = %e, "malformed control message");
                                continue;
                            }
                        };
                        match parsed {
                            ControlMessage::Heartbeat { .. } => {}

                            ControlMessage::Rpc { id, payload } => {
                                let mutates = handlers::mutates_inventory(&payload);
                                let outcome = handlers::handle_rpc(ctx, payload).await;
                                let reply = ControlMessage::RpcReply { id, outcome };
                                if send(&mut ws_tx, &reply).await.is_err() {
                                    return Ok((ServeEnd::Disconnected, true));
                                }
                                if mutates && send_inventory(ctx, &mut ws_tx).await.is_err() {
                                    return Ok((ServeEnd::Disconnected, true));
                                }
                            }

                            ControlMessage::Upgrade { reason } => {
                                if ctx.config.no_upgrade {
                                    let line = "upgrade refused (--no-upgrade)".to_owned();
                                    let _ = send(&mut ws_tx, &ControlMessage::Log { line }).await;
                                    continue;
                                }
                                tracing::info!(?reason, "upgrade requested");
                                let _ = send(&mut ws_tx, &ControlMessage::UpgradeAck {}).await;
                                let _ = ws_tx.send(Message::Close(None)).await;
                                return Ok((ServeEnd::Upgrade, true));
                            }

                            other => {
                                tracing::debug!(?other, "unexpected control message");
                            }
                        }
                    }
                    Message::Close(frame) => {
                        tracing::info!(?frame, "control connection closed by server");
                        return Ok((ServeEnd::Disconnected, true));
                    }
                    _ => {}
                }
            }
        }
    }
}

async fn send_inventory<S>(ctx: &Arc<AgentContext>, tx: &mut S) -> Result<(), ()>
where
    S: SinkExt<Message> + Unpin,
{
    let sessions = ctx.inventory().await;
    send(tx, &ControlMessage::Inventory { sessions }).await
}

async fn send<S>(tx: &mut S, msg: &ControlMessage) -> Result<(), ()>
where
    S: SinkExt<Message> + Unpin,
{
    let text = match serde_json::to_string(msg) {
        Ok(t) => t,
        Err(_) => return Err(()),
    };
    tx.send(Message::Text(text.into())).await.map_err(|_| ())
}
