// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Local RPC handlers: the agent-side equivalents of the hub's session
//! operations, all running against this host's tmux server.

use std::path::PathBuf;
use std::sync::Arc;

use roost_core::protocol::{InventoryEntry, RpcOutcome, RpcPayload};
use roost_core::record::SessionMode;
use roost_core::richlog::{self, RichDir};
use roost_core::tmux::TmuxControl;
use roost_core::epoch_ms;

use crate::config::AgentConfig;

/// Shared agent-side context for RPC handling and side-channels.
pub struct AgentContext {
    pub config: AgentConfig,
    pub tmux: TmuxControl,
    pub data_dir: PathBuf,
}

impl AgentContext {
    pub fn new(config: AgentConfig) -> Arc<Self> {
        let tmux = TmuxControl::with_socket(config.tmux_socket.clone());
        let data_dir = config.data_dir.clone();
        Arc::new(Self { config, tmux, data_dir })
    }

    pub fn rich_dir(&self, session_name: &str) -> RichDir {
        RichDir::new(&self.data_dir, session_name)
    }

    /// Current session inventory from the local tmux server.
    ///
    /// Emulator names map back to record names: the `rich-` prefix marks
    /// rich sessions.
    pub async fn inventory(&self) -> Vec<InventoryEntry> {
        let now = epoch_ms();
        self.tmux
            .list_sessions()
            .await
            .into_iter()
            .map(|emulator| match emulator.strip_prefix("rich-") {
                Some(name) => InventoryEntry {
                    name: name.to_owned(),
                    mode: SessionMode::Rich,
                    alive: true,
                    last_activity: now,
                },
                None => InventoryEntry {
                    name: emulator,
                    mode: SessionMode::Terminal,
                    alive: true,
                    last_activity: now,
                },
            })
            .collect()
    }
}

/// Whether an RPC mutates the local session set (inventory must be
/// re-sent afterwards).
pub fn mutates_inventory(payload: &RpcPayload) -> bool {
    matches!(
        payload,
        RpcPayload::CreateSession { .. }
            | RpcPayload::DeleteSession { .. }
            | RpcPayload::ForkSession { .. }
    )
}

/// Execute one RPC against local state.
pub async fn handle_rpc(ctx: &Arc<AgentContext>, payload: RpcPayload) -> RpcOutcome {
    match payload {
        RpcPayload::CreateSession { name, mode, command, cwd } => {
            create_session(ctx, &name, mode, &command, cwd.as_deref()).await
        }

        RpcPayload::DeleteSession { name, mode } => {
            let emulator = mode.emulator_name(&name);
            let _ = ctx.tmux.kill(&emulator).await;
            if mode == SessionMode::Rich {
                let _ = std::fs::remove_dir_all(ctx.rich_dir(&name).path());
            }
            RpcOutcome::ok(serde_json::json!({}))
        }

        RpcPayload::ForkSession { source, name, mode, command } => {
            if mode == SessionMode::Rich {
                let parent = ctx.rich_dir(&source);
                let child = ctx.rich_dir(&name);
                if let Err(e) = richlog::copy_event_prefix(&parent, &child) {
                    return RpcOutcome::err("INTERNAL", format!("fork copy failed: {e}"));
                }
            }
            create_session(ctx, &name, mode, &command, None).await
        }

        RpcPayload::SnapshotSession { name, mode } => {
            let emulator = mode.emulator_name(&name);
            if !ctx.tmux.exists(&emulator).await {
                return RpcOutcome::err("NOT_FOUND", format!("no backing session '{name}'"));
            }
            match ctx.tmux.capture(&emulator).await {
                Ok(text) => RpcOutcome::ok(serde_json::json!({ "text": text })),
                Err(e) => RpcOutcome::err("INTERNAL", format!("capture failed: {e}")),
            }
        }

        RpcPayload::ListSessions {} => {
            let sessions = ctx.inventory().await;
            match serde_json::to_value(&sessions) {
                Ok(value) => RpcOutcome::ok(serde_json::json!({ "sessions": value })),
                Err(e) => RpcOutcome::err("INTERNAL", format!("{e}")),
            }
        }

        RpcPayload::DiagnoseRichSession { name } => {
            let diag = richlog::diagnose(&ctx.rich_dir(&name));
            match serde_json::to_value(&diag) {
                Ok(value) => RpcOutcome::ok(value),
                Err(e) => RpcOutcome::err("INTERNAL", format!("{e}")),
            }
        }

        RpcPayload::OpenTerminalChannel { channel_id, session_name } => {
            let ctx = Arc::clone(ctx);
            tokio::spawn(async move {
                crate::channels::open_terminal(ctx, channel_id, session_name).await;
            });
            RpcOutcome::ok(serde_json::json!({}))
        }

        RpcPayload::OpenRichChannel { channel_id, session_name, command } => {
            let ctx = Arc::clone(ctx);
            tokio::spawn(async move {
                crate::channels::open_rich(ctx, channel_id, session_name, command).await;
            });
            RpcOutcome::ok(serde_json::json!({}))
        }
    }
}

async fn create_session(
    ctx: &Arc<AgentContext>,
    name: &str,
    mode: SessionMode,
    command: &str,
    cwd: Option<&str>,
) -> RpcOutcome {
    let emulator = mode.emulator_name(name);
    if ctx.tmux.exists(&emulator).await {
        return RpcOutcome::err("NAME_TAKEN", format!("session '{name}' already exists here"));
    }

    let command = match mode {
        SessionMode::Terminal => command.to_owned(),
        SessionMode::Rich => {
            let dir = ctx.rich_dir(name);
            if let Err(e) = dir.ensure() {
                return RpcOutcome::err("SPAWN_FAILED", format!("rich dir: {e}"));
            }
            richlog::wrap_command(command, &dir)
        }
    };

    match ctx.tmux.spawn(&emulator, &command, cwd.map(std::path::Path::new), &[]).await {
        Ok(()) => RpcOutcome::ok(serde_json::json!({})),
        Err(e) => RpcOutcome::err("SPAWN_FAILED", format!("{e}")),
    }
}

#[cfg(test)]
#[path = "handlers_tests.rs"]
mod tests;
