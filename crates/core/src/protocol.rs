// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire types for the executor control protocol and the per-session
//! channels. Messages are internally-tagged JSON enums; both the hub and
//! the agent deserialize with the same definitions.

use serde::{Deserialize, Serialize};

use crate::record::SessionMode;

/// One session as reported by an agent's inventory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryEntry {
    pub name: String,
    pub mode: SessionMode,
    pub alive: bool,
    pub last_activity: u64,
}

/// Messages on the long-lived control connection, both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Agent → server. First message after connect; carries the bearer token.
    Hello {
        id: String,
        name: String,
        #[serde(default)]
        labels: Vec<String>,
        version: String,
        token: String,
    },
    /// Server → agent. Accepts the handshake.
    HelloAck { server_version: String, heartbeat_interval_ms: u64 },
    /// Either direction. Any inbound traffic counts as liveness.
    Heartbeat { ts: u64 },
    /// Agent → server. Sent on connect and on every local session change.
    Inventory { sessions: Vec<InventoryEntry> },
    /// Server → agent. Typed request with a correlation id.
    Rpc { id: String, payload: RpcPayload },
    /// Agent → server. Completes the pending entry for `id`.
    RpcReply { id: String, outcome: RpcOutcome },
    /// Agent → server. Human-visible event line for the operator log.
    Log { line: String },
    /// Server → agent. Fetch a new build and exit with the restart code.
    Upgrade {
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Agent → server. Sent once the upgrade has started.
    UpgradeAck {},
}

/// Typed RPC requests the server dispatches to agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RpcPayload {
    CreateSession {
        name: String,
        mode: SessionMode,
        command: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
    },
    DeleteSession { name: String, mode: SessionMode },
    ForkSession {
        source: String,
        name: String,
        mode: SessionMode,
        command: String,
    },
    SnapshotSession { name: String, mode: SessionMode },
    ListSessions {},
    DiagnoseRichSession { name: String },
    OpenTerminalChannel { channel_id: String, session_name: String },
    OpenRichChannel { channel_id: String, session_name: String, command: String },
}

impl RpcPayload {
    /// Short operation name for logs.
    pub fn op(&self) -> &'static str {
        match self {
            Self::CreateSession { .. } => "create_session",
            Self::DeleteSession { .. } => "delete_session",
            Self::ForkSession { .. } => "fork_session",
            Self::SnapshotSession { .. } => "snapshot_session",
            Self::ListSessions {} => "list_sessions",
            Self::DiagnoseRichSession { .. } => "diagnose_rich_session",
            Self::OpenTerminalChannel { .. } => "open_terminal_channel",
            Self::OpenRichChannel { .. } => "open_rich_channel",
        }
    }
}

/// RPC completion carried on the wire. Transport-level failures (timeout,
/// disconnect) are synthesized server-side and never serialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RpcOutcome {
    Ok {
        #[serde(default)]
        data: serde_json::Value,
    },
    Err { code: String, message: String },
}

impl RpcOutcome {
    pub fn ok(data: serde_json::Value) -> Self {
        Self::Ok { data }
    }

    pub fn err(code: &str, message: impl Into<String>) -> Self {
        Self::Err { code: code.to_owned(), message: message.into() }
    }
}

/// Browser → rich channel messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RichClientMessage {
    /// Relay a user prompt to the AI process via the prompt FIFO.
    Prompt { text: String },
    /// Cancel the in-flight turn (Ctrl-C to the backing emulator session).
    Interrupt {},
}

/// Rich channel → browser messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RichServerMessage {
    /// Sent once on open.
    SessionState { streaming: bool, process_alive: bool },
    /// One forwarded event-log line, already parsed.
    Event { event: serde_json::Value },
}

/// Parse a terminal control frame (`{"resize":[cols,rows]}`).
///
/// Everything that is not a resize frame is raw input for the PTY, so this
/// must only match the exact shape.
pub fn parse_resize_frame(text: &str) -> Option<(u16, u16)> {
    #[derive(Deserialize)]
    struct Frame {
        resize: (u16, u16),
    }
    serde_json::from_str::<Frame>(text).ok().map(|f| f.resize)
}

/// Format a user prompt as the single-line JSON record the AI CLI reads
/// from the prompt FIFO.
pub fn encode_prompt_line(text: &str) -> String {
    let record = serde_json::json!({
        "role": "user",
        "content": [{"type": "text", "text": text}],
    });
    let mut line = record.to_string();
    line.push('\n');
    line
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
