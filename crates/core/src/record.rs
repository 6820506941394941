// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session and executor records shared across the wire and the store.

use serde::{Deserialize, Serialize};

/// What kind of backing process a session runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    Terminal,
    Rich,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Terminal => "terminal",
            Self::Rich => "rich",
        }
    }

    /// Name of the backing emulator session on the placement host.
    ///
    /// Rich sessions are prefixed so the AI process and a plain shell with
    /// the same record name never collide.
    pub fn emulator_name(&self, name: &str) -> String {
        match self {
            Self::Terminal => name.to_owned(),
            Self::Rich => format!("rich-{name}"),
        }
    }
}

impl std::str::FromStr for SessionMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "terminal" => Ok(Self::Terminal),
            "rich" => Ok(Self::Rich),
            other => anyhow::bail!("unknown session mode: {other}"),
        }
    }
}

/// A persisted session record. The store is the source of truth; `alive`
/// is derived at list time and never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub name: String,
    pub description: String,
    pub mode: SessionMode,
    /// Argv string used to spawn the inner process.
    pub command: String,
    pub executor_id: String,
    pub owner_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_prompt: Option<String>,
    pub order_index: i64,
    pub created_at: u64,
    pub last_activity: u64,
}

impl SessionRecord {
    /// Emulator session name backing this record.
    pub fn emulator_name(&self) -> String {
        self.mode.emulator_name(&self.name)
    }
}

/// Executor connection status as persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorStatus {
    Online,
    Offline,
}

impl ExecutorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }
}

/// A persisted executor record. Survives offline periods so operators can
/// see history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorRecord {
    pub id: String,
    pub name: String,
    pub labels: Vec<String>,
    pub status: ExecutorStatus,
    pub version: String,
    pub last_seen: u64,
    pub session_count: i64,
}

/// An issued executor credential. The token itself is returned exactly once
/// at creation; only its sha256 hex digest is stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorKeyRecord {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    /// First characters of the token, kept so operators can match keys to
    /// configured agents without revealing the secret.
    pub prefix: String,
    #[serde(skip_serializing)]
    pub hashed_token: String,
    pub created_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}
