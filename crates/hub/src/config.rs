// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;

use clap::Parser;

/// Control plane for browser terminal and rich sessions.
#[derive(Debug, Clone, Parser)]
#[command(name = "roost", version, about)]
pub struct HubConfig {
    /// Host address to bind to.
    #[arg(long, env = "ROOST_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// HTTP port to listen on.
    #[arg(long, env = "PORT", default_value_t = 4600)]
    pub port: u16,

    /// Directory for the session database and rich event logs.
    #[arg(long, env = "DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Disable authentication and collapse all owners to "local" (dev only).
    #[arg(long, env = "AUTH_DISABLED", default_value_t = false)]
    pub auth_disabled: bool,

    /// Bearer token authenticating the operator principal.
    #[arg(long, env = "AUTH_TOKEN")]
    pub auth_token: Option<String>,

    /// Static token accepted from executor agents when no issued key matches.
    #[arg(long, env = "EXECUTOR_TOKEN")]
    pub executor_token: Option<String>,

    /// Private tmux server socket (tests and embedded deployments).
    #[arg(long, env = "ROOST_TMUX_SOCKET")]
    pub tmux_socket: Option<PathBuf>,

    /// Default AI CLI invocation for rich sessions.
    #[arg(
        long,
        env = "ROOST_AI_COMMAND",
        default_value = "claude --output-format stream-json --input-format stream-json --verbose"
    )]
    pub ai_command: String,

    /// Heartbeat interval handed to executor agents, in milliseconds.
    #[arg(long, env = "ROOST_HEARTBEAT_MS", default_value_t = 15_000)]
    pub heartbeat_interval_ms: u64,

    /// Per-RPC deadline in milliseconds.
    #[arg(long, env = "ROOST_RPC_TIMEOUT_MS", default_value_t = 30_000)]
    pub rpc_timeout_ms: u64,

    /// How long a PTY bridge lingers after its last client detaches.
    #[arg(long, env = "ROOST_LINGER_MS", default_value_t = 1_500)]
    pub linger_ms: u64,

    /// Tolerate non-matching WebSocket upgrades (hot-reload dev servers).
    #[arg(long, env = "ROOST_DEV", default_value_t = false)]
    pub dev: bool,

    /// Log format (json or text).
    #[arg(long, env = "ROOST_LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "ROOST_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl HubConfig {
    pub fn heartbeat_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn rpc_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn linger(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.linger_ms)
    }

    /// Validate the configuration after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.auth_disabled && self.auth_token.is_none() {
            anyhow::bail!("either --auth-token or AUTH_DISABLED=1 must be set");
        }
        match self.log_format.as_str() {
            "json" | "text" => {}
            other => anyhow::bail!("invalid log format: {other}"),
        }
        Ok(())
    }
}
