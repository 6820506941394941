// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;

use clap::Parser;

/// Remote executor agent for the roost control plane.
#[derive(Debug, Clone, Parser)]
#[command(name = "roost-agent", version, about)]
pub struct AgentConfig {
    /// Control plane base URL (http or https).
    #[arg(long, env = "EXECUTOR_URL")]
    pub url: Option<String>,

    /// Executor bearer token.
    #[arg(long, env = "EXECUTOR_TOKEN")]
    pub token: Option<String>,

    /// Executor id (defaults to the hostname).
    #[arg(long, env = "EXECUTOR_ID")]
    pub id: Option<String>,

    /// Human-readable executor name (defaults to the id).
    #[arg(long, env = "EXECUTOR_NAME")]
    pub name: Option<String>,

    /// Comma-separated labels (e.g. `gpu,linux`).
    #[arg(long, env = "EXECUTOR_LABELS", default_value = "")]
    pub labels: String,

    /// Refuse upgrade requests from the control plane.
    #[arg(long, default_value_t = false)]
    pub no_upgrade: bool,

    /// Key for end-to-end test hooks.
    #[arg(long, env = "EXECUTOR_E2E_KEY")]
    pub e2e_key: Option<String>,

    /// Directory for rich event logs and prompt FIFOs on this host.
    #[arg(long, env = "EXECUTOR_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Private tmux server socket (tests and embedded deployments).
    #[arg(long, env = "EXECUTOR_TMUX_SOCKET")]
    pub tmux_socket: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "EXECUTOR_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl AgentConfig {
    /// Validate after parsing; failures are fatal config errors (exit 1).
    pub fn validate(&self) -> anyhow::Result<()> {
        let url = self.url.as_deref().unwrap_or_default();
        if url.is_empty() {
            anyhow::bail!("--url or EXECUTOR_URL is required");
        }
        if !url.starts_with("http://") && !url.starts_with("https://") {
            anyhow::bail!("--url must be an http(s) URL");
        }
        if self.token.as_deref().unwrap_or_default().is_empty() {
            anyhow::bail!("--token or EXECUTOR_TOKEN is required");
        }
        Ok(())
    }

    /// Executor id: flag, env, or hostname.
    pub fn effective_id(&self) -> String {
        if let Some(ref id) = self.id {
            if !id.is_empty() {
                return id.clone();
            }
        }
        nix::unistd::gethostname()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-executor".to_owned())
    }

    pub fn effective_name(&self) -> String {
        self.name.clone().filter(|n| !n.is_empty()).unwrap_or_else(|| self.effective_id())
    }

    pub fn labels_vec(&self) -> Vec<String> {
        self.labels
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect()
    }

    /// Base URL rewritten for WebSocket dialing.
    pub fn ws_base(&self) -> String {
        let base = self.url.clone().unwrap_or_default();
        if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else {
            format!("ws://{}", base.strip_prefix("http://").unwrap_or(&base))
        }
    }

    /// URL of the control endpoint.
    pub fn control_url(&self) -> String {
        format!("{}/ws/executor/control", self.ws_base().trim_end_matches('/'))
    }

    /// URL an `open_*_channel` RPC tells us to dial.
    pub fn channel_url(&self, channel_id: &str) -> String {
        format!(
            "{}/ws/executor/terminal/{channel_id}?token={}",
            self.ws_base().trim_end_matches('/'),
            self.token.as_deref().unwrap_or_default()
        )
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
