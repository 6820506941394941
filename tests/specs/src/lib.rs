// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end binary smoke tests.
//!
//! Spawns the real `roost` hub (and optionally `roost-agent`) as
//! subprocesses, each against its own isolated tmux server socket, and
//! exercises them over HTTP and WebSocket.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

/// Gate: these tests need built binaries and a real tmux.
pub fn e2e_enabled() -> bool {
    if std::env::var("ROOST_E2E_TESTS").is_err() {
        eprintln!("skipping: set ROOST_E2E_TESTS=1 to run end-to-end specs");
        return false;
    }
    true
}

/// Resolve the path to a compiled workspace binary.
pub fn workspace_binary(name: &str) -> PathBuf {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    // tests/specs → tests → workspace root
    let workspace = manifest.parent().and_then(|p| p.parent()).unwrap_or(manifest);
    workspace.join("target").join("debug").join(name)
}

/// Find a free TCP port by binding to :0 then releasing.
pub fn free_port() -> anyhow::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// Kill the tmux server behind an isolated socket, ignoring absence.
fn kill_tmux_server(socket: &Path) {
    let _ = Command::new("tmux")
        .args(["-S"])
        .arg(socket)
        .args(["kill-server"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}

/// A running hub process with isolated state.
pub struct HubProcess {
    child: Child,
    port: u16,
    tmux_socket: PathBuf,
    pub tmpdir: tempfile::TempDir,
}

/// Static executor token the harness hub accepts from agents.
pub const EXECUTOR_TOKEN: &str = "rk_spec_harness";

impl HubProcess {
    pub fn start() -> anyhow::Result<Self> {
        let tmpdir = tempfile::tempdir()?;
        let port = free_port()?;
        let tmux_socket = tmpdir.path().join("hub-tmux.sock");
        let data_dir = tmpdir.path().join("data");

        let child = Command::new(workspace_binary("roost"))
            .arg("--host")
            .arg("127.0.0.1")
            .arg("--port")
            .arg(port.to_string())
            .arg("--data-dir")
            .arg(&data_dir)
            .arg("--auth-disabled")
            .arg("--executor-token")
            .arg(EXECUTOR_TOKEN)
            .arg("--tmux-socket")
            .arg(&tmux_socket)
            .arg("--linger-ms")
            .arg("300")
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()?;

        Ok(Self { child, port, tmux_socket, tmpdir })
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://127.0.0.1:{}{path}", self.port)
    }

    /// Poll `/api/health` until the hub answers.
    pub async fn wait_healthy(&self, timeout: Duration) -> anyhow::Result<()> {
        let url = format!("{}/api/health", self.base_url());
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Ok(resp) = reqwest::get(&url).await {
                if resp.status().is_success() {
                    return Ok(());
                }
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("hub never became healthy");
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

impl Drop for HubProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        kill_tmux_server(&self.tmux_socket);
    }
}

/// A running agent process pointed at a hub, with its own tmux server to
/// simulate a separate host.
pub struct AgentProcess {
    child: Child,
    tmux_socket: PathBuf,
    _tmpdir: tempfile::TempDir,
}

impl AgentProcess {
    pub fn start(hub: &HubProcess, id: &str) -> anyhow::Result<Self> {
        let tmpdir = tempfile::tempdir()?;
        let tmux_socket = tmpdir.path().join("agent-tmux.sock");
        let data_dir = tmpdir.path().join("data");

        let child = Command::new(workspace_binary("roost-agent"))
            .arg("--url")
            .arg(hub.base_url())
            .arg("--token")
            .arg(EXECUTOR_TOKEN)
            .arg("--id")
            .arg(id)
            .arg("--tmux-socket")
            .arg(&tmux_socket)
            .arg("--data-dir")
            .arg(&data_dir)
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()?;

        Ok(Self { child, tmux_socket, _tmpdir: tmpdir })
    }

    /// Poll the hub's executor list until this agent shows online.
    pub async fn wait_online(&self, hub: &HubProcess, id: &str, timeout: Duration) -> anyhow::Result<()> {
        let url = format!("{}/api/executors", hub.base_url());
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Ok(resp) = reqwest::get(&url).await {
                if let Ok(list) = resp.json::<Vec<serde_json::Value>>().await {
                    if list.iter().any(|e| e["id"] == id && e["status"] == "online") {
                        return Ok(());
                    }
                }
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("agent '{id}' never came online");
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

impl Drop for AgentProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        kill_tmux_server(&self.tmux_socket);
    }
}

/// Write a fake AI CLI script into `dir`: emits an init event, then for
/// every prompt line answers with an assistant event and a turn_complete.
pub fn write_fake_ai(dir: &Path) -> anyhow::Result<PathBuf> {
    let path = dir.join("fake-ai.sh");
    let script = r#"#!/bin/sh
echo '{"type":"system","subtype":"init","model":"fake"}'
while read -r line; do
  echo '{"type":"stream_event","delta":"4"}'
  echo '{"type":"assistant","message":"the answer is 4"}'
  echo '{"type":"result","total_cost":0}'
  echo '{"type":"turn_complete"}'
done
"#;
    std::fs::write(&path, script)?;
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(&path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms)?;
    Ok(path)
}
