// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Adapter over an external `tmux` server providing named, detachable
//! emulator sessions.
//!
//! Sessions are created detached and clients attach through a PTY running
//! `tmux attach-session` (see [`crate::pty`]), which preserves OSC-52
//! passthrough and scrollback. All invocations honor an optional private
//! server socket (`-S <path>`) so tests and embedded deployments stay off
//! the user's default tmux server.

use std::path::{Path, PathBuf};

use anyhow::Context;

/// Handle to a tmux server, addressed by optional socket path.
#[derive(Debug, Clone, Default)]
pub struct TmuxControl {
    socket: Option<PathBuf>,
}

impl TmuxControl {
    pub fn new() -> Self {
        Self { socket: None }
    }

    /// Target a specific tmux server socket instead of the user's default.
    pub fn with_socket(socket: Option<PathBuf>) -> Self {
        Self { socket }
    }

    /// Verify the tmux binary is present and usable. Returns the version
    /// string (e.g. `"tmux 3.4"`).
    pub fn preflight(&self) -> anyhow::Result<String> {
        let output = std::process::Command::new("tmux").arg("-V").output().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                anyhow::anyhow!(
                    "tmux is not installed or not in PATH; \
                     sessions require a tmux server (>= 3.2)"
                )
            } else {
                anyhow::Error::new(e).context("failed to run tmux -V")
            }
        })?;
        anyhow::ensure!(output.status.success(), "tmux -V exited with {}", output.status);
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
    }

    /// Spawn a detached emulator session running `command` through `sh -c`.
    pub async fn spawn(
        &self,
        name: &str,
        command: &str,
        cwd: Option<&Path>,
        env: &[(String, String)],
    ) -> anyhow::Result<()> {
        let mut cmd = self.cmd();
        cmd.args(["new-session", "-d", "-s", name]);
        if let Some(dir) = cwd {
            cmd.arg("-c").arg(dir);
        }
        for (key, value) in env {
            cmd.arg("-e").arg(format!("{key}={value}"));
        }
        if !command.is_empty() {
            cmd.arg(command);
        }
        let output = cmd.output().await.context("failed to run tmux new-session")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("tmux new-session failed for '{name}': {}", stderr.trim());
        }
        Ok(())
    }

    /// Whether an emulator session with this name exists.
    pub async fn exists(&self, name: &str) -> bool {
        let mut cmd = self.cmd();
        cmd.args(["has-session", "-t", &exact_target(name)])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());
        matches!(cmd.status().await, Ok(s) if s.success())
    }

    /// Capture the visible screen plus scrollback as a single string.
    pub async fn capture(&self, name: &str) -> anyhow::Result<String> {
        let output = self
            .cmd()
            .args(["capture-pane", "-p", "-e", "-S", "-", "-t", &exact_target(name)])
            .output()
            .await
            .context("failed to run tmux capture-pane")?;
        anyhow::ensure!(
            output.status.success(),
            "tmux capture-pane failed for '{name}'"
        );
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Kill the named emulator session. Succeeds when already gone.
    pub async fn kill(&self, name: &str) -> anyhow::Result<()> {
        let mut cmd = self.cmd();
        cmd.args(["kill-session", "-t", &exact_target(name)])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());
        // kill-session on a missing session is not an error for callers:
        // delete must be idempotent.
        let _ = cmd.status().await;
        Ok(())
    }

    /// Send Ctrl-C into the session (cancels an AI turn in rich sessions).
    pub async fn send_ctrl_c(&self, name: &str) -> anyhow::Result<()> {
        let status = self
            .cmd()
            .args(["send-keys", "-t", &exact_target(name), "C-c"])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await
            .context("failed to run tmux send-keys")?;
        anyhow::ensure!(status.success(), "tmux send-keys failed for '{name}'");
        Ok(())
    }

    /// Names of all sessions on this server. A missing or empty server
    /// reads as no sessions.
    pub async fn list_sessions(&self) -> Vec<String> {
        let output = self
            .cmd()
            .args(["list-sessions", "-F", "#{session_name}"])
            .output()
            .await;
        match output {
            Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout)
                .lines()
                .map(str::to_owned)
                .filter(|l| !l.is_empty())
                .collect(),
            _ => vec![],
        }
    }

    /// Argv that attaches a PTY to the named session.
    pub fn attach_argv(&self, name: &str) -> Vec<String> {
        let mut argv = vec!["tmux".to_owned()];
        if let Some(ref s) = self.socket {
            argv.push("-S".to_owned());
            argv.push(s.to_string_lossy().into_owned());
        }
        argv.push("attach-session".to_owned());
        argv.push("-t".to_owned());
        argv.push(exact_target(name));
        argv
    }

    fn cmd(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new("tmux");
        if let Some(ref s) = self.socket {
            cmd.arg("-S").arg(s);
        }
        cmd
    }
}

/// tmux prefix-matches bare `-t` targets; `=name` requires an exact match
/// so `has-session -t foo` does not hit `foo-bar`.
fn exact_target(name: &str) -> String {
    format!("={name}")
}

#[cfg(test)]
#[path = "tmux_tests.rs"]
mod tests;
