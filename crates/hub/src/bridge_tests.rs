// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bridge tests against an isolated tmux server.
//!
//! Each test spins up its own tmux via `-S <tmpdir>/tmux.sock` so runs
//! never collide with each other or the user's default server. Gated on
//! `ROOST_TMUX_TESTS=1` because they need a real tmux binary.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use bytes::Bytes;

use super::*;

/// RAII guard for an isolated tmux server + one session.
struct TmuxServer {
    socket: PathBuf,
    _tmpdir: tempfile::TempDir,
}

impl TmuxServer {
    fn with_session(name: &str) -> anyhow::Result<Self> {
        let tmpdir = tempfile::tempdir()?;
        let socket = tmpdir.path().join("tmux.sock");

        let status = Command::new("tmux")
            .args(["-S"])
            .arg(&socket)
            .args(["new-session", "-d", "-s", name, "-x", "80", "-y", "24"])
            .status()?;
        anyhow::ensure!(status.success(), "failed to create tmux session");

        Ok(Self { socket, _tmpdir: tmpdir })
    }

    fn control(&self) -> TmuxControl {
        TmuxControl::with_socket(Some(self.socket.clone()))
    }
}

impl Drop for TmuxServer {
    fn drop(&mut self) {
        let _ = Command::new("tmux")
            .args(["-S"])
            .arg(&self.socket)
            .args(["kill-server"])
            .status();
    }
}

fn gated() -> bool {
    if std::env::var("ROOST_TMUX_TESTS").is_err() {
        eprintln!("skipping: set ROOST_TMUX_TESTS=1 to run tmux-backed bridge tests");
        return true;
    }
    false
}

async fn read_until(
    client: &mut BridgeClient,
    needle: &str,
    timeout: Duration,
) -> anyhow::Result<String> {
    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .ok_or_else(|| anyhow::anyhow!("timed out waiting for {needle:?}"))?;
        match tokio::time::timeout(remaining, client.recv()).await {
            Ok(BridgeRead::Data(data)) => {
                seen.extend_from_slice(&data);
                let text = String::from_utf8_lossy(&seen);
                if text.contains(needle) {
                    return Ok(text.into_owned());
                }
            }
            Ok(BridgeRead::Lagged) => anyhow::bail!("client lagged"),
            Ok(BridgeRead::Closed) => anyhow::bail!("bridge closed before {needle:?}"),
            Err(_) => anyhow::bail!("timed out waiting for {needle:?}"),
        }
    }
}

#[tokio::test]
async fn attach_missing_session_fails() -> anyhow::Result<()> {
    if gated() {
        return Ok(());
    }
    let server = TmuxServer::with_session("present")?;
    let bridges = Arc::new(Bridges::new(server.control(), Duration::from_millis(200)));

    match bridges.attach("absent", 80, 24).await {
        Err(e) => assert_eq!(e.code, ErrorCode::NotFound),
        Ok(_) => anyhow::bail!("attach to missing session succeeded"),
    }
    Ok(())
}

#[tokio::test]
async fn two_clients_observe_the_same_bytes() -> anyhow::Result<()> {
    if gated() {
        return Ok(());
    }
    let server = TmuxServer::with_session("shared")?;
    let bridges = Arc::new(Bridges::new(server.control(), Duration::from_millis(200)));

    let a = bridges.attach("shared", 80, 24).await?;
    let mut b = bridges.attach("shared", 80, 24).await?;

    a.send_input(Bytes::from_static(b"echo multi-test\r")).await?;
    let text = read_until(&mut b, "multi-test", Duration::from_secs(10)).await?;
    assert!(text.contains("multi-test"));

    // A detaching does not kill the session for B.
    a.detach();
    b.send_input(Bytes::from_static(b"echo still-alive\r")).await?;
    read_until(&mut b, "still-alive", Duration::from_secs(10)).await?;
    b.detach();
    Ok(())
}

#[tokio::test]
async fn backing_session_survives_last_detach() -> anyhow::Result<()> {
    if gated() {
        return Ok(());
    }
    let server = TmuxServer::with_session("durable")?;
    let tmux = server.control();
    let bridges = Arc::new(Bridges::new(tmux.clone(), Duration::from_millis(100)));

    let client = bridges.attach("durable", 80, 24).await?;
    client.detach();

    // Give the linger plus teardown time to run.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(tmux.exists("durable").await, "backing session was killed by detach");
    Ok(())
}
