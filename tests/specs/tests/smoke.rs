// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end smoke tests spawning the real `roost` and `roost-agent`
//! binaries. Gated on `ROOST_E2E_TESTS=1`: they need built binaries and
//! a tmux in PATH.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use roost_specs::{e2e_enabled, write_fake_ai, AgentProcess, HubProcess};

const TIMEOUT: Duration = Duration::from_secs(10);

type Ws = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn connect(url: &str) -> anyhow::Result<Ws> {
    let (ws, _) = tokio_tungstenite::connect_async(url).await?;
    Ok(ws)
}

/// Read frames until the accumulated terminal output contains `needle`.
async fn read_until(ws: &mut Ws, needle: &str, timeout: Duration) -> anyhow::Result<String> {
    let mut seen = String::new();
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .ok_or_else(|| anyhow::anyhow!("timed out waiting for {needle:?}; saw: {seen}"))?;
        let msg = tokio::time::timeout(remaining, ws.next())
            .await
            .map_err(|_| anyhow::anyhow!("timed out waiting for {needle:?}"))?;
        match msg {
            Some(Ok(Message::Binary(data))) => seen.push_str(&String::from_utf8_lossy(&data)),
            Some(Ok(Message::Text(text))) => seen.push_str(text.as_str()),
            Some(Ok(Message::Close(_))) | None => {
                anyhow::bail!("socket closed waiting for {needle:?}")
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
        }
        if seen.contains(needle) {
            return Ok(seen);
        }
    }
}

/// Read the next JSON text frame from a rich channel.
async fn next_json(ws: &mut Ws, timeout: Duration) -> anyhow::Result<serde_json::Value> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .ok_or_else(|| anyhow::anyhow!("timed out waiting for rich message"))?;
        let msg = tokio::time::timeout(remaining, ws.next())
            .await
            .map_err(|_| anyhow::anyhow!("timed out waiting for rich message"))?;
        match msg {
            Some(Ok(Message::Text(text))) => return Ok(serde_json::from_str(text.as_str())?),
            Some(Ok(Message::Close(_))) | None => anyhow::bail!("rich socket closed"),
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

async fn create_session(
    hub: &HubProcess,
    body: serde_json::Value,
) -> anyhow::Result<serde_json::Value> {
    let client = reqwest::Client::new();
    let resp =
        client.post(format!("{}/api/sessions", hub.base_url())).json(&body).send().await?;
    anyhow::ensure!(resp.status() == 201, "create returned {}", resp.status());
    Ok(resp.json().await?)
}

// -- scenario 1: create, echo, snapshot, delete -------------------------------

#[tokio::test]
async fn terminal_session_lifecycle() -> anyhow::Result<()> {
    if !e2e_enabled() {
        return Ok(());
    }
    let hub = HubProcess::start()?;
    hub.wait_healthy(TIMEOUT).await?;

    let created = create_session(&hub, serde_json::json!({"command": "bash"})).await?;
    let name = created["name"].as_str().unwrap_or_default().to_owned();
    assert!(!name.is_empty());
    assert_eq!(created["mode"], "terminal");
    assert_eq!(created["alive"], true);

    let mut ws = connect(&hub.ws_url(&format!("/ws/sessions/{name}"))).await?;
    ws.send(Message::Text("echo hello-e2e\r".into())).await?;
    read_until(&mut ws, "hello-e2e", TIMEOUT).await?;

    let snapshot: serde_json::Value =
        reqwest::get(format!("{}/api/sessions/{name}/snapshot", hub.base_url()))
            .await?
            .json()
            .await?;
    assert!(snapshot["text"].as_str().unwrap_or_default().contains("hello-e2e"));

    let client = reqwest::Client::new();
    let resp =
        client.delete(format!("{}/api/sessions/{name}", hub.base_url())).send().await?;
    assert_eq!(resp.status(), 204);

    let list: Vec<serde_json::Value> =
        reqwest::get(format!("{}/api/sessions", hub.base_url())).await?.json().await?;
    assert!(!list.iter().any(|s| s["name"] == name.as_str()));
    Ok(())
}

// -- scenario 2: two clients, shared bytes ------------------------------------

#[tokio::test]
async fn two_clients_share_a_session() -> anyhow::Result<()> {
    if !e2e_enabled() {
        return Ok(());
    }
    let hub = HubProcess::start()?;
    hub.wait_healthy(TIMEOUT).await?;

    let created = create_session(&hub, serde_json::json!({"command": "bash"})).await?;
    let name = created["name"].as_str().unwrap_or_default().to_owned();

    let mut a = connect(&hub.ws_url(&format!("/ws/sessions/{name}"))).await?;
    let mut b = connect(&hub.ws_url(&format!("/ws/sessions/{name}"))).await?;

    a.send(Message::Text("echo multi-test\r".into())).await?;
    read_until(&mut b, "multi-test", TIMEOUT).await?;

    a.close(None).await?;
    drop(a);

    b.send(Message::Text("echo still-alive\r".into())).await?;
    read_until(&mut b, "still-alive", TIMEOUT).await?;
    Ok(())
}

// -- scenario 3: fork ---------------------------------------------------------

#[tokio::test]
async fn fork_records_parent_and_survives_parent_delete() -> anyhow::Result<()> {
    if !e2e_enabled() {
        return Ok(());
    }
    let hub = HubProcess::start()?;
    hub.wait_healthy(TIMEOUT).await?;

    let parent = create_session(&hub, serde_json::json!({"command": "bash"})).await?;
    let parent_name = parent["name"].as_str().unwrap_or_default().to_owned();

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/api/sessions/fork", hub.base_url()))
        .json(&serde_json::json!({"source": parent_name}))
        .send()
        .await?;
    anyhow::ensure!(resp.status() == 201, "fork returned {}", resp.status());
    let child: serde_json::Value = resp.json().await?;
    let child_name = child["name"].as_str().unwrap_or_default().to_owned();
    assert_eq!(child["parent_name"], parent_name.as_str());

    let list: Vec<serde_json::Value> =
        reqwest::get(format!("{}/api/sessions", hub.base_url())).await?.json().await?;
    assert!(list.iter().any(|s| s["name"] == parent_name.as_str()));
    assert!(list.iter().any(|s| s["name"] == child_name.as_str()));

    let resp = client
        .delete(format!("{}/api/sessions/{parent_name}", hub.base_url()))
        .send()
        .await?;
    assert_eq!(resp.status(), 204);

    let list: Vec<serde_json::Value> =
        reqwest::get(format!("{}/api/sessions", hub.base_url())).await?.json().await?;
    assert!(list.iter().any(|s| s["name"] == child_name.as_str()));
    Ok(())
}

// -- scenarios 4 & 5: rich turn + reconnect replay ----------------------------

#[tokio::test]
async fn rich_turn_and_reconnect_replay() -> anyhow::Result<()> {
    if !e2e_enabled() {
        return Ok(());
    }
    let hub = HubProcess::start()?;
    hub.wait_healthy(TIMEOUT).await?;
    let fake_ai = write_fake_ai(hub.tmpdir.path())?;

    let created = create_session(
        &hub,
        serde_json::json!({"mode": "rich", "command": fake_ai.to_string_lossy()}),
    )
    .await?;
    let name = created["name"].as_str().unwrap_or_default().to_owned();

    let mut ws = connect(&hub.ws_url(&format!("/ws/rich/{name}"))).await?;

    let state = next_json(&mut ws, TIMEOUT).await?;
    assert_eq!(state["type"], "session_state");

    ws.send(Message::Text(
        serde_json::json!({"type": "prompt", "text": "What is 2+2?"}).to_string().into(),
    ))
    .await?;

    let mut saw_assistant = false;
    loop {
        let msg = next_json(&mut ws, Duration::from_secs(60)).await?;
        assert_eq!(msg["type"], "event");
        let event_type = msg["event"]["type"].as_str().unwrap_or_default();
        assert_ne!(event_type, "stream_event", "stream_event leaked to the browser");
        if event_type == "assistant" {
            saw_assistant = true;
        }
        if event_type == "turn_complete" {
            break;
        }
    }
    assert!(saw_assistant);
    ws.close(None).await?;
    drop(ws);

    // Reconnect: prior events replay in order, before anything new, with
    // no stream_events and at most one init.
    let mut ws = connect(&hub.ws_url(&format!("/ws/rich/{name}"))).await?;
    let state = next_json(&mut ws, TIMEOUT).await?;
    assert_eq!(state["type"], "session_state");

    let mut types = Vec::new();
    loop {
        let msg = next_json(&mut ws, TIMEOUT).await?;
        let event_type = msg["event"]["type"].as_str().unwrap_or_default().to_owned();
        assert_ne!(event_type, "stream_event", "stream_event leaked on replay");
        types.push(event_type.clone());
        if event_type == "turn_complete" {
            break;
        }
    }
    assert_eq!(types.iter().filter(|t| t.as_str() == "system").count(), 1);
    let assistant_pos = types
        .iter()
        .position(|t| t == "assistant")
        .ok_or_else(|| anyhow::anyhow!("no assistant in replay: {types:?}"))?;
    let result_pos = types
        .iter()
        .position(|t| t == "result")
        .ok_or_else(|| anyhow::anyhow!("no result in replay: {types:?}"))?;
    assert!(assistant_pos < result_pos, "replay out of order: {types:?}");
    Ok(())
}

// -- scenario 6: remote executor ----------------------------------------------

#[tokio::test]
async fn remote_executor_roundtrip() -> anyhow::Result<()> {
    if !e2e_enabled() {
        return Ok(());
    }
    let hub = HubProcess::start()?;
    hub.wait_healthy(TIMEOUT).await?;

    let agent = AgentProcess::start(&hub, "test-exec")?;
    agent.wait_online(&hub, "test-exec", TIMEOUT).await?;

    let created = create_session(
        &hub,
        serde_json::json!({"command": "bash", "executor": "test-exec"}),
    )
    .await?;
    let name = created["name"].as_str().unwrap_or_default().to_owned();

    let mut ws = connect(&hub.ws_url(&format!("/ws/sessions/{name}"))).await?;
    ws.send(Message::Text("echo remote-e2e\r".into())).await?;
    read_until(&mut ws, "remote-e2e", TIMEOUT).await?;

    let snapshot: serde_json::Value =
        reqwest::get(format!("{}/api/sessions/{name}/snapshot", hub.base_url()))
            .await?
            .json()
            .await?;
    assert!(snapshot["text"].as_str().unwrap_or_default().contains("remote-e2e"));
    Ok(())
}

// -- scenario 8: reorder ------------------------------------------------------

#[tokio::test]
async fn reorder_is_reflected_by_list() -> anyhow::Result<()> {
    if !e2e_enabled() {
        return Ok(());
    }
    let hub = HubProcess::start()?;
    hub.wait_healthy(TIMEOUT).await?;

    let mut names = Vec::new();
    for _ in 0..3 {
        let created = create_session(&hub, serde_json::json!({"command": "bash"})).await?;
        names.push(created["name"].as_str().unwrap_or_default().to_owned());
    }

    let reversed: Vec<&str> = names.iter().rev().map(String::as_str).collect();
    let client = reqwest::Client::new();
    let resp = client
        .put(format!("{}/api/sessions/reorder", hub.base_url()))
        .json(&serde_json::json!({"names": reversed}))
        .send()
        .await?;
    anyhow::ensure!(resp.status().is_success(), "reorder returned {}", resp.status());

    let list: Vec<serde_json::Value> =
        reqwest::get(format!("{}/api/sessions", hub.base_url())).await?.json().await?;
    let listed: Vec<&str> = list.iter().filter_map(|s| s["name"].as_str()).collect();
    assert_eq!(listed, reversed);
    Ok(())
}
