// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use roost_core::record::{SessionMode, SessionRecord};
use roost_core::richlog::RichDir;
use roost_core::tmux::TmuxControl;

use crate::bridge::Bridges;
use crate::registry::ExecutorRegistry;
use crate::store::SessionStore;

use super::*;

struct Fixture {
    manager: Arc<SessionManager>,
    store: Arc<SessionStore>,
    _tmp: tempfile::TempDir,
}

fn fixture() -> anyhow::Result<Fixture> {
    let tmp = tempfile::tempdir()?;
    let store = Arc::new(SessionStore::open_in_memory()?);
    let tmux = TmuxControl::with_socket(Some(tmp.path().join("tmux.sock")));
    let bridges = Arc::new(Bridges::new(tmux.clone(), Duration::from_millis(200)));
    let manager = SessionManager::new(
        Arc::clone(&store),
        tmux,
        bridges,
        tmp.path().to_path_buf(),
        "claude --output-format stream-json".into(),
    );
    Ok(Fixture { manager, store, _tmp: tmp })
}

fn with_registry(fx: &Fixture) -> Arc<ExecutorRegistry> {
    let registry = ExecutorRegistry::new(
        Arc::clone(&fx.store),
        Some("sekrit".into()),
        Duration::from_millis(100),
        Duration::from_millis(200),
    );
    fx.manager.set_registry(Arc::clone(&registry));
    registry
}

fn remote_record(name: &str, owner: &str, executor: &str) -> SessionRecord {
    SessionRecord {
        name: name.to_owned(),
        description: String::new(),
        mode: SessionMode::Terminal,
        command: "bash".to_owned(),
        executor_id: executor.to_owned(),
        owner_id: owner.to_owned(),
        parent_name: None,
        job_prompt: None,
        order_index: 0,
        created_at: roost_core::epoch_ms(),
        last_activity: roost_core::epoch_ms(),
    }
}

#[tokio::test]
async fn create_against_offline_executor_leaves_no_record() -> anyhow::Result<()> {
    let fx = fixture()?;
    with_registry(&fx);

    for _ in 0..2 {
        let err = fx
            .manager
            .create(
                CreateParams { executor_id: Some("ghost-exec".into()), ..Default::default() },
                "local",
            )
            .await
            .err()
            .ok_or_else(|| anyhow::anyhow!("create against offline executor succeeded"))?;
        assert_eq!(err.code, ErrorCode::ExecutorOffline);
    }
    assert!(fx.store.list_sessions("local")?.is_empty());
    Ok(())
}

#[tokio::test]
async fn create_remote_without_registry_short_circuits() -> anyhow::Result<()> {
    let fx = fixture()?;
    let err = fx
        .manager
        .create(CreateParams { executor_id: Some("remote".into()), ..Default::default() }, "local")
        .await
        .err()
        .ok_or_else(|| anyhow::anyhow!("expected failure"))?;
    assert_eq!(err.code, ErrorCode::ExecutorOffline);
    Ok(())
}

#[tokio::test]
async fn fork_of_unknown_session_is_not_found() -> anyhow::Result<()> {
    let fx = fixture()?;
    let err = fx
        .manager
        .fork("no-such-session", "local")
        .await
        .err()
        .ok_or_else(|| anyhow::anyhow!("expected failure"))?;
    assert_eq!(err.code, ErrorCode::NotFound);
    Ok(())
}

#[tokio::test]
async fn cross_owner_operations_read_as_not_found() -> anyhow::Result<()> {
    let fx = fixture()?;
    fx.store.create_session(&remote_record("calm-heron", "alice", "local"))?;

    let err = fx
        .manager
        .delete("calm-heron", "bob")
        .await
        .err()
        .ok_or_else(|| anyhow::anyhow!("expected failure"))?;
    assert_eq!(err.code, ErrorCode::NotFound);

    let err = fx
        .manager
        .snapshot("calm-heron", "bob")
        .await
        .err()
        .ok_or_else(|| anyhow::anyhow!("expected failure"))?;
    assert_eq!(err.code, ErrorCode::NotFound);
    Ok(())
}

#[tokio::test]
async fn delete_of_remote_session_with_dead_agent_still_removes_record() -> anyhow::Result<()> {
    let fx = fixture()?;
    with_registry(&fx);
    fx.store.create_session(&remote_record("calm-heron", "o", "gone-exec"))?;

    fx.manager.delete("calm-heron", "o").await?;
    assert!(fx.store.list_sessions("o")?.is_empty());
    Ok(())
}

#[tokio::test]
async fn delete_is_idempotent_for_dead_local_backing() -> anyhow::Result<()> {
    let fx = fixture()?;
    // Record exists but no emulator session was ever spawned.
    fx.store.create_session(&remote_record("calm-heron", "o", "local"))?;
    fx.manager.delete("calm-heron", "o").await?;

    let err = fx
        .manager
        .delete("calm-heron", "o")
        .await
        .err()
        .ok_or_else(|| anyhow::anyhow!("second delete should be NotFound"))?;
    assert_eq!(err.code, ErrorCode::NotFound);
    Ok(())
}

#[tokio::test]
async fn snapshot_of_dead_local_session_is_placeholder() -> anyhow::Result<()> {
    let fx = fixture()?;
    fx.store.create_session(&remote_record("calm-heron", "o", "local"))?;

    let text = fx.manager.snapshot("calm-heron", "o").await?;
    assert_eq!(text, NOT_RUNNING);
    Ok(())
}

#[tokio::test]
async fn job_requires_prompt() -> anyhow::Result<()> {
    let fx = fixture()?;
    let err = fx
        .manager
        .create_job(
            JobParams {
                prompt: String::new(),
                max_iterations: None,
                executor_id: None,
                skip_permissions: false,
            },
            "local",
        )
        .await
        .err()
        .ok_or_else(|| anyhow::anyhow!("expected failure"))?;
    assert_eq!(err.code, ErrorCode::BadRequest);
    Ok(())
}

#[tokio::test]
async fn list_marks_remote_sessions_dead_without_connection() -> anyhow::Result<()> {
    let fx = fixture()?;
    with_registry(&fx);
    fx.store.create_session(&remote_record("calm-heron", "o", "far-exec"))?;

    let views = fx.manager.list("o").await?;
    assert_eq!(views.len(), 1);
    assert!(!views[0].alive);
    Ok(())
}

#[test]
fn rich_wrap_redirects_fifo_and_log() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = RichDir::new(tmp.path(), "s");
    let wrapped = roost_core::richlog::wrap_command("claude --verbose", &dir);
    assert!(wrapped.starts_with("exec claude --verbose"));
    assert!(wrapped.contains("prompt.fifo"));
    assert!(wrapped.contains("events.ndjson"));
    assert!(wrapped.contains("0<>"));
}

#[test]
fn copy_event_prefix_cuts_at_last_complete_line() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let parent = RichDir::new(tmp.path(), "parent");
    let child = RichDir::new(tmp.path(), "child");
    parent.ensure()?;

    let mut f = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(parent.events_path())?;
    writeln!(f, r#"{{"type":"user"}}"#)?;
    writeln!(f, r#"{{"type":"assistant"}}"#)?;
    write!(f, r#"{{"type":"partial"#)?;
    f.flush()?;

    roost_core::richlog::copy_event_prefix(&parent, &child)?;
    let copied = std::fs::read_to_string(child.events_path())?;
    assert_eq!(copied, "{\"type\":\"user\"}\n{\"type\":\"assistant\"}\n");
    Ok(())
}

#[test]
fn adoption_creates_record_once() -> anyhow::Result<()> {
    let fx = fixture()?;
    let entry = roost_core::protocol::InventoryEntry {
        name: "stray-otter".into(),
        mode: SessionMode::Terminal,
        alive: true,
        last_activity: roost_core::epoch_ms(),
    };

    fx.manager.adopt_orphan("test-exec", &entry);
    fx.manager.adopt_orphan("test-exec", &entry);

    let records = fx.store.list_sessions_for_executor("test-exec")?;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].owner_id, "local");
    Ok(())
}
