// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::io::Write;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use roost_core::richlog::{RichDir, RichSession};
use roost_core::tmux::TmuxControl;

fn session_in(tmp: &tempfile::TempDir, name: &str) -> anyhow::Result<RichSession> {
    let dir = RichDir::new(tmp.path(), name);
    dir.ensure()?;
    Ok(RichSession::new(dir, TmuxControl::new(), format!("rich-{name}")))
}

fn append(path: &std::path::Path, lines: &[&str]) -> anyhow::Result<()> {
    let mut f = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    for line in lines {
        writeln!(f, "{line}")?;
    }
    f.flush()?;
    Ok(())
}

async fn next_event(
    rx: &mut tokio::sync::mpsc::Receiver<serde_json::Value>,
) -> anyhow::Result<serde_json::Value> {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await?
        .ok_or_else(|| anyhow::anyhow!("event stream ended"))
}

#[tokio::test]
async fn replay_precedes_tail_and_filters_stream_events() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let session = session_in(&tmp, "s")?;
    append(
        &session.dir().events_path(),
        &[
            r#"{"type":"system","subtype":"init","model":"x"}"#,
            r#"{"type":"stream_event","delta":"h"}"#,
            r#"{"type":"user","text":"hi"}"#,
            r#"{"type":"assistant","text":"hello"}"#,
        ],
    )?;

    let shutdown = CancellationToken::new();
    let mut rx = session.spawn_event_stream(shutdown.clone());

    // Replay: file order, stream_event skipped.
    assert_eq!(next_event(&mut rx).await?["type"], "system");
    assert_eq!(next_event(&mut rx).await?["type"], "user");
    assert_eq!(next_event(&mut rx).await?["type"], "assistant");

    // Tail: appended lines arrive after the replay prefix; a second init
    // and further stream_events stay filtered.
    append(
        &session.dir().events_path(),
        &[
            r#"{"type":"stream_event","delta":"4"}"#,
            r#"{"type":"system","subtype":"init"}"#,
            r#"{"type":"result","total":"4"}"#,
            r#"{"type":"turn_complete"}"#,
        ],
    )?;
    assert_eq!(next_event(&mut rx).await?["type"], "result");
    assert_eq!(next_event(&mut rx).await?["type"], "turn_complete");

    shutdown.cancel();
    Ok(())
}

#[tokio::test]
async fn malformed_lines_are_skipped() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let session = session_in(&tmp, "s")?;
    append(
        &session.dir().events_path(),
        &["this is not json", r#"{"type":"user","text":"ok"}"#],
    )?;

    let shutdown = CancellationToken::new();
    let mut rx = session.spawn_event_stream(shutdown.clone());
    assert_eq!(next_event(&mut rx).await?["type"], "user");
    shutdown.cancel();
    Ok(())
}

#[tokio::test]
async fn stream_starts_before_log_exists() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let session = session_in(&tmp, "s")?;

    let shutdown = CancellationToken::new();
    let mut rx = session.spawn_event_stream(shutdown.clone());

    // Log file created after the channel opened.
    append(&session.dir().events_path(), &[r#"{"type":"user","text":"late"}"#])?;
    assert_eq!(next_event(&mut rx).await?["text"], "late");
    shutdown.cancel();
    Ok(())
}

#[tokio::test]
async fn prompt_roundtrip_through_fifo() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let session = session_in(&tmp, "s")?;

    // No reader yet: dropped, not blocked.
    assert!(!session.send_prompt("ignored")?);

    use std::io::Read;
    use std::os::unix::fs::OpenOptionsExt;
    let mut rd = std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(nix::libc::O_NONBLOCK)
        .open(session.dir().fifo_path())?;

    assert!(session.send_prompt("What is 2+2?")?);

    let mut buf = Vec::new();
    let mut chunk = [0u8; 256];
    let n = rd.read(&mut chunk)?;
    buf.extend_from_slice(&chunk[..n]);
    let line = String::from_utf8(buf)?;
    let value: serde_json::Value = serde_json::from_str(line.trim_end())?;
    assert_eq!(value["role"], "user");
    assert_eq!(value["content"][0]["text"], "What is 2+2?");
    Ok(())
}
