// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::io::Write;

use super::*;

fn write_events(path: &std::path::Path, lines: &[&str]) -> anyhow::Result<()> {
    let mut f = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    for line in lines {
        writeln!(f, "{line}")?;
    }
    Ok(())
}

#[test]
fn tail_reads_complete_lines_only() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let path = tmp.path().join("events.ndjson");
    write_events(&path, &[r#"{"type":"user"}"#])?;

    let mut tail = EventTail::new(path.clone());
    assert_eq!(tail.read_new_lines()?.len(), 1);

    // Append a partial line: it must be held until the newline arrives.
    let mut f = std::fs::OpenOptions::new().append(true).open(&path)?;
    write!(f, r#"{{"type":"assist"#)?;
    f.flush()?;
    assert!(tail.read_new_lines()?.is_empty());

    writeln!(f, r#"ant"}}"#)?;
    let lines = tail.read_new_lines()?;
    assert_eq!(lines, vec![r#"{"type":"assistant"}"#.to_owned()]);
    Ok(())
}

#[test]
fn tail_resets_on_truncation() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let path = tmp.path().join("events.ndjson");
    write_events(&path, &[r#"{"type":"user"}"#, r#"{"type":"result"}"#])?;

    let mut tail = EventTail::new(path.clone());
    assert_eq!(tail.read_new_lines()?.len(), 2);

    std::fs::write(&path, "{\"type\":\"system\"}\n")?;
    let lines = tail.read_new_lines()?;
    assert_eq!(lines, vec![r#"{"type":"system"}"#.to_owned()]);
    Ok(())
}

#[test]
fn tail_of_missing_file_is_empty() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let mut tail = EventTail::new(tmp.path().join("absent.ndjson"));
    assert!(tail.read_new_lines()?.is_empty());
    Ok(())
}

#[test]
fn filter_skips_stream_events_and_duplicate_init() {
    let mut filter = EventFilter::new();
    let init = serde_json::json!({"type":"system","subtype":"init"});
    let stream = serde_json::json!({"type":"stream_event","delta":"x"});
    let user = serde_json::json!({"type":"user"});
    let other_system = serde_json::json!({"type":"system","subtype":"notice"});

    assert!(filter.admit(&init));
    assert!(!filter.admit(&stream));
    assert!(filter.admit(&user));
    assert!(!filter.admit(&init));
    assert!(filter.admit(&other_system));
}

#[test]
fn fifo_write_without_reader_is_dropped() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let dir = RichDir::new(tmp.path(), "calm-heron");
    dir.ensure()?;

    let fifo = PromptFifo::new(dir.fifo_path());
    // No reader: the write must report a drop, not block or error.
    assert!(!fifo.write_line("{\"role\":\"user\"}\n")?);
    Ok(())
}

#[test]
fn fifo_write_reaches_reader() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let dir = RichDir::new(tmp.path(), "calm-heron");
    dir.ensure()?;
    let path = dir.fifo_path();

    // Hold the read side open non-blocking so the writer finds a reader.
    use std::io::Read;
    use std::os::unix::fs::OpenOptionsExt;
    let mut rd = std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(nix::libc::O_NONBLOCK)
        .open(&path)?;

    let fifo = PromptFifo::new(path);
    assert!(fifo.write_line("{\"role\":\"user\"}\n")?);

    let mut buf = [0u8; 64];
    let n = rd.read(&mut buf)?;
    assert!(n > 0);
    Ok(())
}

#[test]
fn diagnose_counts_events() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let dir = RichDir::new(tmp.path(), "s");
    dir.ensure()?;
    write_events(
        &dir.events_path(),
        &[r#"{"type":"system","subtype":"init"}"#, r#"{"type":"user"}"#, r#"{"type":"result"}"#],
    )?;

    let diag = diagnose(&dir);
    assert_eq!(diag.event_count, 3);
    assert_eq!(diag.last_event_type.as_deref(), Some("result"));
    assert!(diag.fifo_present);
    Ok(())
}
