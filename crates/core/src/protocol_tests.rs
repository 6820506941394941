// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::record::SessionMode;

#[test]
fn hello_roundtrip() -> anyhow::Result<()> {
    let msg = ControlMessage::Hello {
        id: "test-exec".into(),
        name: "build-box".into(),
        labels: vec!["gpu".into(), "linux".into()],
        version: "0.4.2".into(),
        token: "rk_abc".into(),
    };
    let json = serde_json::to_string(&msg)?;
    assert!(json.contains("\"type\":\"hello\""));

    let back: ControlMessage = serde_json::from_str(&json)?;
    match back {
        ControlMessage::Hello { id, labels, .. } => {
            assert_eq!(id, "test-exec");
            assert_eq!(labels.len(), 2);
        }
        other => anyhow::bail!("unexpected variant: {other:?}"),
    }
    Ok(())
}

#[test]
fn rpc_payload_tagged_by_op() -> anyhow::Result<()> {
    let msg = ControlMessage::Rpc {
        id: "7".into(),
        payload: RpcPayload::OpenTerminalChannel {
            channel_id: "ch-1".into(),
            session_name: "brave-otter".into(),
        },
    };
    let json = serde_json::to_value(&msg)?;
    assert_eq!(json["type"], "rpc");
    assert_eq!(json["payload"]["op"], "open_terminal_channel");
    assert_eq!(json["payload"]["channel_id"], "ch-1");
    Ok(())
}

#[test]
fn rpc_outcome_err_shape() -> anyhow::Result<()> {
    let outcome = RpcOutcome::err("NOT_FOUND", "no such session");
    let json = serde_json::to_value(&outcome)?;
    assert_eq!(json["status"], "err");
    assert_eq!(json["code"], "NOT_FOUND");
    Ok(())
}

#[test]
fn hello_tolerates_missing_labels() -> anyhow::Result<()> {
    let json = r#"{"type":"hello","id":"a","name":"a","version":"1","token":"t"}"#;
    let msg: ControlMessage = serde_json::from_str(json)?;
    match msg {
        ControlMessage::Hello { labels, .. } => assert!(labels.is_empty()),
        other => anyhow::bail!("unexpected variant: {other:?}"),
    }
    Ok(())
}

#[test]
fn resize_frame_parses_exact_shape_only() {
    assert_eq!(parse_resize_frame(r#"{"resize":[120,40]}"#), Some((120, 40)));
    assert_eq!(parse_resize_frame("ls -la\r"), None);
    assert_eq!(parse_resize_frame(r#"{"resize":"big"}"#), None);
    assert_eq!(parse_resize_frame(r#"{"type":"prompt"}"#), None);
}

#[test]
fn prompt_line_is_single_newline_terminated_json() -> anyhow::Result<()> {
    let line = encode_prompt_line("What is 2+2?");
    assert!(line.ends_with('\n'));
    assert_eq!(line.matches('\n').count(), 1);

    let value: serde_json::Value = serde_json::from_str(line.trim_end())?;
    assert_eq!(value["role"], "user");
    assert_eq!(value["content"][0]["text"], "What is 2+2?");
    Ok(())
}

#[test]
fn emulator_name_prefixes_rich() {
    assert_eq!(SessionMode::Terminal.emulator_name("calm-heron"), "calm-heron");
    assert_eq!(SessionMode::Rich.emulator_name("calm-heron"), "rich-calm-heron");
}
