use clap::Parser;
use ebb_core::catch_up::CatchUpReport;
use ebb_core::outbox::FlushReport;
use ebb_core::{EngineConfig, SyncState};
use serde_json::json;

use crate::cli::{Cli, Commands};
use crate::commands::common::{format_timestamp, open_engine, parse_payload, payload_preview};
use crate::commands::sync::{describe_catch_up, describe_flush, format_status_lines};
use crate::error::CliError;

#[test]
fn parse_payload_requires_a_json_object() {
    let fields = parse_payload(r#" { "key": "theme", "value": "dark" } "#).unwrap();
    assert_eq!(fields["value"], json!("dark"));

    assert!(matches!(parse_payload("  "), Err(CliError::EmptyPayload)));
    assert!(matches!(parse_payload("[1, 2]"), Err(CliError::PayloadNotObject)));
    assert!(matches!(parse_payload("{oops"), Err(CliError::Serialization(_))));
}

#[test]
fn payload_preview_truncates_long_values() {
    let short = json!({ "a": 1 });
    assert_eq!(payload_preview(&short), r#"{"a":1}"#);

    let long = json!({ "text": "x".repeat(200) });
    let preview = payload_preview(&long);
    assert_eq!(preview.chars().count(), 60);
    assert!(preview.ends_with("..."));
}

#[test]
fn timestamps_render_in_utc() {
    assert_eq!(format_timestamp(0), "1970-01-01 00:00:00");
}

#[test]
fn cli_parses_put_with_global_flags() {
    let cli = Cli::try_parse_from([
        "ebb",
        "--scope",
        "work",
        "put",
        "kv",
        r#"{"key":"a","value":1}"#,
    ])
    .unwrap();
    assert_eq!(cli.scope.as_deref(), Some("work"));
    assert!(matches!(
        cli.command,
        Commands::Put { ref table, payload: Some(_) } if table == "kv"
    ));
}

#[test]
fn sync_requires_relay_configuration() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ebb.db");
    let result = open_engine(&path, EngineConfig::for_scope("work"), true);
    assert!(matches!(result, Err(CliError::SyncNotConfigured)));
}

#[test]
fn local_writes_work_without_a_relay() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ebb.db");
    let engine = open_engine(&path, EngineConfig::for_scope("work"), false).unwrap();

    engine
        .writer()
        .put("kv", &json!({ "key": "a", "value": 1 }))
        .unwrap();
    let status = engine.status().unwrap();
    assert_eq!(status.pending_ops, 1);
    assert_eq!(status.state, SyncState::Idle);

    let lines = format_status_lines(&status);
    assert!(lines.iter().any(|line| line.contains("pending:  1")));
}

#[test]
fn reports_describe_paused_and_normal_runs() {
    let paused = FlushReport {
        paused: true,
        remaining: 4,
        ..FlushReport::default()
    };
    assert_eq!(describe_flush(&paused), "Push paused by open circuit; 4 queued");

    let pulled = CatchUpReport {
        pages: 2,
        cursor: 17,
        ..CatchUpReport::default()
    };
    assert!(describe_catch_up(&pulled).contains("cursor 17"));
}

#[test]
fn scope_flag_cannot_reuse_another_scopes_database() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ebb.db");
    {
        let engine = open_engine(&path, EngineConfig::for_scope("work"), false).unwrap();
        engine
            .writer()
            .put("kv", &json!({ "key": "a", "value": 1 }))
            .unwrap();
    }

    let result = open_engine(&path, EngineConfig::for_scope("personal"), false);
    assert!(matches!(
        result,
        Err(CliError::Core(ebb_core::Error::Config(message))) if message.contains("personal")
    ));

    let reopened = open_engine(&path, EngineConfig::for_scope("work"), false).unwrap();
    assert_eq!(reopened.status().unwrap().pending_ops, 1);
}
