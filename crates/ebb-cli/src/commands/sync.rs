use std::path::Path;
use std::sync::Arc;

use ebb_core::catch_up::CatchUpReport;
use ebb_core::outbox::FlushReport;
use ebb_core::{EngineConfig, SyncStatus};
use tokio::sync::watch;

use crate::commands::common::open_engine;
use crate::error::CliError;

pub async fn run_sync(config: EngineConfig, db_path: &Path) -> Result<(), CliError> {
    let engine = open_engine(db_path, config, true)?;
    let report = engine.sync_once().await?;
    println!("{}", describe_flush(&report.flush));
    println!("{}", describe_catch_up(&report.catch_up));
    Ok(())
}

pub async fn run_rescan(config: EngineConfig, db_path: &Path) -> Result<(), CliError> {
    let engine = open_engine(db_path, config, true)?;
    let report = engine.rescan().await?;
    println!("{}", describe_catch_up(&report));
    Ok(())
}

pub fn run_status(as_json: bool, config: EngineConfig, db_path: &Path) -> Result<(), CliError> {
    let engine = open_engine(db_path, config, false)?;
    let status = engine.status()?;
    if as_json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        for line in format_status_lines(&status) {
            println!("{line}");
        }
    }
    Ok(())
}

pub async fn run_background(config: EngineConfig, db_path: &Path) -> Result<(), CliError> {
    let engine = Arc::new(open_engine(db_path, config, true)?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = engine.clone().spawn(shutdown_rx);
    println!("Syncing scope `{}`; press Ctrl-C to stop", engine.scope());

    tokio::signal::ctrl_c().await?;
    shutdown_tx.send(true).ok();
    handle.join().await;

    // Final push so nothing written just before shutdown waits for the next run.
    match engine.flush().await {
        Ok(report) => println!("{}", describe_flush(&report)),
        Err(error) => tracing::warn!(%error, "Final flush failed"),
    }
    Ok(())
}

pub fn describe_flush(report: &FlushReport) -> String {
    if report.paused {
        return format!("Push paused by open circuit; {} queued", report.remaining);
    }
    format!(
        "Pushed {} ({} acknowledged, {} rejected, {} coalesced); {} queued",
        report.sent, report.acknowledged, report.rejected, report.coalesced, report.remaining
    )
}

pub fn describe_catch_up(report: &CatchUpReport) -> String {
    if report.paused {
        return format!("Pull paused by open circuit at cursor {}", report.cursor);
    }
    format!(
        "Pulled {} page(s): {} applied, {} deleted, {} stale; cursor {}",
        report.pages,
        report.changes.applied,
        report.changes.deleted,
        report.changes.stale,
        report.cursor
    )
}

pub fn format_status_lines(status: &SyncStatus) -> Vec<String> {
    let mut lines = vec![
        format!("scope:    {}", status.scope),
        format!("state:    {:?}", status.state),
        format!("pending:  {}", status.pending_ops),
        format!("cursor:   {}", status.cursor),
        format!("circuit:  {:?}", status.breaker),
    ];
    if let Some(error) = &status.last_error {
        lines.push(format!("error:    {error}"));
    }
    lines
}
