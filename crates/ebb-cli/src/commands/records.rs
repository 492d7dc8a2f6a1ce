use std::path::Path;

use serde_json::Value;

use crate::commands::common::{format_record_line, format_record_lines, open_engine, read_payload};
use crate::error::CliError;
use ebb_core::EngineConfig;

pub fn run_put(
    table: &str,
    payload: Option<&str>,
    config: EngineConfig,
    db_path: &Path,
) -> Result<(), CliError> {
    let fields = read_payload(payload)?;
    let engine = open_engine(db_path, config, false)?;
    let clock = engine.writer().put(table, &Value::Object(fields))?;
    println!("{clock}");
    Ok(())
}

pub fn run_get(
    table: &str,
    key: &str,
    as_json: bool,
    config: EngineConfig,
    db_path: &Path,
) -> Result<(), CliError> {
    let engine = open_engine(db_path, config, false)?;
    let record = engine
        .writer()
        .get(table, key)?
        .ok_or_else(|| CliError::RecordNotFound {
            table: table.to_string(),
            key: key.to_string(),
        })?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        println!("{}", format_record_line(&record));
    }
    Ok(())
}

pub fn run_delete(
    table: &str,
    key: &str,
    config: EngineConfig,
    db_path: &Path,
) -> Result<(), CliError> {
    let engine = open_engine(db_path, config, false)?;
    if !engine.writer().delete(table, key)? {
        return Err(CliError::RecordNotFound {
            table: table.to_string(),
            key: key.to_string(),
        });
    }
    println!("{key}");
    Ok(())
}

pub fn run_list(
    table: &str,
    limit: usize,
    as_json: bool,
    config: EngineConfig,
    db_path: &Path,
) -> Result<(), CliError> {
    let engine = open_engine(db_path, config, false)?;
    let records = engine.writer().list(table, limit)?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else if records.is_empty() {
        println!("No records in `{table}`.");
    } else {
        for line in format_record_lines(&records) {
            println!("{line}");
        }
    }
    Ok(())
}
