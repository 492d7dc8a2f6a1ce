//! ebb CLI - local records and manual sync against an ebb relay

mod cli;
mod commands;
mod error;

#[cfg(test)]
mod tests;

use clap::Parser;

use crate::cli::{Cli, Commands};
use crate::commands::common::{load_config, resolve_db_path};
use crate::commands::records::{run_delete, run_get, run_list, run_put};
use crate::commands::sync::{run_background, run_rescan, run_status, run_sync};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ebb=warn".parse().expect("valid directive")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let db_path = resolve_db_path(cli.db_path);
    let config = load_config(cli.scope.as_deref())?;

    match cli.command {
        Commands::Put { table, payload } => run_put(&table, payload.as_deref(), config, &db_path)?,
        Commands::Get { table, key, json } => run_get(&table, &key, json, config, &db_path)?,
        Commands::Delete { table, key } => run_delete(&table, &key, config, &db_path)?,
        Commands::List { table, limit, json } => {
            run_list(&table, limit, json, config, &db_path)?;
        }
        Commands::Sync => run_sync(config, &db_path).await?,
        Commands::Status { json } => run_status(json, config, &db_path)?,
        Commands::Rescan => run_rescan(config, &db_path).await?,
        Commands::Run => run_background(config, &db_path).await?,
    }
    Ok(())
}
