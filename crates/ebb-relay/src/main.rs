use std::sync::Arc;

use ebb_core::registry::TableRegistry;
use ebb_relay::gc::spawn_gc_task;
use ebb_relay::{app_router, AppConfig, AppState, Authority};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Only load .env in development; production uses platform-native env injection.
    #[cfg(debug_assertions)]
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ebb_relay=info".parse().expect("valid directive")),
        )
        .init();

    let config = Arc::new(AppConfig::from_env()?);
    tracing::info!("Starting ebb-relay with config: {:?}", config);

    let registry = match config.registry_path.as_deref() {
        Some(path) => TableRegistry::from_path(path)?,
        None => TableRegistry::builtin(),
    };
    let authority = Arc::new(Authority::open(&config.db_path, Arc::new(registry))?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let gc = spawn_gc_task(authority.clone(), config.gc_interval, shutdown_rx);

    let state = AppState::new(config.clone(), authority);
    let bind_addr = config.bind_addr.clone();
    let router = app_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("ebb-relay listening on {}", bind_addr);
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutdown requested");
        })
        .await?;

    shutdown_tx.send(true).ok();
    gc.await?;
    Ok(())
}
