//! Orchestrator wiring and lifecycle.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use depot_api::{ApiState, build_router, handlers::CONFIG_KEY};
use depot_core::{GatewayBackendConfig, OrchestratorConfig};
use depot_gateway::{build_gateway, build_importer};
use depot_state::{KeyValueStore, Tables};
use depot_updater::UpdateManager;
use depot_versions::{PostgresAdmin, VersionManager};
use tokio::sync::watch;
use tracing::{info, warn};

/// Merge the override stored in the meta table over `file_config`.
async fn merge_stored(file_config: &OrchestratorConfig, meta: &dyn KeyValueStore) -> anyhow::Result<OrchestratorConfig> {
    let remote = meta.get(CONFIG_KEY).await;
    let config = file_config.merge_remote(&remote)?;
    if remote.as_object().is_some_and(|o| !o.is_empty()) {
        info!("applied stored config override");
    }
    Ok(config)
}

/// The config `run` would use: the file config with the stored override.
pub async fn effective_config(file_config: OrchestratorConfig) -> anyhow::Result<OrchestratorConfig> {
    let tables = Tables::open(&file_config).await?;
    merge_stored(&file_config, tables.meta.as_ref()).await
}

pub async fn run(file_config: OrchestratorConfig) -> anyhow::Result<()> {
    info!("depot orchestrator starting");

    // ── Initialize subsystems ──────────────────────────────────

    let tables = Tables::open(&file_config).await?;
    let config = Arc::new(merge_stored(&file_config, tables.meta.as_ref()).await?);

    let gateway = build_gateway(&config.gateway).await?;
    let importer = build_importer(config.importer.as_ref()).await?;
    if importer.is_none() {
        warn!("no importer configured, imports must be run manually");
    }
    let admin = Arc::new(PostgresAdmin::new(Duration::from_millis(
        config.connection_timeout,
    )));

    let versions = Arc::new(VersionManager::new(
        config.clone(),
        &tables,
        gateway,
        admin,
    ));
    versions.start().await;

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);

    // ── Start background tasks ─────────────────────────────────

    let updates = Arc::new(UpdateManager::new(versions.clone(), importer));
    let updates_handle = tokio::spawn(updates.run(shutdown_rx.clone()));

    // ── Start API server ───────────────────────────────────────

    let router = build_router(ApiState {
        versions: versions.clone(),
        meta: tables.meta.clone(),
        shutdown: shutdown_tx.clone(),
    });
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!(%addr, "control api starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let mut killed = shutdown_rx;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("shutdown signal received"),
                _ = killed.changed() => info!("kill requested"),
            }
            let _ = shutdown_tx.send(true);
        })
        .await?;

    let _ = updates_handle.await;

    // Local workers are child processes of this daemon.
    if matches!(config.gateway, GatewayBackendConfig::Local(_)) {
        versions.stop().await;
    }

    info!("depot orchestrator stopped");
    Ok(())
}
