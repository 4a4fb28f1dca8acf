//! Long-running serve mode
//!
//! Owns the background tasks around the engine: catalog reload, periodic
//! metrics summaries and, when enabled, the shared breaker mirror.
//!
//! The `breakers` and `metrics` commands read what this mode leaves on disk:
//! the file-backed breaker store and the exported metrics text.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use gateway_core::{load_catalog, BreakerMirror, CatalogError, FileStateStore, GatewayConfig, ProviderRouter};

use crate::build_router;

/// Run until Ctrl-C
pub async fn run(config: GatewayConfig) -> Result<()> {
    info!("Gateway daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("PID: {}", std::process::id());

    let router = build_router(&config)?;
    info!(
        models = router.registry().model_count(),
        max_retries = router.max_retries(),
        "Routing engine ready"
    );

    let shutdown = CancellationToken::new();
    let mut tasks = JoinSet::new();

    if let Some(path) = config.catalog_path.clone() {
        tasks.spawn(catalog_reload_loop(
            router.clone(),
            path,
            config.catalog_reload_interval,
            shutdown.clone(),
        ));
    }

    tasks.spawn(metrics_log_loop(
        router.clone(),
        config.metrics_log_interval,
        config.metrics_export_path.clone(),
        shutdown.clone(),
    ));

    if config.store_enabled {
        let store = Arc::new(FileStateStore::new(config.store_path.clone()));
        let mirror = BreakerMirror::new(router.breakers().clone(), store, config.store_sync_interval);
        info!(
            instance = %mirror.instance_id(),
            path = %config.store_path.display(),
            "Breaker state mirroring enabled"
        );
        let handle = mirror.spawn(shutdown.clone());
        tasks.spawn(async move {
            if let Err(e) = handle.await {
                warn!(error = %e, "Breaker mirror task ended abnormally");
            }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Received SIGINT, initiating shutdown");

    shutdown.cancel();
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "Background task failed during shutdown");
        }
    }

    info!("Gateway daemon stopped cleanly");
    Ok(())
}

/// Re-read the catalog periodically; a bad file keeps the previous catalog
async fn catalog_reload_loop(
    router: Arc<ProviderRouter>,
    path: PathBuf,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every.max(Duration::from_secs(1)));
    // First tick completes immediately; the catalog was loaded at startup
    ticker.tick().await;

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => match reload_catalog(&router, &path) {
                Ok((models, emptied)) => info!(models, emptied, "Catalog reloaded"),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Catalog reload failed, keeping previous catalog");
                }
            },
        }
    }
}

/// Load `path` and make it the whole catalog
///
/// Returns the number of models read and the number of previously known
/// models left without providers because the file no longer lists them.
pub(crate) fn reload_catalog(router: &ProviderRouter, path: &Path) -> Result<(usize, usize), CatalogError> {
    let models = load_catalog(path)?;
    let count = models.len();
    let emptied = router.replace_catalog(models);
    Ok((count, emptied))
}

/// Write the Prometheus text export, replacing the previous file whole
pub(crate) async fn export_metrics(router: &ProviderRouter, path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("prom.tmp");
    tokio::fs::write(&tmp, router.metrics_text()).await?;
    tokio::fs::rename(&tmp, path).await
}

/// Log a metrics summary and refresh the export periodically
async fn metrics_log_loop(
    router: Arc<ProviderRouter>,
    every: Duration,
    export_path: PathBuf,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every.max(Duration::from_secs(1)));
    ticker.tick().await;
    write_export(&router, &export_path).await;

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                write_export(&router, &export_path).await;
                let summary = router.metrics().summary();
                info!(
                    plans = summary.plans,
                    failover_runs = summary.failover_runs,
                    failover_successes = summary.failover_successes,
                    fallbacks = summary.fallbacks,
                    last_resort_calls = summary.last_resort_calls,
                    open_breakers = summary.open_breakers,
                    "Routing metrics"
                );
            }
        }
    }

    // Final numbers for anyone reading after shutdown
    write_export(&router, &export_path).await;
}

async fn write_export(router: &ProviderRouter, path: &Path) {
    if let Err(e) = export_metrics(router, path).await {
        warn!(path = %path.display(), error = %e, "Failed to export metrics");
    }
}
