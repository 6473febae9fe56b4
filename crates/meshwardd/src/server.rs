//! Server wiring: store, registry, scheduler, flush loop and API.
//!
//! Startup order matters: the registry is reloaded from disk before the
//! scheduler's first tick, so previously known clients are probed right
//! away instead of waiting for their next heartbeat.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use meshward_api::{ApiState, build_router};
use meshward_core::{ConfigHandle, ServerConfig};
use meshward_metrics::ProbeMetrics;
use meshward_registry::ClientRegistry;
use meshward_scheduler::{PingScheduler, prober_for};
use meshward_state::AddressStore;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// How often the config file's mtime is checked.
const CONFIG_POLL: Duration = Duration::from_secs(5);

/// `host`, `port` and `data_dir` are read once at startup; a reload
/// changes them in `/config` but not in the running listener or store.
pub async fn run(config: ConfigHandle<ServerConfig>, config_path: Option<PathBuf>) -> anyhow::Result<()> {
    info!("meshward server starting");
    let settings = config.current();

    std::fs::create_dir_all(&settings.data_dir)?;
    let db_path = settings.data_dir.join("meshward.redb");

    // ── Registry ───────────────────────────────────────────────

    let store = AddressStore::open(&db_path)?;
    info!(path = ?db_path, "address store opened");

    let registry = Arc::new(ClientRegistry::new(store));
    let restored = registry.load()?;
    info!(clients = restored, "registry restored");

    // ── Scheduler ──────────────────────────────────────────────

    let prober = prober_for(settings.probe, settings.probe_port);
    let scheduler = Arc::new(PingScheduler::new(
        Arc::clone(&registry),
        config.clone(),
        prober,
        ProbeMetrics::new(),
    ));
    info!(
        interval = ?settings.ping_interval(),
        max_concurrent = settings.max_concurrent_probes,
        probe = ?settings.probe,
        "ping scheduler initialized"
    );

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Background tasks ───────────────────────────────────────

    let scheduler_handle = {
        let scheduler = Arc::clone(&scheduler);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { scheduler.run(shutdown).await })
    };

    let flush_handle = {
        let registry = Arc::clone(&registry);
        let config = config.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { flush_loop(registry, config, shutdown).await })
    };

    let watch_handle = config_path.map(|path| {
        let config = config.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { config.watch_file(path, CONFIG_POLL, shutdown).await })
    });

    // ── API server ─────────────────────────────────────────────

    let router = build_router(ApiState::new(
        Arc::clone(&registry),
        Arc::clone(&scheduler),
        config.clone(),
    ));
    let listener = tokio::net::TcpListener::bind((settings.host.as_str(), settings.port)).await?;
    info!(addr = %listener.local_addr()?, "API server starting");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for ctrl-c");
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    // Wait for background tasks; the flush loop writes once more on exit.
    let _ = scheduler_handle.await;
    let _ = flush_handle.await;
    if let Some(handle) = watch_handle {
        let _ = handle.await;
    }

    info!("meshward server stopped");
    Ok(())
}

/// Write deferred registry updates every `save_interval_secs`, and once
/// more at shutdown.
async fn flush_loop(
    registry: Arc<ClientRegistry>,
    config: ConfigHandle<ServerConfig>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let every = config.current().save_interval();
        tokio::select! {
            _ = tokio::time::sleep(every) => flush(&registry),
            _ = shutdown.changed() => break,
        }
    }
    flush(&registry);
    debug!("flush loop stopped");
}

fn flush(registry: &ClientRegistry) {
    if let Err(e) = registry.flush() {
        warn!(error = %e, pending = registry.pending_writes(), "registry flush failed, will retry");
    }
}
