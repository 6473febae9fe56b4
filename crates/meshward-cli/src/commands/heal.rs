//! `meshward heal`, `remember`, `restart`, `enable`, `disable` and
//! `status`: the client side of the watchdog.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use meshward_core::{ClientConfig, ConfigHandle};
use meshward_heal::{
    HealController, RemediationReport, ServerReporter, StepOutcome, SystemOverlayControl,
};
use meshward_scheduler::PingProber;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::REQUEST_TIMEOUT;
use super::control::{self, HealStatus};

/// How often the config file's mtime is checked.
const CONFIG_POLL: Duration = Duration::from_secs(5);

fn controller(config: &ConfigHandle<ClientConfig>) -> (Arc<HealController>, Arc<ServerReporter>) {
    let current = config.current();
    let reporter = Arc::new(ServerReporter::new(config.clone(), REQUEST_TIMEOUT));
    let control = Arc::new(SystemOverlayControl::new(
        current.service_names.clone(),
        current.app_paths.clone(),
    ));
    let controller = Arc::new(HealController::new(
        config.clone(),
        Arc::new(PingProber),
        control,
        reporter.clone(),
    ));
    (controller, reporter)
}

/// Run the auto-heal loop, the heartbeat and the control endpoint until
/// Ctrl-C.
pub async fn run(
    config: ConfigHandle<ClientConfig>,
    config_path: PathBuf,
    heartbeat_secs: u64,
    auto_heal: bool,
) -> Result<()> {
    let control_port = config.current().control_port;
    let listener = control::bind(control_port).await.with_context(|| {
        format!("cannot take control port {control_port}; is another meshward heal or restart running?")
    })?;
    let (controller, reporter) = controller(&config);
    if !auto_heal {
        controller.set_enabled(false);
    }
    info!(
        target_address = %config.current().target_address,
        auto_heal = controller.is_enabled(),
        heartbeat_secs,
        "meshward client starting"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let heal_handle = {
        let controller = Arc::clone(&controller);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { controller.run(shutdown).await })
    };

    let heartbeat_handle = {
        let shutdown = shutdown_rx.clone();
        let every = Duration::from_secs(heartbeat_secs.max(1));
        tokio::spawn(async move { heartbeat_loop(reporter, every, shutdown).await })
    };

    let control_handle = {
        let controller = Arc::clone(&controller);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(control::serve(listener, controller, shutdown))
    };

    let watch_handle = config_path.is_file().then(|| {
        let config = config.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { config.watch_file(config_path, CONFIG_POLL, shutdown).await })
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for ctrl-c");
    }
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = heal_handle.await;
    let _ = heartbeat_handle.await;
    let _ = control_handle.await;
    if let Some(handle) = watch_handle {
        let _ = handle.await;
    }

    let snapshot = controller.snapshot();
    info!(
        remediations = snapshot.remediations,
        failed_remediations = snapshot.failed_remediations,
        "meshward client stopped"
    );
    Ok(())
}

/// Register once, then again every `every`, until shutdown. Failures are
/// logged and retried on the next beat.
async fn heartbeat_loop(
    reporter: Arc<ServerReporter>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if let Err(e) = reporter.remember_self().await {
            warn!(error = %e, "heartbeat failed");
        }
        tokio::select! {
            _ = tokio::time::sleep(every) => {}
            _ = shutdown.changed() => break,
        }
    }
}

/// `meshward remember`
pub async fn remember(config: ConfigHandle<ClientConfig>) -> Result<()> {
    let reporter = ServerReporter::new(config, REQUEST_TIMEOUT);
    let ack = reporter.remember_self().await?;
    println!(
        "registered {} as {} ({} clients known)",
        ack.identity, ack.address, ack.total_clients
    );
    Ok(())
}

/// `meshward restart`
///
/// Handed to the running heal loop when there is one, so it goes through
/// that loop's gate. Otherwise runs here while holding the control port.
pub async fn restart(config: ConfigHandle<ClientConfig>) -> Result<()> {
    let current = config.current();
    let report = match control::bind(current.control_port).await {
        Ok(listener) => restart_here(&config, listener).await?,
        Err(e) if e.kind() == ErrorKind::AddrInUse => {
            info!(port = current.control_port, "handing restart to the running heal loop");
            control::client(&current, control::remediation_budget(&current))?
                .post_json::<RemediationReport>("/heal/restart")
                .await?
        }
        Err(e) => {
            return Err(e).with_context(|| format!("cannot bind control port {}", current.control_port));
        }
    };
    print_report(&report);
    Ok(())
}

/// No heal loop on this host. The control endpoint is served for the
/// duration, so concurrent triggers are refused by the same gate.
async fn restart_here(
    config: &ConfigHandle<ClientConfig>,
    listener: TcpListener,
) -> Result<RemediationReport> {
    let (controller, _) = controller(config);
    controller.set_enabled(false);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(control::serve(listener, Arc::clone(&controller), shutdown_rx));

    let result = controller.run_now().await;
    let _ = shutdown_tx.send(true);
    let _ = server.await;
    Ok(result?)
}

fn print_report(report: &RemediationReport) {
    for step in &report.steps {
        match &step.outcome {
            StepOutcome::Ok => println!("  ok      {:?} ({} ms)", step.step, step.elapsed_ms),
            StepOutcome::Failed(reason) => {
                println!("  failed  {:?} ({} ms): {reason}", step.step, step.elapsed_ms)
            }
        }
    }
    if report.succeeded() {
        println!("remediation finished");
    } else {
        println!(
            "remediation finished with {} failed step(s)",
            report.failed_steps().count()
        );
    }
}

/// `meshward enable` / `meshward disable`
pub async fn set_auto_heal(config: &ClientConfig, enabled: bool) -> Result<()> {
    let path = if enabled { "/heal/enable" } else { "/heal/disable" };
    let status: HealStatus = control::client(config, REQUEST_TIMEOUT)?
        .post_json(path)
        .await
        .with_context(|| not_running(config))?;
    println!(
        "auto-heal {} ({:?})",
        if status.enabled { "enabled" } else { "disabled" },
        status.phase
    );
    Ok(())
}

/// `meshward status`
pub async fn status(config: &ClientConfig) -> Result<()> {
    let status: HealStatus = control::client(config, REQUEST_TIMEOUT)?
        .get_json("/heal/status")
        .await
        .with_context(|| not_running(config))?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

fn not_running(config: &ClientConfig) -> String {
    format!(
        "no meshward heal answering on control port {}",
        config.control_port
    )
}
