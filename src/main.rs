use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use slotbook::catalog::StaticCatalog;
use slotbook::config::Config;
use slotbook::dispatch::run_dispatcher;
use slotbook::engine::Engine;
use slotbook::gateway::{LogGateway, NotificationGateway};
use slotbook::notify::NotifyHub;
use slotbook::engine::now_local;
use slotbook::scheduler::{run_compactor, run_planner, spawn_sweeps, Scheduler};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::load()?;
    slotbook::observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let catalog = Arc::new(StaticCatalog::new(config.services.iter().cloned()));
    let notify = Arc::new(NotifyHub::new());
    let engine = Arc::new(Engine::new(
        config.wal_path(),
        catalog.clone(),
        notify.clone(),
        config.buffer_release,
    )?);
    let gateway: Arc<dyn NotificationGateway> = Arc::new(LogGateway);

    // Don't wait for the first planner tick to open next month.
    let planned = engine
        .schedule_next_month(&config.working_hours, now_local())
        .await?;

    info!("slotbook started");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  services: {}", catalog.len());
    info!("  staff: {}", config.staff.len());
    info!("  buffer_release: {:?}", config.buffer_release);
    info!("  next month: {} new slots", planned.len());
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let shutdown = CancellationToken::new();
    let mut tasks = vec![tokio::spawn(run_dispatcher(
        notify.subscribe(),
        gateway.clone(),
        config.staff.clone(),
        shutdown.clone(),
    ))];
    let scheduler = Arc::new(Scheduler::new(
        engine.clone(),
        gateway,
        config.staff.clone(),
        config.reminder_lead(),
    ));
    tasks.extend(spawn_sweeps(
        scheduler,
        config.reminder.trigger,
        config.completion.trigger,
        shutdown.clone(),
    ));
    tasks.push(tokio::spawn(run_planner(
        engine.clone(),
        config.working_hours,
        config.planning.trigger,
        shutdown.clone(),
    )));
    tasks.push(tokio::spawn(run_compactor(
        engine.clone(),
        config.compaction.threshold,
        config.compaction.trigger,
        shutdown.clone(),
    )));

    wait_for_signal().await;
    info!("shutdown signal received, stopping background tasks");
    shutdown.cancel();

    // Let in-flight sweeps finish (up to 10s)
    if tokio::time::timeout(Duration::from_secs(10), join_all(tasks))
        .await
        .is_err()
    {
        warn!("drain timeout, background tasks still running");
    }

    info!("slotbook stopped");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable: {e}");
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
