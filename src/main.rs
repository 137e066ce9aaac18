use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use greenhouse_controller::{config, controller, hardware, repo, resilience, telemetry};
use config::Config;
use hardware::push_cache::{spawn_line_bridge, spawn_listener};
use hardware::{DeviceFactory, PushCache};
use std::sync::Arc;
use telemetry::init_tracing;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = Config::load()?;
    let shutdown = CancellationToken::new();
    telemetry::cancel_on_shutdown(shutdown.clone());

    let registry = Arc::new(resilience::HealthRegistry::new(cfg.alerts.clone()));

    let push_cache = Arc::new(PushCache::new(
        cfg.devices.shelly_ht_topic_prefix.clone(),
        Duration::seconds(cfg.devices.push_stale_seconds),
    ));
    let (push_tx, push_rx) = mpsc::channel(64);
    let listener = spawn_listener(push_rx, push_cache.clone(), shutdown.clone());
    match &cfg.devices.push_bridge_addr {
        Some(addr) => {
            let addr = addr.parse().context("invalid devices.push_bridge_addr")?;
            spawn_line_bridge(addr, push_tx, shutdown.clone()).await?;
            info!(topics = ?push_cache.topics(), "push bridge enabled");
        }
        None => {
            drop(push_tx);
            warn!("push bridge not configured, indoor sensor uses the cloud API only");
        }
    }

    let devices = DeviceFactory::new(&cfg, push_cache).create()?;
    let store = repo::open(&cfg).await?;
    if let Err(e) = store
        .record_startup(Utc::now(), env!("CARGO_PKG_VERSION"))
        .await
    {
        warn!(error = %e, "could not record startup");
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        mode = ?cfg.controller.hardware_mode,
        "starting greenhouse controller"
    );

    let controller = controller::GreenhouseController::new(&cfg, devices, store.clone(), registry);
    controller.run(shutdown.clone()).await;

    shutdown.cancel();
    if let Err(e) = listener.await {
        warn!(error = %e, "push listener task failed");
    }
    store.close().await?;
    warn!("shutdown complete");
    Ok(())
}
