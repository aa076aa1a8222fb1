//! UNAS Kernel - bridge supervisor
//!
//! Wires every component as an owned instance:
//! - MQTT listener → single cache writer → `StateCache`
//! - reconciliation coordinator over SSH (install, version drift, services)
//! - discovery of drive bays and pools into the entity registry
//! - fan control writes and the HTTP surface
//!
//! On Ctrl-C or SIGTERM the HTTP server drains, then cooling is handed back to the firmware.

mod cache;
mod catalog;
mod config;
mod control;
mod coordinator;
mod deploy;
mod discovery;
mod health;
mod http;
mod mqtt;
mod remote;

use anyhow::{Context, Result};
use cache::{spawn_cache_writer, StateCache};
use catalog::{system_entities, EntityRegistry};
use config::load_config;
use control::{spawn_seed_defaults, FanControlWriter, SEED_GRACE};
use coordinator::Coordinator;
use deploy::{restore_firmware_control, SshDeployer, VersionStore};
use discovery::{new_shared, spawn_startup_discovery, Discovery, RetryPolicy};
use health::BusHealth;
use http::AppState;
use remote::SshShell;
use rumqttc::AsyncClient;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use unas_core::{Bus, RemoteShell, Topics};

/// Ctrl-C, or SIGTERM from a service manager.
async fn shutdown_signal() -> Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("Ctrl-C handler failed")?;
            Ok("SIGINT")
        }
        _ = sigterm.recv() => Ok("SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = load_config().await?;
    let topics = Topics::new(&cfg.namespace);
    info!("UNAS kernel {} for {} (namespace {})", env!("CARGO_PKG_VERSION"), cfg.ssh.host, topics.namespace());

    // bus → cache
    let bus_health = BusHealth::new();
    let cache = StateCache::new();
    let (client, eventloop) = AsyncClient::new(mqtt::mqtt_options(&cfg), 64);
    let (events_tx, events_rx) = mpsc::channel(512);
    spawn_cache_writer(cache.clone(), events_rx);
    mqtt::spawn_mqtt_listener(eventloop, client.clone(), topics.clone(), events_tx, bus_health.clone());
    let bus: Arc<dyn Bus> = Arc::new(client.clone());

    // appliance side
    let shell: Arc<dyn RemoteShell> = Arc::new(SshShell::new(cfg.ssh.clone()));
    let deployer = Arc::new(SshDeployer::new(shell.clone(), cfg.clone()));
    let versions = VersionStore::new(&cfg.data_dir);

    // discovery
    let registry = new_shared(EntityRegistry::new());
    let seeded = registry.lock().extend(system_entities());
    info!("{} system entities registered", seeded);
    let discovery = new_shared(Discovery::new(registry.clone()));
    spawn_startup_discovery(discovery.clone(), cache.clone(), RetryPolicy::default());

    // controls
    spawn_seed_defaults(bus.clone(), cache.clone(), topics.clone(), SEED_GRACE);
    let control = FanControlWriter::new(bus.clone(), shell.clone(), cache.clone(), topics.clone());

    // reconciliation
    let (coordinator, state_rx) = Coordinator::new(
        shell.clone(),
        deployer,
        versions,
        env!("CARGO_PKG_VERSION"),
        cache.clone(),
        bus_health.clone(),
        discovery,
    );
    let (commands_tx, commands_rx) = mpsc::channel(8);
    let coordinator_task = tokio::spawn(coordinator.run(commands_rx, cfg.poll_interval()));

    // HTTP
    let app = http::router(AppState {
        control,
        state_rx,
        registry,
        commands: commands_tx,
        health: bus_health,
        api_key: cfg.http.api_key.clone(),
    });
    if cfg.http.api_key.is_none() {
        warn!("No API key configured, HTTP API is open");
    }
    let listener = TcpListener::bind(&cfg.http.bind)
        .await
        .with_context(|| format!("Failed to bind {}", cfg.http.bind))?;
    info!("Listening on http://{}", cfg.http.bind);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            match shutdown_signal().await {
                Ok(name) => info!("Shutting down ({name})"),
                Err(e) => error!("Signal handling failed, shutting down: {e:#}"),
            }
        })
        .await
        .context("HTTP server failed")?;

    // teardown
    coordinator_task.abort();
    restore_firmware_control(shell.as_ref(), &cfg.agent.hwmon_dir).await;
    if let Err(e) = client.disconnect().await {
        warn!("MQTT disconnect failed: {e}");
    }
    Ok(())
}
