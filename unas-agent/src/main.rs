//! UNAS Agent - on-device telemetry and fan control
//!
//! Runs as two systemd services on the appliance, one per role:
//! - `monitor`: samples hardware telemetry and publishes it as retained sensor states,
//!   owns the liveness topic (last will "offline")
//! - `fan-control`: follows the retained fan mode and curve, drives `pwm1`, echoes the
//!   applied speed back on the sensor topics

mod config;
mod execution;
mod fan;
mod metrics;
mod monitor;
mod relay;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::AgentConfig;
use execution::SystemRunner;
use fan::{FanController, FanLoop, HwmonFan, TemperatureTracker};
use metrics::TelemetryReader;
use monitor::Monitor;
use relay::{mqtt_options, spawn_event_loop, Role};
use rumqttc::AsyncClient;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use unas_core::Topics;

#[derive(Parser, Debug)]
#[command(name = "unas-agent", version, about = "UNAS on-device agent")]
struct Cli {
    /// Config file (default: $UNAS_AGENT_CONFIG, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    role: RoleCommand,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum RoleCommand {
    /// Publish hardware telemetry
    Monitor,
    /// Drive the fan from the retained mode and curve
    FanControl,
}

impl From<RoleCommand> for Role {
    fn from(cmd: RoleCommand) -> Self {
        match cmd {
            RoleCommand::Monitor => Role::Monitor,
            RoleCommand::FanControl => Role::FanControl,
        }
    }
}

/// Main agent state
struct Agent {
    config: AgentConfig,
    role: Role,
    topics: Topics,
    client: AsyncClient,
    events: mpsc::Receiver<relay::ControlEvent>,
}

impl Agent {
    fn new(config: AgentConfig, role: Role) -> Self {
        let topics = Topics::new(&config.namespace);
        let (client, eventloop) = AsyncClient::new(mqtt_options(&config, role, &topics), 64);
        let (tx, rx) = mpsc::channel(256);
        spawn_event_loop(eventloop, client.clone(), role, topics.clone(), tx);
        info!(
            "Agent {} -> {}:{} (namespace {})",
            role.as_str(),
            config.mqtt.host,
            config.mqtt.port,
            topics.namespace()
        );
        Self { config, role, topics, client, events: rx }
    }

    async fn run(self) -> Result<()> {
        let bus: Arc<dyn unas_core::Bus> = Arc::new(self.client.clone());
        let mut task = match self.role {
            Role::Monitor => {
                let runner = Arc::new(SystemRunner::new(self.config.monitor.command_timeout()));
                let reader = TelemetryReader::new(self.config.clone(), runner);
                let monitor = Monitor::new(reader, bus.clone(), self.topics.clone(), self.config.monitor.interval());
                tokio::spawn(monitor.run(self.events))
            }
            Role::FanControl => {
                let fan_loop = FanLoop::new(
                    FanController::new(HwmonFan::new(&self.config.paths.hwmon_dir)),
                    TemperatureTracker::new(self.config.fan.temperature_max_age()),
                    bus.clone(),
                    self.topics.clone(),
                    self.config.fan.control_interval(),
                );
                tokio::spawn(fan_loop.run(self.events))
            }
        };

        tokio::select! {
            res = &mut task => res.context("agent task panicked")?,
            received = shutdown_signal() => {
                task.abort();
                match received {
                    Ok(name) => info!("Shutdown requested ({name})"),
                    Err(e) => error!("Signal handling failed, shutting down: {e:#}"),
                }
            }
        }

        match self.role {
            Role::Monitor => monitor::mark_offline(bus.as_ref(), &self.topics).await,
            Role::FanControl => fan::release_to_firmware(&self.config.paths.hwmon_dir).await,
        }
        // let queued publishes drain before the connection goes away
        let _ = self.client.disconnect().await;
        Ok(())
    }
}

/// Ctrl-C, or SIGTERM from `systemctl stop`.
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
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = AgentConfig::load(cli.config.as_deref())
        .await
        .context("Failed to load agent configuration")?;

    info!("Initializing UNAS Agent v{}", env!("CARGO_PKG_VERSION"));
    Agent::new(config, cli.role.into()).run().await
}
