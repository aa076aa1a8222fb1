//! Reconciliation coordinator
//!
//! Every poll cycle folds the appliance side (markers, deployed version, services) and the
//! cache snapshot into one `ReconciledState`, published whole on a watch channel.
//!
//! Phases:
//! - `Uninitialized`: no cycle has completed yet
//! - `Synced`: agent installed at the kernel's version
//! - `Drifted`: markers missing or version mismatch, redeploy pending or failed
//! - `Unreachable`: the appliance did not answer
//!
//! A failed cycle leaves the last good state in place and only flips the status fields.

use crate::cache::StateCache;
use crate::deploy::{DeployError, Deployer, VersionStore, SERVICES};
use crate::discovery::{Discovery, Shared};
use crate::health::BusHealth;
use crate::remote::{markers_present, service_active};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use unas_core::{RemoteShell, ShellError, TelemetrySample};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Uninitialized,
    Synced,
    Drifted,
    Unreachable,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconciledState {
    pub cycle: u64,
    pub phase: Phase,
    pub agent_reachable: bool,
    pub agent_installed: bool,
    pub deployed_version: Option<String>,
    pub services: BTreeMap<String, bool>,
    pub telemetry: TelemetrySample,
    /// Last liveness message from the monitor agent (`online` / `offline`).
    pub agent_status: Option<String>,
    pub available: bool,
    pub last_update_success: bool,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("message bus unavailable")]
    BusUnavailable,
    #[error("appliance unreachable: {0}")]
    Remote(#[from] ShellError),
    #[error("redeploy failed: {0}")]
    Deploy(#[from] DeployError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Reinstall the agent even if nothing drifted.
    Redeploy,
    /// Run a cycle now instead of waiting for the next tick.
    Refresh,
}

pub struct Coordinator {
    shell: Arc<dyn RemoteShell>,
    deployer: Arc<dyn Deployer>,
    versions: VersionStore,
    version: String,
    cache: StateCache,
    bus: BusHealth,
    discovery: Shared<Discovery>,
    state_tx: watch::Sender<ReconciledState>,
    phase: Phase,
    cycle: u64,
    failures: u32,
}

impl Coordinator {
    pub fn new(
        shell: Arc<dyn RemoteShell>,
        deployer: Arc<dyn Deployer>,
        versions: VersionStore,
        version: impl Into<String>,
        cache: StateCache,
        bus: BusHealth,
        discovery: Shared<Discovery>,
    ) -> (Self, watch::Receiver<ReconciledState>) {
        let (state_tx, state_rx) = watch::channel(ReconciledState::default());
        let coordinator = Self {
            shell,
            deployer,
            versions,
            version: version.into(),
            cache,
            bus,
            discovery,
            state_tx,
            phase: Phase::Uninitialized,
            cycle: 0,
            failures: 0,
        };
        (coordinator, state_rx)
    }

    /// One reconciliation pass. On error the published state keeps its data fields.
    pub async fn run_cycle(&mut self, force_redeploy: bool) -> Result<(), CycleError> {
        self.cycle += 1;
        match self.reconcile(force_redeploy).await {
            Ok(state) => {
                if self.failures > 0 {
                    info!("Cycle {} recovered after {} failure(s)", self.cycle, self.failures);
                }
                self.failures = 0;
                self.phase = state.phase;
                debug!("Cycle {}: {:?}, services {:?}", self.cycle, state.phase, state.services);
                self.state_tx.send_replace(state);
                Ok(())
            }
            Err(e) => {
                self.failures += 1;
                self.phase = match &e {
                    CycleError::Remote(err) | CycleError::Deploy(DeployError::Shell(err)) if err.is_transport() => {
                        Phase::Unreachable
                    }
                    CycleError::Remote(_) | CycleError::Deploy(_) => Phase::Drifted,
                    CycleError::BusUnavailable => self.phase,
                };
                error!("Cycle {} failed ({} in a row): {}", self.cycle, self.failures, e);
                let (cycle, phase, failures, message) = (self.cycle, self.phase, self.failures, e.to_string());
                let unreachable = phase == Phase::Unreachable;
                self.state_tx.send_modify(|state| {
                    state.cycle = cycle;
                    state.phase = phase;
                    if unreachable {
                        state.agent_reachable = false;
                    }
                    state.last_update_success = false;
                    state.last_error = Some(message);
                    state.consecutive_failures = failures;
                });
                Err(e)
            }
        }
    }

    async fn reconcile(&mut self, force_redeploy: bool) -> Result<ReconciledState, CycleError> {
        // fan-safety telemetry is not optional: no bus, no cycle
        if !self.bus.is_connected() {
            return Err(CycleError::BusUnavailable);
        }

        let shell = self.shell.as_ref();
        let markers = self.deployer.markers();
        let mut installed = markers_present(shell, &markers).await?;
        let recorded = self.versions.load().await.map(|r| r.version);
        let version_ok = recorded.as_deref() == Some(self.version.as_str());

        let mut deployed_version = recorded;
        if force_redeploy || !installed || !version_ok {
            let reason = if force_redeploy {
                "redeploy requested".to_string()
            } else if !installed {
                "agent files missing".to_string()
            } else {
                format!("deployed {:?}, running {}", deployed_version, self.version)
            };
            warn!("Cycle {}: drift ({}), redeploying", self.cycle, reason);
            self.phase = Phase::Drifted;
            self.deployer.deploy().await?;
            self.versions.record(&self.version).await?;
            deployed_version = Some(self.version.clone());
            installed = markers_present(shell, &markers).await?;
        }

        let mut services = BTreeMap::new();
        for service in SERVICES {
            services.insert(service.to_string(), service_active(shell, service).await?);
        }

        let telemetry = self.cache.snapshot();
        self.discovery.lock().scan(&telemetry);

        Ok(ReconciledState {
            cycle: self.cycle,
            phase: if installed { Phase::Synced } else { Phase::Drifted },
            agent_reachable: true,
            agent_installed: installed,
            deployed_version,
            services,
            telemetry,
            agent_status: self.cache.liveness().map(|l| l.as_payload().to_string()),
            available: self.cache.is_available(),
            last_update_success: true,
            last_error: None,
            consecutive_failures: 0,
            updated_at: Some(OffsetDateTime::now_utc()),
        })
    }

    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>, period: Duration) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Coordinator started (every {:?})", period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let _ = self.run_cycle(false).await;
                }
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    info!("Coordinator command: {:?}", command);
                    let _ = self.run_cycle(command == Command::Redeploy).await;
                }
            }
        }
        info!("Coordinator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::EntityRegistry;
    use crate::config::KernelConfig;
    use crate::deploy::{AgentLayout, SshDeployer};
    use crate::discovery::new_shared;
    use unas_core::Liveness;
    use unas_devkit::ScriptedShell;

    const VERSION: &str = "0.3.0";

    struct Fixture {
        _dir: tempfile::TempDir,
        shell: ScriptedShell,
        health: BusHealth,
        cache: StateCache,
        registry: Shared<EntityRegistry>,
        versions: VersionStore,
        layout: AgentLayout,
        coordinator: Coordinator,
        state: watch::Receiver<ReconciledState>,
    }

    fn fixture(shell: ScriptedShell) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("unas-agent");
        std::fs::write(&binary, b"agent").unwrap();
        let mut cfg = KernelConfig::default();
        cfg.agent.binary = binary;
        cfg.data_dir = dir.path().join("data");

        let health = BusHealth::new();
        health.mark_connected();
        let cache = StateCache::new();
        let registry = new_shared(EntityRegistry::new());
        let versions = VersionStore::new(&cfg.data_dir);
        let shared_shell: Arc<dyn RemoteShell> = Arc::new(shell.clone());
        let deployer = Arc::new(SshDeployer::new(shared_shell.clone(), cfg.clone()));
        let (coordinator, state) = Coordinator::new(
            shared_shell,
            deployer,
            versions.clone(),
            VERSION,
            cache.clone(),
            health.clone(),
            new_shared(Discovery::new(registry.clone())),
        );
        Fixture {
            _dir: dir,
            shell,
            health,
            cache,
            registry,
            versions,
            layout: AgentLayout::new(&cfg),
            coordinator,
            state,
        }
    }

    #[tokio::test]
    async fn test_first_cycle_deploys_and_syncs() {
        let mut f = fixture(ScriptedShell::new());
        assert_eq!(f.state.borrow().phase, Phase::Uninitialized);

        f.coordinator.run_cycle(false).await.unwrap();
        let state = f.state.borrow().clone();
        assert_eq!(state.phase, Phase::Synced);
        assert!(state.agent_reachable);
        assert!(state.agent_installed);
        assert!(state.last_update_success);
        assert_eq!(state.deployed_version.as_deref(), Some(VERSION));
        assert_eq!(state.services.get("unas_monitor"), Some(&true));
        assert_eq!(state.services.get("fan_control"), Some(&true));
        assert_eq!(f.shell.uploads().len(), 4);
        assert_eq!(f.versions.load().await.unwrap().version, VERSION);

        // nothing drifted: no second deployment
        f.coordinator.run_cycle(false).await.unwrap();
        assert_eq!(f.shell.uploads().len(), 4);
        assert_eq!(f.state.borrow().cycle, 2);
    }

    #[tokio::test]
    async fn test_bus_down_fails_cycle_and_keeps_state() {
        let mut f = fixture(ScriptedShell::new());
        f.cache.put("cpu_temp", "51");
        f.coordinator.run_cycle(false).await.unwrap();

        f.health.mark_disconnected();
        f.cache.put("cpu_temp", "60");
        let err = f.coordinator.run_cycle(false).await.unwrap_err();
        assert!(matches!(err, CycleError::BusUnavailable));

        let state = f.state.borrow().clone();
        assert!(!state.last_update_success);
        assert_eq!(state.consecutive_failures, 1);
        assert_eq!(state.cycle, 2);
        assert_eq!(state.phase, Phase::Synced);
        assert_eq!(state.last_error.as_deref(), Some("message bus unavailable"));
        // last good snapshot, not the newer cache value
        assert_eq!(state.telemetry["cpu_temp"], unas_core::TelemetryValue::Int(51));
    }

    #[tokio::test]
    async fn test_marker_loss_triggers_redeploy() {
        let mut f = fixture(ScriptedShell::new());
        f.coordinator.run_cycle(false).await.unwrap();

        // firmware upgrade wiped the binary and stopped the services
        f.shell.remove_file(&f.layout.binary);
        f.shell.set_service("unas_monitor", false);
        f.coordinator.run_cycle(false).await.unwrap();

        assert_eq!(f.shell.uploads().len(), 8);
        let state = f.state.borrow().clone();
        assert_eq!(state.phase, Phase::Synced);
        assert_eq!(state.services.get("unas_monitor"), Some(&true));
    }

    #[tokio::test]
    async fn test_version_mismatch_redeploys() {
        let mut f = fixture(ScriptedShell::new());
        for marker in f.layout.markers() {
            f.shell.add_file(&marker);
        }
        f.shell.set_service("unas_monitor", true).set_service("fan_control", true);
        f.versions.record("0.2.0").await.unwrap();

        f.coordinator.run_cycle(false).await.unwrap();
        assert_eq!(f.shell.uploads().len(), 4);
        assert_eq!(f.versions.load().await.unwrap().version, VERSION);
        assert_eq!(f.state.borrow().deployed_version.as_deref(), Some(VERSION));
    }

    #[tokio::test]
    async fn test_unreachable_then_recovers() {
        let mut f = fixture(ScriptedShell::new());
        f.shell.set_reachable(false);
        assert!(matches!(f.coordinator.run_cycle(false).await, Err(CycleError::Remote(_))));
        assert_eq!(f.state.borrow().phase, Phase::Unreachable);
        assert!(f.coordinator.run_cycle(false).await.is_err());
        assert_eq!(f.state.borrow().consecutive_failures, 2);
        assert!(!f.state.borrow().agent_reachable);

        f.shell.set_reachable(true);
        f.coordinator.run_cycle(false).await.unwrap();
        let state = f.state.borrow().clone();
        assert_eq!(state.phase, Phase::Synced);
        assert!(state.agent_reachable);
        assert_eq!(state.consecutive_failures, 0);
        assert!(state.last_error.is_none());
    }

    #[tokio::test]
    async fn test_failed_deploy_is_drift() {
        let shell = ScriptedShell::new();
        shell.reply("daemon-reload", unas_core::CommandOutput::failed(1, "Access denied"));
        let mut f = fixture(shell);
        assert!(matches!(f.coordinator.run_cycle(false).await, Err(CycleError::Deploy(_))));
        assert_eq!(f.state.borrow().phase, Phase::Drifted);
        assert_eq!(f.versions.load().await, None);
    }

    #[tokio::test]
    async fn test_rejected_upload_is_drift() {
        let shell = ScriptedShell::new();
        shell.fail_upload("unas-agent", 1, "No space left on device");
        let mut f = fixture(shell);
        let err = f.coordinator.run_cycle(false).await.unwrap_err();
        assert!(matches!(err, CycleError::Deploy(DeployError::Shell(ShellError::Exit { code: 1, .. }))));

        let state = f.state.borrow().clone();
        assert_eq!(state.phase, Phase::Drifted);
        assert!(state.last_error.unwrap().contains("No space left"));
    }

    #[tokio::test]
    async fn test_cycle_folds_cache_and_runs_discovery() {
        let mut f = fixture(ScriptedShell::new());
        f.cache.set_liveness(Liveness::Online);
        f.cache.put("hdd_2_temperature", "41");
        f.cache.put("pool1_usage", "26");
        f.coordinator.run_cycle(false).await.unwrap();

        let state = f.state.borrow().clone();
        assert!(state.available);
        assert_eq!(state.agent_status.as_deref(), Some("online"));
        assert_eq!(state.telemetry.len(), 2);
        let keys: Vec<String> = f.registry.lock().list().into_iter().map(|e| e.key).collect();
        assert!(keys.contains(&"hdd_2_temperature".to_string()));
        assert!(keys.contains(&"pool1_available".to_string()));
    }

    #[tokio::test]
    async fn test_run_handles_commands() {
        let f = fixture(ScriptedShell::new());
        let shell = f.shell.clone();
        let mut state = f.state.clone();
        let (tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(f.coordinator.run(rx, Duration::from_secs(3600)));

        // the first tick fires immediately
        state.wait_for(|s| s.cycle >= 1).await.unwrap();
        assert_eq!(shell.uploads().len(), 4);

        tx.send(Command::Redeploy).await.unwrap();
        state.wait_for(|s| s.cycle >= 2).await.unwrap();
        assert_eq!(shell.uploads().len(), 8);

        tx.send(Command::Refresh).await.unwrap();
        state.wait_for(|s| s.cycle >= 3).await.unwrap();
        assert_eq!(shell.uploads().len(), 8);

        drop(tx);
        task.await.unwrap();
    }
}
