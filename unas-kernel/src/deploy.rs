//! Agent deployment
//!
//! What lands on the appliance:
//! - `<install_dir>/unas-agent`: the agent binary (0755)
//! - `<install_dir>/unas-agent.toml`: broker + namespace, rendered from the kernel config (0600)
//! - `<unit_dir>/unas_monitor.service`, `<unit_dir>/fan_control.service` (0644)
//!
//! All four double as markers: a firmware upgrade that wipes any of them reads as drift.
//! The last deployed kernel version is kept in `<data_dir>/deployment.json`.

use crate::config::KernelConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{error, info, warn};
use unas_core::{RemoteShell, ShellError};

pub const MONITOR_SERVICE: &str = "unas_monitor";
pub const FAN_SERVICE: &str = "fan_control";
pub const SERVICES: [&str; 2] = [MONITOR_SERVICE, FAN_SERVICE];

/// `pwm1_enable` value giving control back to the firmware.
const PWM_ENABLE_FIRMWARE: u8 = 2;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("cannot read agent binary {path}: {source}")]
    Binary {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot render agent config: {0}")]
    Render(#[from] toml::ser::Error),
    #[error(transparent)]
    Shell(#[from] ShellError),
    #[error("`{command}` exited {code}: {stderr}")]
    Command { command: String, code: i32, stderr: String },
    #[error("cannot record deployment in {path}: {reason}")]
    Record { path: String, reason: String },
}

/// Remote paths of everything we install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentLayout {
    pub binary: String,
    pub config: String,
    unit_dir: String,
}

impl AgentLayout {
    pub fn new(cfg: &KernelConfig) -> Self {
        let dir = cfg.agent.install_dir.trim_end_matches('/');
        Self {
            binary: format!("{dir}/unas-agent"),
            config: format!("{dir}/unas-agent.toml"),
            unit_dir: cfg.agent.unit_dir.trim_end_matches('/').to_string(),
        }
    }

    pub fn unit(&self, service: &str) -> String {
        format!("{}/{}.service", self.unit_dir, service)
    }

    pub fn markers(&self) -> Vec<String> {
        let mut markers = vec![self.binary.clone(), self.config.clone()];
        markers.extend(SERVICES.iter().map(|s| self.unit(s)));
        markers
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployFile {
    pub remote_path: String,
    pub content: Vec<u8>,
    pub mode: u32,
}

#[derive(Debug, Clone)]
pub struct DeployPlan {
    pub files: Vec<DeployFile>,
}

#[derive(Serialize)]
struct RenderedAgentConfig<'a> {
    namespace: &'a str,
    model: &'a str,
    mqtt: RenderedMqtt<'a>,
    monitor: RenderedMonitor<'a>,
    paths: RenderedPaths<'a>,
}

#[derive(Serialize)]
struct RenderedMqtt<'a> {
    host: &'a str,
    port: u16,
    username: Option<&'a str>,
    password: Option<&'a str>,
}

#[derive(Serialize)]
struct RenderedMonitor<'a> {
    bay_map: Option<&'a BTreeMap<String, String>>,
}

#[derive(Serialize)]
struct RenderedPaths<'a> {
    hwmon_dir: &'a str,
}

/// Agent config file as the appliance should see it. Everything not rendered here keeps
/// the agent's own default.
pub fn render_agent_config(cfg: &KernelConfig) -> Result<String, DeployError> {
    let rendered = RenderedAgentConfig {
        namespace: &cfg.namespace,
        model: &cfg.agent.model,
        mqtt: RenderedMqtt {
            host: cfg.broker_host_for_agent(),
            port: cfg.mqtt.port,
            username: cfg.mqtt.username.as_deref(),
            password: cfg.mqtt.password.as_deref(),
        },
        monitor: RenderedMonitor { bay_map: cfg.agent.bay_map.as_ref() },
        paths: RenderedPaths { hwmon_dir: &cfg.agent.hwmon_dir },
    };
    Ok(toml::to_string(&rendered)?)
}

pub fn render_unit(description: &str, layout: &AgentLayout, role: &str) -> String {
    format!(
        "[Unit]\n\
         Description={description}\n\
         After=network-online.target\n\
         Wants=network-online.target\n\
         \n\
         [Service]\n\
         Type=simple\n\
         ExecStart={} --config {} {role}\n\
         Restart=always\n\
         RestartSec=10\n\
         Environment=RUST_LOG=info\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        layout.binary, layout.config
    )
}

impl DeployPlan {
    pub fn build(cfg: &KernelConfig, layout: &AgentLayout, binary: Vec<u8>) -> Result<Self, DeployError> {
        let files = vec![
            DeployFile { remote_path: layout.binary.clone(), content: binary, mode: 0o755 },
            DeployFile {
                remote_path: layout.config.clone(),
                content: render_agent_config(cfg)?.into_bytes(),
                mode: 0o600,
            },
            DeployFile {
                remote_path: layout.unit(MONITOR_SERVICE),
                content: render_unit("UNAS hardware monitor", layout, "monitor").into_bytes(),
                mode: 0o644,
            },
            DeployFile {
                remote_path: layout.unit(FAN_SERVICE),
                content: render_unit("UNAS fan control", layout, "fan-control").into_bytes(),
                mode: 0o644,
            },
        ];
        Ok(Self { files })
    }
}

/// Installs the agent on the appliance.
#[async_trait]
pub trait Deployer: Send + Sync {
    /// Files whose joint presence means "installed".
    fn markers(&self) -> Vec<String>;

    async fn deploy(&self) -> Result<(), DeployError>;
}

pub struct SshDeployer {
    shell: Arc<dyn RemoteShell>,
    cfg: KernelConfig,
    layout: AgentLayout,
}

impl SshDeployer {
    pub fn new(shell: Arc<dyn RemoteShell>, cfg: KernelConfig) -> Self {
        let layout = AgentLayout::new(&cfg);
        Self { shell, cfg, layout }
    }

    async fn checked(&self, command: &str) -> Result<(), DeployError> {
        let out = self.shell.run(command).await?;
        if !out.success() {
            return Err(DeployError::Command {
                command: command.to_string(),
                code: out.exit_code,
                stderr: out.stderr.trim().to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Deployer for SshDeployer {
    fn markers(&self) -> Vec<String> {
        self.layout.markers()
    }

    async fn deploy(&self) -> Result<(), DeployError> {
        let path = &self.cfg.agent.binary;
        let binary = tokio::fs::read(path)
            .await
            .map_err(|source| DeployError::Binary { path: path.display().to_string(), source })?;
        let plan = DeployPlan::build(&self.cfg, &self.layout, binary)?;

        info!("Deploying agent to {} ({} files)", self.cfg.ssh.host, plan.files.len());
        for file in &plan.files {
            self.shell.upload(&file.remote_path, &file.content, file.mode).await?;
        }

        let units = SERVICES.join(" ");
        self.checked(&format!(
            "systemctl daemon-reload && systemctl enable --now {units} && systemctl restart {units}"
        ))
        .await?;
        info!("Agent deployed, services {} restarted", units);
        Ok(())
    }
}

/// Teardown: stop our fan loop and hand cooling back to the firmware. Best effort, every
/// step is attempted and failures are only logged.
pub async fn restore_firmware_control(shell: &dyn RemoteShell, hwmon_dir: &str) {
    let steps = [
        format!("systemctl stop {FAN_SERVICE}"),
        format!(
            "echo {PWM_ENABLE_FIRMWARE} > {}",
            shell_words::quote(&format!("{}/pwm1_enable", hwmon_dir.trim_end_matches('/')))
        ),
    ];
    for step in &steps {
        match shell.run(step).await {
            Ok(out) if out.success() => {}
            Ok(out) => warn!("Teardown step `{}` exited {}: {}", step, out.exit_code, out.stderr.trim()),
            Err(e) => error!("Teardown step `{}` failed: {}", step, e),
        }
    }
    info!("Fan control returned to firmware");
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub version: String,
    #[serde(with = "time::serde::rfc3339")]
    pub deployed_at: OffsetDateTime,
}

/// Last successfully deployed version, persisted across kernel restarts.
#[derive(Debug, Clone)]
pub struct VersionStore {
    path: PathBuf,
}

impl VersionStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self { path: data_dir.into().join("deployment.json") }
    }

    /// `None` when nothing was recorded or the record is unreadable; both force a redeploy.
    pub async fn load(&self) -> Option<DeploymentRecord> {
        let txt = tokio::fs::read_to_string(&self.path).await.ok()?;
        match serde_json::from_str(&txt) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("Ignoring corrupt {}: {}", self.path.display(), e);
                None
            }
        }
    }

    pub async fn record(&self, version: &str) -> Result<DeploymentRecord, DeployError> {
        let record = DeploymentRecord { version: version.to_string(), deployed_at: OffsetDateTime::now_utc() };
        let err = |reason: String| DeployError::Record { path: self.path.display().to_string(), reason };
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(|e| err(e.to_string()))?;
        }
        let json = serde_json::to_string_pretty(&record).map_err(|e| err(e.to_string()))?;
        tokio::fs::write(&self.path, json).await.map_err(|e| err(e.to_string()))?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use unas_devkit::ScriptedShell;

    fn kernel_config(binary: PathBuf) -> KernelConfig {
        let mut cfg = KernelConfig::default();
        cfg.mqtt.host = "broker.lan".into();
        cfg.mqtt.username = Some("homeassistant".into());
        cfg.mqtt.password = Some("s3cret".into());
        cfg.agent.binary = binary;
        cfg
    }

    #[test]
    fn test_layout_markers() {
        let layout = AgentLayout::new(&KernelConfig::default());
        assert_eq!(
            layout.markers(),
            vec![
                "/root/unas-agent",
                "/root/unas-agent.toml",
                "/etc/systemd/system/unas_monitor.service",
                "/etc/systemd/system/fan_control.service",
            ]
        );
    }

    #[test]
    fn test_rendered_config_and_units() {
        let mut cfg = kernel_config(PathBuf::from("unused"));
        cfg.agent.broker_host = Some("192.168.1.111".into());
        let toml_text = render_agent_config(&cfg).unwrap();
        let parsed: toml::Value = toml::from_str(&toml_text).unwrap();
        assert_eq!(parsed["namespace"].as_str(), Some("homeassistant/unas"));
        assert_eq!(parsed["mqtt"]["host"].as_str(), Some("192.168.1.111"));
        assert_eq!(parsed["mqtt"]["password"].as_str(), Some("s3cret"));
        assert_eq!(parsed["paths"]["hwmon_dir"].as_str(), Some("/sys/class/hwmon/hwmon0"));

        let unit = render_unit("UNAS fan control", &AgentLayout::new(&cfg), "fan-control");
        assert!(unit.contains("ExecStart=/root/unas-agent --config /root/unas-agent.toml fan-control\n"));
        assert!(unit.contains("Restart=always"));
    }

    #[tokio::test]
    async fn test_deploy_uploads_and_starts_services() {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("unas-agent");
        std::fs::write(&binary, b"\x7fELF").unwrap();

        let shell = ScriptedShell::new();
        let deployer = SshDeployer::new(Arc::new(shell.clone()), kernel_config(binary));
        deployer.deploy().await.unwrap();

        let uploads = shell.uploads();
        assert_eq!(uploads.len(), 4);
        assert_eq!(uploads[0].content, b"\x7fELF");
        assert_eq!(uploads[0].mode, 0o755);
        assert_eq!(uploads[1].mode, 0o600);
        assert!(shell.service_active(MONITOR_SERVICE));
        assert!(shell.service_active(FAN_SERVICE));
        assert!(crate::remote::markers_present(&shell, &deployer.markers()).await.unwrap());
    }

    #[tokio::test]
    async fn test_deploy_errors() {
        let shell = ScriptedShell::new();
        let missing = SshDeployer::new(Arc::new(shell.clone()), kernel_config(PathBuf::from("/nonexistent/agent")));
        assert!(matches!(missing.deploy().await, Err(DeployError::Binary { .. })));
        assert!(shell.uploads().is_empty());

        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("unas-agent");
        std::fs::write(&binary, b"bin").unwrap();
        shell.reply("daemon-reload", unas_core::CommandOutput::failed(1, "Access denied"));
        let deployer = SshDeployer::new(Arc::new(shell.clone()), kernel_config(binary));
        match deployer.deploy().await {
            Err(DeployError::Command { code, stderr, .. }) => {
                assert_eq!(code, 1);
                assert_eq!(stderr, "Access denied");
            }
            other => panic!("expected command failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_restore_firmware_control() {
        let shell = ScriptedShell::new();
        shell.set_service(FAN_SERVICE, true);
        restore_firmware_control(&shell, "/sys/class/hwmon/hwmon0/").await;
        assert!(!shell.service_active(FAN_SERVICE));
        assert!(shell.ran("echo 2 > /sys/class/hwmon/hwmon0/pwm1_enable"));

        // unreachable appliance: still returns
        shell.set_reachable(false);
        restore_firmware_control(&shell, "/sys/class/hwmon/hwmon0").await;
    }

    #[tokio::test]
    async fn test_version_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = VersionStore::new(dir.path().join("nested"));
        assert_eq!(store.load().await, None);

        let record = store.record("0.3.0").await.unwrap();
        assert_eq!(store.load().await, Some(record));

        std::fs::write(dir.path().join("nested/deployment.json"), "{not json").unwrap();
        assert_eq!(store.load().await, None);
    }
}
