use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::warn;
use unas_core::topics::DEFAULT_NAMESPACE;

pub const CONFIG_ENV: &str = "UNAS_KERNEL_CONFIG";
pub const API_KEY_ENV: &str = "UNAS_API_KEY";

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct KernelConfig {
    pub namespace: String,
    /// Where `deployment.json` lives.
    pub data_dir: PathBuf,
    pub poll_interval_secs: u64,
    pub mqtt: MqttConf,
    pub ssh: SshConf,
    pub agent: AgentConf,
    pub http: HttpConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub keep_alive_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SshConf {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub identity_file: Option<PathBuf>,
    /// Directory for the persistent control socket.
    pub control_dir: PathBuf,
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AgentConf {
    /// Local build of `unas-agent` pushed to the appliance.
    pub binary: PathBuf,
    pub install_dir: String,
    pub unit_dir: String,
    pub hwmon_dir: String,
    pub model: String,
    /// Broker address as seen from the appliance (default: `mqtt.host`).
    pub broker_host: Option<String>,
    pub bay_map: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConf {
    pub bind: String,
    pub api_key: Option<String>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.into(),
            data_dir: PathBuf::from("./data"),
            poll_interval_secs: 30,
            mqtt: MqttConf::default(),
            ssh: SshConf::default(),
            agent: AgentConf::default(),
            http: HttpConf::default(),
        }
    }
}

impl Default for MqttConf {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            username: None,
            password: None,
            client_id: "unas-kernel".into(),
            keep_alive_secs: 15,
        }
    }
}

impl Default for SshConf {
    fn default() -> Self {
        Self {
            host: "unas.local".into(),
            port: 22,
            user: "root".into(),
            identity_file: None,
            control_dir: std::env::temp_dir(),
            timeout_secs: 30,
            connect_timeout_secs: 10,
        }
    }
}

impl Default for AgentConf {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("./unas-agent"),
            install_dir: "/root".into(),
            unit_dir: "/etc/systemd/system".into(),
            hwmon_dir: "/sys/class/hwmon/hwmon0".into(),
            model: "unas-pro".into(),
            broker_host: None,
            bay_map: None,
        }
    }
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8080".into(), api_key: None }
    }
}

impl KernelConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn broker_host_for_agent(&self) -> &str {
        self.agent.broker_host.as_deref().unwrap_or(&self.mqtt.host)
    }
}

impl SshConf {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Load `kernel.yaml` (or `$UNAS_KERNEL_CONFIG`). A missing or empty file yields defaults;
/// a file that does not parse is a startup error.
pub async fn load_config() -> Result<KernelConfig> {
    let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| "kernel.yaml".into());
    let mut cfg = load_from(Path::new(&path)).await?;
    if let Ok(key) = std::env::var(API_KEY_ENV) {
        if !key.is_empty() {
            cfg.http.api_key = Some(key);
        }
    }
    Ok(cfg)
}

pub async fn load_from(path: &Path) -> Result<KernelConfig> {
    if !path.exists() {
        warn!("No {}, using default configuration", path.display());
        return Ok(KernelConfig::default());
    }
    let txt = fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    if txt.trim().is_empty() {
        return Ok(KernelConfig::default());
    }
    serde_yaml::from_str(&txt).with_context(|| format!("Invalid kernel config {}", path.display()))
}
