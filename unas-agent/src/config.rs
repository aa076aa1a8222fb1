//! Agent configuration
//!
//! TOML file, resolved in this order:
//! - `--config <path>` on the command line
//! - `UNAS_AGENT_CONFIG`
//! - `<config_dir>/unas-agent/config.toml`
//!
//! A missing file yields the defaults; a malformed one is a startup error. Every field has a
//! default so the kernel only has to render what it knows (broker, namespace, bay map).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use unas_core::topics::DEFAULT_NAMESPACE;

pub const CONFIG_ENV: &str = "UNAS_AGENT_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    pub namespace: String,
    /// Hardware model, selects the built-in bay table.
    pub model: String,
    pub mqtt: MqttConfig,
    pub monitor: MonitorConfig,
    pub fan: FanConfig,
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: Option<String>,
    pub keep_alive_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    pub interval_secs: u64,
    pub pool_min_size_gb: u64,
    pub command_timeout_secs: u64,
    /// ATA port → bay overrides; replaces the built-in table when present.
    pub bay_map: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FanConfig {
    pub control_interval_secs: u64,
    pub temperature_max_age_secs: u64,
}

/// Filesystem roots, overridable so the readers can run against fixture trees.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PathsConfig {
    pub proc_dir: PathBuf,
    pub dev_dir: PathBuf,
    pub volume_dir: PathBuf,
    pub thermal_zone: PathBuf,
    pub hwmon_dir: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            model: "unas-pro".to_string(),
            mqtt: MqttConfig::default(),
            monitor: MonitorConfig::default(),
            fan: FanConfig::default(),
            paths: PathsConfig::default(),
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            username: None,
            password: None,
            client_id: None,
            keep_alive_secs: 60,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            pool_min_size_gb: 75,
            command_timeout_secs: 10,
            bay_map: None,
        }
    }
}

impl Default for FanConfig {
    fn default() -> Self {
        Self {
            control_interval_secs: 15,
            temperature_max_age_secs: 120,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            proc_dir: PathBuf::from("/proc"),
            dev_dir: PathBuf::from("/dev"),
            volume_dir: PathBuf::from("/volume"),
            thermal_zone: PathBuf::from("/sys/class/thermal/thermal_zone0/temp"),
            hwmon_dir: PathBuf::from("/sys/class/hwmon/hwmon0"),
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

impl FanConfig {
    pub fn control_interval(&self) -> Duration {
        Duration::from_secs(self.control_interval_secs)
    }

    pub fn temperature_max_age(&self) -> Duration {
        Duration::from_secs(self.temperature_max_age_secs)
    }
}

impl AgentConfig {
    /// Resolve the config path and load it.
    pub async fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(p) => p.to_path_buf(),
            None => match std::env::var_os(CONFIG_ENV) {
                Some(p) => PathBuf::from(p),
                None => Self::config_file_path()?,
            },
        };
        Self::load_from(&path).await
    }

    pub async fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::warn!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: AgentConfig =
            toml::from_str(&content).with_context(|| format!("Invalid config {}", path.display()))?;
        Ok(config)
    }

    pub fn config_file_path() -> Result<PathBuf> {
        let mut path =
            dirs::config_dir().ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        path.push("unas-agent");
        path.push("config.toml");
        Ok(path)
    }

    /// Broker client id for a role; one connection per role and host.
    pub fn client_id(&self, role: &str) -> String {
        match &self.mqtt.client_id {
            Some(id) => format!("{id}-{role}"),
            None => {
                let host = hostname::get()
                    .map(|h| h.to_string_lossy().to_string())
                    .unwrap_or_else(|_| "unas".to_string());
                format!("unas-agent-{host}-{role}")
            }
        }
    }
}
