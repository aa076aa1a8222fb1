//! Host-level metrics: uptime, memory, CPU temperature, fan, firmware versions
//!
//! Each optional source falls back to a fixed default (0 or empty string) when unreadable.

use crate::execution::CommandRunner;
use std::path::Path;
use sysinfo::System;
use unas_core::{pwm_to_percent, TelemetrySample, TelemetryValue};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryUsage {
    pub total_mb: u64,
    pub used_mb: u64,
    pub usage: f64,
}

pub fn memory_usage(total_bytes: u64, available_bytes: u64) -> MemoryUsage {
    let total_mb = total_bytes / (1024 * 1024);
    let used_mb = total_mb.saturating_sub(available_bytes / (1024 * 1024));
    let usage = if total_mb > 0 {
        (used_mb as f64 / total_mb as f64 * 1000.0).round() / 10.0
    } else {
        0.0
    };
    MemoryUsage { total_mb, used_mb, usage }
}

/// Thermal zone millidegrees → whole degrees (truncating).
pub async fn read_cpu_temp(thermal_zone: &Path) -> i64 {
    read_trimmed(thermal_zone)
        .await
        .and_then(|s| s.parse::<i64>().ok())
        .map(|milli| milli / 1000)
        .unwrap_or(0)
}

pub async fn read_fan_pwm(hwmon_dir: &Path) -> u8 {
    read_trimmed(&hwmon_dir.join("pwm1"))
        .await
        .and_then(|s| s.parse::<u8>().ok())
        .unwrap_or(0)
}

async fn read_trimmed(path: &Path) -> Option<String> {
    tokio::fs::read_to_string(path).await.ok().map(|s| s.trim().to_string())
}

async fn package_version(runner: &dyn CommandRunner, package: &str) -> String {
    match runner.run("dpkg-query", &["-W", "-f=${Version}", package]).await {
        Ok(out) if out.exit_code == 0 => out.stdout.trim().to_string(),
        _ => String::new(),
    }
}

pub struct SystemProbe {
    sys: System,
}

impl SystemProbe {
    pub fn new() -> Self {
        Self { sys: System::new() }
    }

    pub async fn collect(
        &mut self,
        runner: &dyn CommandRunner,
        thermal_zone: &Path,
        hwmon_dir: &Path,
        sample: &mut TelemetrySample,
    ) {
        self.sys.refresh_memory();
        let mem = memory_usage(self.sys.total_memory(), self.sys.available_memory());

        sample.insert("uptime".into(), System::uptime().into());
        sample.insert("memory_total".into(), mem.total_mb.into());
        sample.insert("memory_used".into(), mem.used_mb.into());
        sample.insert("memory_usage".into(), TelemetryValue::Float(mem.usage));
        sample.insert("cpu_temp".into(), TelemetryValue::Int(read_cpu_temp(thermal_zone).await));

        let pwm = read_fan_pwm(hwmon_dir).await;
        sample.insert("fan_speed".into(), pwm.into());
        sample.insert("fan_speed_percent".into(), pwm_to_percent(pwm).into());

        sample.insert("os_version".into(), package_version(runner, "unifi-core").await.into());
        sample.insert("drive_version".into(), package_version(runner, "unifi-drive").await.into());
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::testing::CannedRunner;

    #[test]
    fn test_memory_usage() {
        let gib = 1024 * 1024 * 1024;
        let m = memory_usage(8 * gib, 6 * gib);
        assert_eq!(m, MemoryUsage { total_mb: 8192, used_mb: 2048, usage: 25.0 });
        assert_eq!(memory_usage(0, 0).usage, 0.0);
        let m = memory_usage(3 * gib, 2 * gib);
        assert_eq!(m.usage, 33.3);
    }

    #[tokio::test]
    async fn test_sysfs_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_cpu_temp(&dir.path().join("temp")).await, 0);
        assert_eq!(read_fan_pwm(dir.path()).await, 0);

        std::fs::write(dir.path().join("temp"), "51875\n").unwrap();
        std::fs::write(dir.path().join("pwm1"), "204\n").unwrap();
        assert_eq!(read_cpu_temp(&dir.path().join("temp")).await, 51);
        assert_eq!(read_fan_pwm(dir.path()).await, 204);
    }

    #[tokio::test]
    async fn test_collect_fills_every_key() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pwm1"), "255").unwrap();
        let runner = CannedRunner::new().with("dpkg-query -W -f=${Version} unifi-core", "4.1.13\n");

        let mut sample = TelemetrySample::new();
        SystemProbe::new()
            .collect(&runner, &dir.path().join("missing"), dir.path(), &mut sample)
            .await;

        assert_eq!(sample.get("fan_speed_percent"), Some(&TelemetryValue::Int(100)));
        assert_eq!(sample.get("cpu_temp"), Some(&TelemetryValue::Int(0)));
        assert_eq!(sample.get("os_version"), Some(&TelemetryValue::Text("4.1.13".into())));
        assert_eq!(sample.get("drive_version"), Some(&TelemetryValue::Text(String::new())));
        for key in ["uptime", "memory_total", "memory_used", "memory_usage", "fan_speed"] {
            assert!(sample.contains_key(key), "{key} missing");
        }
    }
}
