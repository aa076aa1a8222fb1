//! Hardware telemetry for the UNAS
//!
//! One `sample()` call produces the full flat sample published by the monitor role:
//! - system: uptime, memory, CPU usage and temperature, fan PWM, package versions
//! - disk throughput across whole SATA disks
//! - per-bay SMART attributes (`hdd_<bay>_*`)
//! - per-pool usage (`pool<n>_*`)
//!
//! Every source fails soft. A bay or pool that cannot be read is left out of the sample;
//! its absence is the failure signal.

pub mod cpu;
pub mod disk_io;
pub mod drives;
pub mod pools;
pub mod system;

use crate::config::AgentConfig;
use crate::execution::CommandRunner;
use drives::{BayMapper, BayTable};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use unas_core::{TelemetrySample, TelemetryValue};

/// Sampling window between the two `/proc/stat` reads.
pub const CPU_WINDOW: Duration = Duration::from_millis(100);

pub struct TelemetryReader {
    config: AgentConfig,
    runner: Arc<dyn CommandRunner>,
    cpu: cpu::CpuSampler,
    disk_io: disk_io::DiskIoSampler,
    bays: BayMapper,
    system: system::SystemProbe,
}

impl TelemetryReader {
    pub fn new(config: AgentConfig, runner: Arc<dyn CommandRunner>) -> Self {
        let table = match &config.monitor.bay_map {
            Some(map) => BayTable::from_map(map.clone()),
            None => BayTable::builtin(&config.model).unwrap_or_else(|| {
                warn!("No bay table for model '{}', drives will not be reported", config.model);
                BayTable::from_map(Default::default())
            }),
        };
        Self {
            cpu: cpu::CpuSampler::new(&config.paths.proc_dir, CPU_WINDOW),
            disk_io: disk_io::DiskIoSampler::new(&config.paths.proc_dir),
            bays: BayMapper::new(table),
            system: system::SystemProbe::new(),
            runner,
            config,
        }
    }

    pub async fn sample(&mut self) -> TelemetrySample {
        let mut sample = TelemetrySample::new();
        let paths = &self.config.paths;

        // prime the disk counters so the first report spans the CPU window
        if !self.disk_io.is_primed() {
            self.disk_io.prime().await;
        }
        sample.insert("cpu_usage".into(), TelemetryValue::Int(self.cpu.sample().await));
        let io = self.disk_io.sample().await;
        sample.insert("disk_read_speed".into(), TelemetryValue::Float(io.read_mb_s));
        sample.insert("disk_write_speed".into(), TelemetryValue::Float(io.write_mb_s));

        self.system
            .collect(self.runner.as_ref(), &paths.thermal_zone, &paths.hwmon_dir, &mut sample)
            .await;

        let devices = drives::list_devices(&paths.dev_dir);
        let found = drives::collect_drives(self.runner.as_ref(), &mut self.bays, &devices).await;
        for drive in &found {
            drive.write_into(&mut sample);
        }

        let pools =
            pools::collect_pools(self.runner.as_ref(), &paths.volume_dir, self.config.monitor.pool_min_size_gb).await;
        for pool in &pools {
            pool.write_into(&mut sample);
        }

        debug!("sampled {} keys ({} drives, {} pools)", sample.len(), found.len(), pools.len());
        sample
    }
}

/// `204 PWM (80%) | CPU 51°C | HDD 38°C, 41°C`
pub fn summary_line(sample: &TelemetrySample) -> String {
    let show = |key: &str| sample.get(key).map(ToString::to_string).unwrap_or_else(|| "?".to_string());
    let drives = drive_temperatures(sample);
    let temps = if drives.is_empty() {
        "no drives".to_string()
    } else {
        drives.iter().map(|(_, t)| format!("{t}°C")).collect::<Vec<_>>().join(", ")
    };
    format!(
        "{} PWM ({}%) | CPU {}°C | HDD {}",
        show("fan_speed"),
        show("fan_speed_percent"),
        show("cpu_temp"),
        temps
    )
}

/// Drive temperatures present in a sample, ordered by bay.
pub fn drive_temperatures(sample: &TelemetrySample) -> Vec<(String, i64)> {
    sample
        .iter()
        .filter_map(|(key, value)| {
            let bay = key.strip_prefix("hdd_")?.strip_suffix("_temperature")?;
            Some((bay.to_string(), value.as_i64()?))
        })
        .collect()
}
