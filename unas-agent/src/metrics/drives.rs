//! Drive bays and SMART attributes
//!
//! Bay numbers come from the ATA port in the kernel device path (`.../ata4/host3/...`) looked
//! up in a per-model table. The table is data: the built-in one covers the UNAS Pro, other
//! models supply `bay_map` in the agent config.

use crate::execution::CommandRunner;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use tracing::{debug, info};
use unas_core::{TelemetrySample, TelemetryValue};

const TB: f64 = 1_099_511_627_776.0;

/// ATA port → bay number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BayTable(BTreeMap<String, String>);

impl BayTable {
    pub fn builtin(model: &str) -> Option<Self> {
        let pairs: &[(&str, &str)] = match model {
            "unas-pro" => &[("1", "6"), ("3", "7"), ("4", "3"), ("5", "5"), ("6", "2"), ("7", "4"), ("8", "1")],
            _ => return None,
        };
        Some(Self(pairs.iter().map(|(p, b)| (p.to_string(), b.to_string())).collect()))
    }

    pub fn from_map(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }

    pub fn bay_for_port(&self, port: &str) -> Option<&str> {
        self.0.get(port).map(String::as_str)
    }
}

/// First `ata<N>` segment of a sysfs device path whose port is in the table.
pub fn bay_from_devpath(table: &BayTable, devpath: &str) -> Option<String> {
    devpath
        .trim()
        .split('/')
        .filter_map(|segment| segment.strip_prefix("ata"))
        .filter(|port| !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()))
        .find_map(|port| table.bay_for_port(port))
        .map(str::to_string)
}

/// `sd?` device names currently present.
pub fn list_devices(dev_dir: &Path) -> BTreeSet<String> {
    let pattern = dev_dir.join("sd?");
    let Ok(paths) = glob::glob(&pattern.to_string_lossy()) else {
        return BTreeSet::new();
    };
    paths
        .filter_map(Result::ok)
        .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
        .collect()
}

/// Device → bay cache, dropped wholesale when the device set changes (hot swap).
pub struct BayMapper {
    table: BayTable,
    cache: HashMap<String, Option<String>>,
    known: BTreeSet<String>,
}

impl BayMapper {
    pub fn new(table: BayTable) -> Self {
        Self { table, cache: HashMap::new(), known: BTreeSet::new() }
    }

    /// Returns true when the cache was invalidated.
    pub fn refresh_devices(&mut self, present: &BTreeSet<String>) -> bool {
        if *present == self.known {
            return false;
        }
        info!("drive set changed: {:?} -> {:?}", self.known, present);
        self.cache.clear();
        self.known = present.clone();
        true
    }

    pub async fn bay(&mut self, runner: &dyn CommandRunner, device: &str) -> Option<String> {
        if let Some(cached) = self.cache.get(device) {
            return cached.clone();
        }
        let dev_path = format!("/dev/{device}");
        let bay = match runner.run("udevadm", &["info", "-q", "path", "-n", &dev_path]).await {
            Ok(out) => bay_from_devpath(&self.table, &out.stdout),
            Err(e) => {
                debug!("udevadm failed for {device}: {e}");
                None
            }
        };
        self.cache.insert(device.to_string(), bay.clone());
        bay
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct SmartReport {
    pub model_name: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    pub firmware_version: Option<String>,
    pub smart_status: Option<SmartStatus>,
    pub temperature: Option<SmartTemperature>,
    pub rotation_rate: Option<u64>,
    pub ata_smart_attributes: Option<AtaAttributes>,
    pub power_on_time: Option<PowerOnTime>,
    pub user_capacity: Option<UserCapacity>,
}

#[derive(Debug, Deserialize)]
pub struct SmartStatus {
    pub passed: bool,
}

#[derive(Debug, Deserialize)]
pub struct SmartTemperature {
    pub current: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct AtaAttributes {
    #[serde(default)]
    pub table: Vec<AtaAttribute>,
}

#[derive(Debug, Deserialize)]
pub struct AtaAttribute {
    #[serde(default)]
    pub name: String,
    pub raw: Option<RawValue>,
}

#[derive(Debug, Deserialize)]
pub struct RawValue {
    pub value: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct PowerOnTime {
    pub hours: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct UserCapacity {
    pub bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DriveReport {
    pub bay: String,
    pub model: String,
    pub serial: String,
    pub firmware: String,
    pub status: &'static str,
    pub temperature: i64,
    pub rpm: Option<u64>,
    pub power_hours: i64,
    pub bad_sectors: i64,
    pub total_size: f64,
}

impl DriveReport {
    /// `None` when the report has no health verdict (device error, unsupported device).
    pub fn from_smart(bay: String, report: SmartReport) -> Option<Self> {
        let passed = report.smart_status?.passed;

        let attribute = |wanted: &str| {
            report.ata_smart_attributes.as_ref().and_then(|attrs| {
                attrs
                    .table
                    .iter()
                    .find(|a| a.name.eq_ignore_ascii_case(wanted))
                    .map(|a| a.raw.as_ref().and_then(|r| r.value).unwrap_or(0))
            })
        };
        let power_hours = attribute("power_on_hours")
            .or_else(|| report.power_on_time.as_ref().and_then(|p| p.hours))
            .unwrap_or(0);
        let bad_sectors = attribute("reallocated_sector_ct").unwrap_or(0);

        let bytes = report.user_capacity.as_ref().and_then(|c| c.bytes).unwrap_or(0);
        let total_size = (bytes as f64 / TB * 100.0).round() / 100.0;

        Some(Self {
            bay,
            model: report
                .model_name
                .or(report.product)
                .unwrap_or_else(|| "Unknown".to_string()),
            serial: report.serial_number.unwrap_or_else(|| "Unknown".to_string()),
            firmware: report.firmware_version.unwrap_or_else(|| "Unknown".to_string()),
            status: if passed { "Optimal" } else { "Warning" },
            temperature: report.temperature.and_then(|t| t.current).unwrap_or(0),
            rpm: report.rotation_rate.filter(|r| *r > 0),
            power_hours,
            bad_sectors,
            total_size,
        })
    }

    pub fn write_into(&self, sample: &mut TelemetrySample) {
        let key = |field: &str| format!("hdd_{}_{}", self.bay, field);
        sample.insert(key("model"), self.model.clone().into());
        sample.insert(key("serial"), self.serial.clone().into());
        sample.insert(key("firmware"), self.firmware.clone().into());
        sample.insert(key("status"), self.status.into());
        sample.insert(key("temperature"), TelemetryValue::Int(self.temperature));
        if let Some(rpm) = self.rpm {
            sample.insert(key("rpm"), rpm.into());
        }
        sample.insert(key("power_hours"), TelemetryValue::Int(self.power_hours));
        sample.insert(key("bad_sectors"), TelemetryValue::Int(self.bad_sectors));
        sample.insert(key("total_size"), TelemetryValue::Float(self.total_size));
    }
}

/// Query every mapped drive. Unmapped devices and failed queries are skipped.
pub async fn collect_drives(
    runner: &dyn CommandRunner,
    mapper: &mut BayMapper,
    devices: &BTreeSet<String>,
) -> Vec<DriveReport> {
    mapper.refresh_devices(devices);
    let mut drives = Vec::new();
    for device in devices {
        let Some(bay) = mapper.bay(runner, device).await else {
            continue;
        };
        let dev_path = format!("/dev/{device}");
        let output = match runner.run("smartctl", &["-a", "-j", &dev_path]).await {
            Ok(out) if !out.stdout.trim().is_empty() => out.stdout,
            Ok(_) => continue,
            Err(e) => {
                debug!("smartctl failed for {device} (bay {bay}): {e}");
                continue;
            }
        };
        let report: SmartReport = match serde_json::from_str(&output) {
            Ok(r) => r,
            Err(e) => {
                debug!("smartctl JSON unreadable for {device} (bay {bay}): {e}");
                continue;
            }
        };
        match DriveReport::from_smart(bay, report) {
            Some(drive) => drives.push(drive),
            None => debug!("no SMART verdict for {device}"),
        }
    }
    drives
}
