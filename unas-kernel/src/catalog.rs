//! Sensor catalog: what each metric key means to a dashboard
//!
//! System sensors exist from the start. Drive-bay and pool sensors are stamped out per
//! discovered unit from the suffix tables below.

use serde::Serialize;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Temperature,
    DataSize,
    DataRate,
    Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StateClass {
    Measurement,
    TotalIncreasing,
}

/// Static description of one sensor shape.
#[derive(Debug, Clone, Copy)]
pub struct SensorSpec {
    pub key: &'static str,
    pub name: &'static str,
    pub unit: Option<&'static str>,
    pub device_class: Option<DeviceClass>,
    pub state_class: Option<StateClass>,
    pub icon: Option<&'static str>,
}

const fn spec(
    key: &'static str,
    name: &'static str,
    unit: Option<&'static str>,
    device_class: Option<DeviceClass>,
    state_class: Option<StateClass>,
    icon: Option<&'static str>,
) -> SensorSpec {
    SensorSpec { key, name, unit, device_class, state_class, icon }
}

use DeviceClass::*;
use StateClass::*;

pub const SYSTEM_SENSORS: &[SensorSpec] = &[
    spec("cpu_temp", "CPU Temperature", Some("°C"), Some(Temperature), Some(Measurement), None),
    spec("cpu_usage", "CPU Usage", Some("%"), None, Some(Measurement), Some("mdi:chip")),
    spec("fan_speed", "Fan Speed (PWM)", None, None, Some(Measurement), Some("mdi:fan")),
    spec("fan_speed_percent", "Fan Speed", Some("%"), None, Some(Measurement), Some("mdi:fan")),
    spec("memory_usage", "Memory Usage", Some("%"), None, Some(Measurement), Some("mdi:memory")),
    spec("memory_used", "Memory Used", Some("MB"), Some(DataSize), Some(Measurement), None),
    spec("memory_total", "Memory Total", Some("MB"), Some(DataSize), None, None),
    spec("uptime", "Uptime", Some("s"), Some(Duration), Some(TotalIncreasing), None),
    spec("os_version", "UniFi OS Version", None, None, None, Some("mdi:information")),
    spec("drive_version", "UniFi Drive Version", None, None, None, Some("mdi:information")),
    spec("disk_read_speed", "Disk Read Speed", Some("MB/s"), Some(DataRate), Some(Measurement), None),
    spec("disk_write_speed", "Disk Write Speed", Some("MB/s"), Some(DataRate), Some(Measurement), None),
];

/// Per bay, keyed `hdd_<bay>_<suffix>`.
pub const DRIVE_SENSORS: &[SensorSpec] = &[
    spec("temperature", "Temperature", Some("°C"), Some(Temperature), Some(Measurement), None),
    spec("model", "Model", None, None, None, Some("mdi:harddisk")),
    spec("serial", "Serial Number", None, None, None, Some("mdi:identifier")),
    spec("rpm", "RPM", Some("rpm"), None, None, Some("mdi:speedometer")),
    spec("firmware", "Firmware", None, None, None, Some("mdi:information")),
    spec("status", "Status", None, None, None, Some("mdi:check-circle")),
    spec("total_size", "Total Size", Some("TB"), Some(DataSize), None, None),
    spec("power_hours", "Power-On Hours", Some("h"), Some(Duration), Some(TotalIncreasing), None),
    spec("bad_sectors", "Bad Sectors", None, None, None, Some("mdi:alert-circle")),
];

/// Per pool, keyed `pool<n>_<suffix>`.
pub const POOL_SENSORS: &[SensorSpec] = &[
    spec("usage", "Usage", Some("%"), None, Some(Measurement), Some("mdi:harddisk")),
    spec("size", "Size", Some("GB"), Some(DataSize), None, None),
    spec("used", "Used", Some("GB"), Some(DataSize), Some(Measurement), None),
    spec("available", "Available", Some("GB"), Some(DataSize), Some(Measurement), None),
];

/// A registered sensor entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityDescriptor {
    pub key: String,
    pub name: String,
    /// `system`, `hdd_<bay>` or `pool<n>`
    pub group: String,
    pub unit: Option<&'static str>,
    pub device_class: Option<DeviceClass>,
    pub state_class: Option<StateClass>,
    pub icon: Option<&'static str>,
}

impl EntityDescriptor {
    fn from_spec(spec: &SensorSpec, key: String, name: String, group: &str) -> Self {
        Self {
            key,
            name,
            group: group.to_string(),
            unit: spec.unit,
            device_class: spec.device_class,
            state_class: spec.state_class,
            icon: spec.icon,
        }
    }
}

pub fn system_entities() -> Vec<EntityDescriptor> {
    SYSTEM_SENSORS
        .iter()
        .map(|s| EntityDescriptor::from_spec(s, s.key.to_string(), format!("UNAS {}", s.name), "system"))
        .collect()
}

pub fn drive_entities(bay: &str) -> Vec<EntityDescriptor> {
    let group = format!("hdd_{bay}");
    DRIVE_SENSORS
        .iter()
        .map(|s| EntityDescriptor::from_spec(s, format!("{group}_{}", s.key), format!("HDD {bay} {}", s.name), &group))
        .collect()
}

pub fn pool_entities(number: &str) -> Vec<EntityDescriptor> {
    let group = format!("pool{number}");
    POOL_SENSORS
        .iter()
        .map(|s| {
            EntityDescriptor::from_spec(s, format!("{group}_{}", s.key), format!("Storage Pool {number} {}", s.name), &group)
        })
        .collect()
}

/// Append-only entity list; a key is registered at most once.
#[derive(Debug, Default)]
pub struct EntityRegistry {
    entities: Vec<EntityDescriptor>,
    keys: HashSet<String>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns how many entities were actually new.
    pub fn extend(&mut self, entities: impl IntoIterator<Item = EntityDescriptor>) -> usize {
        let before = self.entities.len();
        for entity in entities {
            if self.keys.insert(entity.key.clone()) {
                self.entities.push(entity);
            }
        }
        self.entities.len() - before
    }

    pub fn list(&self) -> Vec<EntityDescriptor> {
        self.entities.clone()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drive_entities_for_bay() {
        let entities = drive_entities("3");
        assert_eq!(entities.len(), DRIVE_SENSORS.len());
        let temp = &entities[0];
        assert_eq!(temp.key, "hdd_3_temperature");
        assert_eq!(temp.name, "HDD 3 Temperature");
        assert_eq!(temp.group, "hdd_3");
        assert_eq!(temp.device_class, Some(DeviceClass::Temperature));
        assert!(entities.iter().any(|e| e.key == "hdd_3_power_hours" && e.unit == Some("h")));
    }

    #[test]
    fn test_pool_and_system_keys_match_agent_metrics() {
        let keys: Vec<String> = pool_entities("1").into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec!["pool1_usage", "pool1_size", "pool1_used", "pool1_available"]);
        assert!(system_entities().iter().any(|e| e.key == "fan_speed_percent"));
    }

    #[test]
    fn test_registry_is_append_only() {
        let mut registry = EntityRegistry::new();
        assert_eq!(registry.len(), 0);
        assert_eq!(registry.extend(drive_entities("1")), DRIVE_SENSORS.len());
        assert_eq!(registry.extend(drive_entities("1")), 0);
        assert_eq!(registry.extend(pool_entities("1")), POOL_SENSORS.len());
        assert_eq!(registry.len(), DRIVE_SENSORS.len() + POOL_SENSORS.len());
        assert_eq!(registry.list()[0].key, "hdd_1_temperature");
    }
}
