//! Bus topic layout
//!
//! All topics hang off one namespace (default `homeassistant/unas`):
//! - `<ns>/sensor/<metric_key>/state` telemetry, retained
//! - `<ns>/fan_curve/<param>` curve calibration points, retained
//! - `<ns>/fan_mode` mode / fixed PWM target, retained
//! - `<ns>/status` agent liveness, retained + last will
//! - `<ns>/monitor_interval` poll interval override in seconds

use crate::fan::CurveParam;
use std::time::Duration;

pub const DEFAULT_NAMESPACE: &str = "homeassistant/unas";

pub const STATUS_ONLINE: &str = "online";
pub const STATUS_OFFLINE: &str = "offline";

/// Accepted range for `<ns>/monitor_interval`, in seconds.
pub const MONITOR_INTERVAL_RANGE: std::ops::RangeInclusive<u64> = 5..=60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    ns: String,
}

/// Classification of a topic received under the namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound<'a> {
    Sensor(&'a str),
    FanCurve(CurveParam),
    FanMode,
    Status,
    MonitorInterval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Online,
    Offline,
}

impl Liveness {
    pub fn parse(payload: &str) -> Option<Self> {
        match payload.trim() {
            STATUS_ONLINE => Some(Self::Online),
            STATUS_OFFLINE => Some(Self::Offline),
            _ => None,
        }
    }

    pub fn as_payload(&self) -> &'static str {
        match self {
            Self::Online => STATUS_ONLINE,
            Self::Offline => STATUS_OFFLINE,
        }
    }
}

impl Default for Topics {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}

impl Topics {
    pub fn new(ns: &str) -> Self {
        Self { ns: ns.trim_end_matches('/').to_string() }
    }

    pub fn namespace(&self) -> &str {
        &self.ns
    }

    pub fn sensor_state(&self, metric_key: &str) -> String {
        format!("{}/sensor/{}/state", self.ns, metric_key)
    }

    pub fn sensor_filter(&self) -> String {
        format!("{}/sensor/+/state", self.ns)
    }

    pub fn fan_curve(&self, param: CurveParam) -> String {
        format!("{}/fan_curve/{}", self.ns, param.as_str())
    }

    pub fn fan_curve_filter(&self) -> String {
        format!("{}/fan_curve/+", self.ns)
    }

    pub fn fan_mode(&self) -> String {
        format!("{}/fan_mode", self.ns)
    }

    pub fn status(&self) -> String {
        format!("{}/status", self.ns)
    }

    pub fn monitor_interval(&self) -> String {
        format!("{}/monitor_interval", self.ns)
    }

    /// Classify an inbound topic. Unknown shapes (foreign namespaces, unknown curve
    /// parameters, config topics) return `None`.
    pub fn classify<'a>(&self, topic: &'a str) -> Option<Inbound<'a>> {
        let rest = topic.strip_prefix(self.ns.as_str())?.strip_prefix('/')?;
        let parts: Vec<&'a str> = rest.split('/').collect();
        match parts.as_slice() {
            ["sensor", key, "state"] if !key.is_empty() => Some(Inbound::Sensor(*key)),
            ["fan_curve", param] => param.parse().ok().map(Inbound::FanCurve),
            ["fan_mode"] => Some(Inbound::FanMode),
            ["status"] => Some(Inbound::Status),
            ["monitor_interval"] => Some(Inbound::MonitorInterval),
            _ => None,
        }
    }
}

/// Parse a `monitor_interval` payload. Out-of-range or non-numeric payloads yield `None`
/// and the caller keeps its previous interval.
pub fn parse_monitor_interval(payload: &str) -> Option<Duration> {
    let secs = payload.trim().parse::<u64>().ok()?;
    MONITOR_INTERVAL_RANGE
        .contains(&secs)
        .then(|| Duration::from_secs(secs))
}
