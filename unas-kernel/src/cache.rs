//! State cache
//!
//! Latest value per metric key as delivered by the bus, plus the two inputs of the
//! availability predicate (liveness flag, time of the last telemetry write).
//! Only the writer task spawned by `spawn_cache_writer` mutates it; everyone else reads
//! owned snapshots.

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};
use unas_core::{CurveParam, FanCurveConfig, FanMode, Inbound, Liveness, TelemetrySample, TelemetryValue, Topics};

/// Max age of the last telemetry write for the agent to count as available.
pub const FRESHNESS: Duration = Duration::from_secs(120);

pub const FAN_MODE_KEY: &str = "fan_mode";

pub fn curve_key(param: CurveParam) -> String {
    format!("fan_curve_{}", param.as_str())
}

/// One bus delivery, already classified.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    Telemetry { key: String, raw: String },
    /// Retained control state (curve, mode): stored, but never counts as a sign of life.
    Control { key: String, raw: String },
    Liveness(Liveness),
}

impl CacheEvent {
    pub fn from_publish(topics: &Topics, topic: &str, payload: &str) -> Option<Self> {
        match topics.classify(topic)? {
            Inbound::Sensor(key) => Some(Self::Telemetry { key: key.to_string(), raw: payload.to_string() }),
            Inbound::FanCurve(param) => Some(Self::Control { key: curve_key(param), raw: payload.to_string() }),
            Inbound::FanMode => Some(Self::Control { key: FAN_MODE_KEY.to_string(), raw: payload.to_string() }),
            Inbound::Status => {
                let liveness = Liveness::parse(payload);
                if liveness.is_none() {
                    warn!("Ignoring liveness payload '{}'", payload);
                }
                liveness.map(Self::Liveness)
            }
            Inbound::MonitorInterval => None,
        }
    }
}

#[derive(Default)]
struct CacheInner {
    values: TelemetrySample,
    liveness: Option<Liveness>,
    last_telemetry: Option<Instant>,
}

#[derive(Clone)]
pub struct StateCache {
    inner: Arc<RwLock<CacheInner>>,
    freshness: Duration,
}

impl Default for StateCache {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCache {
    pub fn new() -> Self {
        Self::with_freshness(FRESHNESS)
    }

    pub fn with_freshness(freshness: Duration) -> Self {
        Self { inner: Arc::new(RwLock::new(CacheInner::default())), freshness }
    }

    /// Store a telemetry payload and mark the agent as recently heard from.
    pub fn put(&self, key: &str, raw: &str) {
        let value = TelemetryValue::parse_raw(raw);
        let mut inner = self.inner.write();
        inner.values.insert(key.to_string(), value);
        inner.last_telemetry = Some(Instant::now());
    }

    pub fn put_control(&self, key: &str, raw: &str) {
        self.inner.write().values.insert(key.to_string(), TelemetryValue::parse_raw(raw));
    }

    pub fn set_liveness(&self, liveness: Liveness) {
        self.inner.write().liveness = Some(liveness);
    }

    pub fn apply(&self, event: CacheEvent) {
        match event {
            CacheEvent::Telemetry { key, raw } => self.put(&key, &raw),
            CacheEvent::Control { key, raw } => self.put_control(&key, &raw),
            CacheEvent::Liveness(liveness) => {
                debug!("Agent liveness: {}", liveness.as_payload());
                self.set_liveness(liveness);
            }
        }
    }

    /// Owned copy of every key, telemetry and control alike.
    pub fn snapshot(&self) -> TelemetrySample {
        self.inner.read().values.clone()
    }

    pub fn get(&self, key: &str) -> Option<TelemetryValue> {
        self.inner.read().values.get(key).cloned()
    }

    pub fn liveness(&self) -> Option<Liveness> {
        self.inner.read().liveness
    }

    pub fn is_available(&self) -> bool {
        self.is_available_at(Instant::now())
    }

    pub fn is_available_at(&self, now: Instant) -> bool {
        let inner = self.inner.read();
        inner.liveness == Some(Liveness::Online)
            && inner
                .last_telemetry
                .is_some_and(|at| now.saturating_duration_since(at) <= self.freshness)
    }

    pub fn has_curve_param(&self, param: CurveParam) -> bool {
        self.inner.read().values.contains_key(&curve_key(param))
    }

    /// Curve as currently retained on the bus, defaults for parameters not seen yet.
    /// Not validated: it is whatever the broker holds.
    pub fn curve(&self) -> FanCurveConfig {
        let inner = self.inner.read();
        let raw = |param: CurveParam| inner.values.get(&curve_key(param)).and_then(TelemetryValue::as_i64);
        let defaults = FanCurveConfig::default();
        FanCurveConfig {
            min_temp: raw(CurveParam::MinTemp)
                .and_then(|v| i32::try_from(v).ok())
                .unwrap_or(defaults.min_temp),
            max_temp: raw(CurveParam::MaxTemp)
                .and_then(|v| i32::try_from(v).ok())
                .unwrap_or(defaults.max_temp),
            min_fan: raw(CurveParam::MinFan)
                .and_then(|v| u8::try_from(v).ok())
                .unwrap_or(defaults.min_fan),
            max_fan: raw(CurveParam::MaxFan)
                .and_then(|v| u8::try_from(v).ok())
                .unwrap_or(defaults.max_fan),
        }
    }

    pub fn fan_mode(&self) -> Option<FanMode> {
        let value = self.get(FAN_MODE_KEY)?;
        value.to_string().parse().ok()
    }
}

/// The single writer: applies events in delivery order until every sender is gone.
pub fn spawn_cache_writer(cache: StateCache, mut events: mpsc::Receiver<CacheEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            cache.apply(event);
        }
        debug!("Cache writer stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use unas_core::evaluate;
    use unas_devkit::fixtures::curve_messages;

    #[test]
    fn test_put_parses_like_the_bus_contract() {
        let cache = StateCache::new();
        cache.put("cpu_temp", "51");
        cache.put("disk_read_speed", "1.25");
        cache.put("hdd_1_status", "Optimal");
        cache.put("os_version", "4.1.13");

        let snap = cache.snapshot();
        assert_eq!(snap["cpu_temp"], TelemetryValue::Int(51));
        assert_eq!(snap["disk_read_speed"], TelemetryValue::Float(1.25));
        assert_eq!(snap["hdd_1_status"], TelemetryValue::Text("Optimal".into()));
        assert_eq!(snap["os_version"], TelemetryValue::Text("4.1.13".into()));
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let cache = StateCache::new();
        cache.put("cpu_temp", "51");
        let mut snap = cache.snapshot();
        snap.insert("cpu_temp".into(), TelemetryValue::Int(99));
        snap.clear();
        assert_eq!(cache.get("cpu_temp"), Some(TelemetryValue::Int(51)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_availability_needs_liveness_and_recency() {
        let cache = StateCache::new();
        cache.put("cpu_temp", "51");
        // telemetry alone is not enough
        assert!(!cache.is_available());

        cache.set_liveness(Liveness::Online);
        assert!(cache.is_available());

        tokio::time::advance(Duration::from_secs(120)).await;
        assert!(cache.is_available());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!cache.is_available());

        // retained control traffic does not revive a silent agent
        cache.put_control(&curve_key(CurveParam::MinTemp), "43");
        assert!(!cache.is_available());

        cache.put("cpu_temp", "52");
        assert!(cache.is_available());
        cache.set_liveness(Liveness::Offline);
        assert!(!cache.is_available());
    }

    #[test]
    fn test_online_without_telemetry_is_unavailable() {
        let cache = StateCache::new();
        cache.set_liveness(Liveness::Online);
        assert!(!cache.is_available());
    }

    #[test]
    fn test_from_publish() {
        let t = Topics::default();
        assert_eq!(
            CacheEvent::from_publish(&t, "homeassistant/unas/sensor/cpu_temp/state", "51"),
            Some(CacheEvent::Telemetry { key: "cpu_temp".into(), raw: "51".into() })
        );
        assert_eq!(
            CacheEvent::from_publish(&t, "homeassistant/unas/fan_curve/max_fan", "255"),
            Some(CacheEvent::Control { key: "fan_curve_max_fan".into(), raw: "255".into() })
        );
        assert_eq!(
            CacheEvent::from_publish(&t, "homeassistant/unas/status", "online"),
            Some(CacheEvent::Liveness(Liveness::Online))
        );
        assert_eq!(CacheEvent::from_publish(&t, "homeassistant/unas/status", "sleepy"), None);
        assert_eq!(CacheEvent::from_publish(&t, "homeassistant/unas/monitor_interval", "10"), None);
    }

    #[tokio::test]
    async fn test_writer_applies_in_order() {
        let cache = StateCache::new();
        let (tx, rx) = mpsc::channel(16);
        let writer = spawn_cache_writer(cache.clone(), rx);
        for raw in ["40", "41", "42"] {
            tx.send(CacheEvent::Telemetry { key: "cpu_temp".into(), raw: raw.into() }).await.unwrap();
        }
        tx.send(CacheEvent::Liveness(Liveness::Online)).await.unwrap();
        drop(tx);
        writer.await.unwrap();

        assert_eq!(cache.get("cpu_temp"), Some(TelemetryValue::Int(42)));
        assert_eq!(cache.liveness(), Some(Liveness::Online));
    }

    #[test]
    fn test_retained_curve_and_mode_drive_evaluation() {
        let t = Topics::default();
        let cache = StateCache::new();
        let curve = FanCurveConfig { min_temp: 43, max_temp: 47, min_fan: 204, max_fan: 255 };
        for (topic, payload) in curve_messages(&t, &curve) {
            cache.apply(CacheEvent::from_publish(&t, &topic, &payload).unwrap());
        }
        cache.apply(CacheEvent::from_publish(&t, "homeassistant/unas/fan_mode", "auto").unwrap());

        assert_eq!(cache.curve(), curve);
        let mode = cache.fan_mode().unwrap();
        assert_eq!(mode, FanMode::CustomCurve);
        assert_eq!(evaluate(mode, &cache.curve(), 45.0), Some(229));
    }

    #[test]
    fn test_curve_defaults_for_missing_params() {
        let cache = StateCache::new();
        cache.put_control("fan_curve_max_temp", "55");
        cache.put_control("fan_curve_min_fan", "9999");
        let curve = cache.curve();
        assert_eq!(curve.max_temp, 55);
        assert_eq!(curve.min_temp, 43);
        assert_eq!(curve.min_fan, 204);
        assert!(cache.has_curve_param(CurveParam::MaxTemp));
        assert!(!cache.has_curve_param(CurveParam::MinTemp));
        assert_eq!(cache.fan_mode(), None);
    }
}
