//! Fan control role
//!
//! - `HwmonFan`: the `pwm1` / `pwm1_enable` sysfs pair
//! - `TemperatureTracker`: freshest drive temperatures seen on the sensor topics
//! - `FanController`: mode + curve, mode-boundary side effects, one PWM decision per cycle
//! - `FanLoop`: the long-running task wiring bus events and the control interval together

use crate::relay::ControlEvent;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use unas_core::{evaluate, pwm_to_percent, Bus, CurveError, CurveParam, FanCurveConfig, FanMode, TelemetryValue, Topics};

/// `pwm1_enable`: manual duty cycle.
pub const PWM_ENABLE_MANUAL: u8 = 1;
/// `pwm1_enable`: firmware automatic control.
pub const PWM_ENABLE_FIRMWARE: u8 = 2;

pub struct HwmonFan {
    pwm_path: PathBuf,
    enable_path: PathBuf,
}

impl HwmonFan {
    pub fn new(hwmon_dir: &Path) -> Self {
        Self {
            pwm_path: hwmon_dir.join("pwm1"),
            enable_path: hwmon_dir.join("pwm1_enable"),
        }
    }

    pub async fn set_enable(&self, value: u8) -> Result<()> {
        tokio::fs::write(&self.enable_path, value.to_string())
            .await
            .with_context(|| format!("Failed to write {}", self.enable_path.display()))
    }

    pub async fn write_pwm(&self, pwm: u8) -> Result<()> {
        tokio::fs::write(&self.pwm_path, pwm.to_string())
            .await
            .with_context(|| format!("Failed to write {}", self.pwm_path.display()))
    }
}

/// Drive and CPU temperatures with the time they were seen.
pub struct TemperatureTracker {
    readings: HashMap<String, (f64, Instant)>,
    max_age: Duration,
}

impl TemperatureTracker {
    pub fn new(max_age: Duration) -> Self {
        Self { readings: HashMap::new(), max_age }
    }

    fn tracked(key: &str) -> bool {
        key == "cpu_temp"
            || key
                .strip_prefix("hdd_")
                .and_then(|rest| rest.strip_suffix("_temperature"))
                .is_some_and(|bay| !bay.is_empty() && bay.bytes().all(|b| b.is_ascii_digit()))
    }

    pub fn observe(&mut self, key: &str, value: &TelemetryValue, now: Instant) {
        if !Self::tracked(key) {
            return;
        }
        if let Some(temp) = value.as_f64() {
            self.readings.insert(key.to_string(), (temp, now));
        }
    }

    /// Hottest fresh drive; the CPU temperature only when no drive reading is fresh.
    pub fn control_temperature(&self, now: Instant) -> Option<f64> {
        let fresh = |at: &Instant| now.saturating_duration_since(*at) <= self.max_age;
        let hottest_drive = self
            .readings
            .iter()
            .filter(|(key, (_, at))| key.as_str() != "cpu_temp" && fresh(at))
            .map(|(_, (temp, _))| *temp)
            .fold(None, |acc: Option<f64>, t| Some(acc.map_or(t, |a| a.max(t))));
        hottest_drive.or_else(|| {
            self.readings
                .get("cpu_temp")
                .filter(|(_, at)| fresh(at))
                .map(|(temp, _)| *temp)
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Authority {
    /// Startup: nothing written yet.
    Unknown,
    Firmware,
    Agent,
}

pub struct FanController {
    fan: HwmonFan,
    mode: FanMode,
    curve: FanCurveConfig,
    /// Last value received per parameter, in `CurveParam::ALL` order.
    received: [Option<i64>; 4],
    authority: Authority,
}

impl FanController {
    pub fn new(fan: HwmonFan) -> Self {
        Self {
            fan,
            mode: FanMode::default(),
            curve: FanCurveConfig::default(),
            received: [None; 4],
            authority: Authority::Unknown,
        }
    }

    pub fn mode(&self) -> FanMode {
        self.mode
    }

    pub fn curve(&self) -> &FanCurveConfig {
        &self.curve
    }

    /// Last message wins. Returns true when the mode actually changed.
    pub fn set_mode(&mut self, mode: FanMode) -> bool {
        if self.mode == mode {
            return false;
        }
        info!("Fan mode {} -> {}", self.mode, mode);
        self.mode = mode;
        true
    }

    /// Apply one retained curve parameter. The broker replays retained parameters in any
    /// order, so the candidate curve is built from every value received so far and only
    /// applied once the whole set is valid. Until then the previous curve stays active and
    /// the value is held. Out-of-range values are dropped.
    pub fn set_curve_param(&mut self, param: CurveParam, value: i64) -> bool {
        let slot = param as usize;
        let previous = self.received[slot].replace(value);
        let known = CurveParam::ALL
            .into_iter()
            .filter_map(|p| self.received[p as usize].map(|v| (p, v)));
        match FanCurveConfig::from_params(known) {
            Ok(curve) => {
                self.curve = curve;
                debug!("Curve {} = {} ({})", param, value, self.curve.summary());
                true
            }
            Err(e @ CurveError::OutOfRange { .. }) => {
                self.received[slot] = previous;
                warn!("Rejected curve update {}={}: {}", param, value, e);
                false
            }
            Err(e) => {
                debug!("Curve update {}={} held until the set is consistent: {}", param, value, e);
                false
            }
        }
    }

    /// One control cycle. Returns the PWM written, `None` when firmware has control.
    pub async fn tick(&mut self, temperature: Option<f64>) -> Result<Option<u8>> {
        let target = match (self.mode, temperature) {
            (FanMode::Managed, _) => None,
            (FanMode::CustomCurve, None) => {
                warn!("No fresh temperature, failing safe to max_fan {}", self.curve.max_fan);
                Some(self.curve.max_fan)
            }
            (mode, temp) => evaluate(mode, &self.curve, temp.unwrap_or_default()),
        };

        let Some(pwm) = target else {
            if self.authority != Authority::Firmware {
                self.fan.set_enable(PWM_ENABLE_FIRMWARE).await?;
                self.authority = Authority::Firmware;
                info!("Fan control handed back to firmware");
            }
            return Ok(None);
        };

        if self.authority != Authority::Agent {
            self.fan.set_enable(PWM_ENABLE_MANUAL).await?;
            self.authority = Authority::Agent;
            info!("Fan control taken from firmware");
        }
        self.fan.write_pwm(pwm).await?;
        Ok(Some(pwm))
    }
}

/// Give control back to firmware unconditionally (shutdown path).
pub async fn release_to_firmware(hwmon_dir: &Path) {
    match HwmonFan::new(hwmon_dir).set_enable(PWM_ENABLE_FIRMWARE).await {
        Ok(()) => info!("Fan handed back to firmware"),
        Err(e) => error!("Could not hand fan back to firmware: {e:#}"),
    }
}

pub struct FanLoop {
    controller: FanController,
    tracker: TemperatureTracker,
    bus: Arc<dyn Bus>,
    topics: Topics,
    interval: Duration,
}

impl FanLoop {
    pub fn new(
        controller: FanController,
        tracker: TemperatureTracker,
        bus: Arc<dyn Bus>,
        topics: Topics,
        interval: Duration,
    ) -> Self {
        Self { controller, tracker, bus, topics, interval }
    }

    /// Apply an event. Returns true when the fan should be re-evaluated right away.
    pub fn handle(&mut self, event: ControlEvent) -> bool {
        match event {
            ControlEvent::Mode(mode) => self.controller.set_mode(mode),
            ControlEvent::Curve(param, value) => {
                self.controller.set_curve_param(param, value) && self.controller.mode() == FanMode::CustomCurve
            }
            ControlEvent::Reading(key, value) => {
                self.tracker.observe(&key, &value, Instant::now());
                false
            }
            ControlEvent::Interval(_) => false,
        }
    }

    /// Evaluate and echo the result so every consumer converges on the applied speed.
    pub async fn cycle(&mut self) {
        let temperature = self.tracker.control_temperature(Instant::now());
        match self.controller.tick(temperature).await {
            Ok(Some(pwm)) => {
                debug!("PWM {} at {:?}°C ({})", pwm, temperature, self.controller.mode());
                self.echo(pwm).await;
            }
            Ok(None) => {}
            Err(e) => error!("Fan control cycle failed: {e:#}"),
        }
    }

    async fn echo(&self, pwm: u8) {
        let pairs = [("fan_speed", pwm), ("fan_speed_percent", pwm_to_percent(pwm))];
        for (key, value) in pairs {
            if let Err(e) = self.bus.publish(&self.topics.sensor_state(key), value.to_string(), true).await {
                warn!("Echo of {key} failed: {e}");
            }
        }
    }

    pub async fn run(mut self, mut events: mpsc::Receiver<ControlEvent>) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Fan control loop started (every {:?})", self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.cycle().await,
                event = events.recv() => {
                    let Some(event) = event else { break };
                    if self.handle(event) {
                        self.cycle().await;
                    }
                }
            }
        }
        info!("Fan control loop stopped");
    }

    #[cfg(test)]
    pub fn controller(&self) -> &FanController {
        &self.controller
    }
}
