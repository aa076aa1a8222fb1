//! Fan control writes
//!
//! The kernel never drives the fan itself: it publishes retained control messages and the
//! fan-control agent converges on them. Every write is validated here against the curve
//! currently retained on the bus, and refused while the agent is unavailable.

use crate::cache::StateCache;
use crate::deploy::FAN_SERVICE;
use crate::remote::service_active;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};
use unas_core::fan::DEFAULT_FIXED_PWM;
use unas_core::{
    percent_to_pwm, pwm_to_percent, Bus, BusError, CurveError, CurveParam, FanCurveConfig, FanMode, RemoteShell,
    Topics,
};

/// Grace window for retained curve values to arrive before defaults are seeded.
pub const SEED_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("agent is unavailable")]
    Unavailable,
    #[error("{param} must be within {low}..={high}, got {value}")]
    OutOfBounds { param: CurveParam, value: i64, low: i64, high: i64 },
    #[error(transparent)]
    Curve(#[from] CurveError),
    #[error("fan speed can only be set in fixed speed mode (current: {0})")]
    NotFixedSpeed(String),
    #[error("fan speed percent must be within 0..=100, got {0}")]
    InvalidPercent(f64),
    #[error(transparent)]
    Bus(#[from] BusError),
}

impl ControlError {
    /// Caller error, as opposed to a system state problem.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::OutOfBounds { .. } | Self::Curve(_) | Self::NotFixedSpeed(_) | Self::InvalidPercent(_)
        )
    }
}

/// Slider bounds offered to users; stricter than what the agent accepts.
pub fn presentation_bounds(param: CurveParam) -> (i64, i64) {
    match param {
        CurveParam::MinTemp => (30, 50),
        CurveParam::MaxTemp => (45, 60),
        CurveParam::MinFan | CurveParam::MaxFan => (0, 255),
    }
}

/// Mode selection as requested by a user. `FixedSpeed` without a PWM keeps the current speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ModeRequest {
    Managed,
    CustomCurve,
    FixedSpeed { pwm: Option<u8> },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FanView {
    pub available: bool,
    pub mode: Option<FanMode>,
    pub speed_pwm: Option<i64>,
    pub speed_percent: Option<u8>,
    pub curve: FanCurveConfig,
    /// True once all four parameters have been seen on the bus.
    pub curve_synced: bool,
    pub summary: String,
    pub points: Vec<(i32, u8)>,
}

#[derive(Clone)]
pub struct FanControlWriter {
    bus: Arc<dyn Bus>,
    shell: Arc<dyn RemoteShell>,
    cache: StateCache,
    topics: Topics,
}

impl FanControlWriter {
    pub fn new(bus: Arc<dyn Bus>, shell: Arc<dyn RemoteShell>, cache: StateCache, topics: Topics) -> Self {
        Self { bus, shell, cache, topics }
    }

    fn ensure_available(&self) -> Result<(), ControlError> {
        if self.cache.is_available() {
            Ok(())
        } else {
            Err(ControlError::Unavailable)
        }
    }

    fn current_pwm(&self) -> Option<i64> {
        self.cache.get("fan_speed").and_then(|v| v.as_i64())
    }

    pub async fn set_curve_param(&self, param: CurveParam, value: i64) -> Result<FanCurveConfig, ControlError> {
        self.ensure_available()?;
        let (low, high) = presentation_bounds(param);
        if !(low..=high).contains(&value) {
            return Err(ControlError::OutOfBounds { param, value, low, high });
        }
        let next = self.cache.curve().with_param(param, value)?;
        self.bus.publish(&self.topics.fan_curve(param), value.to_string(), true).await?;
        info!("Fan curve {} = {} ({})", param, value, next.summary());
        Ok(next)
    }

    pub async fn set_mode(&self, request: ModeRequest) -> Result<FanMode, ControlError> {
        self.ensure_available()?;
        self.ensure_fan_service().await;
        let mode = match request {
            ModeRequest::Managed => FanMode::Managed,
            ModeRequest::CustomCurve => FanMode::CustomCurve,
            ModeRequest::FixedSpeed { pwm: Some(pwm) } => FanMode::FixedSpeed(pwm),
            ModeRequest::FixedSpeed { pwm: None } => FanMode::FixedSpeed(
                self.current_pwm()
                    .and_then(|v| u8::try_from(v).ok())
                    .unwrap_or(DEFAULT_FIXED_PWM),
            ),
        };
        self.bus.publish(&self.topics.fan_mode(), mode.as_payload(), true).await?;
        info!("Fan mode set to {}", mode);
        Ok(mode)
    }

    pub async fn set_speed_percent(&self, percent: f64) -> Result<u8, ControlError> {
        self.ensure_available()?;
        if !(0.0..=100.0).contains(&percent) {
            return Err(ControlError::InvalidPercent(percent));
        }
        match self.cache.fan_mode() {
            Some(FanMode::FixedSpeed(_)) => {}
            other => {
                let current = other.map(|m| m.to_string()).unwrap_or_else(|| "unknown".to_string());
                return Err(ControlError::NotFixedSpeed(current));
            }
        }
        let pwm = percent_to_pwm(percent);
        self.bus.publish(&self.topics.fan_mode(), pwm.to_string(), true).await?;
        info!("Fan speed set to {}% (PWM {})", percent, pwm);
        Ok(pwm)
    }

    /// Best effort: a stopped fan service would ignore the mode we are about to publish.
    async fn ensure_fan_service(&self) {
        match service_active(self.shell.as_ref(), FAN_SERVICE).await {
            Ok(true) => {}
            Ok(false) => {
                warn!("{} not running, starting it", FAN_SERVICE);
                if let Err(e) = self.shell.run(&format!("systemctl start {FAN_SERVICE}")).await {
                    error!("Failed to start {}: {}", FAN_SERVICE, e);
                }
            }
            Err(e) => error!("Cannot check {}: {}", FAN_SERVICE, e),
        }
    }

    pub fn view(&self) -> FanView {
        let curve = self.cache.curve();
        let speed_pwm = self.current_pwm();
        FanView {
            available: self.cache.is_available(),
            mode: self.cache.fan_mode(),
            speed_pwm,
            speed_percent: speed_pwm.and_then(|v| u8::try_from(v).ok()).map(pwm_to_percent),
            curve_synced: CurveParam::ALL.iter().all(|p| self.cache.has_curve_param(*p)),
            summary: curve.summary(),
            points: curve.curve_points(),
            curve,
        }
    }
}

/// After `grace`, publish the default of every curve parameter the broker had no
/// retained value for. Resolves to the parameters seeded.
pub fn spawn_seed_defaults(
    bus: Arc<dyn Bus>,
    cache: StateCache,
    topics: Topics,
    grace: Duration,
) -> tokio::task::JoinHandle<Vec<CurveParam>> {
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        let mut seeded = Vec::new();
        for param in CurveParam::ALL {
            if cache.has_curve_param(param) {
                continue;
            }
            let value = param.default_value();
            match bus.publish(&topics.fan_curve(param), value.to_string(), true).await {
                Ok(()) => {
                    info!("Fan curve {} initialised to default {}", param, value);
                    seeded.push(param);
                }
                Err(e) => error!("Failed to seed fan curve {}: {}", param, e),
            }
        }
        seeded
    })
}
