//! Fan mode, fan curve and the curve evaluation
//!
//! The control loop is a pure function of (mode, curve, temperature): nothing accumulates
//! between cycles, so a missed cycle heals on the next one.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const PWM_MAX: u8 = 255;

/// Payload selecting firmware-managed cooling.
pub const MODE_MANAGED: &str = "unas_managed";
/// Payload selecting the custom curve.
pub const MODE_CUSTOM_CURVE: &str = "auto";

/// Fixed PWM used when a fixed-speed mode is requested without a known speed (50%).
pub const DEFAULT_FIXED_PWM: u8 = 128;

/// Accepted temperature range for curve points, °C.
pub const TEMP_LIMITS: std::ops::RangeInclusive<i64> = 0..=100;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CurveError {
    #[error("max_temp ({max}) must be greater than min_temp ({min})")]
    InvertedTemps { min: i32, max: i32 },
    #[error("max_fan ({max}) must be at least min_fan ({min})")]
    InvertedFans { min: u8, max: u8 },
    #[error("{param} value {value} is outside {low}..={high}")]
    OutOfRange { param: CurveParam, value: i64, low: i64, high: i64 },
    #[error("unknown fan curve parameter '{0}'")]
    UnknownParam(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FanModeError {
    #[error("fan mode payload '{0}' is neither a mode nor a PWM value")]
    Unrecognized(String),
    #[error("fixed PWM {0} is outside 0..=255")]
    PwmOutOfRange(i64),
}

/// Active fan control mode. Exactly one is active; the last control message wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "mode", content = "pwm", rename_all = "snake_case")]
pub enum FanMode {
    /// Cooling handed back to the appliance firmware.
    #[default]
    Managed,
    CustomCurve,
    FixedSpeed(u8),
}

impl FanMode {
    pub fn as_payload(&self) -> String {
        match self {
            Self::Managed => MODE_MANAGED.to_string(),
            Self::CustomCurve => MODE_CUSTOM_CURVE.to_string(),
            Self::FixedSpeed(pwm) => pwm.to_string(),
        }
    }
}

impl FromStr for FanMode {
    type Err = FanModeError;

    fn from_str(payload: &str) -> Result<Self, Self::Err> {
        let trimmed = payload.trim();
        match trimmed {
            MODE_MANAGED => Ok(Self::Managed),
            MODE_CUSTOM_CURVE => Ok(Self::CustomCurve),
            digits if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) => {
                let value: i64 = digits
                    .parse()
                    .map_err(|_| FanModeError::PwmOutOfRange(i64::MAX))?;
                u8::try_from(value)
                    .map(Self::FixedSpeed)
                    .map_err(|_| FanModeError::PwmOutOfRange(value))
            }
            _ => Err(FanModeError::Unrecognized(payload.to_string())),
        }
    }
}

impl fmt::Display for FanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_payload())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CurveParam {
    MinTemp,
    MaxTemp,
    MinFan,
    MaxFan,
}

impl CurveParam {
    pub const ALL: [CurveParam; 4] = [Self::MinTemp, Self::MaxTemp, Self::MinFan, Self::MaxFan];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MinTemp => "min_temp",
            Self::MaxTemp => "max_temp",
            Self::MinFan => "min_fan",
            Self::MaxFan => "max_fan",
        }
    }

    pub fn default_value(&self) -> i64 {
        let defaults = FanCurveConfig::default();
        defaults.get(*self)
    }

    fn limits(&self) -> std::ops::RangeInclusive<i64> {
        match self {
            Self::MinTemp | Self::MaxTemp => TEMP_LIMITS,
            Self::MinFan | Self::MaxFan => 0..=i64::from(PWM_MAX),
        }
    }
}

impl fmt::Display for CurveParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CurveParam {
    type Err = CurveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| CurveError::UnknownParam(s.to_string()))
    }
}

/// Linear fan curve between two calibration points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanCurveConfig {
    pub min_temp: i32,
    pub max_temp: i32,
    pub min_fan: u8,
    pub max_fan: u8,
}

impl Default for FanCurveConfig {
    fn default() -> Self {
        Self {
            min_temp: 43,
            max_temp: 47,
            min_fan: 204,
            max_fan: 255,
        }
    }
}

impl FanCurveConfig {
    pub fn validate(&self) -> Result<(), CurveError> {
        if self.max_temp <= self.min_temp {
            return Err(CurveError::InvertedTemps { min: self.min_temp, max: self.max_temp });
        }
        if self.max_fan < self.min_fan {
            return Err(CurveError::InvertedFans { min: self.min_fan, max: self.max_fan });
        }
        Ok(())
    }

    pub fn get(&self, param: CurveParam) -> i64 {
        match param {
            CurveParam::MinTemp => self.min_temp.into(),
            CurveParam::MaxTemp => self.max_temp.into(),
            CurveParam::MinFan => self.min_fan.into(),
            CurveParam::MaxFan => self.max_fan.into(),
        }
    }

    /// Curve built from the defaults with every given parameter applied, validated once
    /// at the end so the intermediate combinations do not matter.
    pub fn from_params(params: impl IntoIterator<Item = (CurveParam, i64)>) -> Result<Self, CurveError> {
        let mut curve = Self::default();
        for (param, value) in params {
            curve.assign(param, value)?;
        }
        curve.validate()?;
        Ok(curve)
    }

    fn assign(&mut self, param: CurveParam, value: i64) -> Result<(), CurveError> {
        let limits = param.limits();
        if !limits.contains(&value) {
            return Err(CurveError::OutOfRange {
                param,
                value,
                low: *limits.start(),
                high: *limits.end(),
            });
        }
        // both casts are lossless after the range check
        match param {
            CurveParam::MinTemp => self.min_temp = value as i32,
            CurveParam::MaxTemp => self.max_temp = value as i32,
            CurveParam::MinFan => self.min_fan = value as u8,
            CurveParam::MaxFan => self.max_fan = value as u8,
        }
        Ok(())
    }

    /// Copy of this curve with one parameter replaced. The result is fully validated;
    /// `self` is never touched.
    pub fn with_param(&self, param: CurveParam, value: i64) -> Result<Self, CurveError> {
        let mut next = *self;
        next.assign(param, value)?;
        next.validate()?;
        Ok(next)
    }

    /// Replace one parameter in place. On error the stored curve is unchanged.
    pub fn set(&mut self, param: CurveParam, value: i64) -> Result<(), CurveError> {
        *self = self.with_param(param, value)?;
        Ok(())
    }

    /// PWM for a temperature. Interpolation truncates, like shell integer arithmetic.
    pub fn pwm_for(&self, temp: f64) -> u8 {
        let min_temp = f64::from(self.min_temp);
        let max_temp = f64::from(self.max_temp);
        if temp.is_nan() || temp >= max_temp {
            return self.max_fan;
        }
        if temp <= min_temp {
            return self.min_fan;
        }
        let span = f64::from(self.max_fan) - f64::from(self.min_fan);
        let pwm = f64::from(self.min_fan) + (temp - min_temp) * span / (max_temp - min_temp);
        pwm.floor().clamp(f64::from(self.min_fan), f64::from(self.max_fan)) as u8
    }

    /// `(temperature, percent)` points from 30 °C to 60 °C for charting.
    pub fn curve_points(&self) -> Vec<(i32, u8)> {
        (30..=60)
            .map(|t| {
                let min_temp = f64::from(self.min_temp);
                let max_temp = f64::from(self.max_temp);
                let temp = f64::from(t);
                let pwm = if temp < min_temp {
                    f64::from(self.min_fan)
                } else if temp > max_temp {
                    f64::from(self.max_fan)
                } else {
                    f64::from(self.min_fan)
                        + (temp - min_temp) * (f64::from(self.max_fan) - f64::from(self.min_fan))
                            / (max_temp - min_temp)
                };
                (t, ratio_to_percent(pwm))
            })
            .collect()
    }

    /// Short description, e.g. `43-47°C → 80-100%`.
    pub fn summary(&self) -> String {
        format!(
            "{}-{}°C → {}-{}%",
            self.min_temp,
            self.max_temp,
            pwm_to_percent(self.min_fan),
            pwm_to_percent(self.max_fan)
        )
    }
}

/// Target PWM for a control cycle. `None` means the loop is inert and the firmware
/// owns cooling.
pub fn evaluate(mode: FanMode, curve: &FanCurveConfig, current_temp: f64) -> Option<u8> {
    match mode {
        FanMode::Managed => None,
        FanMode::FixedSpeed(pwm) => Some(pwm),
        FanMode::CustomCurve => Some(curve.pwm_for(current_temp)),
    }
}

/// `round(pwm * 100 / 255)`
pub fn pwm_to_percent(pwm: u8) -> u8 {
    ratio_to_percent(f64::from(pwm))
}

/// `round(percent * 255 / 100)`, percent clamped to 0..=100.
pub fn percent_to_pwm(percent: f64) -> u8 {
    let percent = if percent.is_nan() { 0.0 } else { percent.clamp(0.0, 100.0) };
    (percent * f64::from(PWM_MAX) / 100.0).round() as u8
}

fn ratio_to_percent(pwm: f64) -> u8 {
    (pwm * 100.0 / f64::from(PWM_MAX)).round().clamp(0.0, 100.0) as u8
}
