//! Telemetry values as carried on the bus
//!
//! Payloads are bare strings. Consumers need numbers for arithmetic (unit conversion,
//! comparisons) and strings for display, so parsing falls back silently:
//! a payload containing `.` is a float, otherwise an integer, otherwise the raw text.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Flat metric key → value map. A missing key means "never observed".
pub type TelemetrySample = BTreeMap<String, TelemetryValue>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TelemetryValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl TelemetryValue {
    /// Parse a raw bus payload. Never fails: unparseable payloads are kept verbatim.
    pub fn parse_raw(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.contains('.') {
            if let Ok(v) = trimmed.parse::<f64>() {
                return Self::Float(v);
            }
        } else if let Ok(v) = trimmed.parse::<i64>() {
            return Self::Int(v);
        }
        Self::Text(raw.to_string())
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Text(_) => None,
        }
    }

    /// Integer view; floats are truncated toward zero.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Float(v) if v.is_finite() => Some(v.trunc() as i64),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for TelemetryValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            // keep the decimal point so the payload parses back as a float
            Self::Float(v) if v.is_finite() && v.fract() == 0.0 => write!(f, "{v:.1}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for TelemetryValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u64> for TelemetryValue {
    fn from(v: u64) -> Self {
        Self::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<u8> for TelemetryValue {
    fn from(v: u8) -> Self {
        Self::Int(v.into())
    }
}

impl From<f64> for TelemetryValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<String> for TelemetryValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&str> for TelemetryValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}
