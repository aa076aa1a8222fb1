//! UNAS core contract
//!
//! Everything the on-device agent and the kernel must agree on bit for bit:
//! - bus topic layout and classification of inbound topics
//! - telemetry value parsing (numeric when possible, verbatim text otherwise)
//! - fan mode payloads, fan curve configuration and the curve evaluation
//! - PWM / percent conversion
//! - the `Bus` and `RemoteShell` seams used by both binaries and by the devkit

pub mod bus;
pub mod fan;
pub mod shell;
pub mod topics;
pub mod value;

pub use bus::{Bus, BusError};
pub use fan::{
    evaluate, percent_to_pwm, pwm_to_percent, CurveError, CurveParam, FanCurveConfig, FanMode,
    FanModeError,
};
pub use shell::{CommandOutput, RemoteShell, ShellError};
pub use topics::{parse_monitor_interval, Inbound, Liveness, Topics};
pub use value::{TelemetrySample, TelemetryValue};
