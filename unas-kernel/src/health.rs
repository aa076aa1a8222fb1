use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BusStatus {
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Serialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub memory_usage_mb: f32,
    pub mqtt_status: BusStatus,
    pub mqtt_reconnects: u32,
}

/// Broker connection state as seen by the MQTT listener. The coordinator reads it as
/// the bus precondition of every cycle.
#[derive(Clone)]
pub struct BusHealth {
    start_time: Instant,
    reconnects: Arc<AtomicU32>,
    status: Arc<parking_lot::Mutex<BusStatus>>,
}

impl Default for BusHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl BusHealth {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            reconnects: Arc::new(AtomicU32::new(0)),
            status: Arc::new(parking_lot::Mutex::new(BusStatus::Connecting)),
        }
    }

    pub fn mark_connected(&self) {
        *self.status.lock() = BusStatus::Connected;
    }

    pub fn mark_disconnected(&self) {
        let mut status = self.status.lock();
        if *status == BusStatus::Connected {
            self.reconnects.fetch_add(1, Ordering::Relaxed);
        }
        *status = BusStatus::Reconnecting;
    }

    pub fn status(&self) -> BusStatus {
        *self.status.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == BusStatus::Connected
    }

    pub fn report(&self) -> KernelHealth {
        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            memory_usage_mb: memory_usage_mb(),
            mqtt_status: self.status(),
            mqtt_reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Resident set size from `/proc/self/status`, 0 where unavailable.
fn memory_usage_mb() -> f32 {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| {
            status
                .lines()
                .find(|line| line.starts_with("VmRSS:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok())
        })
        .map(|kb| kb as f32 / 1024.0)
        .unwrap_or(0.0)
}
