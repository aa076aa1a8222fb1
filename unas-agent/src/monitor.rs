//! Monitor role: sample, publish, sleep
//!
//! The interval starts at the configured value and follows `<ns>/monitor_interval`.
//! A failed cycle is logged and the next one runs on schedule.

use crate::metrics::{summary_line, TelemetryReader};
use crate::relay::{publish_sample, ControlEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{info, warn};
use unas_core::{Bus, Liveness, Topics};

pub struct Monitor {
    reader: TelemetryReader,
    bus: Arc<dyn Bus>,
    topics: Topics,
    period: Duration,
}

fn ticker(period: Duration) -> Interval {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

impl Monitor {
    pub fn new(reader: TelemetryReader, bus: Arc<dyn Bus>, topics: Topics, period: Duration) -> Self {
        Self { reader, bus, topics, period }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub async fn cycle(&mut self) {
        let sample = self.reader.sample().await;
        let failures = publish_sample(self.bus.as_ref(), &self.topics, &sample).await;
        if failures > 0 {
            warn!("{failures}/{} telemetry publishes failed", sample.len());
        }
        info!("{}", summary_line(&sample));
    }

    /// Returns the new period when the event changes it.
    pub fn handle(&mut self, event: ControlEvent) -> Option<Duration> {
        match event {
            ControlEvent::Interval(period) if period != self.period => {
                info!("Monitor interval {:?} -> {:?}", self.period, period);
                self.period = period;
                Some(period)
            }
            _ => None,
        }
    }

    pub async fn run(mut self, mut events: mpsc::Receiver<ControlEvent>) {
        let mut ticks = ticker(self.period);
        info!("UNAS monitor started (every {:?})", self.period);
        loop {
            tokio::select! {
                _ = ticks.tick() => self.cycle().await,
                event = events.recv() => {
                    let Some(event) = event else { break };
                    if let Some(period) = self.handle(event) {
                        ticks = ticker(period);
                        // the fresh interval fires immediately; skip that tick
                        ticks.reset();
                    }
                }
            }
        }
    }
}

/// Graceful stop: mark offline ourselves, the last will only covers crashes.
pub async fn mark_offline(bus: &dyn Bus, topics: &Topics) {
    if let Err(e) = bus.publish(&topics.status(), Liveness::Offline.as_payload().to_string(), true).await {
        warn!("Could not publish offline status: {e}");
    }
}
