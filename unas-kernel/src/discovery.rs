//! Discovery of drive bays and storage pools from the telemetry keys
//!
//! A unit is "present" when its anchor key shows up in a cache snapshot:
//! `hdd_<bay>_temperature` for a drive, `pool<n>_usage` for a pool. Known units are never
//! forgotten for the life of the process, so a drive pulled and reinserted is announced once.

use crate::cache::StateCache;
use crate::catalog::{drive_entities, pool_entities, EntityRegistry};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use unas_core::TelemetrySample;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_shared<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    DriveBay,
    Pool,
}

impl EntityKind {
    pub const ALL: [EntityKind; 2] = [Self::DriveBay, Self::Pool];

    /// Unit id carried by `key`, if `key` is this kind's anchor.
    pub fn unit_of<'a>(&self, key: &'a str) -> Option<&'a str> {
        let id = match self {
            Self::DriveBay => key.strip_prefix("hdd_")?.strip_suffix("_temperature")?,
            Self::Pool => key.strip_prefix("pool")?.strip_suffix("_usage")?,
        };
        (!id.is_empty() && id.bytes().all(|b| b.is_ascii_digit())).then_some(id)
    }

    fn label(&self) -> &'static str {
        match self {
            Self::DriveBay => "drive bay",
            Self::Pool => "pool",
        }
    }
}

/// `present(snapshot) − known`. Pure; an empty snapshot gives an empty set.
pub fn discover(kind: EntityKind, snapshot: &TelemetrySample, known: &BTreeSet<String>) -> BTreeSet<String> {
    snapshot
        .keys()
        .filter_map(|key| kind.unit_of(key))
        .filter(|id| !known.contains(*id))
        .map(str::to_string)
        .collect()
}

/// Known units per kind plus the registry they are announced into.
pub struct Discovery {
    drives: BTreeSet<String>,
    pools: BTreeSet<String>,
    registry: Shared<EntityRegistry>,
}

impl Discovery {
    pub fn new(registry: Shared<EntityRegistry>) -> Self {
        Self { drives: BTreeSet::new(), pools: BTreeSet::new(), registry }
    }

    pub fn known(&self, kind: EntityKind) -> &BTreeSet<String> {
        match kind {
            EntityKind::DriveBay => &self.drives,
            EntityKind::Pool => &self.pools,
        }
    }

    /// Announce every new unit in `snapshot`. Returns how many units were new.
    pub fn scan(&mut self, snapshot: &TelemetrySample) -> usize {
        let mut found = 0;
        for kind in EntityKind::ALL {
            let new_units = discover(kind, snapshot, self.known(kind));
            if new_units.is_empty() {
                continue;
            }
            let mut registry = self.registry.lock();
            let mut added = 0;
            for unit in &new_units {
                added += match kind {
                    EntityKind::DriveBay => registry.extend(drive_entities(unit)),
                    EntityKind::Pool => registry.extend(pool_entities(unit)),
                };
            }
            info!(
                "Discovered {} {}(s) {:?}, {} entities added ({} total)",
                new_units.len(),
                kind.label(),
                new_units,
                added,
                registry.len()
            );
            found += new_units.len();
            match kind {
                EntityKind::DriveBay => self.drives.extend(new_units),
                EntityKind::Pool => self.pools.extend(new_units),
            }
        }
        found
    }
}

/// Bounded retry schedule: `initial`, doubling, capped at `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { attempts: 5, initial: Duration::from_secs(2), max_delay: Duration::from_secs(30) }
    }
}

impl RetryPolicy {
    /// Delay before each attempt.
    pub fn delays(&self) -> Vec<Duration> {
        let mut delays = Vec::with_capacity(self.attempts as usize);
        let mut next = self.initial;
        for _ in 0..self.attempts {
            delays.push(next.min(self.max_delay));
            next = next.saturating_mul(2);
        }
        delays
    }
}

/// Startup discovery: the agent may not have published its first sample yet, so scan on
/// the retry schedule and stop at the first scan that finds anything. Resolves to the
/// number of units found.
pub fn spawn_startup_discovery(
    discovery: Shared<Discovery>,
    cache: StateCache,
    policy: RetryPolicy,
) -> tokio::task::JoinHandle<usize> {
    tokio::spawn(async move {
        for (attempt, delay) in policy.delays().into_iter().enumerate() {
            tokio::time::sleep(delay).await;
            let found = discovery.lock().scan(&cache.snapshot());
            if found > 0 {
                return found;
            }
            debug!("Startup discovery attempt {}/{}: nothing yet", attempt + 1, policy.attempts);
        }
        info!("No drives or pools reported after {} attempts, periodic scans continue", policy.attempts);
        0
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use unas_core::TelemetryValue;

    fn sample(keys: &[&str]) -> TelemetrySample {
        keys.iter().map(|k| (k.to_string(), TelemetryValue::Int(1))).collect()
    }

    #[test]
    fn test_discover_patterns() {
        let snap = sample(&[
            "hdd_1_temperature",
            "hdd_3_temperature",
            "hdd_3_model",
            "hdd_x_temperature",
            "pool1_usage",
            "pool2_size",
            "cpu_temp",
        ]);
        let none = BTreeSet::new();
        assert_eq!(discover(EntityKind::DriveBay, &snap, &none), BTreeSet::from(["1".to_string(), "3".to_string()]));
        assert_eq!(discover(EntityKind::Pool, &snap, &none), BTreeSet::from(["1".to_string()]));
        assert!(discover(EntityKind::DriveBay, &TelemetrySample::new(), &none).is_empty());
    }

    #[test]
    fn test_discover_is_idempotent() {
        let snap = sample(&["hdd_2_temperature", "hdd_5_temperature"]);
        let mut known = BTreeSet::new();
        let first = discover(EntityKind::DriveBay, &snap, &known);
        assert_eq!(first.len(), 2);
        known.extend(first);
        assert!(discover(EntityKind::DriveBay, &snap, &known).is_empty());
    }

    #[test]
    fn test_scan_registers_once() {
        let registry = new_shared(EntityRegistry::new());
        let mut discovery = Discovery::new(registry.clone());
        let snap = sample(&["hdd_1_temperature", "pool1_usage"]);

        assert_eq!(discovery.scan(&snap), 2);
        let count = registry.lock().len();
        assert_eq!(discovery.scan(&snap), 0);
        assert_eq!(registry.lock().len(), count);

        // a removed drive stays known
        assert_eq!(discovery.scan(&sample(&["pool1_usage"])), 0);
        assert!(discovery.known(EntityKind::DriveBay).contains("1"));
    }

    #[test]
    fn test_retry_schedule() {
        let delays: Vec<u64> = RetryPolicy::default().delays().iter().map(Duration::as_secs).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 30]);
        let short = RetryPolicy { attempts: 3, initial: Duration::from_secs(20), max_delay: Duration::from_secs(30) };
        assert_eq!(short.delays(), vec![Duration::from_secs(20), Duration::from_secs(30), Duration::from_secs(30)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_discovery_waits_for_first_sample() {
        let cache = StateCache::new();
        let discovery = new_shared(Discovery::new(new_shared(EntityRegistry::new())));
        let task = spawn_startup_discovery(discovery.clone(), cache.clone(), RetryPolicy::default());

        // first two attempts (t=2s, t=6s) see nothing
        tokio::time::sleep(Duration::from_secs(7)).await;
        assert!(!task.is_finished());
        cache.put("hdd_4_temperature", "39");

        assert_eq!(task.await.unwrap(), 1);
        assert!(discovery.lock().known(EntityKind::DriveBay).contains("4"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_discovery_gives_up() {
        let discovery = new_shared(Discovery::new(new_shared(EntityRegistry::new())));
        let started = tokio::time::Instant::now();
        let found = spawn_startup_discovery(discovery, StateCache::new(), RetryPolicy::default()).await.unwrap();
        assert_eq!(found, 0);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(60) && waited < Duration::from_secs(61));
    }
}
