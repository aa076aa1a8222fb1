//! CPU usage from `/proc/stat` jiffies

use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTimes {
    /// idle + iowait
    pub idle: u64,
    pub total: u64,
}

/// Parse the aggregate `cpu` line.
pub fn parse_proc_stat(content: &str) -> Option<CpuTimes> {
    let line = content.lines().find(|l| l.starts_with("cpu "))?;
    let values: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .map(|v| v.parse::<u64>())
        .collect::<Result<_, _>>()
        .ok()?;
    if values.len() < 5 {
        return None;
    }
    Some(CpuTimes {
        idle: values[3] + values[4],
        total: values.iter().sum(),
    })
}

/// `100 * (1 - Δidle/Δtotal)`, truncated and clamped to 0..=100. A non-positive Δtotal
/// (no time elapsed, counter reset) yields 0.
pub fn usage_percent(before: CpuTimes, after: CpuTimes) -> i64 {
    let d_total = after.total as i128 - before.total as i128;
    if d_total <= 0 {
        return 0;
    }
    let d_idle = after.idle as i128 - before.idle as i128;
    let usage = 100.0 * (1.0 - d_idle as f64 / d_total as f64);
    usage.clamp(0.0, 100.0) as i64
}

pub struct CpuSampler {
    stat_path: PathBuf,
    window: Duration,
}

impl CpuSampler {
    pub fn new(proc_dir: &Path, window: Duration) -> Self {
        Self { stat_path: proc_dir.join("stat"), window }
    }

    async fn read(&self) -> Option<CpuTimes> {
        let content = tokio::fs::read_to_string(&self.stat_path).await.ok()?;
        parse_proc_stat(&content)
    }

    /// Two reads across the sampling window, every call; there is no cached "previous"
    /// sample that could make the first report meaningless.
    pub async fn sample(&self) -> i64 {
        let Some(before) = self.read().await else {
            warn!("cpu: cannot read {}", self.stat_path.display());
            return 0;
        };
        tokio::time::sleep(self.window).await;
        match self.read().await {
            Some(after) => usage_percent(before, after),
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use unas_devkit::fixtures::{PROC_STAT_AFTER, PROC_STAT_BEFORE};

    #[test]
    fn test_parse_proc_stat() {
        let t = parse_proc_stat(PROC_STAT_BEFORE).unwrap();
        assert_eq!(t, CpuTimes { idle: 800, total: 1000 });
        assert_eq!(parse_proc_stat("cpu0 1 2 3\n"), None);
        assert_eq!(parse_proc_stat("cpu  1 2 x 4 5\n"), None);
    }

    #[test]
    fn test_usage_from_fixture() {
        let before = parse_proc_stat(PROC_STAT_BEFORE).unwrap();
        let after = parse_proc_stat(PROC_STAT_AFTER).unwrap();
        assert_eq!(usage_percent(before, after), 25);
    }

    #[test]
    fn test_usage_degenerate_deltas() {
        let t = CpuTimes { idle: 10, total: 100 };
        assert_eq!(usage_percent(t, t), 0);
        assert_eq!(usage_percent(t, CpuTimes { idle: 5, total: 50 }), 0);
        // idle moved more than total: clamp rather than go negative
        assert_eq!(usage_percent(t, CpuTimes { idle: 200, total: 150 }), 0);
        // nothing idle
        assert_eq!(usage_percent(t, CpuTimes { idle: 10, total: 200 }), 100);
    }

    #[tokio::test]
    async fn test_sampler_reads_twice() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("stat"), PROC_STAT_BEFORE).unwrap();
        let sampler = CpuSampler::new(dir.path(), Duration::from_millis(1));
        // identical reads: Δtotal = 0
        assert_eq!(sampler.sample().await, 0);

        let missing = CpuSampler::new(&dir.path().join("nope"), Duration::from_millis(1));
        assert_eq!(missing.sample().await, 0);
    }
}
