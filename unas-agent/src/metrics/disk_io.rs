//! Disk throughput from `/proc/diskstats` sector counters
//!
//! Only whole SATA disks (`sda`..`sdz`) count; partitions, md arrays and loop devices would
//! double count the same I/O.

use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

const SECTOR_BYTES: f64 = 512.0;
const MB: f64 = 1_048_576.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskCounters {
    pub sectors_read: u64,
    pub sectors_written: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Throughput {
    pub read_mb_s: f64,
    pub write_mb_s: f64,
}

pub fn is_whole_disk(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.len() == 3 && name.starts_with("sd") && bytes[2].is_ascii_lowercase()
}

/// Sum the sector counters over all whole disks.
pub fn parse_diskstats(content: &str) -> DiskCounters {
    let mut counters = DiskCounters::default();
    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 || !is_whole_disk(fields[2]) {
            continue;
        }
        let (Ok(read), Ok(written)) = (fields[5].parse::<u64>(), fields[9].parse::<u64>()) else {
            continue;
        };
        counters.sectors_read += read;
        counters.sectors_written += written;
    }
    counters
}

fn rate(before: u64, after: u64, secs: f64) -> f64 {
    // a counter that went backwards was reset (device removed); report nothing
    let Some(delta) = after.checked_sub(before) else {
        return 0.0;
    };
    let mb_s = delta as f64 * SECTOR_BYTES / MB / secs;
    (mb_s * 100.0).round() / 100.0
}

pub fn throughput(before: DiskCounters, after: DiskCounters, elapsed: Duration) -> Throughput {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return Throughput::default();
    }
    Throughput {
        read_mb_s: rate(before.sectors_read, after.sectors_read, secs),
        write_mb_s: rate(before.sectors_written, after.sectors_written, secs),
    }
}

pub struct DiskIoSampler {
    path: PathBuf,
    last: Option<(DiskCounters, Instant)>,
}

impl DiskIoSampler {
    pub fn new(proc_dir: &Path) -> Self {
        Self { path: proc_dir.join("diskstats"), last: None }
    }

    pub fn is_primed(&self) -> bool {
        self.last.is_some()
    }

    async fn read(&self) -> Option<DiskCounters> {
        let content = tokio::fs::read_to_string(&self.path).await.ok()?;
        Some(parse_diskstats(&content))
    }

    pub async fn prime(&mut self) {
        if let Some(counters) = self.read().await {
            self.last = Some((counters, Instant::now()));
        }
    }

    /// Throughput since the previous call, over the measured elapsed time.
    pub async fn sample(&mut self) -> Throughput {
        let Some(now_counters) = self.read().await else {
            debug!("disk_io: {} unreadable", self.path.display());
            return Throughput::default();
        };
        let now = Instant::now();
        let result = match self.last {
            Some((prev, at)) => throughput(prev, now_counters, now.duration_since(at)),
            None => Throughput::default(),
        };
        self.last = Some((now_counters, now));
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use unas_devkit::fixtures::{DISKSTATS_AFTER, DISKSTATS_BEFORE};

    #[test]
    fn test_whole_disk_pattern() {
        assert!(is_whole_disk("sda"));
        assert!(is_whole_disk("sdz"));
        assert!(!is_whole_disk("sda1"));
        assert!(!is_whole_disk("md3"));
        assert!(!is_whole_disk("nvme0n1"));
        assert!(!is_whole_disk("sdA"));
    }

    #[test]
    fn test_parse_sums_whole_disks_only() {
        let c = parse_diskstats(DISKSTATS_BEFORE);
        assert_eq!(c, DiskCounters { sectors_read: 2048 + 4096, sectors_written: 4096 + 8192 });
    }

    #[test]
    fn test_throughput_over_measured_time() {
        let before = parse_diskstats(DISKSTATS_BEFORE);
        let after = parse_diskstats(DISKSTATS_AFTER);
        let t = throughput(before, after, Duration::from_secs(1));
        assert_eq!(t, Throughput { read_mb_s: 2.0, write_mb_s: 2.0 });

        // same deltas over an irregular 3 s gap
        let t = throughput(before, after, Duration::from_secs(3));
        assert_eq!(t, Throughput { read_mb_s: 0.67, write_mb_s: 0.67 });
    }

    #[test]
    fn test_counter_reset_and_zero_elapsed() {
        let before = parse_diskstats(DISKSTATS_AFTER);
        let after = parse_diskstats(DISKSTATS_BEFORE);
        assert_eq!(throughput(before, after, Duration::from_secs(1)), Throughput::default());
        assert_eq!(throughput(after, before, Duration::ZERO), Throughput::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampler_primes_then_measures() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("diskstats");
        std::fs::write(&path, DISKSTATS_BEFORE).unwrap();

        let mut sampler = DiskIoSampler::new(dir.path());
        assert!(!sampler.is_primed());
        sampler.prime().await;
        assert!(sampler.is_primed());

        tokio::time::advance(Duration::from_secs(2)).await;
        std::fs::write(&path, DISKSTATS_AFTER).unwrap();
        let t = sampler.sample().await;
        assert_eq!(t, Throughput { read_mb_s: 1.0, write_mb_s: 1.0 });
    }
}
