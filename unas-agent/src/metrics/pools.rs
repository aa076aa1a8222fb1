//! Storage pools under the volume root
//!
//! Pool numbers are positional: every scan sorts the mounts and numbers the qualifying
//! ones 1..N, so a pool can change number when another appears or disappears.

use crate::execution::CommandRunner;
use std::path::{Path, PathBuf};
use tracing::debug;
use unas_core::{TelemetrySample, TelemetryValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DfRow {
    pub size_gb: i64,
    pub used_gb: i64,
    pub available_gb: i64,
    pub usage: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolReport {
    pub number: usize,
    pub usage: DfRow,
}

/// Parse `df -BG <mount>` output (header + one row).
pub fn parse_df(output: &str) -> Option<DfRow> {
    let row = output.trim().lines().nth(1)?;
    let parts: Vec<&str> = row.split_whitespace().collect();
    if parts.len() < 5 {
        return None;
    }
    let gb = |s: &str| s.trim_end_matches('G').parse::<i64>().ok();
    Some(DfRow {
        size_gb: gb(parts[1])?,
        used_gb: gb(parts[2])?,
        available_gb: gb(parts[3])?,
        usage: parts[4].trim_end_matches('%').parse().ok()?,
    })
}

impl PoolReport {
    pub fn write_into(&self, sample: &mut TelemetrySample) {
        let key = |field: &str| format!("pool{}_{}", self.number, field);
        sample.insert(key("size"), TelemetryValue::Int(self.usage.size_gb));
        sample.insert(key("used"), TelemetryValue::Int(self.usage.used_gb));
        sample.insert(key("available"), TelemetryValue::Int(self.usage.available_gb));
        sample.insert(key("usage"), TelemetryValue::Int(self.usage.usage));
    }
}

async fn mount_dirs(volume_dir: &Path) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(volume_dir).await else {
        return dirs;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    dirs
}

/// Pools larger than `min_size_gb`, numbered by sorted mount path.
pub async fn collect_pools(runner: &dyn CommandRunner, volume_dir: &Path, min_size_gb: u64) -> Vec<PoolReport> {
    let mut pools = Vec::new();
    for dir in mount_dirs(volume_dir).await {
        let mount = dir.to_string_lossy().to_string();
        let row = match runner.run("df", &["-BG", &mount]).await {
            Ok(out) => parse_df(&out.stdout),
            Err(e) => {
                debug!("df failed for {mount}: {e}");
                None
            }
        };
        let Some(row) = row else { continue };
        if row.size_gb <= min_size_gb as i64 {
            continue;
        }
        pools.push(PoolReport { number: pools.len() + 1, usage: row });
    }
    pools
}
