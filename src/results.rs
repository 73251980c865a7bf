//! Benchmark measurements.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The measurements taken for a single backup/restore iteration.
///
/// Timing covers only the transfer itself; repository bookkeeping around an
/// iteration is deliberately excluded.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BenchmarkResult {
    /// How long the transfer took.
    pub duration: Duration,

    /// On-disk size of the transferred data as reported by the repository.
    pub actual_size: u64,

    /// Number of items transferred as reported by the repository.
    pub actual_items: u64,
}

impl BenchmarkResult {
    /// Transfer rate in bytes per second against the repository-reported
    /// size.
    pub fn transfer_rate_actual(&self) -> u64 {
        transfer_rate(self.actual_size, self.duration)
    }

    /// Transfer rate in bytes per second against the logical generated
    /// dataset size, which better reflects end-to-end throughput when the
    /// repository compresses.
    pub fn transfer_rate_generated(&self, generated_size: u64) -> u64 {
        transfer_rate(generated_size, self.duration)
    }
}

/// Bytes per second for a transfer of `size` bytes over `duration`.
///
/// Sub-second transfers report the raw size; truncating to whole seconds
/// would divide by zero, and at that scale the distinction is noise anyway.
fn transfer_rate(size: u64, duration: Duration) -> u64 {
    if duration < Duration::from_secs(1) {
        return size;
    }

    size / duration.as_secs()
}

/// Basic bucket stats reported by the cluster's administration API;
/// displayed alongside results to give context about benchmark conditions.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    #[serde(default)]
    pub item_count: u64,
    #[serde(default)]
    pub disk_used: u64,
    #[serde(default)]
    pub mem_used: u64,
    #[serde(default)]
    pub non_resident: u64,
}

impl Stats {
    /// Percentage of items resident in memory, computed the same way the
    /// cluster's own UI does.
    pub fn residency_ratio(&self) -> u64 {
        if self.item_count == 0 {
            return 100;
        }

        if self.item_count < self.non_resident {
            return 0;
        }

        ((self.item_count - self.non_resident) * 100) / self.item_count
    }
}
