//! Tuning constants used throughout the benchmark orchestrator.
//!
//! This module centralizes all tunable parameters and constants used when
//! provisioning clusters and driving benchmarks against them.

use std::time::Duration;

// ============================================================================
// Convergence Polling
// ============================================================================

/// Interval between convergence checks for asynchronous remote operations
/// (log collection, compaction). The remote side exposes no push
/// notifications so repeated status queries are the only observation channel.
pub const POLL_INTERVAL: Duration = Duration::from_secs(15);

/// How long to wait for a log collection to complete across all nodes.
pub const LOG_COLLECTION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// How long to wait for a bucket compaction to complete.
///
/// Compaction duration scales with the amount of data on disk, so this is
/// deliberately generous; the poller gives up eventually rather than hanging
/// a run forever.
pub const COMPACTION_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

// ============================================================================
// Settle Delays
// ============================================================================
//
// The remote storage engine exposes no readiness signal for these paths, so
// fixed sleeps stand in for one. These encode an assumption rather than a
// guarantee and are a known source of flakiness.

/// Time to wait after installing the storage service for it to become
/// reachable.
pub const SERVICE_SETTLE_DELAY: Duration = Duration::from_secs(30);

/// Time to wait after creating the benchmarking bucket. Flushing or reading
/// a just-created bucket can fail with an internal server error.
pub const BUCKET_SETTLE_DELAY: Duration = Duration::from_secs(30);

/// Time to wait after requesting a bucket flush for it to take effect.
pub const FLUSH_SETTLE_DELAY: Duration = Duration::from_secs(30);

/// Time to wait after triggering a compaction for the task to appear in the
/// remote task list; polling before the entry exists would report an
/// immediate (false) completion.
pub const COMPACTION_START_DELAY: Duration = Duration::from_secs(30);

// ============================================================================
// Remote Storage Engine
// ============================================================================

/// Name of the storage engine package/service on the remote machines.
pub const SERVICE_NAME: &str = "kvstore-server";

/// Directory the storage engine package installs into; purged on
/// re-provision to guarantee a clean slate.
pub const INSTALL_DIRECTORY: &str = "/opt/kvstore";

/// Directory containing the storage engine command line tools; prepended to
/// `PATH` for every remote command.
pub const BIN_DIRECTORY: &str = "/opt/kvstore/bin";

/// Port the cluster administration API listens on.
pub const ADMIN_PORT: u16 = 9000;

/// Port the key-value engine itself listens on.
pub const ENGINE_PORT: u16 = 9210;

/// Name of the bucket benchmarks are run against.
pub const BUCKET_NAME: &str = "default";

/// Number of partitions a bucket has unless explicitly constrained; a
/// blueprint requesting this value (or zero) leaves the platform default
/// untouched.
pub const DEFAULT_PARTITIONS: u16 = 1024;

// ============================================================================
// Dataset Load
// ============================================================================

/// Eviction aggressiveness (percent) applied while loading the dataset; the
/// most conservative value, which speeds up ingestion.
pub const LOAD_EVICTION_PERCENTAGE: u8 = 0;

/// Eviction aggressiveness (percent) restored once the dataset is loaded,
/// so benchmark results are not skewed by a non-default pager setting.
pub const BENCHMARK_EVICTION_PERCENTAGE: u8 = 30;
