//! Run configuration.
//!
//! A run is described by a single YAML file containing the SSH settings, the
//! blueprint of the machines to converge into a cluster, and the benchmark
//! settings. The blueprint is read once at startup and treated as read-only
//! afterwards.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::backupmgr::BackupMgrSettings;

/// Top level configuration for a benchmark run.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub ssh: SshSettings,
    pub blueprint: Blueprint,
    #[serde(default)]
    pub benchmark: BenchmarkSettings,
}

impl Config {
    /// Read and decode the config file at the given path.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file at '{}'", path.display()))?;

        serde_yaml::from_str(&raw).context("failed to decode config file")
    }
}

/// Settings used to reach the remote machines.
#[derive(Debug, Clone, Deserialize)]
pub struct SshSettings {
    pub username: String,
    #[serde(default)]
    pub private_key: Option<PathBuf>,
}

/// The machines which make up a deployment: the storage cluster itself plus
/// the host which drives backups/restores against it.
#[derive(Debug, Clone, Deserialize)]
pub struct Blueprint {
    pub cluster: ClusterBlueprint,
    pub backup_client: BackupClientBlueprint,
}

/// Blueprint for the storage cluster provisioned by the `provision`
/// sub-command.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterBlueprint {
    /// Path to a local storage engine package; uploaded to and installed on
    /// each cluster node.
    ///
    /// NOTE: No validation takes place to ensure the package is valid for
    /// the remote distribution; that's on you...
    pub package_path: PathBuf,

    /// The nodes to converge into a cluster. Order matters only in that the
    /// first entry is the leader: the single node cluster-wide
    /// administrative operations are issued against.
    pub nodes: Vec<NodeBlueprint>,

    /// The bucket created once the cluster is provisioned.
    pub bucket: BucketBlueprint,

    /// Credentials the cluster is initialized with.
    #[serde(default)]
    pub credentials: Credentials,

    /// Whether developer preview mode should be enabled on the cluster.
    #[serde(default)]
    pub developer_preview: bool,
}

/// Blueprint for a single cluster node.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeBlueprint {
    /// Hostname/address of the node.
    pub host: String,

    /// Custom data path for the storage engine; created and ownership-fixed
    /// during provisioning when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_path: Option<String>,
}

/// Credentials used when initializing and administering the cluster.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Default for Credentials {
    fn default() -> Self {
        Credentials {
            username: "admin".to_string(),
            password: "password".to_string(),
        }
    }
}

/// Configuration for the bucket benchmarks are run against.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BucketBlueprint {
    /// Number of partitions for the bucket; zero (or the platform default)
    /// leaves the cluster-wide setting untouched.
    #[serde(default)]
    pub partitions: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eviction_policy: Option<String>,

    /// Whether the bucket should be compacted after the dataset is loaded.
    #[serde(default)]
    pub compact: bool,

    /// Point-in-time recovery settings, passed through to bucket creation
    /// when enabled.
    #[serde(default)]
    pub pitr_enabled: bool,
    #[serde(default)]
    pub pitr_granularity: u64,
    #[serde(default)]
    pub pitr_max_history_age: u64,

    /// The dataset loaded into the bucket.
    #[serde(default)]
    pub data: DataBlueprint,
}

/// Which tool generates the benchmark dataset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataLoader {
    /// The backup tool's bulk generator; writes each item exactly once.
    #[default]
    Backup,
    /// A sustained mutation workload which rewrites a working set of
    /// `active_items` repeatedly; used with the point-in-time bucket
    /// settings so every granularity period sees at least one mutation per
    /// document.
    Workload,
}

/// Options for the benchmark dataset generated into the bucket.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DataBlueprint {
    /// Total number of items to load, split across the cluster nodes.
    pub items: u64,

    /// Size of each generated item in bytes.
    pub size: u64,

    /// Whether the generated values should be compressible.
    #[serde(default)]
    pub compressible: bool,

    /// Number of load generator threads; zero lets the generator pick.
    #[serde(default)]
    pub load_threads: u64,

    /// Which loader generates the dataset.
    #[serde(default)]
    pub loader: DataLoader,

    /// Size of the working set the workload loader mutates; must be set
    /// when that loader is selected.
    #[serde(default)]
    pub active_items: u64,
}

impl DataBlueprint {
    /// The logical size of the dataset implied by the blueprint; the "GDS"
    /// figure transfer rates are reported against.
    pub fn generated_size(&self) -> u64 {
        self.items * self.size
    }
}

impl Default for DataBlueprint {
    fn default() -> Self {
        DataBlueprint {
            items: 0,
            size: 1024,
            compressible: false,
            load_threads: 0,
            loader: DataLoader::default(),
            active_items: 0,
        }
    }
}

/// Blueprint for the host which runs the backup manager. Provisioned like a
/// cluster node, but with the storage service disabled so it doesn't compete
/// with the tool under test for resources.
#[derive(Debug, Clone, Deserialize)]
pub struct BackupClientBlueprint {
    /// Hostname/address of the backup client.
    pub host: String,

    /// Path to a local storage engine package providing the backup tooling.
    pub package_path: PathBuf,
}

/// Settings for the `benchmark` sub-command.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BenchmarkSettings {
    /// Number of times the benchmark is run; more iterations give more
    /// representative data. At least one iteration always runs.
    #[serde(default)]
    pub iterations: i64,

    /// Configuration passed to the backup manager on the remote machine.
    #[serde(default)]
    pub backupmgr: BackupMgrSettings,
}

/// Environment variable overlay applied to backup manager invocations.
pub type Environment = BTreeMap<String, String>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_full_config() {
        let raw = r#"
ssh:
  username: root
  private_key: /home/bench/.ssh/id_ed25519
blueprint:
  cluster:
    package_path: /builds/kvstore-server-7.2.0.deb
    nodes:
      - host: 10.0.0.1
        data_path: /data/kvstore
      - host: 10.0.0.2
    bucket:
      partitions: 128
      eviction_policy: fullEviction
      compact: true
      data:
        items: 500000
        size: 1024
        compressible: true
  backup_client:
    host: 10.0.0.10
    package_path: /builds/kvstore-server-7.2.0.deb
benchmark:
  iterations: 3
  backupmgr:
    archive: /backups/archive
    repository: bench
    threads: 16
"#;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(&path, raw).unwrap();

        let config = Config::load(&path).unwrap();

        assert_eq!(config.ssh.username, "root");
        assert_eq!(config.blueprint.cluster.nodes.len(), 2);
        assert_eq!(
            config.blueprint.cluster.nodes[0].data_path.as_deref(),
            Some("/data/kvstore")
        );
        assert_eq!(config.blueprint.cluster.bucket.partitions, 128);
        assert_eq!(config.blueprint.cluster.bucket.data.items, 500_000);
        assert!(config.blueprint.cluster.bucket.data.compressible);
        assert_eq!(config.blueprint.cluster.credentials.username, "admin");
        assert_eq!(config.benchmark.iterations, 3);
        assert_eq!(config.benchmark.backupmgr.archive, "/backups/archive");
        assert_eq!(config.benchmark.backupmgr.threads, 16);
    }

    #[test]
    fn load_missing_file_is_an_error() {
        let err = Config::load(Path::new("/nonexistent/config.yml")).unwrap_err();
        assert!(err.to_string().contains("failed to read config file"));
    }

    #[test]
    fn data_loader_selection_decodes() {
        let data: DataBlueprint =
            serde_yaml::from_str("items: 1000\nsize: 512\nloader: workload\nactive_items: 100")
                .unwrap();

        assert_eq!(data.loader, DataLoader::Workload);
        assert_eq!(data.active_items, 100);

        let data: DataBlueprint = serde_yaml::from_str("items: 1000\nsize: 512").unwrap();
        assert_eq!(data.loader, DataLoader::Backup);
    }

    #[test]
    fn generated_size_is_items_times_size() {
        let data = DataBlueprint {
            items: 500_000,
            size: 1024,
            ..DataBlueprint::default()
        };

        assert_eq!(data.generated_size(), 512_000_000);
    }
}
