//! The machine which runs the backup manager against the cluster.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::time::Instant;
use tracing::info;

use crate::backupmgr::BackupMgrSettings;
use crate::blueprint::{BackupClientBlueprint, BenchmarkSettings, NodeBlueprint, SshSettings};
use crate::command::Command;
use crate::nodes::{basename, Cluster, Node, Provision};
use crate::results::BenchmarkResult;
use crate::shutdown::ShutdownSignal;

/// Size/item figures for the single backup in the repository.
#[derive(Debug, Clone, Copy)]
struct BackupInfo {
    size: u64,
    items: u64,
}

/// The JSON emitted by `kvbackup info`.
#[derive(Deserialize)]
struct RepositoryInfo {
    backups: Vec<RepositoryBackup>,
}

#[derive(Deserialize)]
struct RepositoryBackup {
    id: String,
    size: u64,
    items: u64,
}

/// A connection to the backup client; provisioned like a cluster node, but
/// with the storage service disabled.
pub struct BackupClient {
    blueprint: BackupClientBlueprint,
    node: Node,
}

impl BackupClient {
    /// Connect to the backup client described by the blueprint over SSH.
    pub async fn connect(ssh: &SshSettings, blueprint: BackupClientBlueprint) -> Result<Self> {
        let node = Node::connect(
            ssh,
            NodeBlueprint {
                host: blueprint.host.clone(),
                data_path: None,
            },
        )
        .await
        .context("failed to connect to backup client")?;

        Ok(BackupClient { blueprint, node })
    }

    /// Wrap an already connected node; used by tests.
    #[cfg(test)]
    pub fn with_node(blueprint: BackupClientBlueprint, node: Node) -> Self {
        BackupClient { blueprint, node }
    }

    pub fn blueprint(&self) -> &BackupClientBlueprint {
        &self.blueprint
    }

    /// Run one or more backup benchmarks against the cluster. If shutdown is
    /// requested the current iteration completes and its result is kept.
    pub async fn benchmark_backup(
        &self,
        settings: &BenchmarkSettings,
        cluster: &Cluster,
        shutdown: &ShutdownSignal,
    ) -> Result<Vec<BenchmarkResult>> {
        info!(iterations = settings.iterations, "beginning backup benchmarks");

        self.prepare_repository(&settings.backupmgr).await?;

        let mut results = Vec::new();

        for iteration in 1..=settings.iterations.max(1) {
            info!(iteration, "beginning backup benchmark");

            let result = self
                .backup_iteration(&settings.backupmgr, cluster)
                .await
                .context("failed to run benchmark")?;

            results.push(result);

            if shutdown.is_set() {
                info!("shutdown requested, stopping after this iteration");
                break;
            }
        }

        Ok(results)
    }

    /// Run one or more restore benchmarks against the cluster. A single
    /// backup is created up-front and restored on every iteration.
    pub async fn benchmark_restore(
        &self,
        settings: &BenchmarkSettings,
        cluster: &Cluster,
        shutdown: &ShutdownSignal,
    ) -> Result<Vec<BenchmarkResult>> {
        info!(iterations = settings.iterations, "beginning restore benchmarks");

        self.prepare_repository(&settings.backupmgr).await?;

        // Restoring to a blackhole still needs a real backup to read from.
        let (_, backup) = self
            .create_backup(&settings.backupmgr, cluster, true)
            .await
            .context("failed to create backup")?;

        let mut results = Vec::new();

        for iteration in 1..=settings.iterations.max(1) {
            info!(iteration, "beginning restore benchmark");

            let result = self
                .restore_iteration(&settings.backupmgr, cluster, backup)
                .await
                .context("failed to run benchmark")?;

            results.push(result);

            if shutdown.is_set() {
                info!("shutdown requested, stopping after this iteration");
                break;
            }
        }

        Ok(results)
    }

    /// Collect the backup manager's logs into the archive and download the
    /// newest archive zip into `output`, returning its local path.
    pub async fn collect_logs(
        &self,
        backupmgr: &BackupMgrSettings,
        output: &Path,
    ) -> Result<PathBuf> {
        info!(output = %output.display(), "collecting backup manager logs");

        self.node
            .client()
            .execute(&backupmgr.command_collect_logs())
            .await
            .context("failed to run 'collect-logs'")?;

        // Cloud archives stage their logs locally.
        let root = backupmgr
            .obj_staging_directory
            .as_deref()
            .unwrap_or(&backupmgr.archive);

        let listed = self
            .node
            .client()
            .execute(&Command::new(format!("ls -t {root}/logs/*.zip | head -1")))
            .await
            .context("failed to determine which zip file to download")?;

        let source = String::from_utf8_lossy(&listed).trim().to_string();
        let sink = output.join(basename(&source));

        info!(source = source.as_str(), sink = %sink.display(), "downloading backup manager logs");

        self.node
            .client()
            .download(&source, &sink)
            .await
            .context("failed to download logs")?;

        Ok(sink)
    }

    /// Start every benchmark from a clean, freshly configured repository.
    async fn prepare_repository(&self, backupmgr: &BackupMgrSettings) -> Result<()> {
        self.purge_archive(backupmgr)
            .await
            .context("failed to purge archive")?;

        info!("creating repository");

        self.node
            .client()
            .execute(&backupmgr.command_config())
            .await
            .context("failed to create repository")?;

        Ok(())
    }

    /// A single timed backup; the created backup is removed afterwards so
    /// the next iteration starts from an empty repository.
    async fn backup_iteration(
        &self,
        backupmgr: &BackupMgrSettings,
        cluster: &Cluster,
    ) -> Result<BenchmarkResult> {
        cluster
            .run_pre_benchmark_tasks()
            .await
            .context("failed to run cluster pre-benchmark tasks")?;

        self.run_pre_benchmark_tasks()
            .await
            .context("failed to run client pre-benchmark tasks")?;

        let (duration, backup) = self
            .create_backup(backupmgr, cluster, false)
            .await
            .context("failed to create backup")?;

        self.purge_backups(backupmgr)
            .await
            .context("failed to purge created backup")?;

        Ok(BenchmarkResult {
            duration,
            actual_size: backup.size,
            actual_items: backup.items,
        })
    }

    /// A single timed restore of the up-front backup.
    async fn restore_iteration(
        &self,
        backupmgr: &BackupMgrSettings,
        cluster: &Cluster,
        backup: BackupInfo,
    ) -> Result<BenchmarkResult> {
        // With a blackhole sink nothing lands in the bucket, so there is
        // nothing to flush between iterations.
        if !backupmgr.blackhole {
            cluster
                .flush_bucket()
                .await
                .context("failed to flush bucket")?;
        }

        cluster
            .run_pre_benchmark_tasks()
            .await
            .context("failed to run cluster pre-benchmark tasks")?;

        self.run_pre_benchmark_tasks()
            .await
            .context("failed to run client pre-benchmark tasks")?;

        info!(blackhole = backupmgr.blackhole, "restoring backup");

        let command = backupmgr.command_restore(
            &cluster.connection_string(backupmgr.tls),
            &cluster.blueprint().credentials,
        );

        let start = Instant::now();

        self.node
            .client()
            .execute(&command)
            .await
            .context("failed to restore backup")?;

        Ok(BenchmarkResult {
            duration: start.elapsed(),
            actual_size: backup.size,
            actual_items: backup.items,
        })
    }

    /// Back up the cluster, returning how long the transfer took and the
    /// repository's figures for it. Bookkeeping around the transfer (cache
    /// sync, the info query) is excluded from the timing.
    async fn create_backup(
        &self,
        backupmgr: &BackupMgrSettings,
        cluster: &Cluster,
        ignore_blackhole: bool,
    ) -> Result<(Duration, BackupInfo)> {
        info!(
            blackhole = backupmgr.blackhole,
            hosts = ?cluster.hosts(),
            "creating backup"
        );

        let command = backupmgr.command_backup(
            &cluster.connection_string(backupmgr.tls),
            &cluster.blueprint().credentials,
            ignore_blackhole,
        );

        let start = Instant::now();

        self.node
            .client()
            .execute(&command)
            .await
            .context("failed to run backup")?;

        let duration = start.elapsed();

        // The backup manager syncs its own writes; once more for good
        // measure before measuring sizes.
        self.node
            .client()
            .sync()
            .await
            .context("failed to sync data to disk")?;

        let info = self.repository_info(backupmgr).await?;

        let backup = info
            .backups
            .first()
            .context("repository contains no backups")?;

        Ok((
            duration,
            BackupInfo {
                size: backup.size,
                items: backup.items,
            },
        ))
    }

    async fn repository_info(&self, backupmgr: &BackupMgrSettings) -> Result<RepositoryInfo> {
        let output = self
            .node
            .client()
            .execute(&backupmgr.command_info())
            .await
            .context("failed to run info")?;

        serde_json::from_slice(&output).context("failed to decode info output")
    }

    /// Flush caches before each iteration so results aren't skewed by a
    /// warm page cache.
    async fn run_pre_benchmark_tasks(&self) -> Result<()> {
        info!("running backup client pre-benchmark tasks");

        self.node.flush_caches().await
    }

    /// Remove any existing archive so benchmarks start from a clean slate.
    async fn purge_archive(&self, backupmgr: &BackupMgrSettings) -> Result<()> {
        if !backupmgr.archive.starts_with("s3://") {
            info!(archive = backupmgr.archive.as_str(), "purging local archive");

            return self.node.client().remove_directory(&backupmgr.archive).await;
        }

        info!(archive = backupmgr.archive.as_str(), "purging cloud archive");

        let mut command = String::new();

        if let Some(id) = &backupmgr.obj_access_key_id {
            command.push_str(&format!("export AWS_ACCESS_KEY_ID={id}; "));
        }

        if let Some(key) = &backupmgr.obj_secret_access_key {
            command.push_str(&format!("export AWS_SECRET_ACCESS_KEY={key}; "));
        }

        if let Some(region) = &backupmgr.obj_region {
            command.push_str(&format!("export AWS_REGION={region}; "));
        }

        command.push_str(&format!("aws s3 rm {} --recursive", backupmgr.archive));

        if let Some(endpoint) = &backupmgr.obj_endpoint {
            command.push_str(&format!(" --endpoint={endpoint}"));
        }

        self.node
            .client()
            .execute(&Command::new(command))
            .await
            .context("failed to purge cloud archive")?;

        let Some(staging) = &backupmgr.obj_staging_directory else {
            return Ok(());
        };

        info!(staging_directory = staging.as_str(), "purging staging directory");

        self.node.client().remove_directory(staging).await
    }

    /// Remove the backups created this iteration through the tool itself so
    /// cloud-resident data is cleaned up too. The archive (and its logs) is
    /// kept; every iteration runs against the same one.
    async fn purge_backups(&self, backupmgr: &BackupMgrSettings) -> Result<()> {
        info!("purging created backups");

        let info = self.repository_info(backupmgr).await?;

        let (Some(first), Some(last)) = (info.backups.first(), info.backups.last()) else {
            return Ok(());
        };

        self.node
            .client()
            .execute(&backupmgr.command_remove(&first.id, &last.id))
            .await?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl Provision for BackupClient {
    /// Provision the backup client: a normal node install, after which the
    /// storage service is disabled so it isn't consuming resources.
    async fn provision(&self) -> Result<()> {
        info!(host = self.blueprint.host.as_str(), "provisioning backup client");

        self.node
            .provision(&self.blueprint.package_path)
            .await
            .context("failed to provision node")?;

        self.node
            .disable_service()
            .await
            .context("failed to disable the storage service")
    }
}
