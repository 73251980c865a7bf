//! The storage cluster a benchmark backs up from/restores into.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::info;

use crate::blueprint::{ClusterBlueprint, Credentials, DataBlueprint, DataLoader, SshSettings};
use crate::command::Command;
use crate::config::{
    ADMIN_PORT, BUCKET_NAME, BUCKET_SETTLE_DELAY, BENCHMARK_EVICTION_PERCENTAGE,
    COMPACTION_START_DELAY, COMPACTION_TIMEOUT, DEFAULT_PARTITIONS, ENGINE_PORT,
    FLUSH_SETTLE_DELAY, LOAD_EVICTION_PERCENTAGE, LOG_COLLECTION_TIMEOUT,
};
use crate::nodes::{basename, Node, Provision};
use crate::pool::WorkerPool;
use crate::poll::{poll, PollOutcome};
use crate::results::Stats;

/// Shell prefix computing a memory quota for commands which need one; the
/// cluster and its bucket get 80% of the free memory on the node by default.
const MEM_QUOTA_PREFIX: &str = r#"
	FREE=$(free | awk '{ print $2 }' | sed '1d;3d' | awk '{ print int($0 / 1024) }');
	QUOTA=$(echo $FREE | awk '{ print int($0 * 0.8) }');
"#;

/// A connection to the nodes of a storage cluster; the cluster itself may
/// not be set up yet.
pub struct Cluster {
    blueprint: ClusterBlueprint,
    nodes: Vec<Arc<Node>>,
}

impl Cluster {
    /// Connect to each node in the blueprint concurrently.
    pub async fn connect(ssh: &SshSettings, blueprint: ClusterBlueprint) -> Result<Self> {
        if blueprint.nodes.is_empty() {
            bail!("cluster blueprint contains no nodes");
        }

        let slots: Arc<Mutex<Vec<Option<Node>>>> =
            Arc::new(Mutex::new((0..blueprint.nodes.len()).map(|_| None).collect()));

        let mut pool = WorkerPool::bounded(blueprint.nodes.len());

        for (idx, nb) in blueprint.nodes.iter().cloned().enumerate() {
            let ssh = ssh.clone();
            let slots = Arc::clone(&slots);

            let queued = pool
                .queue(async move {
                    let node = Node::connect(&ssh, nb).await?;
                    slots.lock().await[idx] = Some(node);

                    Ok(())
                })
                .await;

            // A rejected submission means a connection already failed;
            // stop() reports it.
            if queued.is_err() {
                break;
            }
        }

        pool.stop().await.context("failed to connect to cluster")?;

        let nodes = Arc::try_unwrap(slots)
            .map_err(|_| anyhow!("connection slots still shared"))?
            .into_inner()
            .into_iter()
            .map(|slot| slot.map(Arc::new))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| anyhow!("not all nodes connected"))?;

        Ok(Cluster { blueprint, nodes })
    }

    /// Assemble a cluster directly from connected nodes; used by tests.
    #[cfg(test)]
    pub fn from_nodes(blueprint: ClusterBlueprint, nodes: Vec<Arc<Node>>) -> Self {
        Cluster { blueprint, nodes }
    }

    pub fn blueprint(&self) -> &ClusterBlueprint {
        &self.blueprint
    }

    /// The node cluster-wide administrative operations are issued against.
    fn leader(&self) -> &Node {
        &self.nodes[0]
    }

    pub fn hosts(&self) -> Vec<&str> {
        self.nodes.iter().map(|node| node.host()).collect()
    }

    /// Connection string the backup manager uses to reach the cluster.
    ///
    /// NOTE: Single-host on purpose; the engine discovers the remaining
    /// nodes itself.
    pub fn connection_string(&self, tls: bool) -> String {
        let scheme = if tls { "kvs" } else { "kv" };

        format!("{scheme}://{}", self.leader().host())
    }

    /// Load the benchmark dataset into the bucket. Ingestion is sped up by
    /// relaxing the eviction pager while the load runs.
    pub async fn load_data(&self, compact: bool) -> Result<()> {
        info!(compact, "loading benchmark dataset");

        self.flush_bucket().await.context("failed to flush bucket")?;

        self.modify_eviction_percentages(LOAD_EVICTION_PERCENTAGE)
            .await
            .context("failed to relax eviction for the load")?;

        self.generate_data()
            .await
            .context("failed to generate data")?;

        self.modify_eviction_percentages(BENCHMARK_EVICTION_PERCENTAGE)
            .await
            .context("failed to reset eviction")?;

        if !compact {
            return Ok(());
        }

        self.compact_bucket()
            .await
            .context("failed to compact bucket")
    }

    /// Trigger a log collection across the cluster and download the
    /// resulting archives into `output`, returning their local paths.
    pub async fn collect_logs(&self, output: &Path) -> Result<Vec<PathBuf>> {
        info!(output = %output.display(), "collecting cluster logs");

        self.start_log_collection()
            .await
            .context("failed to start log collection")?;

        let outcome = poll(
            || async { self.log_collection_complete().await },
            LOG_COLLECTION_TIMEOUT,
        )
        .await?;

        if outcome == PollOutcome::TimedOut {
            bail!("timed out waiting for log collection to complete");
        }

        let paths = self
            .log_collection_paths()
            .await
            .context("failed to determine the paths to logs")?;

        self.download_logs(&paths, output)
            .await
            .context("failed to download logs")?;

        Ok(paths
            .iter()
            .map(|path| output.join(basename(path)))
            .collect())
    }

    /// Basic bucket stats as reported by the cluster; displayed in the
    /// report to give context about the benchmark conditions.
    pub async fn stats(&self) -> Result<Stats> {
        info!(host = self.leader().host(), "fetching bucket stats");

        let output = self
            .leader()
            .client()
            .execute(&Command::new(format!(
                "curl -s -u {}:{} localhost:{ADMIN_PORT}/buckets/{BUCKET_NAME}/stats",
                self.credentials().username,
                self.credentials().password,
            )))
            .await?;

        #[derive(Deserialize)]
        struct Overlay {
            #[serde(rename = "basicStats")]
            basic_stats: Stats,
        }

        let decoded: Overlay =
            serde_json::from_slice(&output).context("failed to decode bucket stats")?;

        Ok(decoded.basic_stats)
    }

    /// Flush the benchmarking bucket.
    ///
    /// TODO: This is synchronous on the remote side, so a large enough
    /// bucket could hit the transport timeout.
    pub async fn flush_bucket(&self) -> Result<()> {
        info!(bucket = BUCKET_NAME, "flushing bucket");

        self.execute_on_leader(Command::new(format!(
            "kvstore-cli bucket-flush -c localhost:{ADMIN_PORT} {} --bucket {BUCKET_NAME} --force",
            self.credential_args(),
        )))
        .await?;

        // The flush reports completion before the bucket is usable again.
        tokio::time::sleep(FLUSH_SETTLE_DELAY).await;

        Ok(())
    }

    /// Flush caches on every node so a benchmark doesn't start with a warm
    /// page cache.
    pub async fn run_pre_benchmark_tasks(&self) -> Result<()> {
        info!("running cluster pre-benchmark tasks");

        self.for_each_node(|node| async move { node.flush_caches().await })
            .await
            .context("failed to flush caches")
    }

    fn credentials(&self) -> &Credentials {
        &self.blueprint.credentials
    }

    fn credential_args(&self) -> String {
        format!(
            "-u {} -p {}",
            self.credentials().username,
            self.credentials().password
        )
    }

    async fn execute_on_leader(&self, command: Command) -> Result<Vec<u8>> {
        self.leader().client().execute(&command).await
    }

    /// Run `operation` on every node concurrently, failing fast on the
    /// first error.
    async fn for_each_node<F, Fut>(&self, operation: F) -> Result<()>
    where
        F: Fn(Arc<Node>) -> Fut,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let mut pool = WorkerPool::bounded(self.nodes.len());

        for node in &self.nodes {
            if pool.queue(operation(Arc::clone(node))).await.is_err() {
                break;
            }
        }

        pool.stop().await
    }

    /// Install and initialize the storage engine on every node.
    async fn provision_nodes(&self) -> Result<()> {
        let package = self.blueprint.package_path.clone();
        let credentials = self.credentials().clone();

        self.for_each_node(move |node| {
            let package = package.clone();
            let credentials = credentials.clone();

            async move {
                info!(host = node.host(), "provisioning node");

                node.provision(&package)
                    .await
                    .context("failed to provision node")?;

                node.create_data_path()
                    .await
                    .context("failed to create data path")?;

                node.initialize(&credentials)
                    .await
                    .context("failed to initialize node")
            }
        })
        .await
    }

    /// Converge the provisioned nodes into a single cluster.
    async fn initialize_cluster(&self) -> Result<()> {
        self.cluster_init()
            .await
            .context("failed to initialize cluster")?;

        self.join_cluster()
            .await
            .context("failed to add cluster nodes")?;

        self.rebalance().await.context("failed to rebalance")
    }

    /// Initialize the cluster on the leader with an 80% memory quota.
    async fn cluster_init(&self) -> Result<()> {
        info!(
            hosts = ?self.hosts(),
            username = self.credentials().username.as_str(),
            "initializing cluster"
        );

        self.execute_on_leader(Command::new(format!(
            "{MEM_QUOTA_PREFIX} kvstore-cli cluster-init -c localhost:{ADMIN_PORT} \
             --cluster-username {} --cluster-password {} --cluster-ramsize $QUOTA",
            self.credentials().username,
            self.credentials().password,
        )))
        .await?;

        Ok(())
    }

    /// Add every non-leader node into the cluster concurrently, via the
    /// leader.
    async fn join_cluster(&self) -> Result<()> {
        let leader = Arc::clone(&self.nodes[0]);
        let credential_args = self.credential_args();
        let credentials = self.credentials().clone();

        self.for_each_node(move |node| {
            let leader = Arc::clone(&leader);
            let credential_args = credential_args.clone();
            let credentials = credentials.clone();

            async move {
                // The leader is already in the cluster.
                if Arc::ptr_eq(&node, &leader) {
                    return Ok(());
                }

                info!(host = node.host(), "adding node to cluster");

                leader
                    .client()
                    .execute(&Command::new(format!(
                        "kvstore-cli server-add -c localhost:{ADMIN_PORT} {credential_args} \
                         --server-add {} --server-add-username {} --server-add-password {} \
                         --services data",
                        node.host(),
                        credentials.username,
                        credentials.password,
                    )))
                    .await?;

                Ok(())
            }
        })
        .await
    }

    async fn rebalance(&self) -> Result<()> {
        info!("rebalancing cluster");

        self.execute_on_leader(Command::new(format!(
            "kvstore-cli rebalance -c localhost:{ADMIN_PORT} {}",
            self.credential_args(),
        )))
        .await?;

        Ok(())
    }

    /// Enable developer preview mode on the cluster.
    ///
    /// Done as a raw request since the CLI equivalent prompts for
    /// confirmation.
    async fn enable_developer_preview(&self) -> Result<()> {
        if !self.blueprint.developer_preview {
            return Ok(());
        }

        info!(hosts = ?self.hosts(), "enabling developer preview mode");

        self.execute_on_leader(Command::new(format!(
            r#"curl -X POST -u {}:{} localhost:{ADMIN_PORT}/settings/developerPreview -d "enabled=true""#,
            self.credentials().username,
            self.credentials().password,
        )))
        .await?;

        Ok(())
    }

    /// Constrain the number of bucket partitions cluster-wide; useful when
    /// scaling a benchmark down to simulate a dataset of a certain size.
    async fn limit_partitions(&self) -> Result<()> {
        let partitions = self.blueprint.bucket.partitions;

        // Zero or the platform default means leave the setting untouched.
        if partitions == 0 || partitions == DEFAULT_PARTITIONS {
            return Ok(());
        }

        info!(partitions, "limiting bucket partitions");

        self.execute_on_leader(Command::new(format!(
            r#"curl -X POST -u {}:{} localhost:{ADMIN_PORT}/settings/partitions -d "count={partitions}""#,
            self.credentials().username,
            self.credentials().password,
        )))
        .await?;

        Ok(())
    }

    /// Create the benchmarking bucket with a quota of 80% of the free
    /// memory on the leader.
    async fn create_bucket(&self) -> Result<()> {
        let bucket = &self.blueprint.bucket;

        info!(
            name = BUCKET_NAME,
            bucket_type = bucket.bucket_type.as_deref(),
            eviction_policy = bucket.eviction_policy.as_deref(),
            pitr_enabled = bucket.pitr_enabled,
            "creating bucket"
        );

        let mut command = format!(
            "{MEM_QUOTA_PREFIX} kvstore-cli bucket-create -c localhost:{ADMIN_PORT} {} \
             --bucket {BUCKET_NAME} --bucket-ramsize $QUOTA --bucket-replica 0 \
             --enable-flush 1 --wait",
            self.credential_args(),
        );

        if let Some(bucket_type) = &bucket.bucket_type {
            command.push_str(&format!(" --bucket-type {bucket_type}"));
        }

        if let Some(policy) = &bucket.eviction_policy {
            command.push_str(&format!(" --bucket-eviction-policy {policy}"));
        }

        command = self.add_pitr_args(command);

        self.execute_on_leader(Command::new(command)).await?;

        Ok(())
    }

    fn add_pitr_args(&self, mut command: String) -> String {
        let bucket = &self.blueprint.bucket;

        if bucket.pitr_enabled {
            command.push_str(" --enable-point-in-time 1");
        }

        if bucket.pitr_granularity != 0 {
            command.push_str(&format!(
                " --point-in-time-granularity {}",
                bucket.pitr_granularity
            ));
        }

        if bucket.pitr_max_history_age != 0 {
            command.push_str(&format!(
                " --point-in-time-max-history-age {}",
                bucket.pitr_max_history_age
            ));
        }

        command
    }

    /// Compact the bucket, waiting until the compaction has run to
    /// completion.
    async fn compact_bucket(&self) -> Result<()> {
        info!(bucket = BUCKET_NAME, "compacting bucket");

        self.execute_on_leader(Command::new(format!(
            "kvstore-cli bucket-compact -c localhost:{ADMIN_PORT} {} --bucket {BUCKET_NAME}",
            self.credential_args(),
        )))
        .await?;

        // The compaction task takes a moment to appear in the task list;
        // polling before then would observe a (false) completion.
        tokio::time::sleep(COMPACTION_START_DELAY).await;

        let outcome = poll(
            || async { self.compaction_complete().await },
            COMPACTION_TIMEOUT,
        )
        .await
        .context("failed to poll for compaction completion")?;

        if outcome == PollOutcome::TimedOut {
            bail!("timed out waiting for bucket compaction to complete");
        }

        Ok(())
    }

    /// Whether no compaction task is currently running on the cluster.
    async fn compaction_complete(&self) -> Result<bool> {
        info!("checking compaction status");

        let output = self
            .execute_on_leader(Command::new(format!(
                "curl -s -u {}:{} localhost:{ADMIN_PORT}/tasks",
                self.credentials().username,
                self.credentials().password,
            )))
            .await?;

        #[derive(Deserialize)]
        struct Task {
            #[serde(rename = "type")]
            kind: String,
            #[serde(default)]
            status: String,
        }

        let tasks: Vec<Task> =
            serde_json::from_slice(&output).context("failed to decode task list")?;

        for task in &tasks {
            if task.kind == "bucket_compaction" && task.status == "running" {
                return Ok(false);
            }
        }

        // An idle cluster reports a single rebalance entry; anything else in
        // the task list means compaction-adjacent work is still winding
        // down. Matches the observed behavior rather than any documented
        // contract.
        Ok(tasks.len() == 1 && tasks[0].kind == "rebalance")
    }

    async fn start_log_collection(&self) -> Result<()> {
        info!("starting log collection");

        self.execute_on_leader(Command::new(format!(
            "kvstore-cli collect-logs-start -c {} {} --all-nodes",
            self.leader().host(),
            self.credential_args(),
        )))
        .await?;

        Ok(())
    }

    /// Whether the running log collection has completed on all nodes.
    ///
    /// Status is scraped from the CLI output; a failure to reach the
    /// cluster is indistinguishable from an incomplete collection here, and
    /// shows up as a poll timeout instead.
    async fn log_collection_complete(&self) -> Result<bool> {
        info!("checking log collection status");

        let result = self
            .execute_on_leader(Command::new(format!(
                "kvstore-cli collect-logs-status -c {} {} | grep -q '^Status: completed'",
                self.leader().host(),
                self.credential_args(),
            )))
            .await;

        Ok(result.is_ok())
    }

    /// The remote paths of the collected log archives.
    async fn log_collection_paths(&self) -> Result<Vec<String>> {
        info!("determining which logs to download");

        let output = self
            .execute_on_leader(Command::new(format!(
                r#"kvstore-cli collect-logs-status -c {} {} | grep 'path :' | awk '{{ print $3 }}' | paste -sd ",""#,
                self.leader().host(),
                self.credential_args(),
            )))
            .await?;

        Ok(String::from_utf8_lossy(&output)
            .trim()
            .split(',')
            .filter(|path| !path.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Download each collected archive from whichever node holds it.
    async fn download_logs(&self, paths: &[String], output: &Path) -> Result<()> {
        info!("downloading cluster logs");

        for source in paths {
            let sink = output.join(basename(source));

            self.for_each_node(move |node| {
                let source = source.clone();
                let sink = sink.clone();

                async move {
                    if !node.client().file_exists(&source).await? {
                        return Ok(());
                    }

                    info!(host = node.host(), source = source.as_str(), "downloading logs from node");

                    node.client().download(&source, &sink).await
                }
            })
            .await
            .with_context(|| format!("failed to download logs at '{source}'"))?;
        }

        Ok(())
    }

    /// Relax/restore the eviction pager on every node.
    async fn modify_eviction_percentages(&self, percentage: u8) -> Result<()> {
        info!(hosts = ?self.hosts(), percentage, "modifying eviction percentages");

        let credentials = self.credentials().clone();

        self.for_each_node(move |node| {
            let credentials = credentials.clone();

            async move {
                info!(host = node.host(), percentage, "modifying eviction percentage");

                node.client()
                    .execute(&Command::new(format!(
                        "kvstore-ctl localhost:{ENGINE_PORT} -b {BUCKET_NAME} -u {} -p {} \
                         set eviction_age_percentage {percentage}",
                        credentials.username, credentials.password,
                    )))
                    .await?;

                Ok(())
            }
        })
        .await
    }

    /// Run the configured data loader on every node concurrently, splitting
    /// the total item count between them.
    async fn generate_data(&self) -> Result<()> {
        let data = self.blueprint.bucket.data.clone();
        let granularity = self.blueprint.bucket.pitr_granularity;
        let splits = split_items(data.items, self.nodes.len() as u64);
        let splits = Arc::new(Mutex::new(splits));
        let credentials = self.credentials().clone();

        self.for_each_node(move |node| {
            let data = data.clone();
            let splits = Arc::clone(&splits);
            let credentials = credentials.clone();

            async move {
                let items = splits
                    .lock()
                    .await
                    .pop()
                    .ok_or_else(|| anyhow!("more nodes than item splits"))?;

                info!(
                    host = node.host(),
                    bucket = BUCKET_NAME,
                    loader = ?data.loader,
                    items,
                    size = data.size,
                    threads = data.load_threads,
                    "generating data on node"
                );

                let command = match data.loader {
                    DataLoader::Backup => generate_command(&data, &credentials, items),
                    DataLoader::Workload => {
                        workload_command(&data, &credentials, granularity, items)?
                    }
                };

                node.client().execute(&command).await?;

                Ok(())
            }
        })
        .await
    }
}

#[async_trait::async_trait]
impl Provision for Cluster {
    /// Provision the cluster end to end: install the storage engine on
    /// every node, converge them into a cluster, and create the
    /// benchmarking bucket.
    async fn provision(&self) -> Result<()> {
        info!(hosts = ?self.hosts(), "provisioning cluster");

        self.provision_nodes()
            .await
            .context("failed to provision nodes")?;

        self.initialize_cluster()
            .await
            .context("failed to initialize cluster")?;

        self.enable_developer_preview()
            .await
            .context("failed to enable developer preview mode")?;

        self.limit_partitions()
            .await
            .context("failed to limit partitions")?;

        self.create_bucket()
            .await
            .context("failed to create bucket")?;

        // Flushing or reading a just-created bucket can fail with an
        // internal server error.
        tokio::time::sleep(BUCKET_SETTLE_DELAY).await;

        Ok(())
    }
}

/// The backup tool's bulk generator invocation for one node's share of the
/// dataset.
fn generate_command(data: &DataBlueprint, credentials: &Credentials, items: u64) -> Command {
    let mut command = format!(
        "kvbackup generate --cluster localhost:{ADMIN_PORT} -u {} --password {} \
         --bucket {BUCKET_NAME} --num-documents {items} \
         --prefix $(cat /dev/urandom | tr -dc 'a-z0-9' | fold -w 5 | head -n 1):: \
         --size {} --no-progress-bar",
        credentials.username, credentials.password, data.size,
    );

    if data.load_threads != 0 {
        command.push_str(&format!(" --threads {}", data.load_threads));
    } else {
        command.push_str(" --threads $(nproc)");
    }

    if !data.compressible {
        command.push_str(" --low-compression");
    }

    Command::new(command)
}

/// The mutation workload invocation for one node's share of the dataset.
///
/// The workload tool rate limits per second rather than per granularity
/// period, so it's driven at one mutation per document per second; any
/// period of a second or longer then sees at least one mutation per
/// document.
fn workload_command(
    data: &DataBlueprint,
    credentials: &Credentials,
    granularity: u64,
    items: u64,
) -> Result<Command> {
    if data.active_items == 0 {
        bail!("the workload loader requires a non-zero working set ('active_items')");
    }

    let cycles = (items / data.active_items) * granularity;

    let mut command = format!(
        "kvworkload -U localhost -u {} -P {} -B {active} -I {active} --num-cycles {cycles} \
         --rate-limit {active} -m {size} -M {size} -r 100 -R --sequential",
        credentials.username,
        credentials.password,
        active = data.active_items,
        size = data.size,
    );

    if data.load_threads != 0 {
        command.push_str(&format!(" --num-threads {}", data.load_threads));
    }

    if !data.compressible {
        command.push_str(" --compress");
    }

    Ok(Command::new(command))
}

/// Split `items` between `nodes`, giving any remainder to the last share.
/// Which node ends up with which share doesn't matter, only that the shares
/// sum to the total.
fn split_items(items: u64, nodes: u64) -> Vec<u64> {
    let mut splits = vec![items / nodes; nodes as usize];

    if let Some(last) = splits.last_mut() {
        *last += items % nodes;
    }

    splits
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_items_divides_evenly() {
        assert_eq!(split_items(500_000, 2), vec![250_000, 250_000]);
        assert_eq!(split_items(900, 3), vec![300, 300, 300]);
    }

    #[test]
    fn split_items_gives_the_remainder_to_the_last_node() {
        assert_eq!(split_items(500_001, 2), vec![250_000, 250_001]);
        assert_eq!(split_items(10, 3), vec![3, 3, 4]);
    }

    #[test]
    fn split_items_sums_to_the_total() {
        for (items, nodes) in [(1u64, 1u64), (7, 3), (500_001, 2), (12_345, 7)] {
            assert_eq!(split_items(items, nodes).iter().sum::<u64>(), items);
        }
    }

    #[test]
    fn split_items_single_node_takes_everything() {
        assert_eq!(split_items(42, 1), vec![42]);
    }

    #[test]
    fn workload_command_scales_cycles_to_the_granularity() {
        let data = DataBlueprint {
            items: 1000,
            size: 512,
            active_items: 100,
            loader: DataLoader::Workload,
            ..DataBlueprint::default()
        };

        let command = workload_command(&data, &Credentials::default(), 10, 1000).unwrap();

        // 1,000 items over a working set of 100 is ten granularity periods,
        // each mutated once per second of the ten second granularity.
        assert!(command.as_str().contains("-B 100 -I 100 --num-cycles 100"));
        assert!(command.as_str().contains("--rate-limit 100"));
        assert!(command.as_str().contains("-m 512 -M 512"));
    }

    #[test]
    fn workload_command_requires_a_working_set() {
        let data = DataBlueprint {
            items: 1000,
            loader: DataLoader::Workload,
            ..DataBlueprint::default()
        };

        assert!(workload_command(&data, &Credentials::default(), 10, 1000).is_err());
    }
}
