//! End to end scenarios driven through scripted executors; no remote
//! machines (or SSH) involved.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::backupmgr::BackupMgrSettings;
use crate::blueprint::{
    BackupClientBlueprint, BenchmarkSettings, BucketBlueprint, ClusterBlueprint, Credentials,
    DataBlueprint, DataLoader, NodeBlueprint,
};
use crate::nodes::{BackupClient, Cluster, Node, Provision};
use crate::remote::mock::MockExecutor;
use crate::remote::RemoteExecutor;
use crate::shutdown::ShutdownSignal;

const INFO_JSON: &str = r#"{"backups":[{"id":"2026-08-25T10_00_00","size":1000,"items":500}]}"#;

fn cluster_blueprint(hosts: &[&str], bucket: BucketBlueprint) -> ClusterBlueprint {
    ClusterBlueprint {
        package_path: PathBuf::from("/builds/kvstore-server-7.2.0.deb"),
        nodes: hosts
            .iter()
            .map(|host| NodeBlueprint {
                host: host.to_string(),
                data_path: None,
            })
            .collect(),
        bucket,
        credentials: Credentials::default(),
        developer_preview: false,
    }
}

async fn cluster_with(
    executor: Arc<dyn RemoteExecutor>,
    blueprint: ClusterBlueprint,
) -> Cluster {
    let mut nodes = Vec::new();

    for nb in &blueprint.nodes {
        let node = Node::with_executor(nb.clone(), Arc::clone(&executor))
            .await
            .unwrap();

        nodes.push(Arc::new(node));
    }

    Cluster::from_nodes(blueprint, nodes)
}

async fn backup_client_with(executor: Arc<dyn RemoteExecutor>) -> BackupClient {
    let blueprint = BackupClientBlueprint {
        host: "10.0.0.10".to_string(),
        package_path: PathBuf::from("/builds/kvstore-server-7.2.0.deb"),
    };

    let node = Node::with_executor(
        NodeBlueprint {
            host: blueprint.host.clone(),
            data_path: None,
        },
        executor,
    )
    .await
    .unwrap();

    BackupClient::with_node(blueprint, node)
}

fn benchmark_settings(iterations: i64) -> BenchmarkSettings {
    BenchmarkSettings {
        iterations,
        backupmgr: BackupMgrSettings {
            archive: "/backups/archive".to_string(),
            repository: "bench".to_string(),
            ..BackupMgrSettings::default()
        },
    }
}

/// Index of the first executed command containing `pattern`.
fn first_index(commands: &[String], pattern: &str) -> usize {
    commands
        .iter()
        .position(|command| command.contains(pattern))
        .unwrap_or_else(|| panic!("no command matching '{pattern}'"))
}

/// An executor which requests shutdown once it has seen a command matching
/// `pattern` a given number of times.
struct CancellingExecutor {
    inner: MockExecutor,
    shutdown: ShutdownSignal,
    pattern: &'static str,
    after: usize,
    seen: AtomicUsize,
}

#[async_trait]
impl RemoteExecutor for CancellingExecutor {
    async fn run(&self, command: &str) -> Result<Vec<u8>> {
        if command.contains(self.pattern)
            && self.seen.fetch_add(1, Ordering::SeqCst) + 1 == self.after
        {
            self.shutdown.set();
        }

        self.inner.run(command).await
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<()> {
        self.inner.upload(local, remote).await
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<()> {
        self.inner.download(remote, local).await
    }
}

#[tokio::test(start_paused = true)]
async fn provision_converges_two_nodes_into_a_cluster() {
    let mock = Arc::new(MockExecutor::ubuntu());

    let cluster = cluster_with(
        Arc::clone(&mock) as _,
        cluster_blueprint(
            &["10.0.0.1", "10.0.0.2"],
            BucketBlueprint {
                eviction_policy: Some("fullEviction".to_string()),
                ..BucketBlueprint::default()
            },
        ),
    )
    .await;

    cluster.provision().await.unwrap();

    let commands = mock.commands();

    // Installs happen on both nodes before anything cluster-wide.
    let install = first_index(&commands, "dpkg -i /tmp/kvstore-server-7.2.0.deb");
    let init = first_index(&commands, "cluster-init");
    let add = first_index(&commands, "server-add");
    let rebalance = first_index(&commands, "kvstore-cli rebalance");
    let bucket = first_index(&commands, "bucket-create");

    assert!(install < init);
    assert!(init < add);
    assert!(add < rebalance);
    assert!(rebalance < bucket);

    // Only the non-leader node is added; the leader is already in the
    // cluster.
    let adds = commands
        .iter()
        .filter(|command| command.contains("server-add"))
        .count();
    assert_eq!(adds, 1);
    assert!(mock.ran("--server-add 10.0.0.2"));

    // Quota comes from the remote machine's free memory.
    assert!(mock.ran("--cluster-ramsize $QUOTA"));
    assert!(mock.ran("--bucket-ramsize $QUOTA"));
    assert!(mock.ran("--bucket-eviction-policy fullEviction"));

    // Default partition count leaves the cluster-wide setting untouched.
    assert!(!mock.ran("settings/partitions"));
}

#[tokio::test(start_paused = true)]
async fn provision_adds_every_non_leader_node() {
    let mock = Arc::new(MockExecutor::ubuntu());

    let cluster = cluster_with(
        Arc::clone(&mock) as _,
        cluster_blueprint(
            &["10.0.0.1", "10.0.0.2", "10.0.0.3"],
            BucketBlueprint::default(),
        ),
    )
    .await;

    cluster.provision().await.unwrap();

    let commands = mock.commands();

    let adds = commands
        .iter()
        .filter(|command| command.contains("server-add"))
        .count();
    assert_eq!(adds, 2);
    assert!(mock.ran("--server-add 10.0.0.2"));
    assert!(mock.ran("--server-add 10.0.0.3"));
    assert!(!mock.ran("--server-add 10.0.0.1"));

    // Every join completes before the rebalance starts.
    let rebalance = first_index(&commands, "kvstore-cli rebalance");
    let last_add = commands
        .iter()
        .rposition(|command| command.contains("server-add"))
        .unwrap();
    assert!(last_add < rebalance);
}

#[tokio::test(start_paused = true)]
async fn provision_limits_partitions_when_constrained() {
    let mock = Arc::new(MockExecutor::ubuntu());

    let cluster = cluster_with(
        Arc::clone(&mock) as _,
        cluster_blueprint(
            &["10.0.0.1"],
            BucketBlueprint {
                partitions: 128,
                ..BucketBlueprint::default()
            },
        ),
    )
    .await;

    cluster.provision().await.unwrap();

    assert!(mock.ran(r#"settings/partitions -d "count=128""#));
}

#[tokio::test(start_paused = true)]
async fn load_data_splits_items_across_nodes() {
    let mock = Arc::new(MockExecutor::ubuntu());

    let cluster = cluster_with(
        Arc::clone(&mock) as _,
        cluster_blueprint(
            &["10.0.0.1", "10.0.0.2"],
            BucketBlueprint {
                data: DataBlueprint {
                    items: 500_001,
                    ..DataBlueprint::default()
                },
                ..BucketBlueprint::default()
            },
        ),
    )
    .await;

    cluster.load_data(false).await.unwrap();

    let commands = mock.commands();

    assert!(mock.ran("--num-documents 250000"));
    assert!(mock.ran("--num-documents 250001"));

    // The pager is relaxed for the load and restored afterwards.
    let flush = first_index(&commands, "bucket-flush");
    let relax = first_index(&commands, "set eviction_age_percentage 0");
    let generate = first_index(&commands, "kvbackup generate");
    let restore = first_index(&commands, "set eviction_age_percentage 30");

    assert!(flush < relax);
    assert!(relax < generate);
    assert!(generate < restore);

    // Values default to hard-to-compress content.
    assert!(mock.ran("--low-compression"));

    assert!(!mock.ran("bucket-compact"));
}

#[tokio::test(start_paused = true)]
async fn load_data_splits_evenly_when_divisible() {
    let mock = Arc::new(MockExecutor::ubuntu());

    let cluster = cluster_with(
        Arc::clone(&mock) as _,
        cluster_blueprint(
            &["10.0.0.1", "10.0.0.2"],
            BucketBlueprint {
                data: DataBlueprint {
                    items: 500_000,
                    ..DataBlueprint::default()
                },
                ..BucketBlueprint::default()
            },
        ),
    )
    .await;

    cluster.load_data(false).await.unwrap();

    let splits = mock
        .commands()
        .iter()
        .filter(|command| command.contains("--num-documents 250000"))
        .count();
    assert_eq!(splits, 2);
}

#[tokio::test(start_paused = true)]
async fn load_data_uses_the_workload_loader_when_selected() {
    let mock = Arc::new(MockExecutor::ubuntu());

    let cluster = cluster_with(
        Arc::clone(&mock) as _,
        cluster_blueprint(
            &["10.0.0.1", "10.0.0.2"],
            BucketBlueprint {
                pitr_enabled: true,
                pitr_granularity: 10,
                data: DataBlueprint {
                    items: 1000,
                    active_items: 100,
                    loader: DataLoader::Workload,
                    ..DataBlueprint::default()
                },
                ..BucketBlueprint::default()
            },
        ),
    )
    .await;

    cluster.load_data(false).await.unwrap();

    // Each node mutates its 500 item share: five granularity periods over a
    // 100 document working set, one cycle per second of the granularity.
    let workloads = mock
        .commands()
        .iter()
        .filter(|command| command.contains("kvworkload"))
        .count();
    assert_eq!(workloads, 2);
    assert!(mock.ran("--num-cycles 50"));
    assert!(!mock.ran("kvbackup generate"));
}

#[tokio::test(start_paused = true)]
async fn shutdown_mid_run_keeps_completed_iterations() {
    let shutdown = ShutdownSignal::default();

    let executor = Arc::new(CancellingExecutor {
        inner: {
            let mock = MockExecutor::ubuntu();
            mock.respond("kvbackup info", INFO_JSON);
            mock
        },
        shutdown: shutdown.clone(),
        pattern: "kvbackup backup",
        after: 2,
        seen: AtomicUsize::new(0),
    });

    let cluster = cluster_with(
        Arc::clone(&executor) as _,
        cluster_blueprint(&["10.0.0.1"], BucketBlueprint::default()),
    )
    .await;

    let client = backup_client_with(Arc::clone(&executor) as _).await;

    let results = client
        .benchmark_backup(&benchmark_settings(5), &cluster, &shutdown)
        .await
        .unwrap();

    // The iteration in flight when shutdown was requested completes and is
    // reported; no further iterations start.
    assert_eq!(results.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn log_collection_downloads_every_archive() {
    let mock = Arc::new(MockExecutor::ubuntu());
    mock.respond(
        "paste -sd",
        "/opt/kvstore/logs/collect-10.0.0.1.zip,/opt/kvstore/logs/collect-10.0.0.2.zip\n",
    );
    mock.respond("test -e", "true\n");

    let cluster = cluster_with(
        Arc::clone(&mock) as _,
        cluster_blueprint(&["10.0.0.1", "10.0.0.2"], BucketBlueprint::default()),
    )
    .await;

    let output = tempfile::tempdir().unwrap();

    let logs = cluster.collect_logs(output.path()).await.unwrap();

    assert_eq!(
        logs,
        vec![
            output.path().join("collect-10.0.0.1.zip"),
            output.path().join("collect-10.0.0.2.zip"),
        ],
    );

    assert!(mock.ran("collect-logs-start"));
    assert!(mock.ran("--all-nodes"));

    // Both nodes claim to hold both archives, so each is downloaded twice.
    let downloads = mock
        .transfers()
        .iter()
        .filter(|transfer| transfer.starts_with("download"))
        .count();
    assert_eq!(downloads, 4);
}

#[tokio::test(start_paused = true)]
async fn backup_manager_logs_land_in_the_output_directory() {
    let mock = Arc::new(MockExecutor::ubuntu());
    mock.respond("ls -t", "/backups/archive/logs/collect-2026.zip\n");

    let client = backup_client_with(Arc::clone(&mock) as _).await;

    let output = tempfile::tempdir().unwrap();

    let sink = client
        .collect_logs(&benchmark_settings(1).backupmgr, output.path())
        .await
        .unwrap();

    assert_eq!(sink, output.path().join("collect-2026.zip"));
    assert!(mock.ran("kvbackup collect-logs -a /backups/archive"));
    assert!(mock.ran("ls -t /backups/archive/logs/*.zip | head -1"));
}

#[tokio::test(start_paused = true)]
async fn backup_client_provision_disables_the_service() {
    let mock = Arc::new(MockExecutor::ubuntu());

    let client = backup_client_with(Arc::clone(&mock) as _).await;

    client.provision().await.unwrap();

    let commands = mock.commands();

    let install = first_index(&commands, "dpkg -i");
    let disable = first_index(&commands, "systemctl disable --now kvstore-server");

    assert!(install < disable);
}
