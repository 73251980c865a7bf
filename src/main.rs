use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::ProgressBar;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use autobench::blueprint::Config;
use autobench::nodes::{BackupClient, Cluster, Provision};
use autobench::pool::WorkerPool;
use autobench::report::{Report, ReportOptions};
use autobench::results::BenchmarkResult;
use autobench::shutdown::ShutdownSignal;

#[derive(Parser)]
#[command(
    name = "autobench",
    about = "Provision a key-value storage cluster and benchmark backup/restore against it"
)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Quiet mode - only warnings and the final report
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Install and configure the cluster and backup client, then load the
    /// benchmark dataset
    Provision {
        /// Path to a config file
        #[arg(short, long)]
        config: PathBuf,

        /// Skip provisioning and only load the benchmark dataset; useful
        /// when benchmarking multiple datasets on the same cluster
        #[arg(long)]
        load_only: bool,
    },

    /// Benchmark the backup manager against an already provisioned cluster
    Benchmark {
        /// Whether to benchmark backups or restores
        #[arg(value_enum)]
        operation: Operation,

        /// Path to a config file
        #[arg(short, long)]
        config: PathBuf,

        /// Collect cluster/backup manager logs and download them into this
        /// directory
        #[arg(short = 'l', long)]
        collect_logs: Option<PathBuf>,

        /// JSON format benchmarking report
        #[arg(short, long)]
        json: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Operation {
    Backup,
    Restore,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if args.quiet {
            "autobench=warn"
        } else {
            "autobench=info"
        })
    });

    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    match args.command {
        Command::Provision { config, load_only } => {
            run_provision(&config, load_only, args.quiet).await
        }
        Command::Benchmark {
            operation,
            config,
            collect_logs,
            json,
        } => run_benchmark(operation, &config, collect_logs.as_deref(), json, args.quiet).await,
    }
}

/// Provision the cluster and the backup client concurrently, then load the
/// benchmark dataset.
async fn run_provision(config: &Path, load_only: bool, quiet: bool) -> Result<()> {
    let config = Config::load(config)?;

    let (cluster, client) = connect(&config).await?;

    let progress = spinner(quiet, "provisioning");

    if !load_only {
        let provisioners: Vec<Arc<dyn Provision>> =
            vec![Arc::clone(&cluster) as _, Arc::clone(&client) as _];

        let mut pool = WorkerPool::new(provisioners.len());

        for provisioner in provisioners {
            let queued = pool
                .queue(async move { provisioner.provision().await })
                .await;

            if queued.is_err() {
                break;
            }
        }

        pool.stop().await.context("failed to provision")?;
    }

    progress.set_message("loading dataset");

    cluster
        .load_data(config.blueprint.cluster.bucket.compact)
        .await
        .context("failed to load benchmark dataset")?;

    progress.finish_and_clear();

    Ok(())
}

/// Run the requested benchmark and print a report.
///
/// NOTE: The report includes figures derived from the configured dataset;
/// it's on the user to make sure the dataset hasn't changed since the
/// cluster was provisioned.
async fn run_benchmark(
    operation: Operation,
    config: &Path,
    logs: Option<&Path>,
    json: bool,
    quiet: bool,
) -> Result<()> {
    let config = Config::load(config)?;

    let (cluster, client) = connect(&config).await?;

    let shutdown = ShutdownSignal::listening();

    let progress = spinner(quiet || json, "benchmarking");

    let results: Vec<BenchmarkResult> = match operation {
        Operation::Backup => {
            client
                .benchmark_backup(&config.benchmark, &cluster, &shutdown)
                .await
        }
        Operation::Restore => {
            client
                .benchmark_restore(&config.benchmark, &cluster, &shutdown)
                .await
        }
    }
    .context("failed to run benchmarks")?;

    let stats = cluster
        .stats()
        .await
        .context("failed to get cluster stats")?;

    // The iterations already ran; a log collection failure shouldn't throw
    // their results away.
    let (cluster_logs, backup_logs) = match collect_logs(&cluster, &client, &config, logs).await {
        Ok(logs) => logs,
        Err(err) => {
            tracing::warn!("failed to collect logs: {err:#}");
            (Vec::new(), None)
        }
    };

    progress.finish_and_clear();

    let report = Report::new(ReportOptions {
        data: &config.blueprint.cluster.bucket.data,
        stats: Some(stats),
        results: &results,
        cluster_logs,
        backup_logs,
    });

    report.print(json).context("failed to display report")
}

/// Connect to the cluster and the backup client.
async fn connect(config: &Config) -> Result<(Arc<Cluster>, Arc<BackupClient>)> {
    let cluster = Cluster::connect(&config.ssh, config.blueprint.cluster.clone())
        .await
        .context("failed to connect to cluster")?;

    let client = BackupClient::connect(&config.ssh, config.blueprint.backup_client.clone())
        .await
        .context("failed to connect to backup client")?;

    Ok((Arc::new(cluster), Arc::new(client)))
}

/// Collect cluster and backup manager logs into `path`; no path means the
/// user doesn't want them.
async fn collect_logs(
    cluster: &Cluster,
    client: &BackupClient,
    config: &Config,
    path: Option<&Path>,
) -> Result<(Vec<PathBuf>, Option<PathBuf>)> {
    let Some(path) = path else {
        return Ok((Vec::new(), None));
    };

    if path.exists() && !path.is_dir() {
        bail!("logs output path must not exist, or be a directory");
    }

    tokio::fs::create_dir_all(path)
        .await
        .context("failed to create logs output directory")?;

    let cluster_logs = cluster
        .collect_logs(path)
        .await
        .context("failed to collect cluster logs")?;

    let backup_logs = client
        .collect_logs(&config.benchmark.backupmgr, path)
        .await
        .context("failed to collect backup manager logs")?;

    Ok((cluster_logs, Some(backup_logs)))
}

/// A steady-tick spinner so long phases visibly make progress; hidden in
/// quiet/JSON mode.
fn spinner(hidden: bool, message: &str) -> ProgressBar {
    if hidden {
        return ProgressBar::hidden();
    }

    let bar = ProgressBar::new_spinner().with_message(message.to_string());
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}
