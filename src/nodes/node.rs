//! A single remote storage engine node.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::blueprint::{Credentials, NodeBlueprint, SshSettings};
use crate::command::Command;
use crate::config::{ADMIN_PORT, INSTALL_DIRECTORY, SERVICE_NAME, SERVICE_SETTLE_DELAY};
use crate::remote::{RemoteClient, RemoteExecutor};

/// A connection to a remote node; the node may or may not be set up yet.
pub struct Node {
    blueprint: NodeBlueprint,
    client: RemoteClient,
}

impl Node {
    /// Connect to the node described by the blueprint over SSH.
    pub async fn connect(ssh: &SshSettings, blueprint: NodeBlueprint) -> Result<Self> {
        let client = RemoteClient::connect(&blueprint.host, ssh).await?;

        Ok(Node { blueprint, client })
    }

    /// Wrap an existing executor; used by tests to script remote behavior.
    pub async fn with_executor(
        blueprint: NodeBlueprint,
        executor: Arc<dyn RemoteExecutor>,
    ) -> Result<Self> {
        let client = RemoteClient::with_executor(&blueprint.host, executor).await?;

        Ok(Node { blueprint, client })
    }

    pub fn host(&self) -> &str {
        &self.blueprint.host
    }

    pub fn client(&self) -> &RemoteClient {
        &self.client
    }

    /// Install the storage engine (and anything it needs) on the node,
    /// re-installing from a clean slate if a previous deployment exists.
    pub async fn provision(&self, package: &Path) -> Result<()> {
        self.install_dependencies()
            .await
            .context("failed to install dependencies")?;

        self.uninstall_service()
            .await
            .context("failed to uninstall the storage engine")?;

        self.install_service(package)
            .await
            .context("failed to install the storage engine")?;

        // The service exposes no readiness signal; give it time to start.
        tokio::time::sleep(SERVICE_SETTLE_DELAY).await;

        Ok(())
    }

    /// Install any platform packages which must be present for
    /// provisioning/benchmarking to work.
    async fn install_dependencies(&self) -> Result<()> {
        info!(host = self.host(), "installing dependencies");

        self.client
            .install_packages(self.client.platform().dependencies())
            .await
    }

    /// Remove any existing storage engine deployment, including leftover
    /// state in the install directory.
    async fn uninstall_service(&self) -> Result<()> {
        info!(host = self.host(), "uninstalling '{SERVICE_NAME}'");

        self.client.uninstall_packages(&[SERVICE_NAME]).await?;

        info!(host = self.host(), "purging install directory");

        self.client
            .remove_directory(INSTALL_DIRECTORY)
            .await
            .with_context(|| format!("failed to purge install directory at '{INSTALL_DIRECTORY}'"))
    }

    /// Upload the local package to the node and install it. The uploaded
    /// package is removed afterwards.
    async fn install_service(&self, package: &Path) -> Result<()> {
        let name = package
            .file_name()
            .with_context(|| format!("invalid package path '{}'", package.display()))?;

        let remote = format!("/tmp/{}", name.to_string_lossy());

        info!(host = self.host(), "uploading package");

        self.client
            .upload(package, &remote)
            .await
            .context("failed to upload package")?;

        info!(host = self.host(), "installing '{SERVICE_NAME}'");

        self.client
            .install_package_at(&remote)
            .await
            .context("failed to install package")?;

        info!(host = self.host(), "cleaning up package");

        self.client.remove_file(&remote).await
    }

    /// Ensure the blueprint's data path exists and is owned by the service
    /// user.
    pub async fn create_data_path(&self) -> Result<()> {
        let Some(data_path) = &self.blueprint.data_path else {
            return Ok(());
        };

        info!(host = self.host(), data_path, "creating data path");

        self.client
            .execute(&Command::new(format!("mkdir -p {data_path}")))
            .await
            .context("failed to create remote data directory")?;

        self.client
            .execute(&Command::new(format!("chown -R kvstore:kvstore {data_path}")))
            .await
            .context("failed to chown remote data directory")?;

        Ok(())
    }

    /// Perform node level initialization of the storage engine.
    pub async fn initialize(&self, credentials: &Credentials) -> Result<()> {
        info!(
            host = self.host(),
            data_path = self.blueprint.data_path.as_deref(),
            "initializing node"
        );

        let mut init = format!(
            "kvstore-cli node-init -c localhost:{ADMIN_PORT} -u {} -p {}",
            credentials.username, credentials.password,
        );

        if let Some(data_path) = &self.blueprint.data_path {
            init.push_str(&format!(" --node-init-data-path {data_path}"));
        }

        self.client.execute(&Command::new(init)).await?;

        Ok(())
    }

    /// Stop and disable the storage engine service; done on the backup
    /// client so it isn't competing with the tool under test for resources.
    pub async fn disable_service(&self) -> Result<()> {
        info!(host = self.host(), "disabling '{SERVICE_NAME}'");

        self.client.disable_service().await
    }

    /// Flush filesystem caches so a benchmark doesn't read a previous run's
    /// pages back out of memory.
    pub async fn flush_caches(&self) -> Result<()> {
        self.client
            .execute(&Command::new("sync; echo 3 > /proc/sys/vm/drop_caches"))
            .await?;

        Ok(())
    }
}
