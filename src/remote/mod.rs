//! Remote machine access.
//!
//! All interaction with remote machines happens through a [`RemoteClient`]:
//! a thin, platform-aware wrapper over a [`RemoteExecutor`]. The executor
//! trait is the seam tests hook into; production runs use the OpenSSH-backed
//! implementation in [`openssh`].

mod openssh;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

use crate::blueprint::SshSettings;
use crate::command::{Command, Platform};
use crate::config::BIN_DIRECTORY;

pub use openssh::OpenSshExecutor;

/// Transport used to run commands on, and move files to/from, a remote
/// machine.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run a shell command on the remote machine, returning its standard
    /// output. A non-zero exit status is an error.
    async fn run(&self, command: &str) -> Result<Vec<u8>>;

    /// Copy a local file to the given remote path.
    async fn upload(&self, local: &Path, remote: &str) -> Result<()>;

    /// Copy a remote file to the given local path.
    async fn download(&self, remote: &str, local: &Path) -> Result<()>;
}

/// A connection to a single remote machine.
#[derive(Clone)]
pub struct RemoteClient {
    host: String,
    platform: Platform,
    executor: Arc<dyn RemoteExecutor>,
}

impl RemoteClient {
    /// Connect to the given host over SSH.
    pub async fn connect(host: &str, ssh: &SshSettings) -> Result<Self> {
        let executor = Arc::new(OpenSshExecutor::new(host, ssh));

        RemoteClient::with_executor(host, executor).await
    }

    /// Wrap an existing executor, determining the remote platform in the
    /// process.
    pub async fn with_executor(host: &str, executor: Arc<dyn RemoteExecutor>) -> Result<Self> {
        let distro = executor
            .run(r#"grep -oP '(?<=^ID=).+' /etc/os-release | tr -d '"'"#)
            .await
            .context("failed to determine remote distribution")?;

        let release = executor
            .run(r#"grep -oP '(?<=^VERSION_ID=).+' /etc/os-release | tr -d '"'"#)
            .await
            .context("failed to determine remote release")?;

        let platform = Platform::from_os_release(
            String::from_utf8_lossy(&distro).trim(),
            String::from_utf8_lossy(&release).trim(),
        )?;

        debug!(host, %platform, "connected to remote machine");

        Ok(RemoteClient {
            host: host.to_string(),
            platform,
            executor,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Run a command on the remote machine with the storage engine tools on
    /// `PATH`, returning its standard output.
    pub async fn execute(&self, command: &Command) -> Result<Vec<u8>> {
        debug!(host = self.host.as_str(), %command, "executing remote command");

        self.executor
            .run(&format!("export PATH={BIN_DIRECTORY}:$PATH; {command}"))
            .await
            .with_context(|| format!("failed to run '{command}' on '{}'", self.host))
    }

    /// Upload a local file to the remote machine.
    pub async fn upload(&self, local: &Path, remote: &str) -> Result<()> {
        debug!(
            host = self.host.as_str(),
            local = %local.display(),
            remote,
            "uploading file"
        );

        self.executor.upload(local, remote).await.with_context(|| {
            format!("failed to upload '{}' to '{}'", local.display(), self.host)
        })
    }

    /// Download a remote file to the given local path.
    pub async fn download(&self, remote: &str, local: &Path) -> Result<()> {
        debug!(
            host = self.host.as_str(),
            remote,
            local = %local.display(),
            "downloading file"
        );

        self.executor
            .download(remote, local)
            .await
            .with_context(|| format!("failed to download '{remote}' from '{}'", self.host))
    }

    /// Whether a file exists at the given remote path.
    pub async fn file_exists(&self, path: &str) -> Result<bool> {
        let output = self
            .execute(&Command::new(format!(
                "test -e {path} && echo true || echo false"
            )))
            .await?;

        Ok(String::from_utf8_lossy(&output).trim() == "true")
    }

    pub async fn remove_file(&self, path: &str) -> Result<()> {
        self.execute(&Command::new(format!("rm -f {path}"))).await?;

        Ok(())
    }

    pub async fn remove_directory(&self, path: &str) -> Result<()> {
        self.execute(&Command::new(format!("rm -rf {path}")))
            .await?;

        Ok(())
    }

    /// Flush filesystem buffers on the remote machine.
    pub async fn sync(&self) -> Result<()> {
        self.execute(&Command::new("sync")).await?;

        Ok(())
    }

    /// Install the given packages using the platform's package manager.
    pub async fn install_packages(&self, packages: &[&str]) -> Result<()> {
        self.execute(&self.platform.command_install_packages(packages))
            .await?;

        Ok(())
    }

    /// Uninstall the given packages using the platform's package manager.
    pub async fn uninstall_packages(&self, packages: &[&str]) -> Result<()> {
        self.execute(&self.platform.command_uninstall_packages(packages))
            .await?;

        Ok(())
    }

    /// Install the package file at the given remote path.
    pub async fn install_package_at(&self, path: &str) -> Result<()> {
        self.execute(&self.platform.command_install_package_at(path))
            .await?;

        Ok(())
    }

    /// Stop and disable the storage engine service.
    pub async fn disable_service(&self) -> Result<()> {
        self.execute(&self.platform.command_disable_service())
            .await?;

        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::mock::MockExecutor;
    use super::*;

    #[tokio::test]
    async fn with_executor_detects_the_platform() {
        let client = RemoteClient::with_executor("10.0.0.1", Arc::new(MockExecutor::ubuntu()))
            .await
            .unwrap();

        assert_eq!(client.platform(), Platform::Ubuntu2004);
        assert_eq!(client.host(), "10.0.0.1");
    }

    #[tokio::test]
    async fn with_executor_rejects_unknown_platforms() {
        let mock = MockExecutor::default();
        mock.respond("VERSION_ID", "17.1\n");
        mock.respond("ID=", "gentoo\n");

        let err = match RemoteClient::with_executor("10.0.0.1", Arc::new(mock)).await {
            Ok(_) => panic!("expected the connection to be rejected"),
            Err(err) => err,
        };

        assert!(err.to_string().contains("unsupported platform"));
    }

    #[tokio::test]
    async fn execute_prepends_the_tool_path() {
        let mock = Arc::new(MockExecutor::ubuntu());
        let client = RemoteClient::with_executor("10.0.0.1", Arc::clone(&mock) as _)
            .await
            .unwrap();

        client.execute(&Command::new("kvstore-cli host-list")).await.unwrap();

        assert!(mock.ran("export PATH=/opt/kvstore/bin:$PATH; kvstore-cli host-list"));
    }

    #[tokio::test]
    async fn file_exists_parses_the_probe_output() {
        let mock = Arc::new(MockExecutor::ubuntu());
        mock.respond("test -e /tmp/present", "true\n");
        mock.respond("test -e /tmp/missing", "false\n");

        let client = RemoteClient::with_executor("10.0.0.1", Arc::clone(&mock) as _)
            .await
            .unwrap();

        assert!(client.file_exists("/tmp/present").await.unwrap());
        assert!(!client.file_exists("/tmp/missing").await.unwrap());
    }
}
