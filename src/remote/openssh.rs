//! [`RemoteExecutor`] backed by the system OpenSSH client.
//!
//! Shelling out to `ssh`/`scp` keeps authentication concerns (agents, config
//! files, jump hosts) with the user's existing setup instead of reimplementing
//! them.

use std::path::Path;
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use crate::blueprint::SshSettings;

use super::RemoteExecutor;

pub struct OpenSshExecutor {
    target: String,
    options: Vec<String>,
}

impl OpenSshExecutor {
    pub fn new(host: &str, ssh: &SshSettings) -> Self {
        let mut options = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
        ];

        if let Some(key) = &ssh.private_key {
            options.push("-i".to_string());
            options.push(key.display().to_string());
        }

        OpenSshExecutor {
            target: format!("{}@{host}", ssh.username),
            options,
        }
    }

    async fn spawn(&self, program: &str, args: &[String]) -> Result<Vec<u8>> {
        let output = tokio::process::Command::new(program)
            .args(&self.options)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("failed to spawn '{program}'"))?;

        if !output.status.success() {
            bail!(
                "'{program}' exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim(),
            );
        }

        Ok(output.stdout)
    }
}

#[async_trait]
impl RemoteExecutor for OpenSshExecutor {
    async fn run(&self, command: &str) -> Result<Vec<u8>> {
        self.spawn("ssh", &[self.target.clone(), command.to_string()])
            .await
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<()> {
        self.spawn(
            "scp",
            &[
                local.display().to_string(),
                format!("{}:{remote}", self.target),
            ],
        )
        .await?;

        Ok(())
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<()> {
        self.spawn(
            "scp",
            &[
                format!("{}:{remote}", self.target),
                local.display().to_string(),
            ],
        )
        .await?;

        Ok(())
    }
}
