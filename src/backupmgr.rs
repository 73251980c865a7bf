//! Command construction for `kvbackup`, the backup manager under test.
//!
//! The backup manager's command line contract is consumed as opaque string
//! templates; nothing here interprets its output beyond the documented JSON
//! of `kvbackup info`.

use serde::{Deserialize, Serialize};

use crate::blueprint::{Credentials, Environment};
use crate::command::Command;

/// Configuration for `kvbackup` used whenever the tool is run on the backup
/// client.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BackupMgrSettings {
    /// Environment variable overlay prefixed onto every invocation.
    #[serde(default, skip_serializing_if = "Environment::is_empty")]
    pub environment: Environment,

    /// Archive/repository `kvbackup` operates on. An archive beginning with
    /// `s3://` is treated as cloud storage when purging.
    #[serde(default)]
    pub archive: String,
    #[serde(default)]
    pub repository: String,

    /// Storage backend override; hidden/unsupported upstream, passed
    /// through verbatim when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<String>,

    // Cloud related arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obj_staging_directory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obj_access_key_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obj_secret_access_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obj_region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obj_endpoint: Option<String>,
    #[serde(default)]
    pub obj_auth_by_instance_metadata: bool,
    #[serde(default)]
    pub obj_no_ssl_verify: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3_log_level: Option<String>,
    #[serde(default)]
    pub s3_force_path_style: bool,

    /// Whether to reach the cluster over TLS.
    #[serde(default)]
    pub tls: bool,

    // Encryption related arguments.
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_algo: Option<String>,

    /// Number of threads `kvbackup` runs with; zero lets the tool select
    /// automatically.
    #[serde(default)]
    pub threads: u64,

    /// Whether transferred data should be discarded instead of written; the
    /// benchmark then measures pure transfer without sink I/O.
    #[serde(default)]
    pub blackhole: bool,
}

impl BackupMgrSettings {
    /// Command which creates the benchmark archive/repository.
    pub fn command_config(&self) -> Command {
        let mut command = format!(
            "kvbackup config -a {} -r {}",
            self.archive, self.repository
        );

        command = self.prefix_environment(command);
        command = self.add_cloud_args(command);
        command = self.add_encryption_args(command, true);

        Command::new(command)
    }

    /// Command which backs up the cluster at `host` into the repository.
    ///
    /// Restore benchmarks must create a real backup to restore from, so
    /// `ignore_blackhole` suppresses the blackhole sink for that one
    /// up-front backup.
    pub fn command_backup(
        &self,
        host: &str,
        credentials: &Credentials,
        ignore_blackhole: bool,
    ) -> Command {
        let mut command = format!(
            "kvbackup backup -a {} -r {} -c {} -u {} -p {} --no-progress-bar",
            self.archive, self.repository, host, credentials.username, credentials.password,
        );

        command = self.prefix_environment(command);
        command = self.add_cloud_args(command);
        command = self.add_encryption_args(command, false);
        command = self.add_storage(command);
        command = self.add_threads(command);

        if !ignore_blackhole {
            command = self.add_blackhole(command);
        }

        Command::new(command)
    }

    /// Command which restores the repository's backups into the cluster at
    /// `host`.
    pub fn command_restore(&self, host: &str, credentials: &Credentials) -> Command {
        let mut command = format!(
            "kvbackup restore -a {} -r {} -c {} -u {} -p {} --no-progress-bar",
            self.archive, self.repository, host, credentials.username, credentials.password,
        );

        command = self.prefix_environment(command);
        command = self.add_cloud_args(command);
        command = self.add_encryption_args(command, false);
        command = self.add_threads(command);
        command = self.add_blackhole(command);

        Command::new(command)
    }

    /// Command which reports the repository contents as JSON.
    pub fn command_info(&self) -> Command {
        let mut command = format!("kvbackup info -a {} -r {} -j", self.archive, self.repository);

        command = self.prefix_environment(command);
        command = self.add_cloud_args(command);

        Command::new(command)
    }

    /// Command which removes all backups from `start` to `end` inclusive.
    /// Removal goes through the tool so cloud-resident data is cleaned up
    /// too.
    pub fn command_remove(&self, start: &str, end: &str) -> Command {
        let mut command = format!(
            "kvbackup remove -a {} -r {} --backups {start},{end}",
            self.archive, self.repository,
        );

        command = self.prefix_environment(command);
        command = self.add_cloud_args(command);

        Command::new(command)
    }

    /// Command which collects the backup manager's own logs into the
    /// archive.
    pub fn command_collect_logs(&self) -> Command {
        let mut command = format!("kvbackup collect-logs -a {}", self.archive);

        command = self.add_cloud_args(command);
        command = self.prefix_environment(command);

        Command::new(command)
    }

    /// Prefix the given command with the configured environment variables.
    fn prefix_environment(&self, command: String) -> String {
        if self.environment.is_empty() {
            return command;
        }

        let mut env = String::new();
        for (key, value) in &self.environment {
            env.push_str(&format!("export {key}={value}; "));
        }

        env + &command
    }

    fn add_storage(&self, mut command: String) -> String {
        if let Some(storage) = &self.storage {
            command.push_str(&format!(" --storage {storage}"));
        }

        command
    }

    fn add_threads(&self, mut command: String) -> String {
        if self.threads != 0 {
            command.push_str(&format!(" --threads {}", self.threads));
        } else {
            command.push_str(" --auto-select-threads");
        }

        command
    }

    fn add_blackhole(&self, mut command: String) -> String {
        if self.blackhole {
            command.push_str(" --sink blackhole");
        }

        command
    }

    fn add_cloud_args(&self, mut command: String) -> String {
        if let Some(staging) = &self.obj_staging_directory {
            command.push_str(&format!(" --obj-staging-dir {staging}"));
        }

        if let Some(id) = &self.obj_access_key_id {
            command.push_str(&format!(" --obj-access-key-id {id}"));
        }

        if let Some(key) = &self.obj_secret_access_key {
            command.push_str(&format!(" --obj-secret-access-key {key}"));
        }

        if let Some(region) = &self.obj_region {
            command.push_str(&format!(" --obj-region {region}"));
        }

        if let Some(endpoint) = &self.obj_endpoint {
            command.push_str(&format!(" --obj-endpoint {endpoint}"));
        }

        if self.obj_auth_by_instance_metadata {
            command.push_str(" --obj-auth-by-instance-metadata");
        }

        if self.obj_no_ssl_verify {
            command.push_str(" --obj-no-ssl-verify");
        }

        if let Some(level) = &self.s3_log_level {
            command.push_str(&format!(" --s3-log-level {level}"));
        }

        if self.s3_force_path_style {
            command.push_str(" --s3-force-path-style");
        }

        command
    }

    fn add_encryption_args(&self, mut command: String, config: bool) -> String {
        if !self.encrypted {
            return command;
        }

        if let Some(passphrase) = &self.passphrase {
            command.push_str(&format!(" --passphrase {passphrase}"));
        }

        if !config {
            return command;
        }

        command.push_str(" --encrypted");

        if let Some(algo) = &self.encryption_algo {
            command.push_str(&format!(" --encryption-algo {algo}"));
        }

        command
    }
}
