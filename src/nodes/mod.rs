//! Connections to the remote machines a benchmark runs against: the storage
//! cluster nodes and the backup client which drives the tool under test.

mod backup_client;
mod cluster;
mod node;

use anyhow::Result;
use async_trait::async_trait;

pub use backup_client::BackupClient;
pub use cluster::Cluster;
pub use node::Node;

/// Something which can be (re-)provisioned from its blueprint. The cluster
/// and the backup client provision differently but are driven the same way.
#[async_trait]
pub trait Provision: Send + Sync {
    async fn provision(&self) -> Result<()>;
}

/// The final component of a remote path.
pub(crate) fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basename_strips_directories() {
        assert_eq!(basename("/opt/kvstore/logs/collect.zip"), "collect.zip");
        assert_eq!(basename("collect.zip"), "collect.zip");
    }
}
