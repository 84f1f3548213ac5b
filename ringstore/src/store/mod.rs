//! Store server: hosts many shards across many keyspaces.

pub mod periodic;
pub mod server;
pub mod shard;
pub mod shard_bootstrap;
pub mod shard_follow;

pub use periodic::PeriodicTask;
pub use server::StoreServer;
pub use shard::Shard;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::topology::ShardInfo;

/// Store error.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("net: {0}")]
    Net(#[from] crate::net::Error),

    #[error("storage: {0}")]
    Storage(#[from] crate::storage::Error),

    #[error("binlog: {0}")]
    Binlog(#[from] crate::binlog::Error),

    #[error("config parse: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config serialize: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error("progress file: {0}")]
    Progress(#[from] serde_json::Error),

    #[error("keyspace {0} already exists")]
    KeyspaceExists(String),

    #[error("local server id is {local}, request says {requested}")]
    ServerIdMismatch { local: u32, requested: u32 },

    #[error("missing local shard status for keyspace {0}")]
    MissingLocalStatus(String),

    #[error("keyspace {0} not found")]
    KeyspaceNotFound(String),

    #[error("shard {0} not found")]
    ShardNotFound(String),

    #[error("no reachable node for server {0}")]
    NoNode(u32),

    #[error("shard is shut down")]
    ShardShutdown,
}

/// Options a store runs with.
#[derive(Debug, Clone)]
pub struct StoreOption {
    pub dir: PathBuf,
    pub address: String,
    pub admin_address: String,
    pub master: Option<String>,
    pub data_center: String,
    pub disk_size_gb: u32,
    pub tags: Vec<String>,
    pub log_file_size_mb: u32,
    pub log_file_count: u32,
}

impl Default for StoreOption {
    fn default() -> Self {
        let config = crate::config::config();
        Self {
            dir: config.store.dir.clone(),
            address: config.store.address.clone(),
            admin_address: config.store.admin_address.clone(),
            master: Some(config.store.master.clone()),
            data_center: config.general.data_center.clone(),
            disk_size_gb: config.store.disk_size_gb,
            tags: config.store.tags.clone(),
            log_file_size_mb: config.store.log_file_size_mb,
            log_file_count: config.store.log_file_count,
        }
    }
}

/// What this store hosts for one keyspace; serialized as text into
/// `<dir>/<keyspace>/cluster.config`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocalShardsInCluster {
    pub id: u32,
    pub cluster_size: u32,
    pub replication_factor: u32,
    pub shards: Vec<ShardInfo>,
}

impl LocalShardsInCluster {
    pub fn shard_info(&self, shard_id: u32) -> Option<&ShardInfo> {
        self.shards.iter().find(|s| s.shard_id == shard_id)
    }

    pub fn upsert_shard(&mut self, info: ShardInfo) {
        match self
            .shards
            .iter_mut()
            .find(|s| s.shard_id == info.shard_id)
        {
            Some(slot) => *slot = info,
            None => self.shards.push(info),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cluster_config_text_roundtrip() {
        let mut status = LocalShardsInCluster {
            id: 1,
            cluster_size: 3,
            replication_factor: 2,
            shards: vec![],
        };
        status.upsert_shard(ShardInfo {
            server_id: 1,
            shard_id: 1,
            keyspace: "ks".into(),
            cluster_size: 3,
            replication_factor: 2,
            is_candidate: false,
        });
        status.upsert_shard(ShardInfo {
            server_id: 1,
            shard_id: 0,
            keyspace: "ks".into(),
            cluster_size: 3,
            replication_factor: 2,
            is_candidate: true,
        });

        let text = toml::to_string_pretty(&status).unwrap();
        let parsed: LocalShardsInCluster = toml::from_str(&text).unwrap();
        assert_eq!(parsed, status);
        assert!(parsed.shard_info(0).unwrap().is_candidate);
        assert!(parsed.shard_info(2).is_none());
    }
}
