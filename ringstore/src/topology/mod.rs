//! Cluster topology: hash-ring partitioning, replica placement, and
//! the bootstrap plans that drive topology transitions.

pub mod bootstrap;
pub mod cluster;
pub mod data_center;
pub mod partition;

pub use bootstrap::{bootstrap_plan_with_topo_change, BootstrapPlan, BootstrapRequest};
pub use cluster::{Cluster, ClusterNode, ClusterRegistry, ShardInfo, StoreResource};
pub use data_center::{meet_requirement, DataCenter};
pub use partition::{
    is_shard_in_local, local_shards, partition_hash, partition_shards, peer_shards, shard_id,
};

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Topology error.
#[derive(Debug, Error)]
pub enum Error {
    #[error("insufficient capacity: need {needed} servers, {available} eligible")]
    Capacity { needed: usize, available: usize },
}

/// One replica slot in a cluster: shard `shard_id` hosted on server
/// `server_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterShard {
    pub server_id: u32,
    pub shard_id: u32,
}

impl ClusterShard {
    pub fn new(server_id: u32, shard_id: u32) -> Self {
        Self {
            server_id,
            shard_id,
        }
    }
}

impl fmt::Display for ClusterShard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.server_id, self.shard_id)
    }
}
