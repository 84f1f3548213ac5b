//! Cluster descriptors.
//!
//! A `Cluster` is pure data: which store hosts which replica of which
//! shard. Shards do not hold cluster pointers; they keep their keyspace
//! name and look the live descriptor up in the `ClusterRegistry`.

use std::fmt;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// A store process, as advertised to the master.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreResource {
    pub network: String,
    /// Data-plane address.
    pub address: String,
    /// Admin address: peer replication and control RPCs.
    pub admin_address: String,
    pub data_center: String,
    pub disk_size_gb: u32,
    pub allocated_size_gb: u32,
    pub tags: Vec<String>,
}

impl StoreResource {
    /// Unallocated disk, in GB.
    pub fn free_disk_gb(&self) -> u32 {
        self.disk_size_gb.saturating_sub(self.allocated_size_gb)
    }
}

/// Identifies one replica within a cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardInfo {
    pub server_id: u32,
    pub shard_id: u32,
    pub keyspace: String,
    pub cluster_size: u32,
    pub replication_factor: u32,
    /// Created for a pending topology transition, not yet promoted.
    pub is_candidate: bool,
}

impl ShardInfo {
    /// "keyspace.server.shard", the shard's name in logs.
    pub fn identifier(&self) -> String {
        format!("{}.{}.{}", self.keyspace, self.server_id, self.shard_id)
    }
}

/// One replica slot and the store hosting it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterNode {
    pub store: StoreResource,
    pub shard_info: ShardInfo,
}

/// A sized, replicated ring of shards under one keyspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    keyspace: String,
    expected_size: u32,
    replication_factor: u32,
    /// `logical_shards[server_id][replica_index]`
    logical_shards: Vec<Vec<Option<ClusterNode>>>,
}

impl Cluster {
    pub fn new(keyspace: impl ToString, expected_size: u32, replication_factor: u32) -> Self {
        let replicas = replication_factor.min(expected_size).max(1) as usize;
        Self {
            keyspace: keyspace.to_string(),
            expected_size,
            replication_factor,
            logical_shards: vec![vec![None; replicas]; expected_size as usize],
        }
    }

    pub fn keyspace(&self) -> &str {
        &self.keyspace
    }

    pub fn expected_size(&self) -> u32 {
        self.expected_size
    }

    pub fn replication_factor(&self) -> u32 {
        self.replication_factor
    }

    /// Servers whose primary slot is filled.
    pub fn current_size(&self) -> u32 {
        self.logical_shards
            .iter()
            .filter(|replicas| replicas.first().map(Option::is_some).unwrap_or(false))
            .count() as u32
    }

    /// Replica index of `shard_id` on `server_id`, if that server hosts it.
    fn replica_index(&self, server_id: u32, shard_id: u32) -> Option<usize> {
        if self.expected_size == 0 || server_id >= self.expected_size {
            return None;
        }
        let index = ((server_id + self.expected_size - shard_id) % self.expected_size) as usize;
        (index < self.logical_shards[server_id as usize].len()).then_some(index)
    }

    pub fn get_node(&self, server_id: u32, replica_index: u32) -> Option<&ClusterNode> {
        self.logical_shards
            .get(server_id as usize)?
            .get(replica_index as usize)?
            .as_ref()
    }

    /// Place a node into its slot. Returns false when the slot is out of
    /// range for this cluster.
    pub fn set_node(&mut self, node: ClusterNode) -> bool {
        let server_id = node.shard_info.server_id;
        let shard_id = node.shard_info.shard_id;
        match self.replica_index(server_id, shard_id) {
            Some(index) => {
                self.logical_shards[server_id as usize][index] = Some(node);
                true
            }
            None => false,
        }
    }

    pub fn remove_server(&mut self, server_id: u32) {
        if let Some(replicas) = self.logical_shards.get_mut(server_id as usize) {
            for slot in replicas.iter_mut() {
                *slot = None;
            }
        }
    }

    /// All placed nodes.
    pub fn nodes(&self) -> impl Iterator<Item = &ClusterNode> {
        self.logical_shards
            .iter()
            .flat_map(|replicas| replicas.iter().filter_map(Option::as_ref))
    }
}

impl fmt::Display for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}/{} r={}",
            self.keyspace,
            self.current_size(),
            self.expected_size,
            self.replication_factor
        )
    }
}

/// Live cluster descriptors, keyed by keyspace name.
#[derive(Debug, Default)]
pub struct ClusterRegistry {
    clusters: DashMap<String, Cluster>,
}

impl ClusterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the descriptor for a keyspace.
    pub fn get(&self, keyspace: &str) -> Option<Cluster> {
        self.clusters.get(keyspace).map(|c| c.clone())
    }

    /// Get the descriptor, creating an empty one if the keyspace is new
    /// or its recorded shape differs.
    pub fn get_or_create(
        &self,
        keyspace: &str,
        expected_size: u32,
        replication_factor: u32,
    ) -> Cluster {
        let mut entry = self
            .clusters
            .entry(keyspace.to_string())
            .or_insert_with(|| Cluster::new(keyspace, expected_size, replication_factor));
        if entry.expected_size() != expected_size
            || entry.replication_factor() != replication_factor
        {
            *entry = Cluster::new(keyspace, expected_size, replication_factor);
        }
        entry.clone()
    }

    /// Replace the descriptor wholesale (ring snapshot from the master).
    pub fn set(&self, cluster: Cluster) {
        self.clusters.insert(cluster.keyspace().to_string(), cluster);
    }

    /// Place one node into the keyspace's descriptor.
    pub fn set_node(&self, keyspace: &str, node: ClusterNode) {
        if let Some(mut cluster) = self.clusters.get_mut(keyspace) {
            cluster.set_node(node);
        }
    }

    pub fn remove(&self, keyspace: &str) {
        self.clusters.remove(keyspace);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn node(keyspace: &str, server_id: u32, shard_id: u32, size: u32, r: u32) -> ClusterNode {
        ClusterNode {
            store: StoreResource {
                admin_address: format!("127.0.0.1:{}", 9000 + server_id),
                ..Default::default()
            },
            shard_info: ShardInfo {
                server_id,
                shard_id,
                keyspace: keyspace.into(),
                cluster_size: size,
                replication_factor: r,
                is_candidate: false,
            },
        }
    }

    #[test]
    fn placement_by_replica_index() {
        let mut cluster = Cluster::new("ks", 3, 2);
        assert_eq!(cluster.current_size(), 0);

        // server 1 hosts shard 1 (primary) and shard 0 (replica)
        assert!(cluster.set_node(node("ks", 1, 1, 3, 2)));
        assert!(cluster.set_node(node("ks", 1, 0, 3, 2)));
        // shard 2 is not local to server 1 with R=2
        assert!(!cluster.set_node(node("ks", 1, 2, 3, 2)));

        assert_eq!(cluster.get_node(1, 0).unwrap().shard_info.shard_id, 1);
        assert_eq!(cluster.get_node(1, 1).unwrap().shard_info.shard_id, 0);
        assert_eq!(cluster.current_size(), 1);
        assert_eq!(cluster.nodes().count(), 2);
    }

    #[test]
    fn remove_server_clears_slots() {
        let mut cluster = Cluster::new("ks", 2, 1);
        cluster.set_node(node("ks", 0, 0, 2, 1));
        cluster.set_node(node("ks", 1, 1, 2, 1));
        assert_eq!(cluster.current_size(), 2);

        cluster.remove_server(1);
        assert_eq!(cluster.current_size(), 1);
        assert!(cluster.get_node(1, 0).is_none());
    }

    #[test]
    fn registry_recreates_on_shape_change() {
        let registry = ClusterRegistry::new();
        let mut cluster = registry.get_or_create("ks", 2, 1);
        cluster.set_node(node("ks", 0, 0, 2, 1));
        registry.set(cluster);

        assert_eq!(registry.get("ks").unwrap().current_size(), 1);

        // same shape: descriptor survives
        let same = registry.get_or_create("ks", 2, 1);
        assert_eq!(same.current_size(), 1);

        // resized: fresh descriptor
        let resized = registry.get_or_create("ks", 3, 1);
        assert_eq!(resized.current_size(), 0);
        assert_eq!(resized.expected_size(), 3);
    }
}
