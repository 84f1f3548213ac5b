//! Partition math.
//!
//! Keys hash onto shards with `shard_id = hash(key) % cluster_size`.
//! The primary replica of shard `s` lives on server `s`; the other
//! `replication_factor - 1` replicas live on the next servers around the
//! ring, so server `v` hosts shards `{(v - i) mod size : 0 <= i < R}`.

use std::hash::Hasher;

use fnv::FnvHasher;

use super::ClusterShard;

/// 64-bit FNV-1a hash of the key bytes. Clients may override this per
/// request to co-locate related keys.
pub fn partition_hash(key: &[u8]) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(key);
    hasher.finish()
}

/// Shard owning the given partition hash.
pub fn shard_id(partition_hash: u64, cluster_size: u32) -> u32 {
    debug_assert!(cluster_size > 0);
    (partition_hash % cluster_size as u64) as u32
}

/// Whether server `server_id` hosts a replica of `shard_id`.
///
/// `server_id` is evaluated modulo the ring on purpose: resize plans
/// probe new servers against the old ring. Shard ids are never
/// renumbered past the ring, so `shard_id` must be in range.
pub fn is_shard_in_local(
    shard_id: u32,
    server_id: u32,
    cluster_size: u32,
    replication_factor: u32,
) -> bool {
    debug_assert!(cluster_size > 0);
    debug_assert!(shard_id < cluster_size);
    let replication_factor = replication_factor.min(cluster_size);
    (0..replication_factor).any(|i| (server_id + cluster_size - i) % cluster_size == shard_id)
}

/// All shards hosted on `server_id`.
pub fn local_shards(server_id: u32, cluster_size: u32, replication_factor: u32) -> Vec<ClusterShard> {
    debug_assert!(cluster_size > 0);
    debug_assert!(server_id < cluster_size);
    let replication_factor = replication_factor.min(cluster_size);
    (0..replication_factor)
        .map(|i| ClusterShard::new(server_id, (server_id + cluster_size - i) % cluster_size))
        .collect()
}

/// All replicas of `shard_id`: its primary server and the next
/// `replication_factor - 1` servers around the ring.
pub fn partition_shards(
    shard_id: u32,
    cluster_size: u32,
    replication_factor: u32,
) -> Vec<ClusterShard> {
    debug_assert!(cluster_size > 0);
    debug_assert!(shard_id < cluster_size);
    let replication_factor = replication_factor.min(cluster_size);
    (0..replication_factor)
        .map(|i| ClusterShard::new((shard_id + i) % cluster_size, shard_id))
        .collect()
}

/// Replica peers of `shard_id` as seen from `server_id`: the follow
/// targets for normal replication.
pub fn peer_shards(
    server_id: u32,
    shard_id: u32,
    cluster_size: u32,
    replication_factor: u32,
) -> Vec<ClusterShard> {
    partition_shards(shard_id, cluster_size, replication_factor)
        .into_iter()
        .filter(|shard| shard.server_id != server_id)
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hash_is_stable() {
        let h = partition_hash(b"a");
        assert_eq!(h, partition_hash(b"a"));
        assert_ne!(h, partition_hash(b"b"));
        // zero-length key is a valid, distinct key
        assert_ne!(partition_hash(b""), partition_hash(b"a"));
    }

    #[test]
    fn local_shards_wrap_around_the_ring() {
        // server 0 in a 5-node cluster with R=3 hosts shards 0, 4, 3
        let shards = local_shards(0, 5, 3);
        let ids: Vec<u32> = shards.iter().map(|s| s.shard_id).collect();
        assert_eq!(ids, vec![0, 4, 3]);

        for shard in &shards {
            assert!(is_shard_in_local(shard.shard_id, 0, 5, 3));
        }
        assert!(!is_shard_in_local(1, 0, 5, 3));
        assert!(!is_shard_in_local(2, 0, 5, 3));
    }

    #[test]
    fn partition_shards_cover_all_replicas() {
        let shards = partition_shards(2, 5, 3);
        let servers: Vec<u32> = shards.iter().map(|s| s.server_id).collect();
        assert_eq!(servers, vec![2, 3, 4]);
        assert!(shards.iter().all(|s| s.shard_id == 2));

        // wraps: shard 4 in a 5-node cluster with R=3 lives on 4, 0, 1
        let shards = partition_shards(4, 5, 3);
        let servers: Vec<u32> = shards.iter().map(|s| s.server_id).collect();
        assert_eq!(servers, vec![4, 0, 1]);
    }

    #[test]
    fn peer_shards_exclude_self() {
        let peers = peer_shards(2, 2, 5, 3);
        assert_eq!(peers.len(), 2);
        assert!(peers.iter().all(|s| s.server_id != 2));
    }

    #[test]
    fn single_node_cluster_has_no_peers() {
        assert!(peer_shards(0, 0, 1, 1).is_empty());
        assert_eq!(local_shards(0, 1, 1).len(), 1);
        assert!(is_shard_in_local(0, 0, 1, 1));
    }

    #[test]
    fn full_replication_puts_every_shard_everywhere() {
        // R == cluster_size: every server hosts every shard
        for server_id in 0..4 {
            let shards = local_shards(server_id, 4, 4);
            let mut ids: Vec<u32> = shards.iter().map(|s| s.shard_id).collect();
            ids.sort_unstable();
            assert_eq!(ids, vec![0, 1, 2, 3]);
        }
    }

    #[test]
    fn replication_factor_clamped_to_cluster_size() {
        let shards = local_shards(0, 2, 5);
        assert_eq!(shards.len(), 2);
    }

    #[test]
    fn shard_id_from_hash() {
        for key in [&b"a"[..], b"hello", b"", b"\x00"] {
            let hash = partition_hash(key);
            assert_eq!(shard_id(hash, 3), (hash % 3) as u32);
            assert_eq!(shard_id(hash, 1), 0);
        }
    }
}
