//! Byte codecs for the topology descriptors embedded in control-plane
//! messages.

use bytes::Bytes;

use crate::net::Error;
use crate::topology::{Cluster, ClusterNode, ShardInfo, StoreResource};

use super::{get_bool, get_string, get_u32, get_u64, Payload};

pub fn put_store_resource(payload: &mut Payload, store: &StoreResource) {
    payload.put_string(&store.network);
    payload.put_string(&store.address);
    payload.put_string(&store.admin_address);
    payload.put_string(&store.data_center);
    payload.put_u32(store.disk_size_gb);
    payload.put_u32(store.allocated_size_gb);
    payload.put_u32(store.tags.len() as u32);
    for tag in &store.tags {
        payload.put_string(tag);
    }
}

pub fn get_store_resource(bytes: &mut Bytes) -> Result<StoreResource, Error> {
    let network = get_string(bytes)?;
    let address = get_string(bytes)?;
    let admin_address = get_string(bytes)?;
    let data_center = get_string(bytes)?;
    let disk_size_gb = get_u32(bytes)?;
    let allocated_size_gb = get_u32(bytes)?;
    let tags = (0..get_u32(bytes)?)
        .map(|_| get_string(bytes))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(StoreResource {
        network,
        address,
        admin_address,
        data_center,
        disk_size_gb,
        allocated_size_gb,
        tags,
    })
}

pub fn put_shard_info(payload: &mut Payload, info: &ShardInfo) {
    payload.put_u32(info.server_id);
    payload.put_u32(info.shard_id);
    payload.put_string(&info.keyspace);
    payload.put_u32(info.cluster_size);
    payload.put_u32(info.replication_factor);
    payload.put_bool(info.is_candidate);
}

pub fn get_shard_info(bytes: &mut Bytes) -> Result<ShardInfo, Error> {
    Ok(ShardInfo {
        server_id: get_u32(bytes)?,
        shard_id: get_u32(bytes)?,
        keyspace: get_string(bytes)?,
        cluster_size: get_u32(bytes)?,
        replication_factor: get_u32(bytes)?,
        is_candidate: get_bool(bytes)?,
    })
}

pub fn put_cluster(payload: &mut Payload, cluster: &Cluster) {
    payload.put_string(cluster.keyspace());
    payload.put_u32(cluster.expected_size());
    payload.put_u32(cluster.replication_factor());

    let nodes: Vec<&ClusterNode> = cluster.nodes().collect();
    payload.put_u32(nodes.len() as u32);
    for node in nodes {
        put_store_resource(payload, &node.store);
        put_shard_info(payload, &node.shard_info);
    }
}

pub fn get_cluster(bytes: &mut Bytes) -> Result<Cluster, Error> {
    let keyspace = get_string(bytes)?;
    let expected_size = get_u32(bytes)?;
    let replication_factor = get_u32(bytes)?;

    let mut cluster = Cluster::new(keyspace, expected_size, replication_factor);
    for _ in 0..get_u32(bytes)? {
        let store = get_store_resource(bytes)?;
        let shard_info = get_shard_info(bytes)?;
        cluster.set_node(ClusterNode { store, shard_info });
    }

    Ok(cluster)
}

/// `(segment, offset)` binlog position.
pub fn put_log_position(payload: &mut Payload, position: (u32, u64)) {
    payload.put_u32(position.0);
    payload.put_u64(position.1);
}

pub fn get_log_position(bytes: &mut Bytes) -> Result<(u32, u64), Error> {
    Ok((get_u32(bytes)?, get_u64(bytes)?))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::net::messages::get_u8;

    #[test]
    fn cluster_roundtrip() {
        let mut cluster = Cluster::new("ks", 2, 2);
        for server_id in 0..2u32 {
            for shard_id in 0..2u32 {
                cluster.set_node(ClusterNode {
                    store: StoreResource {
                        network: "tcp".into(),
                        address: format!("127.0.0.1:{}", 7000 + server_id),
                        admin_address: format!("127.0.0.1:{}", 8000 + server_id),
                        data_center: "dc1".into(),
                        disk_size_gb: 10,
                        allocated_size_gb: 1,
                        tags: vec!["ssd".into()],
                    },
                    shard_info: ShardInfo {
                        server_id,
                        shard_id,
                        keyspace: "ks".into(),
                        cluster_size: 2,
                        replication_factor: 2,
                        is_candidate: false,
                    },
                });
            }
        }

        let mut payload = Payload::named('x');
        put_cluster(&mut payload, &cluster);
        let mut bytes = payload.freeze();
        get_u8(&mut bytes).unwrap();

        let decoded = get_cluster(&mut bytes).unwrap();
        assert_eq!(decoded, cluster);
        assert_eq!(decoded.current_size(), 2);
        assert!(bytes.is_empty());
    }
}
