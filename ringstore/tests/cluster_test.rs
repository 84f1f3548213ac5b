//! End-to-end cluster tests: a live master, live stores, and the
//! client router on ephemeral ports.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::sleep;

use ringstore::client::ClusterClient;
use ringstore::master::{MasterOption, MasterServer};
use ringstore::net::messages::{
    BatchRequest, BatchResponse, CreateClusterRequest, GetRequest, PutRequest, Request, Response,
};
use ringstore::net::Stream;
use ringstore::store::{StoreOption, StoreServer};
use ringstore::topology::{partition_hash, Cluster};
use ringstore::util::now_ns;

const DC: &str = "dc1";

async fn start_master() -> Arc<MasterServer> {
    MasterServer::start(MasterOption {
        address: "127.0.0.1:0".into(),
        data_center: DC.into(),
    })
    .await
    .expect("master start")
}

async fn start_store(master: &Arc<MasterServer>, dir: &std::path::Path) -> Arc<StoreServer> {
    StoreServer::start(StoreOption {
        dir: dir.to_path_buf(),
        address: "127.0.0.1:0".into(),
        admin_address: "127.0.0.1:0".into(),
        master: Some(master.address().to_string()),
        data_center: DC.into(),
        disk_size_gb: 100,
        tags: vec![],
        log_file_size_mb: 4,
        log_file_count: 4,
    })
    .await
    .expect("store start")
}

async fn wait_for_stores(master: &Arc<MasterServer>, count: usize) {
    for _ in 0..100 {
        if master.store_count(DC) >= count {
            return;
        }
        sleep(Duration::from_millis(100)).await;
    }
    panic!("{} stores never registered", count);
}

fn create_request(keyspace: &str, cluster_size: u32, replication_factor: u32) -> CreateClusterRequest {
    CreateClusterRequest {
        keyspace: keyspace.into(),
        cluster_size,
        replication_factor,
        total_disk_size_gb: 1,
        tags: vec![],
    }
}

/// Send one batch straight to a store's data address.
async fn send_batch(addr: &str, keyspace: &str, requests: Vec<Request>) -> Vec<Response> {
    let mut stream = Stream::connect(addr).await.expect("dial store");
    stream
        .send_flush(&BatchRequest {
            keyspace: keyspace.into(),
            requests,
        })
        .await
        .expect("send batch");
    let message = stream.read_message().await.expect("read response");
    let batch: BatchResponse = message.parse().expect("parse response");
    batch.responses
}

async fn direct_get(addr: &str, keyspace: &str, key: &[u8]) -> Response {
    let mut responses = send_batch(
        addr,
        keyspace,
        vec![Request::Get(GetRequest {
            key: Bytes::copy_from_slice(key),
            partition_hash: partition_hash(key),
        })],
    )
    .await;
    responses.pop().expect("one response")
}

fn direct_put(key: &[u8], value: &[u8], updated_at_ns: u64) -> Request {
    Request::Put(PutRequest {
        key: Bytes::copy_from_slice(key),
        partition_hash: partition_hash(key),
        value: Bytes::copy_from_slice(value),
        ttl_second: 0,
        op_and_data_type: 0,
        updated_at_ns,
    })
}

/// Data address of the store hosting `server_id` in the cluster.
fn server_data_addr(cluster: &Cluster, server_id: u32) -> String {
    cluster
        .get_node(server_id, 0)
        .expect("server placed")
        .store
        .address
        .clone()
}

#[tokio::test]
async fn single_node_put_get() {
    let master = start_master().await;
    let dir = tempfile::tempdir().unwrap();
    let store = start_store(&master, dir.path()).await;
    wait_for_stores(&master, 1).await;

    master
        .create_cluster(&create_request("k1", 1, 1))
        .await
        .expect("create cluster");

    let client = ClusterClient::connect(master.address(), "k1", DC)
        .await
        .expect("client connect");
    client
        .wait_for_cluster_size(1, Duration::from_secs(10))
        .await
        .expect("ring");

    client.put("a", "1").await.expect("put");
    assert_eq!(client.get("a").await.expect("get"), Some(Bytes::from("1")));
    assert_eq!(client.get("missing").await.expect("get"), None);

    // zero-length key is a real key
    client.put("", "empty").await.expect("put empty key");
    assert_eq!(client.get("").await.unwrap(), Some(Bytes::from("empty")));

    client.delete("a").await.expect("delete");
    assert_eq!(client.get("a").await.unwrap(), None);

    // merge with the default operator concatenates
    client.merge("m", "12").await.expect("merge");
    client.merge("m", "34").await.expect("merge");
    assert_eq!(client.get("m").await.unwrap(), Some(Bytes::from("1234")));

    client.shutdown();
    store.shutdown();
    master.shutdown();
}

#[tokio::test]
async fn batched_requests_preserve_order() {
    let master = start_master().await;
    let dir1 = tempfile::tempdir().unwrap();
    let dir2 = tempfile::tempdir().unwrap();
    let store1 = start_store(&master, dir1.path()).await;
    let store2 = start_store(&master, dir2.path()).await;
    wait_for_stores(&master, 2).await;

    master
        .create_cluster(&create_request("kb", 2, 1))
        .await
        .expect("create cluster");

    let client = ClusterClient::connect(master.address(), "kb", DC)
        .await
        .expect("client connect");
    client
        .wait_for_cluster_size(2, Duration::from_secs(10))
        .await
        .expect("ring");

    // keys spread across both shards
    let keys: Vec<String> = (0..40).map(|i| format!("key{}", i)).collect();
    for key in &keys {
        client
            .put(key.as_str(), format!("v-{}", key))
            .await
            .expect("put");
    }

    let values = client
        .batch_get(keys.iter().map(|k| k.as_str()))
        .await
        .expect("batch get");
    assert_eq!(values.len(), keys.len());
    for (key, value) in keys.iter().zip(values) {
        assert_eq!(value, Some(Bytes::from(format!("v-{}", key))));
    }

    client.shutdown();
    store1.shutdown();
    store2.shutdown();
    master.shutdown();
}

#[tokio::test]
async fn lww_converges_across_replicas() {
    let master = start_master().await;
    let dir1 = tempfile::tempdir().unwrap();
    let dir2 = tempfile::tempdir().unwrap();
    let store1 = start_store(&master, dir1.path()).await;
    let store2 = start_store(&master, dir2.path()).await;
    wait_for_stores(&master, 2).await;

    let cluster = master
        .create_cluster(&create_request("k2", 2, 2))
        .await
        .expect("create cluster");

    // with R == cluster size, both servers host both shards; write the
    // same key to each server with conflicting timestamps
    let addr0 = server_data_addr(&cluster, 0);
    let addr1 = server_data_addr(&cluster, 1);
    let base = now_ns();

    let responses = send_batch(&addr0, "k2", vec![direct_put(b"a", b"old", base)]).await;
    assert!(responses[0].is_ok(), "{}", responses[0].status());
    let responses = send_batch(&addr1, "k2", vec![direct_put(b"a", b"new", base + 100)]).await;
    assert!(responses[0].is_ok(), "{}", responses[0].status());

    // replication converges on the newer write on both servers
    let mut converged = false;
    for _ in 0..150 {
        let r0 = direct_get(&addr0, "k2", b"a").await;
        let r1 = direct_get(&addr1, "k2", b"a").await;
        let v0 = match r0 {
            Response::Get(ref get) => get.key_value.as_ref().map(|kv| kv.value.clone()),
            _ => None,
        };
        let v1 = match r1 {
            Response::Get(ref get) => get.key_value.as_ref().map(|kv| kv.value.clone()),
            _ => None,
        };
        if v0 == Some(Bytes::from("new")) && v1 == Some(Bytes::from("new")) {
            converged = true;
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
    assert!(converged, "replicas never converged on the newest write");

    store1.shutdown();
    store2.shutdown();
    master.shutdown();
}

#[tokio::test]
async fn ttl_expiry_and_supersession() {
    let master = start_master().await;
    let dir = tempfile::tempdir().unwrap();
    let store = start_store(&master, dir.path()).await;
    wait_for_stores(&master, 1).await;

    master
        .create_cluster(&create_request("k5", 1, 1))
        .await
        .expect("create cluster");

    let client = ClusterClient::connect(master.address(), "k5", DC)
        .await
        .expect("client connect");
    client
        .wait_for_cluster_size(1, Duration::from_secs(10))
        .await
        .expect("ring");

    let t = now_ns();
    client.put_with("a", "1", 1, t).await.expect("put with ttl");
    assert_eq!(client.get("a").await.unwrap(), Some(Bytes::from("1")));

    sleep(Duration::from_millis(2100)).await;
    assert_eq!(client.get("a").await.unwrap(), None, "ttl should expire");

    // a later write with an in-between timestamp supersedes the
    // expired row
    client
        .put_with("a", "2", 0, t + 500_000_000)
        .await
        .expect("put after expiry");
    assert_eq!(client.get("a").await.unwrap(), Some(Bytes::from("2")));

    client.shutdown();
    store.shutdown();
    master.shutdown();
}

#[tokio::test]
async fn grow_and_shrink_migrate_keys() {
    let master = start_master().await;
    let dir1 = tempfile::tempdir().unwrap();
    let store1 = start_store(&master, dir1.path()).await;
    wait_for_stores(&master, 1).await;

    master
        .create_cluster(&create_request("k3", 1, 1))
        .await
        .expect("create cluster");

    let client = ClusterClient::connect(master.address(), "k3", DC)
        .await
        .expect("client connect");
    client
        .wait_for_cluster_size(1, Duration::from_secs(10))
        .await
        .expect("ring");

    let keys: Vec<String> = (0..100).map(|i| format!("k{}", i)).collect();
    for key in &keys {
        client
            .put(key.as_str(), format!("v{}", key))
            .await
            .expect("put");
    }

    // grow to 2: shard 1 bootstraps from the existing primary
    let dir2 = tempfile::tempdir().unwrap();
    let store2 = start_store(&master, dir2.path()).await;
    wait_for_stores(&master, 2).await;

    master
        .resize_cluster(&ringstore::net::messages::ResizeClusterRequest {
            keyspace: "k3".into(),
            target_cluster_size: 2,
            cluster: None,
        })
        .await
        .expect("grow");

    client
        .wait_for_cluster_size(2, Duration::from_secs(10))
        .await
        .expect("grown ring");
    let grown = client.cluster().expect("ring snapshot");
    let addr1 = server_data_addr(&grown, 1);

    // keys that now hash to shard 1 were migrated there; keys that do
    // not are refused by server 1
    for key in &keys {
        let response = direct_get(&addr1, "k3", key.as_bytes()).await;
        if partition_hash(key.as_bytes()) % 2 == 1 {
            match response {
                Response::Get(get) => {
                    assert_eq!(
                        get.key_value.map(|kv| kv.value),
                        Some(Bytes::from(format!("v{}", key))),
                        "key {} missing after grow",
                        key
                    );
                }
                other => panic!("unexpected response for {}: {:?}", key, other),
            }
        } else {
            assert!(
                response.is_wrong_shard(),
                "key {} should not be served by server 1",
                key
            );
        }
    }

    // every key is still readable through the router
    let values = client
        .batch_get(keys.iter().map(|k| k.as_str()))
        .await
        .expect("batch get after grow");
    assert!(values.iter().all(|v| v.is_some()));

    // shrink back to 1: shard 0 absorbs the retiring shard
    master
        .resize_cluster(&ringstore::net::messages::ResizeClusterRequest {
            keyspace: "k3".into(),
            target_cluster_size: 1,
            cluster: None,
        })
        .await
        .expect("shrink");

    client
        .wait_for_cluster_size(1, Duration::from_secs(10))
        .await
        .expect("shrunk ring");

    let values = client
        .batch_get(keys.iter().map(|k| k.as_str()))
        .await
        .expect("batch get after shrink");
    for (key, value) in keys.iter().zip(values) {
        assert_eq!(
            value,
            Some(Bytes::from(format!("v{}", key))),
            "key {} lost in shrink",
            key
        );
    }

    client.shutdown();
    store1.shutdown();
    store2.shutdown();
    master.shutdown();
}

#[tokio::test]
async fn capacity_errors_are_reported() {
    let master = start_master().await;
    let dir = tempfile::tempdir().unwrap();
    let store = start_store(&master, dir.path()).await;
    wait_for_stores(&master, 1).await;

    // two servers wanted, one registered
    let err = master
        .create_cluster(&create_request("k4", 2, 1))
        .await
        .expect_err("should fail");
    assert!(err.to_string().contains("capacity"), "{}", err);

    // duplicate creation refused
    master
        .create_cluster(&create_request("k4", 1, 1))
        .await
        .expect("create");
    let err = master
        .create_cluster(&create_request("k4", 1, 1))
        .await
        .expect_err("duplicate should fail");
    assert!(err.to_string().contains("exists"), "{}", err);

    store.shutdown();
    master.shutdown();
}

#[tokio::test]
async fn prefix_scan_within_partition() {
    let master = start_master().await;
    let dir1 = tempfile::tempdir().unwrap();
    let dir2 = tempfile::tempdir().unwrap();
    let store1 = start_store(&master, dir1.path()).await;
    let store2 = start_store(&master, dir2.path()).await;
    wait_for_stores(&master, 2).await;

    master
        .create_cluster(&create_request("k6", 2, 1))
        .await
        .expect("create cluster");

    let client = ClusterClient::connect(master.address(), "k6", DC)
        .await
        .expect("client connect");
    client
        .wait_for_cluster_size(2, Duration::from_secs(10))
        .await
        .expect("ring");

    // co-locate the user's rows on one shard via the partition key
    use ringstore::client::Key;
    for field in ["name", "email", "age"] {
        client
            .put(
                Key::with_partition_key(format!("user:1:{}", field), b"user:1"),
                field,
            )
            .await
            .expect("put");
    }
    client.put("unrelated", "x").await.expect("put");

    let rows = client
        .prefix_scan(Key::with_partition_key("user:1:", b"user:1"), 10)
        .await
        .expect("scan");
    let keys: Vec<&[u8]> = rows.iter().map(|kv| &kv.key[..]).collect();
    assert_eq!(
        keys,
        vec![&b"user:1:age"[..], b"user:1:email", b"user:1:name"]
    );

    client.shutdown();
    store1.shutdown();
    store2.shutdown();
    master.shutdown();
}
