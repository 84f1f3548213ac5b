//! Cluster client: follows ring snapshots from the master and routes
//! batched requests to the right shards.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use futures::future::join_all;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::net::messages::{
    BatchRequest, BatchResponse, ClientHeartbeat, ClusterUpdate, DeleteRequest, GetRequest,
    KeyValue, MergeRequest, PutRequest, Request, Response, ScanRequest,
};
use crate::net::{FromBytes, Stream};
use crate::topology::{partition_hash, Cluster};
use crate::util::now_ns;

const MASTER_RETRY: Duration = Duration::from_secs(2);
const RING_REFRESH_WAIT: Duration = Duration::from_secs(1);

/// Client error.
#[derive(Debug, Error)]
pub enum Error {
    #[error("net: {0}")]
    Net(#[from] crate::net::Error),

    #[error("no cluster known for keyspace {0}")]
    NoCluster(String),

    #[error("no node for shard {0}")]
    NoNode(u32),

    #[error("{0}")]
    Remote(String),

    #[error("timed out waiting for ring")]
    RingTimeout,
}

/// A key plus the hash that places it. Defaults to the hash of the key
/// bytes; overriding the partition key co-locates related keys on one
/// shard.
#[derive(Debug, Clone, PartialEq)]
pub struct Key {
    pub bytes: Bytes,
    pub partition_hash: u64,
}

impl Key {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        let partition_hash = partition_hash(&bytes);
        Self {
            bytes,
            partition_hash,
        }
    }

    /// Key routed by `partition_key` instead of its own bytes.
    pub fn with_partition_key(bytes: impl Into<Bytes>, partition_key: &[u8]) -> Self {
        Self {
            bytes: bytes.into(),
            partition_hash: partition_hash(partition_key),
        }
    }
}

impl From<&[u8]> for Key {
    fn from(bytes: &[u8]) -> Self {
        Self::new(Bytes::copy_from_slice(bytes))
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Self::new(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<Bytes> for Key {
    fn from(bytes: Bytes) -> Self {
        Self::new(bytes)
    }
}

pub struct ClusterClient {
    master: String,
    keyspace: String,
    data_center: String,
    ring: ArcSwapOption<Cluster>,
    ring_changed: Notify,
    ctx: CancellationToken,
}

impl ClusterClient {
    /// Connect to the master, follow the keyspace, and wait for the
    /// first ring snapshot.
    pub async fn connect(
        master: &str,
        keyspace: &str,
        data_center: &str,
    ) -> Result<Arc<Self>, Error> {
        let client = Arc::new(Self {
            master: master.to_string(),
            keyspace: keyspace.to_string(),
            data_center: data_center.to_string(),
            ring: ArcSwapOption::empty(),
            ring_changed: Notify::new(),
            ctx: CancellationToken::new(),
        });

        tokio::spawn(client.clone().follow_master());
        client.wait_for_ring(Duration::from_secs(10)).await?;
        Ok(client)
    }

    pub fn shutdown(&self) {
        self.ctx.cancel();
    }

    /// Current ring snapshot.
    pub fn cluster(&self) -> Option<Arc<Cluster>> {
        self.ring.load_full()
    }

    async fn follow_master(self: Arc<Self>) {
        loop {
            if self.ctx.is_cancelled() {
                return;
            }

            match Stream::connect(&self.master).await {
                Ok(mut stream) => {
                    let follow = ClientHeartbeat::follow(&self.data_center, &self.keyspace);
                    if stream.send_flush(&follow).await.is_ok() {
                        info!(
                            "following {}/{} via master {}",
                            self.keyspace, self.data_center, self.master
                        );
                        loop {
                            let message = tokio::select! {
                                _ = self.ctx.cancelled() => return,
                                message = stream.read_message() => message,
                            };
                            match message {
                                Ok(message) if message.code() == 'U' => {
                                    match ClusterUpdate::from_bytes(message.payload()) {
                                        Ok(update) => {
                                            debug!(
                                                "ring update: {} ({} nodes)",
                                                update.cluster,
                                                update.cluster.nodes().count()
                                            );
                                            self.ring.store(Some(Arc::new(update.cluster)));
                                            self.ring_changed.notify_waiters();
                                        }
                                        Err(err) => {
                                            warn!("bad ring update: {}", err);
                                        }
                                    }
                                }
                                Ok(message) => {
                                    warn!("unexpected message '{}' from master", message.code());
                                }
                                Err(err) => {
                                    if !err.disconnect() {
                                        warn!("master stream: {}", err);
                                    }
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(err) => {
                    debug!("dial master {}: {}", self.master, err);
                }
            }

            tokio::select! {
                _ = self.ctx.cancelled() => return,
                _ = sleep(MASTER_RETRY) => (),
            }
        }
    }

    /// Wait until any ring snapshot has arrived.
    pub async fn wait_for_ring(&self, wait: Duration) -> Result<(), Error> {
        timeout(wait, async {
            loop {
                let notified = self.ring_changed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.ring.load().is_some() {
                    return;
                }
                notified.await;
            }
        })
        .await
        .map_err(|_| Error::RingTimeout)
    }

    /// Wait until the ring reports the given expected size with every
    /// primary placed.
    pub async fn wait_for_cluster_size(&self, size: u32, wait: Duration) -> Result<(), Error> {
        timeout(wait, async {
            loop {
                let notified = self.ring_changed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if let Some(cluster) = self.ring.load_full() {
                    if cluster.expected_size() == size && cluster.current_size() == size {
                        return;
                    }
                }
                notified.await;
            }
        })
        .await
        .map_err(|_| Error::RingTimeout)
    }

    // ---- routing --------------------------------------------------------

    /// Dispatch a batch: group by destination shard, one sub-batch per
    /// store in parallel, responses in request order. A wrong-shard
    /// reply refreshes the ring and retries once.
    pub async fn batch_process(&self, requests: Vec<Request>) -> Result<Vec<Response>, Error> {
        let responses = self.dispatch(&requests).await?;

        if responses.iter().any(|r| r.is_wrong_shard()) {
            debug!("wrong shard response, refreshing ring");
            let notified = self.ring_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let _ = timeout(RING_REFRESH_WAIT, notified).await;
            return self.dispatch(&requests).await;
        }

        Ok(responses)
    }

    async fn dispatch(&self, requests: &[Request]) -> Result<Vec<Response>, Error> {
        let Some(cluster) = self.ring.load_full() else {
            return Err(Error::NoCluster(self.keyspace.clone()));
        };
        let size = cluster.expected_size();
        if size == 0 {
            return Err(Error::NoCluster(self.keyspace.clone()));
        }

        // group request indices by destination shard
        let mut groups: HashMap<u32, Vec<usize>> = HashMap::new();
        for (index, request) in requests.iter().enumerate() {
            let shard_id = (request.partition_hash() % size as u64) as u32;
            groups.entry(shard_id).or_default().push(index);
        }

        let sub_batches = groups.into_iter().map(|(shard_id, indexes)| {
            let cluster = cluster.clone();
            async move {
                let address = node_address(&cluster, shard_id).ok_or(Error::NoNode(shard_id))?;
                let sub_requests: Vec<Request> =
                    indexes.iter().map(|&i| requests[i].clone()).collect();

                let mut stream = Stream::connect(&address).await?;
                stream
                    .send_flush(&BatchRequest {
                        keyspace: self.keyspace.clone(),
                        requests: sub_requests,
                    })
                    .await?;

                let message = stream.read_message().await?;
                let batch = BatchResponse::from_bytes(message.payload())?;
                if batch.responses.len() != indexes.len() {
                    return Err(Error::Remote(format!(
                        "expected {} responses, got {}",
                        indexes.len(),
                        batch.responses.len()
                    )));
                }
                Ok::<_, Error>((indexes, batch.responses))
            }
        });

        let mut ordered: Vec<Option<Response>> = vec![None; requests.len()];
        for result in join_all(sub_batches).await {
            let (indexes, responses) = result?;
            for (index, response) in indexes.into_iter().zip(responses) {
                ordered[index] = Some(response);
            }
        }

        Ok(ordered
            .into_iter()
            .map(|r| r.unwrap_or_else(|| Response::error("missing response")))
            .collect())
    }

    // ---- operations -----------------------------------------------------

    pub async fn put(&self, key: impl Into<Key>, value: impl Into<Bytes>) -> Result<(), Error> {
        self.put_with(key, value, 0, now_ns()).await
    }

    pub async fn put_with(
        &self,
        key: impl Into<Key>,
        value: impl Into<Bytes>,
        ttl_second: u32,
        updated_at_ns: u64,
    ) -> Result<(), Error> {
        let key = key.into();
        let request = Request::Put(PutRequest {
            key: key.bytes,
            partition_hash: key.partition_hash,
            value: value.into(),
            ttl_second,
            op_and_data_type: 0,
            updated_at_ns,
        });
        expect_write(self.batch_process(vec![request]).await?)
    }

    pub async fn get(&self, key: impl Into<Key>) -> Result<Option<Bytes>, Error> {
        let key = key.into();
        let request = Request::Get(GetRequest {
            key: key.bytes,
            partition_hash: key.partition_hash,
        });
        let mut responses = self.batch_process(vec![request]).await?;
        match responses.pop() {
            Some(Response::Get(get)) if get.ok => Ok(get.key_value.map(|kv| kv.value)),
            Some(response) => Err(Error::Remote(response.status().to_string())),
            None => Err(Error::Remote("empty batch response".into())),
        }
    }

    /// Fetch many keys at once, results in key order.
    pub async fn batch_get(
        &self,
        keys: impl IntoIterator<Item = impl Into<Key>>,
    ) -> Result<Vec<Option<Bytes>>, Error> {
        let requests: Vec<Request> = keys
            .into_iter()
            .map(|key| {
                let key = key.into();
                Request::Get(GetRequest {
                    key: key.bytes,
                    partition_hash: key.partition_hash,
                })
            })
            .collect();
        if requests.is_empty() {
            return Ok(vec![]);
        }

        let responses = self.batch_process(requests).await?;
        responses
            .into_iter()
            .map(|response| match response {
                Response::Get(get) if get.ok => Ok(get.key_value.map(|kv| kv.value)),
                response => Err(Error::Remote(response.status().to_string())),
            })
            .collect()
    }

    pub async fn delete(&self, key: impl Into<Key>) -> Result<(), Error> {
        let key = key.into();
        let request = Request::Delete(DeleteRequest {
            key: key.bytes,
            partition_hash: key.partition_hash,
            updated_at_ns: now_ns(),
        });
        expect_write(self.batch_process(vec![request]).await?)
    }

    pub async fn merge(&self, key: impl Into<Key>, value: impl Into<Bytes>) -> Result<(), Error> {
        let key = key.into();
        let request = Request::Merge(MergeRequest {
            key: key.bytes,
            partition_hash: key.partition_hash,
            value: value.into(),
            op_and_data_type: 0,
            updated_at_ns: now_ns(),
        });
        expect_write(self.batch_process(vec![request]).await?)
    }

    /// Scan a co-located prefix. The prefix must route to one shard,
    /// which callers arrange by keying writes with
    /// `Key::with_partition_key`.
    pub async fn prefix_scan(
        &self,
        prefix: impl Into<Key>,
        limit: u32,
    ) -> Result<Vec<KeyValue>, Error> {
        let prefix = prefix.into();
        let request = Request::Scan(ScanRequest {
            prefix: prefix.bytes,
            partition_hash: prefix.partition_hash,
            last_seen_key: Bytes::new(),
            limit,
        });
        let mut responses = self.batch_process(vec![request]).await?;
        match responses.pop() {
            Some(Response::Scan(scan)) if scan.ok => Ok(scan.key_values),
            Some(response) => Err(Error::Remote(response.status().to_string())),
            None => Err(Error::Remote("empty batch response".into())),
        }
    }
}

/// Data address of a store hosting the shard: the primary when placed,
/// otherwise any replica.
fn node_address(cluster: &Cluster, shard_id: u32) -> Option<String> {
    if let Some(node) = cluster.get_node(shard_id, 0) {
        return Some(node.store.address.clone());
    }
    for replica in crate::topology::partition_shards(
        shard_id,
        cluster.expected_size(),
        cluster.replication_factor(),
    ) {
        let index = (replica.server_id + cluster.expected_size() - shard_id)
            % cluster.expected_size();
        if let Some(node) = cluster.get_node(replica.server_id, index) {
            return Some(node.store.address.clone());
        }
    }
    None
}

fn expect_write(mut responses: Vec<Response>) -> Result<(), Error> {
    match responses.pop() {
        Some(response) if response.is_ok() => Ok(()),
        Some(response) => Err(Error::Remote(response.status().to_string())),
        None => Err(Error::Remote("empty batch response".into())),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn key_hash_defaults_and_overrides() {
        let plain = Key::new(Bytes::from_static(b"user:1:name"));
        assert_eq!(plain.partition_hash, partition_hash(b"user:1:name"));

        let grouped = Key::with_partition_key(Bytes::from_static(b"user:1:name"), b"user:1");
        assert_eq!(grouped.partition_hash, partition_hash(b"user:1"));
        assert_eq!(grouped.bytes, plain.bytes);

        let from_str: Key = "abc".into();
        assert_eq!(from_str.partition_hash, partition_hash(b"abc"));
    }
}
