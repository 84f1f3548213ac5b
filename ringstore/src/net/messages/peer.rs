//! Peer and control RPC messages, served on a store's admin address.

use crate::topology::Cluster;

use super::cluster::{get_cluster, get_log_position, put_cluster, put_log_position};
use super::prelude::*;
use super::{KeyValue, LogEntry, Message};

/// Open (or reattach to) a shard set on a store.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateShardRequest {
    pub keyspace: String,
    pub server_id: u32,
    pub cluster_size: u32,
    pub replication_factor: u32,
    /// Present during a resize: the size the cluster is transitioning
    /// from. Drives the bootstrap plan.
    pub from_cluster_size: Option<u32>,
    pub is_candidate: bool,
    /// Current placement, so the store can resolve bootstrap and
    /// follow peers without a round trip to the master.
    pub cluster: Option<Cluster>,
}

impl ToBytes for CreateShardRequest {
    fn to_bytes(&self) -> Result<Bytes, Error> {
        let mut payload = Payload::named(self.code());
        payload.put_string(&self.keyspace);
        payload.put_u32(self.server_id);
        payload.put_u32(self.cluster_size);
        payload.put_u32(self.replication_factor);
        match self.from_cluster_size {
            Some(from) => {
                payload.put_bool(true);
                payload.put_u32(from);
            }
            None => payload.put_bool(false),
        }
        payload.put_bool(self.is_candidate);
        match &self.cluster {
            Some(cluster) => {
                payload.put_bool(true);
                put_cluster(&mut payload, cluster);
            }
            None => payload.put_bool(false),
        }
        Ok(payload.freeze())
    }
}

impl FromBytes for CreateShardRequest {
    fn from_bytes(mut bytes: Bytes) -> Result<Self, Error> {
        code!(bytes, 'S');
        let keyspace = get_string(&mut bytes)?;
        let server_id = get_u32(&mut bytes)?;
        let cluster_size = get_u32(&mut bytes)?;
        let replication_factor = get_u32(&mut bytes)?;
        let from_cluster_size = if get_bool(&mut bytes)? {
            Some(get_u32(&mut bytes)?)
        } else {
            None
        };
        let is_candidate = get_bool(&mut bytes)?;
        let cluster = if get_bool(&mut bytes)? {
            Some(get_cluster(&mut bytes)?)
        } else {
            None
        };
        Ok(Self {
            keyspace,
            server_id,
            cluster_size,
            replication_factor,
            from_cluster_size,
            is_candidate,
            cluster,
        })
    }
}

impl Protocol for CreateShardRequest {
    fn code(&self) -> char {
        'S'
    }
}

/// Drop every shard of a keyspace from a store.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteShardRequest {
    pub keyspace: String,
}

impl ToBytes for DeleteShardRequest {
    fn to_bytes(&self) -> Result<Bytes, Error> {
        let mut payload = Payload::named(self.code());
        payload.put_string(&self.keyspace);
        Ok(payload.freeze())
    }
}

impl FromBytes for DeleteShardRequest {
    fn from_bytes(mut bytes: Bytes) -> Result<Self, Error> {
        code!(bytes, 'D');
        Ok(Self {
            keyspace: get_string(&mut bytes)?,
        })
    }
}

impl Protocol for DeleteShardRequest {
    fn code(&self) -> char {
        'D'
    }
}

/// Ask a peer how much binlog history it still holds for a shard.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckBinlogRequest {
    pub keyspace: String,
    pub shard_id: u32,
}

impl ToBytes for CheckBinlogRequest {
    fn to_bytes(&self) -> Result<Bytes, Error> {
        let mut payload = Payload::named(self.code());
        payload.put_string(&self.keyspace);
        payload.put_u32(self.shard_id);
        Ok(payload.freeze())
    }
}

impl FromBytes for CheckBinlogRequest {
    fn from_bytes(mut bytes: Bytes) -> Result<Self, Error> {
        code!(bytes, 'B');
        Ok(Self {
            keyspace: get_string(&mut bytes)?,
            shard_id: get_u32(&mut bytes)?,
        })
    }
}

impl Protocol for CheckBinlogRequest {
    fn code(&self) -> char {
        'B'
    }
}

/// A cursor at `segment >= earliest_segment` is still tailable.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckBinlogResponse {
    pub earliest_segment: u32,
    pub latest_segment: u32,
}

impl ToBytes for CheckBinlogResponse {
    fn to_bytes(&self) -> Result<Bytes, Error> {
        let mut payload = Payload::named(self.code());
        payload.put_u32(self.earliest_segment);
        payload.put_u32(self.latest_segment);
        Ok(payload.freeze())
    }
}

impl FromBytes for CheckBinlogResponse {
    fn from_bytes(mut bytes: Bytes) -> Result<Self, Error> {
        code!(bytes, 'b');
        Ok(Self {
            earliest_segment: get_u32(&mut bytes)?,
            latest_segment: get_u32(&mut bytes)?,
        })
    }
}

impl Protocol for CheckBinlogResponse {
    fn code(&self) -> char {
        'b'
    }
}

/// Bulk-copy a shard's data, filtered by the requester's partition rule.
#[derive(Debug, Clone, PartialEq)]
pub struct BootstrapCopyRequest {
    pub keyspace: String,
    pub shard_id: u32,
    /// When nonzero, only stream keys with
    /// `hash % target_cluster_size == target_shard_id`.
    pub target_cluster_size: u32,
    pub target_shard_id: u32,
    pub origin: String,
}

impl ToBytes for BootstrapCopyRequest {
    fn to_bytes(&self) -> Result<Bytes, Error> {
        let mut payload = Payload::named(self.code());
        payload.put_string(&self.keyspace);
        payload.put_u32(self.shard_id);
        payload.put_u32(self.target_cluster_size);
        payload.put_u32(self.target_shard_id);
        payload.put_string(&self.origin);
        Ok(payload.freeze())
    }
}

impl FromBytes for BootstrapCopyRequest {
    fn from_bytes(mut bytes: Bytes) -> Result<Self, Error> {
        code!(bytes, 'P');
        Ok(Self {
            keyspace: get_string(&mut bytes)?,
            shard_id: get_u32(&mut bytes)?,
            target_cluster_size: get_u32(&mut bytes)?,
            target_shard_id: get_u32(&mut bytes)?,
            origin: get_string(&mut bytes)?,
        })
    }
}

impl Protocol for BootstrapCopyRequest {
    fn code(&self) -> char {
        'P'
    }
}

/// One batch of sorted key-value pairs; the final batch carries the
/// binlog position the copy covers, which becomes the follower's
/// starting cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct BootstrapCopyBatch {
    pub key_values: Vec<KeyValue>,
    pub binlog_progress: Option<(u32, u64)>,
}

impl ToBytes for BootstrapCopyBatch {
    fn to_bytes(&self) -> Result<Bytes, Error> {
        let mut payload = Payload::named(self.code());
        payload.put_u32(self.key_values.len() as u32);
        for kv in &self.key_values {
            kv.put(&mut payload);
        }
        match self.binlog_progress {
            Some(position) => {
                payload.put_bool(true);
                put_log_position(&mut payload, position);
            }
            None => payload.put_bool(false),
        }
        Ok(payload.freeze())
    }
}

impl FromBytes for BootstrapCopyBatch {
    fn from_bytes(mut bytes: Bytes) -> Result<Self, Error> {
        code!(bytes, 'p');
        let key_values = (0..get_u32(&mut bytes)?)
            .map(|_| KeyValue::get(&mut bytes))
            .collect::<Result<Vec<_>, _>>()?;
        let binlog_progress = if get_bool(&mut bytes)? {
            Some(get_log_position(&mut bytes)?)
        } else {
            None
        };
        Ok(Self {
            key_values,
            binlog_progress,
        })
    }
}

impl Protocol for BootstrapCopyBatch {
    fn code(&self) -> char {
        'p'
    }
}

/// Tail a peer shard's binlog from a cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct TailBinlogRequest {
    pub keyspace: String,
    pub shard_id: u32,
    pub segment: u32,
    pub offset: u64,
    pub limit: u32,
    pub target_cluster_size: u32,
    pub target_shard_id: u32,
    pub origin: String,
}

impl ToBytes for TailBinlogRequest {
    fn to_bytes(&self) -> Result<Bytes, Error> {
        let mut payload = Payload::named(self.code());
        payload.put_string(&self.keyspace);
        payload.put_u32(self.shard_id);
        payload.put_u32(self.segment);
        payload.put_u64(self.offset);
        payload.put_u32(self.limit);
        payload.put_u32(self.target_cluster_size);
        payload.put_u32(self.target_shard_id);
        payload.put_string(&self.origin);
        Ok(payload.freeze())
    }
}

impl FromBytes for TailBinlogRequest {
    fn from_bytes(mut bytes: Bytes) -> Result<Self, Error> {
        code!(bytes, 'T');
        Ok(Self {
            keyspace: get_string(&mut bytes)?,
            shard_id: get_u32(&mut bytes)?,
            segment: get_u32(&mut bytes)?,
            offset: get_u64(&mut bytes)?,
            limit: get_u32(&mut bytes)?,
            target_cluster_size: get_u32(&mut bytes)?,
            target_shard_id: get_u32(&mut bytes)?,
            origin: get_string(&mut bytes)?,
        })
    }
}

impl Protocol for TailBinlogRequest {
    fn code(&self) -> char {
        'T'
    }
}

/// A slice of the binlog. `next_segment`/`next_offset` is the cursor
/// for the next read, advanced even when every entry was filtered out.
#[derive(Debug, Clone, PartialEq)]
pub struct TailBinlogBatch {
    pub entries: Vec<LogEntry>,
    pub next_segment: u32,
    pub next_offset: u64,
}

impl ToBytes for TailBinlogBatch {
    fn to_bytes(&self) -> Result<Bytes, Error> {
        let mut payload = Payload::named(self.code());
        payload.put_u32(self.entries.len() as u32);
        for entry in &self.entries {
            payload.put_bytes(&entry.to_bytes()?);
        }
        payload.put_u32(self.next_segment);
        payload.put_u64(self.next_offset);
        Ok(payload.freeze())
    }
}

impl FromBytes for TailBinlogBatch {
    fn from_bytes(mut bytes: Bytes) -> Result<Self, Error> {
        code!(bytes, 't');
        let entries = (0..get_u32(&mut bytes)?)
            .map(|_| LogEntry::from_bytes(get_bytes(&mut bytes)?))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            entries,
            next_segment: get_u32(&mut bytes)?,
            next_offset: get_u64(&mut bytes)?,
        })
    }
}

impl Protocol for TailBinlogBatch {
    fn code(&self) -> char {
        't'
    }
}

/// Generic acknowledgment.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OkResponse {
    pub error: Option<String>,
}

impl OkResponse {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn error(error: impl ToString) -> Self {
        Self {
            error: Some(error.to_string()),
        }
    }

    /// Turn into a result, so callers can use `?`.
    pub fn into_result(self) -> Result<(), Error> {
        match self.error {
            Some(error) => Err(Error::Remote(error)),
            None => Ok(()),
        }
    }
}

impl ToBytes for OkResponse {
    fn to_bytes(&self) -> Result<Bytes, Error> {
        let mut payload = Payload::named(self.code());
        payload.put_opt_bytes(self.error.as_deref().map(str::as_bytes));
        Ok(payload.freeze())
    }
}

impl FromBytes for OkResponse {
    fn from_bytes(mut bytes: Bytes) -> Result<Self, Error> {
        code!(bytes, 's');
        let error = match get_opt_bytes(&mut bytes)? {
            Some(bytes) => Some(String::from_utf8(bytes.to_vec())?),
            None => None,
        };
        Ok(Self { error })
    }
}

impl Protocol for OkResponse {
    fn code(&self) -> char {
        's'
    }
}

/// Terminates a server-side stream.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StreamEnd {
    pub error: Option<String>,
}

impl StreamEnd {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn error(error: impl ToString) -> Self {
        Self {
            error: Some(error.to_string()),
        }
    }

    pub fn into_result(self) -> Result<(), Error> {
        match self.error {
            Some(error) => Err(Error::Remote(error)),
            None => Ok(()),
        }
    }
}

impl ToBytes for StreamEnd {
    fn to_bytes(&self) -> Result<Bytes, Error> {
        let mut payload = Payload::named(self.code());
        payload.put_opt_bytes(self.error.as_deref().map(str::as_bytes));
        Ok(payload.freeze())
    }
}

impl FromBytes for StreamEnd {
    fn from_bytes(mut bytes: Bytes) -> Result<Self, Error> {
        code!(bytes, 'Z');
        let error = match get_opt_bytes(&mut bytes)? {
            Some(bytes) => Some(String::from_utf8(bytes.to_vec())?),
            None => None,
        };
        Ok(Self { error })
    }
}

impl Protocol for StreamEnd {
    fn code(&self) -> char {
        'Z'
    }
}

/// Helper for callers expecting a plain `OkResponse` reply.
pub fn expect_ok(message: &Message) -> Result<(), Error> {
    match message.code() {
        's' => message.parse::<OkResponse>()?.into_result(),
        code => Err(Error::UnexpectedMessage(code)),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::net::messages::EntryOp;

    #[test]
    fn create_shard_roundtrip() {
        for from in [None, Some(2)] {
            let request = CreateShardRequest {
                keyspace: "ks".into(),
                server_id: 1,
                cluster_size: 3,
                replication_factor: 2,
                from_cluster_size: from,
                is_candidate: from.is_some(),
                cluster: from.map(|_| Cluster::new("ks", 3, 2)),
            };
            let decoded = CreateShardRequest::from_bytes(request.to_bytes().unwrap()).unwrap();
            assert_eq!(decoded, request);
        }
    }

    #[test]
    fn tail_batch_roundtrip() {
        let batch = TailBinlogBatch {
            entries: vec![LogEntry {
                updated_at_ns: 5,
                op: EntryOp::Delete {
                    key: Bytes::from_static(b"k"),
                    partition_hash: 3,
                },
            }],
            next_segment: 1,
            next_offset: 4096,
        };
        let decoded = TailBinlogBatch::from_bytes(batch.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, batch);
    }

    #[test]
    fn bootstrap_batch_roundtrip() {
        let batch = BootstrapCopyBatch {
            key_values: vec![KeyValue {
                key: Bytes::from_static(b"a"),
                value: Bytes::from_static(b"1"),
            }],
            binlog_progress: Some((2, 77)),
        };
        let decoded = BootstrapCopyBatch::from_bytes(batch.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, batch);
    }

    #[test]
    fn ok_response_into_result() {
        assert!(OkResponse::ok().into_result().is_ok());
        let err = OkResponse::error("boom").into_result().unwrap_err();
        assert!(matches!(err, Error::Remote(e) if e == "boom"));
    }
}
