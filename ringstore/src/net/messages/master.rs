//! Master-plane messages: store and client registration streams, and
//! the admin RPCs.

use crate::topology::{Cluster, ShardInfo, StoreResource};

use super::cluster::{
    get_cluster, get_shard_info, get_store_resource, put_cluster, put_shard_info,
    put_store_resource,
};
use super::prelude::*;

/// Shard lifecycle status, reported to the master over the store
/// heartbeat stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardStatus {
    Ready,
    Deleted,
}

impl ShardStatus {
    fn to_u8(self) -> u8 {
        match self {
            ShardStatus::Ready => 1,
            ShardStatus::Deleted => 2,
        }
    }

    fn from_u8(tag: u8) -> Result<Self, Error> {
        match tag {
            1 => Ok(ShardStatus::Ready),
            2 => Ok(ShardStatus::Deleted),
            tag => Err(Error::UnknownTag("shard status", tag)),
        }
    }
}

/// Store -> master heartbeat. The first message on the stream carries
/// the resource advertisement; later messages carry shard status.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreHeartbeat {
    pub data_center: String,
    pub store: Option<StoreResource>,
    pub shard_status: Option<(ShardInfo, ShardStatus)>,
}

impl StoreHeartbeat {
    pub fn register(store: StoreResource) -> Self {
        Self {
            data_center: store.data_center.clone(),
            store: Some(store),
            shard_status: None,
        }
    }

    pub fn shard_status(data_center: &str, info: ShardInfo, status: ShardStatus) -> Self {
        Self {
            data_center: data_center.into(),
            store: None,
            shard_status: Some((info, status)),
        }
    }
}

impl ToBytes for StoreHeartbeat {
    fn to_bytes(&self) -> Result<Bytes, Error> {
        let mut payload = Payload::named(self.code());
        payload.put_string(&self.data_center);
        match &self.store {
            Some(store) => {
                payload.put_bool(true);
                put_store_resource(&mut payload, store);
            }
            None => payload.put_bool(false),
        }
        match &self.shard_status {
            Some((info, status)) => {
                payload.put_bool(true);
                put_shard_info(&mut payload, info);
                payload.put_u8(status.to_u8());
            }
            None => payload.put_bool(false),
        }
        Ok(payload.freeze())
    }
}

impl FromBytes for StoreHeartbeat {
    fn from_bytes(mut bytes: Bytes) -> Result<Self, Error> {
        code!(bytes, 'H');
        let data_center = get_string(&mut bytes)?;
        let store = if get_bool(&mut bytes)? {
            Some(get_store_resource(&mut bytes)?)
        } else {
            None
        };
        let shard_status = if get_bool(&mut bytes)? {
            let info = get_shard_info(&mut bytes)?;
            let status = ShardStatus::from_u8(get_u8(&mut bytes)?)?;
            Some((info, status))
        } else {
            None
        };
        Ok(Self {
            data_center,
            store,
            shard_status,
        })
    }
}

impl Protocol for StoreHeartbeat {
    fn code(&self) -> char {
        'H'
    }
}

/// Follow or unfollow a keyspace.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterFollow {
    pub keyspace: String,
    pub is_unfollow: bool,
}

/// Client -> master heartbeat.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientHeartbeat {
    pub data_center: String,
    pub cluster_follow: Option<ClusterFollow>,
}

impl ClientHeartbeat {
    pub fn follow(data_center: &str, keyspace: &str) -> Self {
        Self {
            data_center: data_center.into(),
            cluster_follow: Some(ClusterFollow {
                keyspace: keyspace.into(),
                is_unfollow: false,
            }),
        }
    }

    pub fn unfollow(data_center: &str, keyspace: &str) -> Self {
        Self {
            data_center: data_center.into(),
            cluster_follow: Some(ClusterFollow {
                keyspace: keyspace.into(),
                is_unfollow: true,
            }),
        }
    }
}

impl ToBytes for ClientHeartbeat {
    fn to_bytes(&self) -> Result<Bytes, Error> {
        let mut payload = Payload::named(self.code());
        payload.put_string(&self.data_center);
        match &self.cluster_follow {
            Some(follow) => {
                payload.put_bool(true);
                payload.put_string(&follow.keyspace);
                payload.put_bool(follow.is_unfollow);
            }
            None => payload.put_bool(false),
        }
        Ok(payload.freeze())
    }
}

impl FromBytes for ClientHeartbeat {
    fn from_bytes(mut bytes: Bytes) -> Result<Self, Error> {
        code!(bytes, 'C');
        let data_center = get_string(&mut bytes)?;
        let cluster_follow = if get_bool(&mut bytes)? {
            Some(ClusterFollow {
                keyspace: get_string(&mut bytes)?,
                is_unfollow: get_bool(&mut bytes)?,
            })
        } else {
            None
        };
        Ok(Self {
            data_center,
            cluster_follow,
        })
    }
}

impl Protocol for ClientHeartbeat {
    fn code(&self) -> char {
        'C'
    }
}

/// Full ring snapshot pushed to a following client.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterUpdate {
    pub cluster: Cluster,
}

impl ToBytes for ClusterUpdate {
    fn to_bytes(&self) -> Result<Bytes, Error> {
        let mut payload = Payload::named(self.code());
        put_cluster(&mut payload, &self.cluster);
        Ok(payload.freeze())
    }
}

impl FromBytes for ClusterUpdate {
    fn from_bytes(mut bytes: Bytes) -> Result<Self, Error> {
        code!(bytes, 'U');
        Ok(Self {
            cluster: get_cluster(&mut bytes)?,
        })
    }
}

impl Protocol for ClusterUpdate {
    fn code(&self) -> char {
        'U'
    }
}

/// Admin -> master: create a keyspace.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateClusterRequest {
    pub keyspace: String,
    pub cluster_size: u32,
    pub replication_factor: u32,
    pub total_disk_size_gb: u32,
    pub tags: Vec<String>,
}

impl ToBytes for CreateClusterRequest {
    fn to_bytes(&self) -> Result<Bytes, Error> {
        let mut payload = Payload::named(self.code());
        payload.put_string(&self.keyspace);
        payload.put_u32(self.cluster_size);
        payload.put_u32(self.replication_factor);
        payload.put_u32(self.total_disk_size_gb);
        payload.put_u32(self.tags.len() as u32);
        for tag in &self.tags {
            payload.put_string(tag);
        }
        Ok(payload.freeze())
    }
}

impl FromBytes for CreateClusterRequest {
    fn from_bytes(mut bytes: Bytes) -> Result<Self, Error> {
        code!(bytes, 'K');
        let keyspace = get_string(&mut bytes)?;
        let cluster_size = get_u32(&mut bytes)?;
        let replication_factor = get_u32(&mut bytes)?;
        let total_disk_size_gb = get_u32(&mut bytes)?;
        let tags = (0..get_u32(&mut bytes)?)
            .map(|_| get_string(&mut bytes))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            keyspace,
            cluster_size,
            replication_factor,
            total_disk_size_gb,
            tags,
        })
    }
}

impl Protocol for CreateClusterRequest {
    fn code(&self) -> char {
        'K'
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateClusterResponse {
    pub cluster: Option<Cluster>,
    pub error: Option<String>,
}

impl CreateClusterResponse {
    pub fn ok(cluster: Cluster) -> Self {
        Self {
            cluster: Some(cluster),
            error: None,
        }
    }

    pub fn error(error: impl ToString) -> Self {
        Self {
            cluster: None,
            error: Some(error.to_string()),
        }
    }

    pub fn into_result(self) -> Result<Cluster, Error> {
        match (self.cluster, self.error) {
            (_, Some(error)) => Err(Error::Remote(error)),
            (Some(cluster), None) => Ok(cluster),
            (None, None) => Err(Error::Remote("empty response".into())),
        }
    }
}

impl ToBytes for CreateClusterResponse {
    fn to_bytes(&self) -> Result<Bytes, Error> {
        let mut payload = Payload::named(self.code());
        match &self.cluster {
            Some(cluster) => {
                payload.put_bool(true);
                put_cluster(&mut payload, cluster);
            }
            None => payload.put_bool(false),
        }
        payload.put_opt_bytes(self.error.as_deref().map(str::as_bytes));
        Ok(payload.freeze())
    }
}

impl FromBytes for CreateClusterResponse {
    fn from_bytes(mut bytes: Bytes) -> Result<Self, Error> {
        code!(bytes, 'k');
        let cluster = if get_bool(&mut bytes)? {
            Some(get_cluster(&mut bytes)?)
        } else {
            None
        };
        let error = match get_opt_bytes(&mut bytes)? {
            Some(bytes) => Some(String::from_utf8(bytes.to_vec())?),
            None => None,
        };
        Ok(Self { cluster, error })
    }
}

impl Protocol for CreateClusterResponse {
    fn code(&self) -> char {
        'k'
    }
}

/// Admin -> master: resize a keyspace. Master -> store: commit the new
/// size on surviving shards, with the promoted placement attached.
#[derive(Debug, Clone, PartialEq)]
pub struct ResizeClusterRequest {
    pub keyspace: String,
    pub target_cluster_size: u32,
    pub cluster: Option<Cluster>,
}

impl ToBytes for ResizeClusterRequest {
    fn to_bytes(&self) -> Result<Bytes, Error> {
        let mut payload = Payload::named(self.code());
        payload.put_string(&self.keyspace);
        payload.put_u32(self.target_cluster_size);
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

impl FromBytes for ResizeClusterRequest {
    fn from_bytes(mut bytes: Bytes) -> Result<Self, Error> {
        code!(bytes, 'Y');
        let keyspace = get_string(&mut bytes)?;
        let target_cluster_size = get_u32(&mut bytes)?;
        let cluster = if get_bool(&mut bytes)? {
            Some(get_cluster(&mut bytes)?)
        } else {
            None
        };
        Ok(Self {
            keyspace,
            target_cluster_size,
            cluster,
        })
    }
}

impl Protocol for ResizeClusterRequest {
    fn code(&self) -> char {
        'Y'
    }
}

/// Admin -> master: remove a keyspace everywhere.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteClusterRequest {
    pub keyspace: String,
}

impl ToBytes for DeleteClusterRequest {
    fn to_bytes(&self) -> Result<Bytes, Error> {
        let mut payload = Payload::named(self.code());
        payload.put_string(&self.keyspace);
        Ok(payload.freeze())
    }
}

impl FromBytes for DeleteClusterRequest {
    fn from_bytes(mut bytes: Bytes) -> Result<Self, Error> {
        code!(bytes, 'X');
        Ok(Self {
            keyspace: get_string(&mut bytes)?,
        })
    }
}

impl Protocol for DeleteClusterRequest {
    fn code(&self) -> char {
        'X'
    }
}

/// Admin -> master: describe a keyspace.
#[derive(Debug, Clone, PartialEq)]
pub struct DescRequest {
    pub keyspace: String,
}

impl ToBytes for DescRequest {
    fn to_bytes(&self) -> Result<Bytes, Error> {
        let mut payload = Payload::named(self.code());
        payload.put_string(&self.keyspace);
        Ok(payload.freeze())
    }
}

impl FromBytes for DescRequest {
    fn from_bytes(mut bytes: Bytes) -> Result<Self, Error> {
        code!(bytes, 'G');
        Ok(Self {
            keyspace: get_string(&mut bytes)?,
        })
    }
}

impl Protocol for DescRequest {
    fn code(&self) -> char {
        'G'
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DescResponse {
    pub cluster: Option<Cluster>,
}

impl ToBytes for DescResponse {
    fn to_bytes(&self) -> Result<Bytes, Error> {
        let mut payload = Payload::named(self.code());
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

impl FromBytes for DescResponse {
    fn from_bytes(mut bytes: Bytes) -> Result<Self, Error> {
        code!(bytes, 'g');
        let cluster = if get_bool(&mut bytes)? {
            Some(get_cluster(&mut bytes)?)
        } else {
            None
        };
        Ok(Self { cluster })
    }
}

impl Protocol for DescResponse {
    fn code(&self) -> char {
        'g'
    }
}
