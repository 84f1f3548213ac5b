//! Master: store membership, keyspace registry, and ring snapshots
//! pushed to clients.

pub mod clients;
pub mod keyspaces;
pub mod server;

pub use clients::{ClientChannels, ClientKey};
pub use keyspaces::Keyspaces;
pub use server::MasterServer;

use thiserror::Error;

/// Master error. A store-side failure is reported to the caller; the
/// master itself never goes down with it.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("net: {0}")]
    Net(#[from] crate::net::Error),

    #[error("{0}")]
    Topology(#[from] crate::topology::Error),

    #[error("keyspace {0} already exists")]
    KeyspaceExists(String),

    #[error("keyspace {0} not found")]
    KeyspaceNotFound(String),

    #[error("no store registered in data center {0}")]
    NoDataCenter(String),

    #[error("cluster for {0} is missing server {1}")]
    IncompleteCluster(String, u32),

    #[error("create shard on {addr}: {error}")]
    CreateShard { addr: String, error: String },
}

/// Options the master runs with.
#[derive(Debug, Clone)]
pub struct MasterOption {
    pub address: String,
    /// Data center served by this master.
    pub data_center: String,
}

impl Default for MasterOption {
    fn default() -> Self {
        let config = crate::config::config();
        Self {
            address: config.master.address.clone(),
            data_center: config.general.data_center.clone(),
        }
    }
}
