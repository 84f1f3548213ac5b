//! Per-client push channels.
//!
//! Each following client gets a watch channel per (keyspace, data
//! center). Watch keeps only the latest snapshot, which is the
//! drop-oldest behavior ring updates want: a client that falls behind
//! skips straight to the newest ring.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::topology::Cluster;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey {
    pub keyspace: String,
    pub data_center: String,
    pub client: String,
}

#[derive(Debug, Default)]
pub struct ClientChannels {
    inner: Mutex<HashMap<ClientKey, watch::Sender<Option<Cluster>>>>,
}

impl ClientChannels {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client follow. Returns `None` when this client
    /// already follows the pair.
    pub fn add_client(&self, key: ClientKey) -> Option<watch::Receiver<Option<Cluster>>> {
        let mut inner = self.inner.lock();
        if inner.contains_key(&key) {
            return None;
        }
        let (tx, rx) = watch::channel(None);
        inner.insert(key, tx);
        Some(rx)
    }

    /// Drop a follow; the forwarder task ends when its sender goes.
    pub fn remove_client(&self, key: &ClientKey) {
        self.inner.lock().remove(key);
    }

    /// Push a ring snapshot to every client following the pair.
    /// Returns how many clients were notified.
    pub fn notify_cluster(&self, keyspace: &str, data_center: &str, cluster: &Cluster) -> usize {
        let inner = self.inner.lock();
        let mut notified = 0;
        for (key, tx) in inner.iter() {
            if key.keyspace == keyspace && key.data_center == data_center {
                tx.send_replace(Some(cluster.clone()));
                notified += 1;
            }
        }
        notified
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn key(client: &str) -> ClientKey {
        ClientKey {
            keyspace: "ks".into(),
            data_center: "dc1".into(),
            client: client.into(),
        }
    }

    #[test]
    fn duplicate_follow_rejected() {
        let channels = ClientChannels::new();
        assert!(channels.add_client(key("c1")).is_some());
        assert!(channels.add_client(key("c1")).is_none());
        channels.remove_client(&key("c1"));
        assert!(channels.add_client(key("c1")).is_some());
    }

    #[tokio::test]
    async fn latest_snapshot_wins() {
        let channels = ClientChannels::new();
        let mut rx = channels.add_client(key("c1")).unwrap();

        // two pushes before the client drains: only the latest is seen
        channels.notify_cluster("ks", "dc1", &Cluster::new("ks", 1, 1));
        channels.notify_cluster("ks", "dc1", &Cluster::new("ks", 3, 1));

        rx.changed().await.unwrap();
        let seen = rx.borrow_and_update().clone().unwrap();
        assert_eq!(seen.expected_size(), 3);

        // other pairs are not notified
        assert_eq!(channels.notify_cluster("other", "dc1", &Cluster::new("other", 1, 1)), 0);
    }
}
