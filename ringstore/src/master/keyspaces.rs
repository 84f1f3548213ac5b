//! Keyspace registry: current and next cluster per keyspace, with one
//! lock per keyspace held across create and resize.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex;

use crate::topology::Cluster;

#[derive(Debug, Default)]
pub struct KeyspaceState {
    pub cluster: Option<Cluster>,
    /// Candidate cluster while a resize is in flight.
    pub next_cluster: Option<Cluster>,
}

#[derive(Debug, Default)]
pub struct KeyspaceEntry {
    /// Serializes create/resize/delete for this keyspace.
    pub lock: Mutex<()>,
    pub state: RwLock<KeyspaceState>,
}

#[derive(Debug, Default)]
pub struct Keyspaces {
    inner: RwLock<HashMap<String, Arc<KeyspaceEntry>>>,
}

impl Keyspaces {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, keyspace: &str) -> Option<Arc<KeyspaceEntry>> {
        self.inner.read().get(keyspace).cloned()
    }

    pub fn get_or_create(&self, keyspace: &str) -> Arc<KeyspaceEntry> {
        if let Some(entry) = self.get(keyspace) {
            return entry;
        }
        self.inner
            .write()
            .entry(keyspace.to_string())
            .or_default()
            .clone()
    }

    pub fn remove(&self, keyspace: &str) {
        self.inner.write().remove(keyspace);
    }

    /// Snapshot of the active cluster.
    pub fn cluster(&self, keyspace: &str) -> Option<Cluster> {
        self.get(keyspace)?.state.read().cluster.clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn entries_are_shared() {
        let keyspaces = Keyspaces::new();
        let a = keyspaces.get_or_create("ks");
        let b = keyspaces.get_or_create("ks");
        assert!(Arc::ptr_eq(&a, &b));

        a.state.write().cluster = Some(Cluster::new("ks", 2, 1));
        assert_eq!(keyspaces.cluster("ks").unwrap().expected_size(), 2);

        keyspaces.remove("ks");
        assert!(keyspaces.cluster("ks").is_none());
    }
}
