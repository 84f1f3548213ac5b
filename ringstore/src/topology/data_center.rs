//! Store membership within one data center, and server allocation for
//! new clusters.

use tracing::debug;

use super::{Error, StoreResource};

/// All stores registered in one data center.
#[derive(Debug, Default, Clone)]
pub struct DataCenter {
    pub name: String,
    servers: Vec<StoreResource>,
}

impl DataCenter {
    pub fn new(name: impl ToString) -> Self {
        Self {
            name: name.to_string(),
            servers: vec![],
        }
    }

    /// Register a store, replacing any prior registration from the same
    /// admin address.
    pub fn add_store(&mut self, store: StoreResource) {
        match self
            .servers
            .iter_mut()
            .find(|s| s.admin_address == store.admin_address)
        {
            Some(slot) => *slot = store,
            None => self.servers.push(store),
        }
    }

    pub fn remove_store(&mut self, admin_address: &str) -> bool {
        let before = self.servers.len();
        self.servers.retain(|s| s.admin_address != admin_address);
        before != self.servers.len()
    }

    pub fn servers(&self) -> &[StoreResource] {
        &self.servers
    }

    /// Pick `n` stores for a new cluster needing `total_disk_gb` in
    /// total, preferring the emptiest. Fails when fewer than `n` stores
    /// satisfy the disk and predicate requirements.
    pub fn allocate_servers(
        &mut self,
        n: usize,
        total_disk_gb: u32,
        requirement: impl Fn(&StoreResource) -> bool,
    ) -> Result<Vec<StoreResource>, Error> {
        let per_server_gb = total_disk_gb.div_ceil(n.max(1) as u32);

        let mut eligible: Vec<usize> = self
            .servers
            .iter()
            .enumerate()
            .filter(|(_, s)| s.free_disk_gb() >= per_server_gb && requirement(s))
            .map(|(i, _)| i)
            .collect();

        if eligible.len() < n {
            return Err(Error::Capacity {
                needed: n,
                available: eligible.len(),
            });
        }

        eligible.sort_by_key(|&i| std::cmp::Reverse(self.servers[i].free_disk_gb()));
        eligible.truncate(n);

        let mut chosen = Vec::with_capacity(n);
        for index in eligible {
            let server = &mut self.servers[index];
            server.allocated_size_gb += per_server_gb;
            debug!(
                "allocated {}gb on {} ({}gb free)",
                per_server_gb,
                server.admin_address,
                server.free_disk_gb()
            );
            chosen.push(server.clone());
        }

        Ok(chosen)
    }
}

/// All required tags present on the store.
pub fn meet_requirement(store_tags: &[String], required: &[String]) -> bool {
    required.iter().all(|tag| store_tags.contains(tag))
}
