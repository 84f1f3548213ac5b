//! Shard bootstrap: peer consultation, bulk sorted-file copy, and the
//! startup sequence that runs a bootstrap plan.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, error, info, warn};

use crate::net::messages::{
    BootstrapCopyBatch, BootstrapCopyRequest, CheckBinlogRequest, CheckBinlogResponse, OkResponse,
    StreamEnd,
};
use crate::net::Stream;
use crate::storage::SstWriter;
use crate::topology::{partition, BootstrapPlan, ClusterNode, ClusterShard, StoreResource};
use crate::util::now_ns;

use super::shard::Shard;
use super::Error;

impl Shard {
    /// Peers replicating this shard, per the live topology.
    pub(crate) fn replica_peers(&self) -> Vec<ClusterShard> {
        match self.registry.get(&self.keyspace) {
            Some(cluster) => partition::peer_shards(
                self.server_id,
                self.id,
                cluster.expected_size(),
                cluster.replication_factor(),
            ),
            None => vec![],
        }
    }

    /// Resolve the store hosting `server_id`, preferring the explicit
    /// list handed down with the bootstrap plan.
    pub(crate) fn node_for_server(
        &self,
        existing: &[ClusterNode],
        server_id: u32,
    ) -> Option<StoreResource> {
        if let Some(node) = existing
            .iter()
            .find(|node| node.shard_info.server_id == server_id)
        {
            return Some(node.store.clone());
        }
        self.registry
            .get(&self.keyspace)?
            .get_node(server_id, 0)
            .map(|node| node.store.clone())
    }

    /// Run the bootstrap plan and start following peers. Called once
    /// when a shard is created or recovered.
    pub async fn start_with_bootstrap_plan(
        self: &Arc<Self>,
        plan: &BootstrapPlan,
        mut existing_primary_shards: Vec<ClusterNode>,
    ) -> Result<(), Error> {
        if existing_primary_shards.is_empty() {
            if let Some(cluster) = self.registry.get(&self.keyspace) {
                for server_id in 0..cluster.expected_size() {
                    if let Some(node) = cluster.get_node(server_id, 0) {
                        existing_primary_shards.push(node.clone());
                    }
                }
            }
        }

        // catch up or fall back to a full copy if the binlog cursor
        // went stale while we were down
        if let Err(err) = self.maybe_bootstrap_after_restart().await {
            error!("{}: bootstrap after restart: {}", self, err);
            return Err(err);
        }

        // bulk copy driven by the topology change, if any
        if let Err(err) = self
            .topo_change_bootstrap(plan, &existing_primary_shards)
            .await
        {
            warn!("{}: topology bootstrap: {}", self, err);
        }

        let replication_factor = self
            .registry
            .get(&self.keyspace)
            .map(|c| c.replication_factor())
            .unwrap_or(1);
        self.adjust_normal_followings(plan.to_cluster_size, replication_factor);

        // one-time follows bridge the transition; no retries, the
        // sources are already up
        let one_time = self.ctx.child_token();
        if let Some(previous) = self.one_time_cancel.lock().replace(one_time.clone()) {
            previous.cancel();
        }

        if !plan.transitional_follow_source.is_empty() {
            info!(
                "{} one-time follows {:?}, {}",
                self, plan.transitional_follow_source, plan
            );
        }
        for source in plan.transitional_follow_source.iter().copied() {
            let Some(store) = self.node_for_server(&existing_primary_shards, source.server_id)
            else {
                warn!("{}: no node for one-time follow {}", self, source);
                continue;
            };
            let shard = self.clone();
            let token = one_time.clone();
            let to_cluster_size = plan.to_cluster_size;
            tokio::spawn(async move {
                if let Err(err) = shard
                    .follow_changes(&token, &store, source.shard_id, to_cluster_size, false)
                    .await
                {
                    warn!("{} one-time follow {}: {}", shard, source, err);
                }
            });
        }

        Ok(())
    }

    /// Cancel transitional follows once the topology change commits.
    pub fn cancel_one_time_follows(&self) {
        if let Some(cancel) = self.one_time_cancel.lock().take() {
            cancel.cancel();
        }
    }

    /// After a restart, check whether the local binlog cursors are
    /// still tailable on the peers; when a peer has already purged past
    /// our cursor, escalate to a full bootstrap copy.
    pub(crate) async fn maybe_bootstrap_after_restart(&self) -> Result<(), Error> {
        let peers = self.replica_peers();
        if peers.is_empty() {
            return Ok(());
        }

        let (best, needed) = self.is_bootstrap_needed(&peers, &[]).await;
        if !needed {
            return Ok(());
        }

        let Some((peer, store)) = best else {
            warn!("{}: bootstrap needed but no reachable peer", self);
            return Ok(());
        };

        info!("{}: bootstrapping from server {}", self, peer.server_id);
        // a peer created in parallel may not have opened its shard yet;
        // the normal follows catch up from the start of its binlog
        if let Err(err) = self.do_bootstrap_copy(&store, peer.shard_id, 0).await {
            warn!(
                "{}: bootstrap copy from server {}: {}",
                self, peer.server_id, err
            );
        }
        Ok(())
    }

    /// Bulk copy driven by a topology-change plan.
    pub(crate) async fn topo_change_bootstrap(
        &self,
        plan: &BootstrapPlan,
        existing: &[ClusterNode],
    ) -> Result<(), Error> {
        if plan.bootstrap_source.is_empty() {
            return Ok(());
        }

        if plan.pick_best_bootstrap_source {
            let (best, needed) = self.is_bootstrap_needed(&plan.bootstrap_source, existing).await;
            if !needed {
                debug!("{}: bootstrap not needed", self);
                return Ok(());
            }
            let Some((peer, store)) = best else {
                warn!("{}: bootstrap needed but no reachable source", self);
                return Ok(());
            };
            info!("{}: bootstrapping from server {}", self, peer.server_id);
            return self
                .do_bootstrap_copy(&store, peer.shard_id, plan.to_cluster_size)
                .await;
        }

        // copy from every source in parallel, keeping only keys that
        // hash here under the new cluster size
        let copies = plan.bootstrap_source.iter().filter_map(|source| {
            let store = self.node_for_server(existing, source.server_id)?;
            let source = *source;
            Some(async move {
                self.do_bootstrap_copy(&store, source.shard_id, plan.to_cluster_size)
                    .await
                    .map_err(|err| (source, err))
            })
        });

        let mut first_error = None;
        for result in join_all(copies).await {
            if let Err((source, err)) = result {
                error!("{}: bootstrap copy from {}: {}", self, source, err);
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Consult every source in parallel; bootstrap is needed when any
    /// of them can no longer serve our cursor. Returns the peer with
    /// the most binlog history as the copy source.
    async fn is_bootstrap_needed(
        &self,
        sources: &[ClusterShard],
        existing: &[ClusterNode],
    ) -> (Option<(ClusterShard, StoreResource)>, bool) {
        let checks = sources.iter().filter_map(|peer| {
            let store = self.node_for_server(existing, peer.server_id)?;
            let peer = *peer;
            Some(async move {
                let result = self.check_binlog_available(&store, peer.shard_id).await;
                (peer, store, result)
            })
        });

        let mut needed = false;
        let mut best: Option<(u32, ClusterShard, StoreResource)> = None;

        for (peer, store, result) in join_all(checks).await {
            match result {
                Ok((latest_segment, can_tail)) => {
                    needed = needed || !can_tail;
                    if best
                        .as_ref()
                        .map(|(max, ..)| latest_segment >= *max)
                        .unwrap_or(true)
                    {
                        best = Some((latest_segment, peer, store));
                    }
                }
                Err(err) => {
                    debug!(
                        "{}: check binlog on {} for shard {}: {}",
                        self, store.admin_address, peer.shard_id, err
                    );
                }
            }
        }

        (best.map(|(_, peer, store)| (peer, store)), needed)
    }

    /// Whether our cursor into the peer's binlog is still tailable.
    /// Without recorded progress there is nothing to tail and a copy is
    /// needed, no round trip required.
    async fn check_binlog_available(
        &self,
        store: &StoreResource,
        source_shard_id: u32,
    ) -> Result<(u32, bool), Error> {
        let Some((segment, _)) = self.progress(&store.admin_address, source_shard_id) else {
            return Ok((0, false));
        };

        let mut stream = Stream::connect(&store.admin_address).await?;
        stream
            .send_flush(&CheckBinlogRequest {
                keyspace: self.keyspace.clone(),
                shard_id: source_shard_id,
            })
            .await?;

        let message = stream.read_message().await?;
        match message.code() {
            'b' => {
                let response: CheckBinlogResponse = message.parse()?;
                Ok((
                    response.latest_segment,
                    response.earliest_segment <= segment,
                ))
            }
            's' => {
                message.parse::<OkResponse>()?.into_result()?;
                Err(Error::Net(crate::net::Error::UnexpectedMessage('s')))
            }
            code => Err(Error::Net(crate::net::Error::UnexpectedMessage(code))),
        }
    }

    /// Full copy from a peer, then record the binlog cursor the copy
    /// covers as the starting follow position.
    pub(crate) async fn do_bootstrap_copy(
        &self,
        store: &StoreResource,
        source_shard_id: u32,
        target_cluster_size: u32,
    ) -> Result<(), Error> {
        let position = self
            .write_to_sst(store, source_shard_id, target_cluster_size)
            .await?;
        self.save_progress(&store.admin_address, source_shard_id, position)
    }

    /// Stream the peer's sorted rows into a temporary file, then ingest
    /// it behind the live data: anything written while the copy ran
    /// keeps precedence.
    async fn write_to_sst(
        &self,
        store: &StoreResource,
        source_shard_id: u32,
        target_cluster_size: u32,
    ) -> Result<(u32, u64), Error> {
        let mut stream = Stream::connect(&store.admin_address).await?;
        stream
            .send_flush(&BootstrapCopyRequest {
                keyspace: self.keyspace.clone(),
                shard_id: source_shard_id,
                target_cluster_size,
                target_shard_id: self.id,
                origin: self.to_string(),
            })
            .await?;

        let sst_path = self.dir.join(format!("bootstrap-{}.sst", now_ns()));
        let result = async {
            let mut writer = SstWriter::create(&sst_path)?;
            let mut position = (0u32, 0u64);

            loop {
                let message = stream.read_message().await?;
                match message.code() {
                    'p' => {
                        let batch: BootstrapCopyBatch = message.parse()?;
                        for kv in &batch.key_values {
                            writer.add(&kv.key, &kv.value)?;
                        }
                        if let Some(progress) = batch.binlog_progress {
                            position = progress;
                        }
                    }
                    'Z' => {
                        message.parse::<StreamEnd>()?.into_result()?;
                        break;
                    }
                    code => return Err(Error::Net(crate::net::Error::UnexpectedMessage(code))),
                }
            }

            let (path, count) = writer.finish()?;
            if count > 0 {
                let ingested = self.db.ingest_sorted_file(&path)?;
                info!(
                    "{}: bootstrap copy from {} shard {}: {} rows, {} ingested",
                    self, store.admin_address, source_shard_id, count, ingested
                );
            }
            Ok(position)
        }
        .await;

        if let Err(err) = std::fs::remove_file(&sst_path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!("{}: remove {}: {}", self, sst_path.display(), err);
            }
        }

        result
    }
}
