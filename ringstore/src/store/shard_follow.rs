//! Follow processes: long-lived tails of peer binlogs.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::net::messages::{StreamEnd, TailBinlogBatch, TailBinlogRequest};
use crate::net::Stream;
use crate::topology::{partition, StoreResource};
use crate::util::retry_forever;

use super::shard::Shard;
use super::Error;

/// Entries per tail batch.
const TAIL_LIMIT: u32 = 8096;
/// Backoff between normal-follow retries.
const FOLLOW_RETRY: Duration = Duration::from_secs(2);

impl Shard {
    /// Reconcile the set of follow processes with the replica peers for
    /// the given topology: start tails for new peers, cancel tails for
    /// peers that dropped out. Each tail retries forever under its own
    /// child token until cancelled.
    pub fn adjust_normal_followings(
        self: &Arc<Self>,
        cluster_size: u32,
        replication_factor: u32,
    ) {
        let targets =
            partition::peer_shards(self.server_id, self.id, cluster_size, replication_factor);
        debug!(
            "{} follow peers {:?}, cluster {} replication {}",
            self, targets, cluster_size, replication_factor
        );

        for peer in &targets {
            let token = self.ctx.child_token();
            {
                let mut processes = self.follow_processes.lock();
                if processes.contains_key(peer) {
                    continue;
                }
                processes.insert(*peer, token.clone());
            }

            info!("{} normal follow {}", self, peer);
            let shard = self.clone();
            let peer = *peer;
            let name = format!("shard {} follow {}", self, peer);
            tokio::spawn(async move {
                let loop_shard = shard.clone();
                let loop_token = token.clone();
                retry_forever(&token, &name, FOLLOW_RETRY, move || {
                    let shard = loop_shard.clone();
                    let token = loop_token.clone();
                    async move {
                        let Some(store) = shard.node_for_server(&[], peer.server_id) else {
                            return Err(Error::NoNode(peer.server_id));
                        };
                        shard
                            .follow_changes(&token, &store, peer.shard_id, cluster_size, true)
                            .await?;
                        // a clean stream end without cancellation means
                        // the peer went away; keep retrying
                        if token.is_cancelled() {
                            Ok(())
                        } else {
                            Err(Error::Net(crate::net::Error::Eof))
                        }
                    }
                })
                .await;
            });
        }

        // cancel outdated followings
        let mut processes = self.follow_processes.lock();
        processes.retain(|peer, token| {
            if targets.contains(peer) {
                true
            } else {
                info!("{} stops following {}", self, peer);
                token.cancel();
                false
            }
        });
    }

    /// Tail one peer shard: apply every streamed entry and advance the
    /// follow cursor. Returns `Ok` only on cancellation; stream errors
    /// bubble up for the caller's retry policy.
    pub(crate) async fn follow_changes(
        &self,
        ctx: &CancellationToken,
        store: &StoreResource,
        source_shard_id: u32,
        target_cluster_size: u32,
        save_progress: bool,
    ) -> Result<(), Error> {
        let (segment, offset) = self
            .progress(&store.admin_address, source_shard_id)
            .unwrap_or((0, 0));
        if save_progress {
            self.insert_progress(&store.admin_address, source_shard_id, (segment, offset));
        }
        debug!(
            "{} follows {} shard {} from {}:{}",
            self, store.admin_address, source_shard_id, segment, offset
        );

        let mut stream = Stream::connect(&store.admin_address).await?;
        stream
            .send_flush(&TailBinlogRequest {
                keyspace: self.keyspace.clone(),
                shard_id: source_shard_id,
                segment,
                offset,
                limit: TAIL_LIMIT,
                target_cluster_size,
                target_shard_id: self.id,
                origin: self.to_string(),
            })
            .await?;

        loop {
            let message = tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                message = stream.read_message() => message?,
            };

            match message.code() {
                't' => {
                    let batch: TailBinlogBatch = message.parse()?;
                    for entry in &batch.entries {
                        self.apply_entry(entry);
                    }
                    if save_progress {
                        self.update_progress_if_present(
                            &store.admin_address,
                            source_shard_id,
                            (batch.next_segment, batch.next_offset),
                        );
                    }
                }
                'Z' => {
                    let end: StreamEnd = message.parse()?;
                    if let Some(error) = &end.error {
                        warn!(
                            "{} tail of {} shard {} ended: {}",
                            self, store.admin_address, source_shard_id, error
                        );
                    }
                    return end.into_result().map_err(Into::into);
                }
                code => return Err(Error::Net(crate::net::Error::UnexpectedMessage(code))),
            }
        }
    }
}
