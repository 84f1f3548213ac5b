//! Bootstrap plans for topology transitions.
//!
//! When a cluster is created, resized, or a replica is relocated, every
//! affected shard receives a plan describing where to bulk-copy its data
//! from and which shards to tail temporarily while the transition is in
//! flight.

use std::fmt;

use super::{is_shard_in_local, partition_shards, ClusterShard};

/// Request to plan the bootstrap of one shard.
#[derive(Debug, Clone, Copy)]
pub struct BootstrapRequest {
    pub server_id: u32,
    pub shard_id: u32,
    pub from_cluster_size: u32,
    pub to_cluster_size: u32,
    pub replication_factor: u32,
}

/// Detailed plan to bootstrap one shard.
///
/// `bootstrap_source` lists the shards to bulk-copy from. When
/// `pick_best_bootstrap_source` is set, the shard consults all of them
/// and copies from the one with the most binlog history; otherwise it
/// copies from every source, relying on the partition filter to keep
/// only its own keys. `transitional_follow_source` lists shards to tail
/// (with the follower's filter) until the transition completes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BootstrapPlan {
    pub bootstrap_source: Vec<ClusterShard>,
    pub pick_best_bootstrap_source: bool,
    pub transitional_follow_source: Vec<ClusterShard>,
    pub from_cluster_size: u32,
    pub to_cluster_size: u32,
}

impl BootstrapPlan {
    /// Plan with nothing to do besides normal following.
    pub fn plain(to_cluster_size: u32) -> Self {
        Self {
            to_cluster_size,
            from_cluster_size: to_cluster_size,
            ..Default::default()
        }
    }
}

/// Build the bootstrap plan for one shard given a topology change.
///
/// Ids live in the union of the two rings: retiring shards are dropped
/// wholesale, never renumbered, so non-contiguous ids cannot arise.
pub fn bootstrap_plan_with_topo_change(req: &BootstrapRequest) -> BootstrapPlan {
    let ring = req.from_cluster_size.max(req.to_cluster_size);
    debug_assert!(req.from_cluster_size > 0 && req.to_cluster_size > 0);
    debug_assert!(req.shard_id < ring && req.server_id < ring);

    let mut plan = BootstrapPlan {
        from_cluster_size: req.from_cluster_size,
        to_cluster_size: req.to_cluster_size,
        ..Default::default()
    };

    if req.from_cluster_size == req.to_cluster_size {
        // replica relocation: copy from the partition peers, then tail
        // the same shard on its other servers
        plan.bootstrap_source =
            partition_shards(req.shard_id, req.to_cluster_size, req.replication_factor);
        plan.pick_best_bootstrap_source = true;
        plan.transitional_follow_source = vec![ClusterShard::new(req.server_id, req.shard_id)];
        return plan;
    }

    if req.from_cluster_size < req.to_cluster_size {
        // growing cluster
        if req.shard_id >= req.from_cluster_size {
            // brand-new shard: read everything from the existing
            // primaries, keeping only keys that now hash here
            plan.bootstrap_source = (0..req.from_cluster_size)
                .map(|i| ClusterShard::new(i, i))
                .collect();
            plan.transitional_follow_source = plan.bootstrap_source.clone();
            return plan;
        }

        if is_shard_in_local(
            req.shard_id,
            req.server_id,
            req.to_cluster_size,
            req.replication_factor,
        ) {
            if is_shard_in_local(
                req.shard_id,
                req.server_id,
                req.from_cluster_size,
                req.replication_factor,
            ) {
                // the shard does not move
                return plan;
            }
            // relocating here: copy from a remote replica, no
            // transitional follow needed
            plan.bootstrap_source = partition_shards(
                req.shard_id,
                req.from_cluster_size,
                req.replication_factor,
            );
            plan.pick_best_bootstrap_source = true;
            return plan;
        }

        // moving out, nothing to do
        return plan;
    }

    // shrinking cluster
    if req.server_id >= req.to_cluster_size || req.shard_id >= req.to_cluster_size {
        // retiring, nothing to bootstrap
        return plan;
    }

    if is_shard_in_local(
        req.shard_id,
        req.server_id,
        req.to_cluster_size,
        req.replication_factor,
    ) {
        let retiring: Vec<ClusterShard> = (req.to_cluster_size..req.from_cluster_size)
            .map(|i| ClusterShard::new(i, i))
            .collect();

        if !is_shard_in_local(
            req.shard_id,
            req.server_id,
            req.from_cluster_size,
            req.replication_factor,
        ) {
            // new home for this shard: copy an existing replica, and
            // tail the retiring shards with the new filter
            plan.bootstrap_source = partition_shards(
                req.shard_id,
                req.from_cluster_size,
                req.replication_factor,
            );
            plan.pick_best_bootstrap_source = true;
            plan.transitional_follow_source = retiring;
            return plan;
        }

        // already here in both clusters: absorb the retiring shards
        plan.bootstrap_source = retiring;
        plan.transitional_follow_source = plan.bootstrap_source.clone();
        return plan;
    }

    // moving out, nothing to do
    plan
}

impl fmt::Display for BootstrapPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.bootstrap_source.is_empty() {
            write!(f, "bootstraps from ")?;
            if self.pick_best_bootstrap_source {
                write!(f, "one of ")?;
            }
            write!(f, "[")?;
            for (i, shard) in self.bootstrap_source.iter().enumerate() {
                if i != 0 {
                    write!(f, ",")?;
                }
                write!(f, "{}", shard)?;
            }
            write!(f, "] ")?;
        }

        if !self.transitional_follow_source.is_empty() {
            write!(f, "temporarily follows [")?;
            for (i, shard) in self.transitional_follow_source.iter().enumerate() {
                if i != 0 {
                    write!(f, ",")?;
                }
                write!(f, "{}", shard)?;
            }
            write!(f, "] ")?;
        }

        write!(f, "bootstrap start")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn plan(server_id: u32, shard_id: u32, from: u32, to: u32, r: u32) -> BootstrapPlan {
        bootstrap_plan_with_topo_change(&BootstrapRequest {
            server_id,
            shard_id,
            from_cluster_size: from,
            to_cluster_size: to,
            replication_factor: r,
        })
    }

    fn shards(pairs: &[(u32, u32)]) -> Vec<ClusterShard> {
        pairs
            .iter()
            .map(|&(server_id, shard_id)| ClusterShard::new(server_id, shard_id))
            .collect()
    }

    #[test]
    fn same_size_relocates_replicas() {
        let p = plan(1, 1, 3, 3, 2);
        assert_eq!(p.bootstrap_source, shards(&[(1, 1), (2, 1)]));
        assert!(p.pick_best_bootstrap_source);
        assert_eq!(p.transitional_follow_source, shards(&[(1, 1)]));
    }

    #[test]
    fn grow_new_shard_reads_all_existing_primaries() {
        // growing 2 -> 3, shard 2 is brand new
        let p = plan(2, 2, 2, 3, 1);
        assert_eq!(p.bootstrap_source, shards(&[(0, 0), (1, 1)]));
        assert!(!p.pick_best_bootstrap_source);
        assert_eq!(p.transitional_follow_source, p.bootstrap_source);
    }

    #[test]
    fn grow_unmoved_shard_is_a_noop() {
        // growing 2 -> 3, shard 0 stays on server 0
        let p = plan(0, 0, 2, 3, 1);
        assert!(p.bootstrap_source.is_empty());
        assert!(p.transitional_follow_source.is_empty());
    }

    #[test]
    fn grow_modular_local_shard_is_unmoved() {
        // growing 2 -> 4 with R=2: shard 1 is local to server 2 in both
        // the old and the new ring by the modular placement rule, so the
        // plan is empty
        let p = plan(2, 1, 2, 4, 2);
        assert!(p.bootstrap_source.is_empty());
        assert!(p.transitional_follow_source.is_empty());
    }

    #[test]
    fn grow_moving_out_is_a_noop() {
        // growing 2 -> 3 with R=1: server 0's shard 0 stays, but from
        // server 1's perspective shard 0 was never local; use R=2:
        // shard 0 was local on server 1 in size 2, not in size 3
        let p = plan(1, 0, 3, 5, 1);
        assert!(p.bootstrap_source.is_empty());
        assert!(p.transitional_follow_source.is_empty());
    }

    #[test]
    fn shrink_retiring_server_is_a_noop() {
        let p = plan(2, 2, 3, 2, 1);
        assert!(p.bootstrap_source.is_empty());
        assert!(p.transitional_follow_source.is_empty());
    }

    #[test]
    fn shrink_surviving_shard_absorbs_retirees() {
        // shrinking 3 -> 2, shard 0 on server 0 survives in place
        let p = plan(0, 0, 3, 2, 1);
        assert_eq!(p.bootstrap_source, shards(&[(2, 2)]));
        assert!(!p.pick_best_bootstrap_source);
        assert_eq!(p.transitional_follow_source, p.bootstrap_source);
    }

    #[test]
    fn shrink_relocating_shard_copies_then_tails_retirees() {
        // shrinking 4 -> 2 with R=2: server 0 newly hosts shard 1
        // (local_shards(0, 2, 2) = {0, 1}; local_shards(0, 4, 2) = {0, 3})
        let p = plan(0, 1, 4, 2, 2);
        assert_eq!(p.bootstrap_source, shards(&[(1, 1), (2, 1)]));
        assert!(p.pick_best_bootstrap_source);
        assert_eq!(p.transitional_follow_source, shards(&[(2, 2), (3, 3)]));
    }

    #[test]
    fn display_reads_like_a_sentence() {
        let p = plan(0, 0, 3, 2, 1);
        assert_eq!(
            p.to_string(),
            "bootstraps from [2.2] temporarily follows [2.2] bootstrap start"
        );

        let p = plan(1, 1, 3, 3, 2);
        assert_eq!(
            p.to_string(),
            "bootstraps from one of [1.1,2.1] temporarily follows [1.1] bootstrap start"
        );
    }
}
