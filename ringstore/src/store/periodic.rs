//! Periodic task bus: a one-second tick dispatched to registered
//! tasks.

use std::sync::Weak;

use super::shard::Shard;

/// Work dispatched every second. Tasks hold weak shard references, so a
/// deleted shard silently drops off the bus.
#[derive(Debug, Clone)]
pub enum PeriodicTask {
    /// Flush in-memory follow progress on its interval.
    FlushProgress(Weak<Shard>),
    /// Compact and persist the shard's store when dirty.
    CompactStore(Weak<Shard>),
}

impl PeriodicTask {
    /// Returns false when the owning shard is gone and the task should
    /// be unregistered.
    pub fn every_second(&self) -> bool {
        let (shard, f): (_, fn(&Shard)) = match self {
            PeriodicTask::FlushProgress(shard) => (shard, Shard::tick_progress),
            PeriodicTask::CompactStore(shard) => (shard, Shard::tick_compact),
        };

        match shard.upgrade() {
            Some(shard) if !shard.is_shutdown() => {
                f(&shard);
                true
            }
            _ => false,
        }
    }
}
