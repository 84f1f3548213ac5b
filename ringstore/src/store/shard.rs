//! One shard: an ordered store, its binlog, and the follow processes
//! replicating peers into it.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::binlog::LogManager;
use crate::net::messages::{EntryOp, FromBytes, KeyValue, LogEntry};
use crate::net::ToBytes;
use crate::storage::{Db, MergeOp, Row};
use crate::topology::{ClusterRegistry, ClusterShard, ShardInfo};
use crate::util::now_ns;

use super::Error;

const PROGRESS_FILE: &str = "follow-progress";
/// How often in-memory follow progress is flushed to disk.
pub(crate) const PROGRESS_FLUSH_INTERVAL_SECS: u64 = 60;

/// Follow progress per `(peer admin address, source shard)`. Positions
/// only advance.
#[derive(Debug, Default)]
pub(crate) struct FollowProgress {
    entries: HashMap<(String, u32), (u32, u64)>,
    dirty: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct ProgressRecord {
    peer: String,
    shard_id: u32,
    segment: u32,
    offset: u64,
}

pub struct Shard {
    pub keyspace: String,
    pub id: u32,
    pub server_id: u32,
    pub(crate) db: Arc<Db>,
    pub(crate) binlog: Option<Arc<LogManager>>,
    pub(crate) registry: Arc<ClusterRegistry>,
    pub(crate) dir: PathBuf,
    /// Root of this shard's task tree; shutdown cancels every follow.
    pub(crate) ctx: CancellationToken,
    pub(crate) follow_progress: Mutex<FollowProgress>,
    pub(crate) follow_processes: Mutex<HashMap<ClusterShard, CancellationToken>>,
    pub(crate) one_time_cancel: Mutex<Option<CancellationToken>>,
    ticks: AtomicU64,
    is_shutdown: AtomicBool,
}

impl fmt::Display for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.keyspace, self.server_id, self.id)
    }
}

impl fmt::Debug for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shard")
            .field("keyspace", &self.keyspace)
            .field("id", &self.id)
            .field("server_id", &self.server_id)
            .finish_non_exhaustive()
    }
}

impl Shard {
    /// Open the shard in `dir`, replaying any binlog tail the snapshot
    /// does not cover.
    pub fn open(
        info: &ShardInfo,
        dir: PathBuf,
        registry: Arc<ClusterRegistry>,
        merge_op: MergeOp,
        log_file_size_mb: u32,
        log_file_count: u32,
    ) -> Result<Arc<Self>, Error> {
        info!("open {} in {}", info.identifier(), dir.display());
        std::fs::create_dir_all(&dir)?;

        let db = Arc::new(Db::open(&dir, merge_op)?);
        db.set_shard_filter(info.shard_id, info.cluster_size);

        let binlog = if log_file_size_mb > 0 {
            Some(Arc::new(LogManager::open(
                &dir,
                log_file_size_mb,
                log_file_count,
            )?))
        } else {
            None
        };

        let shard = Arc::new(Self {
            keyspace: info.keyspace.clone(),
            id: info.shard_id,
            server_id: info.server_id,
            db,
            binlog,
            registry,
            dir,
            ctx: CancellationToken::new(),
            follow_progress: Mutex::new(FollowProgress::default()),
            follow_processes: Mutex::new(HashMap::new()),
            one_time_cancel: Mutex::new(None),
            ticks: AtomicU64::new(0),
            is_shutdown: AtomicBool::new(false),
        });

        shard.load_progress_file()?;
        shard.replay_binlog()?;

        Ok(shard)
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown.load(Ordering::SeqCst)
    }

    /// Tear the shard down: cancel every follow process, close the
    /// binlog and the store.
    pub fn shutdown_node(&self) {
        if self.is_shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down shard {}", self);

        self.ctx.cancel();
        if let Some(cancel) = self.one_time_cancel.lock().take() {
            cancel.cancel();
        }
        self.follow_processes.lock().clear();

        if let Some(binlog) = &self.binlog {
            binlog.shutdown();
        }
        if let Err(err) = self.flush_progress() {
            warn!("{}: progress flush on shutdown: {}", self, err);
        }
        if let Err(err) = self.db.close() {
            error!("{}: close: {}", self, err);
        }
    }

    // ---- data plane -----------------------------------------------------

    /// Read one key; expired rows read as absent.
    pub fn get(&self, key: &[u8]) -> Option<Row> {
        let row = Row::from_bytes(self.db.get(key)?).ok()?;
        (!row.is_expired(now_ns())).then_some(row)
    }

    /// Append a mutation to the binlog, then apply it. A crash between
    /// the two is recovered by replay on reopen.
    pub fn write_entry(&self, entry: &LogEntry) -> Result<(), Error> {
        if self.is_shutdown() {
            return Err(Error::ShardShutdown);
        }

        if let Some(binlog) = &self.binlog {
            let position = binlog.append(&entry.to_bytes()?)?;
            self.apply_entry(entry);
            self.db.set_applied(position);
        } else {
            self.apply_entry(entry);
        }
        Ok(())
    }

    /// Apply one entry under last-writer-wins and TTL rules. Also the
    /// replication apply path, so local writes and tailed writes
    /// converge identically.
    pub(crate) fn apply_entry(&self, entry: &LogEntry) {
        let now = now_ns();
        match &entry.op {
            EntryOp::Merge {
                key,
                partition_hash,
                value,
                op_and_data_type,
            } => {
                // merges apply unconditionally
                let incoming = Row {
                    partition_hash: *partition_hash,
                    updated_at_ns: entry.updated_at_ns,
                    ttl_second: 0,
                    op_and_data_type: *op_and_data_type,
                    value: value.clone(),
                };
                self.db.merge(key, &incoming);
            }

            EntryOp::Delete { key, .. } => {
                let Some(existing) = self.existing_row(key) else {
                    return;
                };
                if existing.is_expired(now) || existing.updated_at_ns > entry.updated_at_ns {
                    return;
                }
                self.db.delete(key);
            }

            EntryOp::Put {
                key,
                partition_hash,
                value,
                ttl_second,
                op_and_data_type,
            } => {
                let incoming = Row {
                    partition_hash: *partition_hash,
                    updated_at_ns: entry.updated_at_ns,
                    ttl_second: *ttl_second,
                    op_and_data_type: *op_and_data_type,
                    value: value.clone(),
                };
                match self.existing_row(key) {
                    None => self.db.put(key, incoming.to_bytes()),
                    Some(existing) => {
                        if existing.is_expired(now) {
                            // an expired row never blocks a live write
                            if !incoming.is_expired(now) {
                                self.db.put(key, incoming.to_bytes());
                            }
                        } else if existing.updated_at_ns > entry.updated_at_ns {
                            // last writer wins, drop silently
                        } else {
                            self.db.put(key, incoming.to_bytes());
                        }
                    }
                }
            }
        }
    }

    fn existing_row(&self, key: &[u8]) -> Option<Row> {
        self.db.get(key).and_then(|b| Row::from_bytes(b).ok())
    }

    /// Ordered scan of live rows under a prefix, resumable after
    /// `last_seen_key`.
    pub fn prefix_scan(
        &self,
        prefix: &[u8],
        last_seen_key: Option<&[u8]>,
        limit: usize,
    ) -> Vec<KeyValue> {
        let now = now_ns();
        let mut out = Vec::new();
        self.db.prefix_scan(prefix, last_seen_key, 0, |key, value| {
            if let Ok(row) = Row::from_bytes(value.clone()) {
                if !row.is_expired(now) {
                    out.push(KeyValue {
                        key: Bytes::copy_from_slice(key),
                        value: row.value,
                    });
                    if limit > 0 && out.len() >= limit {
                        return false;
                    }
                }
            }
            true
        });
        out
    }

    // ---- periodic work --------------------------------------------------

    pub(crate) fn tick_compact(&self) {
        if self.db.is_dirty() {
            if let Err(err) = self.db.flush() {
                error!("{}: flush: {}", self, err);
            }
        }
    }

    pub(crate) fn tick_progress(&self) {
        let tick = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        if tick % PROGRESS_FLUSH_INTERVAL_SECS == 0 {
            if let Err(err) = self.flush_progress() {
                warn!("{}: progress flush: {}", self, err);
            }
        }
    }

    /// Re-target the compaction filter after a cluster resize.
    pub fn set_cluster_size(&self, cluster_size: u32) {
        self.db.set_shard_filter(self.id, cluster_size);
    }

    // ---- follow progress ------------------------------------------------

    pub(crate) fn progress(&self, peer: &str, source_shard: u32) -> Option<(u32, u64)> {
        self.follow_progress
            .lock()
            .entries
            .get(&(peer.to_string(), source_shard))
            .copied()
    }

    /// Record a starting cursor for a follow.
    pub(crate) fn insert_progress(&self, peer: &str, source_shard: u32, position: (u32, u64)) {
        let progress = &mut *self.follow_progress.lock();
        let entry = progress
            .entries
            .entry((peer.to_string(), source_shard))
            .or_insert(position);
        if position > *entry {
            *entry = position;
        }
        progress.dirty = true;
    }

    /// Advance the cursor for an active follow; positions never move
    /// backwards and absent entries are not created.
    pub(crate) fn update_progress_if_present(
        &self,
        peer: &str,
        source_shard: u32,
        position: (u32, u64),
    ) {
        let progress = &mut *self.follow_progress.lock();
        if let Some(entry) = progress
            .entries
            .get_mut(&(peer.to_string(), source_shard))
        {
            if position > *entry {
                *entry = position;
                progress.dirty = true;
            }
        }
    }

    /// Record and persist a cursor, used right after a bootstrap copy.
    pub(crate) fn save_progress(
        &self,
        peer: &str,
        source_shard: u32,
        position: (u32, u64),
    ) -> Result<(), Error> {
        self.insert_progress(peer, source_shard, position);
        self.flush_progress()
    }

    pub(crate) fn flush_progress(&self) -> Result<(), Error> {
        let records: Vec<ProgressRecord> = {
            let mut progress = self.follow_progress.lock();
            if !progress.dirty {
                return Ok(());
            }
            progress.dirty = false;
            progress
                .entries
                .iter()
                .map(|((peer, shard_id), (segment, offset))| ProgressRecord {
                    peer: peer.clone(),
                    shard_id: *shard_id,
                    segment: *segment,
                    offset: *offset,
                })
                .collect()
        };

        let tmp = self.dir.join(format!("{}.tmp", PROGRESS_FILE));
        std::fs::write(&tmp, serde_json::to_vec(&records)?)?;
        std::fs::rename(&tmp, self.dir.join(PROGRESS_FILE))?;
        Ok(())
    }

    fn load_progress_file(&self) -> Result<(), Error> {
        let path = self.dir.join(PROGRESS_FILE);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        let records: Vec<ProgressRecord> = serde_json::from_slice(&bytes)?;
        let mut progress = self.follow_progress.lock();
        for record in records {
            progress
                .entries
                .insert((record.peer, record.shard_id), (record.segment, record.offset));
        }
        Ok(())
    }

    // ---- recovery -------------------------------------------------------

    /// Replay binlog records the snapshot does not cover. Put and
    /// delete replay is idempotent under LWW; merges start exactly at
    /// the recorded applied position so they are never doubled.
    fn replay_binlog(&self) -> Result<(), Error> {
        let Some(binlog) = &self.binlog else {
            return Ok(());
        };

        let (mut segment, mut offset) = self.db.applied();
        if segment < binlog.earliest() {
            segment = binlog.earliest();
            offset = 0;
        }

        let mut replayed = 0usize;
        loop {
            let (records, next_segment, next_offset) = match binlog.read(segment, offset, 1024) {
                Ok(read) => read,
                Err(err) if err.stale_cursor() => {
                    segment = binlog.earliest();
                    offset = 0;
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            if records.is_empty() {
                break;
            }
            for record in &records {
                match LogEntry::from_bytes(record.clone()) {
                    Ok(entry) => self.apply_entry(&entry),
                    Err(err) => warn!("{}: skipping undecodable binlog record: {}", self, err),
                }
                replayed += 1;
            }
            segment = next_segment;
            offset = next_offset;
        }

        if replayed > 0 {
            info!("{}: replayed {} binlog records", self, replayed);
        }
        self.db.set_applied((segment, offset));
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn put_entry(key: &[u8], value: &[u8], ts: u64, ttl: u32) -> LogEntry {
        LogEntry {
            updated_at_ns: ts,
            op: EntryOp::Put {
                key: Bytes::copy_from_slice(key),
                partition_hash: crate::topology::partition_hash(key),
                value: Bytes::copy_from_slice(value),
                ttl_second: ttl,
                op_and_data_type: 0,
            },
        }
    }

    fn delete_entry(key: &[u8], ts: u64) -> LogEntry {
        LogEntry {
            updated_at_ns: ts,
            op: EntryOp::Delete {
                key: Bytes::copy_from_slice(key),
                partition_hash: crate::topology::partition_hash(key),
            },
        }
    }

    fn merge_entry(key: &[u8], value: &[u8], ts: u64) -> LogEntry {
        LogEntry {
            updated_at_ns: ts,
            op: EntryOp::Merge {
                key: Bytes::copy_from_slice(key),
                partition_hash: crate::topology::partition_hash(key),
                value: Bytes::copy_from_slice(value),
                op_and_data_type: 0,
            },
        }
    }

    fn test_shard(dir: &std::path::Path) -> Arc<Shard> {
        let info = ShardInfo {
            server_id: 0,
            shard_id: 0,
            keyspace: "ks".into(),
            cluster_size: 1,
            replication_factor: 1,
            is_candidate: false,
        };
        Shard::open(
            &info,
            dir.to_path_buf(),
            Arc::new(ClusterRegistry::new()),
            MergeOp::BytesConcat,
            1,
            3,
        )
        .unwrap()
    }

    #[test]
    fn last_writer_wins() {
        let dir = tempfile::tempdir().unwrap();
        let shard = test_shard(dir.path());

        shard.write_entry(&put_entry(b"a", b"1", 100, 0)).unwrap();
        shard.write_entry(&put_entry(b"a", b"2", 200, 0)).unwrap();
        assert_eq!(&shard.get(b"a").unwrap().value[..], b"2");

        // an older write arriving late is dropped silently
        shard.write_entry(&put_entry(b"a", b"0", 150, 0)).unwrap();
        assert_eq!(&shard.get(b"a").unwrap().value[..], b"2");

        // equal timestamp overwrites
        shard.write_entry(&put_entry(b"a", b"3", 200, 0)).unwrap();
        assert_eq!(&shard.get(b"a").unwrap().value[..], b"3");
        shard.shutdown_node();
    }

    #[test]
    fn delete_respects_lww() {
        let dir = tempfile::tempdir().unwrap();
        let shard = test_shard(dir.path());

        // delete of a missing key is a no-op
        shard.write_entry(&delete_entry(b"a", 100)).unwrap();

        shard.write_entry(&put_entry(b"a", b"1", 200, 0)).unwrap();
        // stale delete dropped
        shard.write_entry(&delete_entry(b"a", 150)).unwrap();
        assert!(shard.get(b"a").is_some());

        // newer delete lands
        shard.write_entry(&delete_entry(b"a", 250)).unwrap();
        assert!(shard.get(b"a").is_none());
        shard.shutdown_node();
    }

    #[test]
    fn expired_rows_never_block_live_writes() {
        let dir = tempfile::tempdir().unwrap();
        let shard = test_shard(dir.path());

        let base = now_ns();
        // ttl of 1s, written 10s in the past: already expired
        shard
            .write_entry(&put_entry(b"a", b"1", base.saturating_sub(10_000_000_000), 1))
            .unwrap();
        assert!(shard.get(b"a").is_none());

        // a non-expired write with an *older-looking* timestamp still
        // supersedes the expired row
        let older = base.saturating_sub(15_000_000_000);
        shard.write_entry(&put_entry(b"a", b"2", older, 0)).unwrap();
        assert_eq!(&shard.get(b"a").unwrap().value[..], b"2");
        shard.shutdown_node();
    }

    #[test]
    fn merges_apply_unconditionally() {
        let dir = tempfile::tempdir().unwrap();
        let shard = test_shard(dir.path());

        shard.write_entry(&put_entry(b"m", b"abc", 100, 0)).unwrap();
        // merge older than the base row still applies
        shard.write_entry(&merge_entry(b"m", b"def", 50)).unwrap();

        let row = shard.get(b"m").unwrap();
        assert_eq!(&row.value[..], b"abcdef");
        // and keeps the max timestamp so a later put at 100 loses
        assert_eq!(row.updated_at_ns, 100);
        shard.shutdown_node();
    }

    #[test]
    fn reopen_replays_binlog_tail() {
        let dir = tempfile::tempdir().unwrap();
        {
            let shard = test_shard(dir.path());
            shard.write_entry(&put_entry(b"a", b"1", 100, 0)).unwrap();
            // persist the snapshot at this point
            shard.db.flush().unwrap();
            // these live only in the binlog
            shard.write_entry(&put_entry(b"b", b"2", 200, 0)).unwrap();
            shard.write_entry(&delete_entry(b"a", 300)).unwrap();
            if let Some(binlog) = &shard.binlog {
                binlog.shutdown();
            }
            // drop without a clean shutdown: snapshot is stale
        }

        let shard = test_shard(dir.path());
        assert!(shard.get(b"a").is_none());
        assert_eq!(&shard.get(b"b").unwrap().value[..], b"2");
        shard.shutdown_node();
    }

    #[test]
    fn progress_is_monotone_and_persistent() {
        let dir = tempfile::tempdir().unwrap();
        let shard = test_shard(dir.path());

        shard.insert_progress("peer:1", 2, (1, 100));
        shard.update_progress_if_present("peer:1", 2, (1, 50));
        assert_eq!(shard.progress("peer:1", 2), Some((1, 100)));

        shard.update_progress_if_present("peer:1", 2, (2, 10));
        assert_eq!(shard.progress("peer:1", 2), Some((2, 10)));

        // absent entries are not created by updates
        shard.update_progress_if_present("peer:2", 0, (5, 5));
        assert_eq!(shard.progress("peer:2", 0), None);

        shard.flush_progress().unwrap();
        shard.shutdown_node();

        let reopened = test_shard(dir.path());
        assert_eq!(reopened.progress("peer:1", 2), Some((2, 10)));
        reopened.shutdown_node();
    }

    #[test]
    fn scan_skips_expired_rows() {
        let dir = tempfile::tempdir().unwrap();
        let shard = test_shard(dir.path());
        let now = now_ns();

        shard.write_entry(&put_entry(b"p:1", b"1", now, 0)).unwrap();
        shard
            .write_entry(&put_entry(b"p:2", b"2", now.saturating_sub(10_000_000_000), 1))
            .unwrap();
        shard.write_entry(&put_entry(b"p:3", b"3", now, 0)).unwrap();
        shard.write_entry(&put_entry(b"q:1", b"4", now, 0)).unwrap();

        let kvs = shard.prefix_scan(b"p:", None, 10);
        let keys: Vec<&[u8]> = kvs.iter().map(|kv| &kv.key[..]).collect();
        assert_eq!(keys, vec![&b"p:1"[..], b"p:3"]);

        let resumed = shard.prefix_scan(b"p:", Some(b"p:1"), 10);
        assert_eq!(resumed.len(), 1);
        assert_eq!(&resumed[0].key[..], b"p:3");
        shard.shutdown_node();
    }
}
