//! Embedded ordered store.
//!
//! An ordered map with a length-prefixed snapshot on disk. The binlog
//! is the write-ahead log: the snapshot header records the binlog
//! position it covers, and the shard replays the tail from there on
//! open. Bulk ingestion goes "behind" existing data: a key already
//! present keeps its newer value.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::util::now_ns;

use super::{sst, Error, MergeOp, Row};

const SNAPSHOT_FILE: &str = "data.db";
const SNAPSHOT_MAGIC: &[u8; 4] = b"RSDB";
const SNAPSHOT_VERSION: u8 = 1;

/// Keys that no longer hash to this shard are dropped at flush time.
#[derive(Debug, Clone, Copy)]
struct ShardFilter {
    shard_id: u32,
    cluster_size: u32,
}

#[derive(Debug, Default)]
struct DbInner {
    mem: BTreeMap<Vec<u8>, Bytes>,
    /// Binlog position covered by the in-memory state.
    applied: (u32, u64),
    dirty: bool,
}

/// One shard's ordered store.
#[derive(Debug)]
pub struct Db {
    dir: PathBuf,
    merge_op: MergeOp,
    inner: RwLock<DbInner>,
    filter: Mutex<Option<ShardFilter>>,
}

impl Db {
    /// Open the store in `dir`, loading the snapshot if one exists.
    pub fn open(dir: impl Into<PathBuf>, merge_op: MergeOp) -> Result<Self, Error> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let db = Self {
            dir,
            merge_op,
            inner: RwLock::new(DbInner::default()),
            filter: Mutex::new(None),
        };
        db.load_snapshot()?;
        Ok(db)
    }

    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.inner.read().mem.get(key).cloned()
    }

    pub fn put(&self, key: &[u8], value: Bytes) {
        let mut inner = self.inner.write();
        inner.mem.insert(key.to_vec(), value);
        inner.dirty = true;
    }

    pub fn delete(&self, key: &[u8]) {
        let mut inner = self.inner.write();
        if inner.mem.remove(key).is_some() {
            inner.dirty = true;
        }
    }

    /// Apply the merge operator under the write lock, so concurrent
    /// merges to the same key serialize.
    pub fn merge(&self, key: &[u8], incoming: &Row) {
        let op = match MergeOp::from_op_code(incoming.op_and_data_type) {
            MergeOp::BytesConcat => self.merge_op,
            selected => selected,
        };

        let mut inner = self.inner.write();
        let existing = inner
            .mem
            .get(key)
            .cloned()
            .and_then(|bytes| Row::from_bytes(bytes).ok());
        let merged = op.merge(existing.as_ref(), incoming);
        inner.mem.insert(key.to_vec(), merged.to_bytes());
        inner.dirty = true;
    }

    pub fn applied(&self) -> (u32, u64) {
        self.inner.read().applied
    }

    pub fn set_applied(&self, position: (u32, u64)) {
        let mut inner = self.inner.write();
        if position > inner.applied {
            inner.applied = position;
            inner.dirty = true;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().mem.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().mem.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.read().dirty
    }

    /// Scan keys strictly after `start_after`, up to `batch` entries.
    /// Restartable: callers resume with the last key they saw.
    pub fn scan_from(&self, start_after: Option<&[u8]>, batch: usize) -> Vec<(Vec<u8>, Bytes)> {
        let inner = self.inner.read();
        let range = match start_after {
            Some(key) => inner
                .mem
                .range::<[u8], _>((Bound::Excluded(key), Bound::Unbounded)),
            None => inner.mem.range::<[u8], _>(..),
        };
        range
            .take(batch)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Visit every row in key order, `batch` rows at a time. Each batch
    /// releases the lock, so writers are never starved by a long scan.
    pub fn full_scan<E>(
        &self,
        batch: usize,
        mut f: impl FnMut(&[(Vec<u8>, Bytes)]) -> Result<(), E>,
    ) -> Result<(), E> {
        let mut last_key: Option<Vec<u8>> = None;
        loop {
            let rows = self.scan_from(last_key.as_deref(), batch.max(1));
            let Some((key, _)) = rows.last() else {
                return Ok(());
            };
            last_key = Some(key.clone());
            f(&rows)?;
        }
    }

    /// Visit keys under `prefix` in order, resuming after
    /// `last_seen_key` when given. The callback returns false to stop;
    /// a `limit` of 0 means unlimited.
    pub fn prefix_scan(
        &self,
        prefix: &[u8],
        last_seen_key: Option<&[u8]>,
        limit: usize,
        mut f: impl FnMut(&[u8], &Bytes) -> bool,
    ) {
        let inner = self.inner.read();
        let lower: Bound<&[u8]> = match last_seen_key {
            Some(key) if key >= prefix => Bound::Excluded(key),
            _ => Bound::Included(prefix),
        };

        let mut seen = 0usize;
        for (key, value) in inner.mem.range::<[u8], _>((lower, Bound::Unbounded)) {
            if !key.starts_with(prefix) {
                break;
            }
            if !f(key, value) {
                break;
            }
            seen += 1;
            if limit > 0 && seen >= limit {
                break;
            }
        }
    }

    /// Ingest a sorted file behind the current state: keys already
    /// present keep their value. Returns how many entries landed.
    pub fn ingest_sorted_file(&self, path: &Path) -> Result<u64, Error> {
        let mut inner = self.inner.write();
        let mut ingested = 0;

        sst::for_each_entry(path, |key, value| {
            inner.mem.entry(key).or_insert_with(|| {
                ingested += 1;
                value
            });
        })?;

        if ingested > 0 {
            inner.dirty = true;
        }
        debug!("{}: ingested {} entries", self.dir.display(), ingested);
        Ok(ingested)
    }

    /// Install the partition filter applied at flush time.
    pub fn set_shard_filter(&self, shard_id: u32, cluster_size: u32) {
        *self.filter.lock() = Some(ShardFilter {
            shard_id,
            cluster_size,
        });
    }

    /// Compact and persist: drop rows that moved out or expired, then
    /// write the snapshot atomically. No-op when clean.
    pub fn flush(&self) -> Result<bool, Error> {
        let filter = *self.filter.lock();
        let mut inner = self.inner.write();
        if !inner.dirty {
            return Ok(false);
        }

        let now = now_ns();
        inner.mem.retain(|key, value| match Row::from_bytes(value.clone()) {
            Ok(row) => {
                if row.is_expired(now) {
                    return false;
                }
                match filter {
                    Some(f) if f.cluster_size > 0 => {
                        row.partition_hash % f.cluster_size as u64 == f.shard_id as u64
                    }
                    _ => true,
                }
            }
            Err(_) => {
                warn!("{}: undecodable row for {:?}", self.dir.display(), key);
                true
            }
        });

        let tmp = self.dir.join(format!("{}.tmp", SNAPSHOT_FILE));
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            writer.write_all(SNAPSHOT_MAGIC)?;
            writer.write_all(&[SNAPSHOT_VERSION])?;
            writer.write_all(&inner.applied.0.to_le_bytes())?;
            writer.write_all(&inner.applied.1.to_le_bytes())?;
            writer.write_all(&(inner.mem.len() as u64).to_le_bytes())?;
            for (key, value) in &inner.mem {
                writer.write_all(&(key.len() as u32).to_le_bytes())?;
                writer.write_all(key)?;
                writer.write_all(&(value.len() as u32).to_le_bytes())?;
                writer.write_all(value)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        std::fs::rename(&tmp, self.dir.join(SNAPSHOT_FILE))?;

        inner.dirty = false;
        Ok(true)
    }

    /// Flush and close.
    pub fn close(&self) -> Result<(), Error> {
        self.flush()?;
        Ok(())
    }

    fn load_snapshot(&self) -> Result<(), Error> {
        let path = self.dir.join(SNAPSHOT_FILE);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != SNAPSHOT_MAGIC {
            return Err(Error::Corrupt("snapshot magic"));
        }
        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != SNAPSHOT_VERSION {
            return Err(Error::Corrupt("snapshot version"));
        }

        let mut u32buf = [0u8; 4];
        let mut u64buf = [0u8; 8];
        reader.read_exact(&mut u32buf)?;
        let segment = u32::from_le_bytes(u32buf);
        reader.read_exact(&mut u64buf)?;
        let offset = u64::from_le_bytes(u64buf);
        reader.read_exact(&mut u64buf)?;
        let count = u64::from_le_bytes(u64buf);

        let mut inner = self.inner.write();
        for _ in 0..count {
            reader.read_exact(&mut u32buf)?;
            let mut key = vec![0u8; u32::from_le_bytes(u32buf) as usize];
            reader.read_exact(&mut key)?;
            reader.read_exact(&mut u32buf)?;
            let mut value = vec![0u8; u32::from_le_bytes(u32buf) as usize];
            reader.read_exact(&mut value)?;
            inner.mem.insert(key, Bytes::from(value));
        }
        inner.applied = (segment, offset);
        inner.dirty = false;

        debug!(
            "{}: loaded {} rows, applied through {}:{}",
            self.dir.display(),
            count,
            segment,
            offset
        );
        Ok(())
    }
}
