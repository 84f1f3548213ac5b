//! Per-shard binlog: an append-only log of mutations in fixed-size
//! segments, rotated ring-style. A position is `(segment, offset)` and
//! only ever advances. Tail readers long-poll on the append notifier.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Binlog error.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("segment {segment} purged, earliest is {earliest}")]
    SegmentPurged { segment: u32, earliest: u32 },

    #[error("corrupt binlog record")]
    Corrupt,

    #[error("binlog record too large ({0} bytes)")]
    Oversized(usize),
}

impl Error {
    /// The caller's cursor points at history this log no longer holds;
    /// recovery is a full bootstrap copy.
    pub fn stale_cursor(&self) -> bool {
        matches!(self, Error::SegmentPurged { .. })
    }
}

const MAX_RECORD_SIZE: usize = 32 * 1024 * 1024;

#[derive(Debug)]
struct LogInner {
    earliest: u32,
    current: u32,
    /// End offset of the current segment.
    offset: u64,
    writer: File,
}

/// Append-only segmented log.
#[derive(Debug)]
pub struct LogManager {
    dir: PathBuf,
    segment_size: u64,
    segment_count: u32,
    inner: Mutex<LogInner>,
    notify: Notify,
}

impl LogManager {
    /// Open (or create) the binlog under `<shard_dir>/binlog`.
    pub fn open(shard_dir: &Path, file_size_mb: u32, file_count: u32) -> Result<Self, Error> {
        let dir = shard_dir.join("binlog");
        std::fs::create_dir_all(&dir)?;

        let mut earliest = u32::MAX;
        let mut current = 0u32;
        let mut found = false;
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(segment) = name
                .to_str()
                .and_then(|n| n.strip_suffix(".log"))
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };
            found = true;
            earliest = earliest.min(segment);
            current = current.max(segment);
        }
        if !found {
            earliest = 0;
            current = 0;
        }

        let path = segment_path(&dir, current);
        let offset = recovered_end_offset(&path)?;
        let writer = OpenOptions::new().create(true).append(true).open(&path)?;
        let actual_len = writer.metadata()?.len();
        if actual_len > offset {
            // torn record from a crash mid-append; drop it
            warn!(
                "{}: truncating segment {} from {} to {}",
                dir.display(),
                current,
                actual_len,
                offset
            );
            writer.set_len(offset)?;
        }

        debug!(
            "{}: segments {}..={}, tail at {}",
            dir.display(),
            earliest,
            current,
            offset
        );

        Ok(Self {
            dir,
            segment_size: file_size_mb as u64 * 1024 * 1024,
            segment_count: file_count.max(1),
            inner: Mutex::new(LogInner {
                earliest,
                current,
                offset,
                writer,
            }),
            notify: Notify::new(),
        })
    }

    /// Append one record, returning the position after it: the cursor a
    /// reader that has consumed this record would hold.
    pub fn append(&self, record: &[u8]) -> Result<(u32, u64), Error> {
        if record.len() > MAX_RECORD_SIZE {
            return Err(Error::Oversized(record.len()));
        }

        let framed_len = 4 + record.len() as u64;
        let mut inner = self.inner.lock();

        if inner.offset > 0 && inner.offset + framed_len > self.segment_size {
            self.rotate(&mut inner)?;
        }

        let mut framed = Vec::with_capacity(framed_len as usize);
        framed.extend_from_slice(&(record.len() as u32).to_le_bytes());
        framed.extend_from_slice(record);
        inner.writer.write_all(&framed)?;
        inner.offset += framed_len;

        let position = (inner.current, inner.offset);
        drop(inner);

        self.notify.notify_waiters();
        Ok(position)
    }

    fn rotate(&self, inner: &mut LogInner) -> Result<(), Error> {
        inner.writer.sync_data()?;
        inner.current += 1;
        inner.offset = 0;
        inner.writer = OpenOptions::new()
            .create(true)
            .append(true)
            .open(segment_path(&self.dir, inner.current))?;

        while inner.current - inner.earliest + 1 > self.segment_count {
            let purged = segment_path(&self.dir, inner.earliest);
            if let Err(err) = std::fs::remove_file(&purged) {
                warn!("purge {}: {}", purged.display(), err);
            }
            inner.earliest += 1;
        }
        debug!(
            "{}: rotated to segment {}, earliest {}",
            self.dir.display(),
            inner.current,
            inner.earliest
        );
        Ok(())
    }

    /// Read up to `limit` records starting at `(segment, offset)`.
    /// Returns the records and the next cursor; an empty result with an
    /// unchanged cursor means the caller is at the tail.
    pub fn read(
        &self,
        segment: u32,
        offset: u64,
        limit: usize,
    ) -> Result<(Vec<Bytes>, u32, u64), Error> {
        let (earliest, current, current_end) = {
            let inner = self.inner.lock();
            (inner.earliest, inner.current, inner.offset)
        };

        if segment < earliest {
            return Err(Error::SegmentPurged { segment, earliest });
        }

        let mut seg = segment;
        let mut off = offset;
        let mut records = Vec::new();

        while records.len() < limit && seg <= current {
            let seg_end = if seg < current {
                match std::fs::metadata(segment_path(&self.dir, seg)) {
                    Ok(meta) => meta.len(),
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                        // purged under us
                        return Err(Error::SegmentPurged {
                            segment: seg,
                            earliest: seg + 1,
                        });
                    }
                    Err(err) => return Err(err.into()),
                }
            } else {
                current_end
            };

            if off >= seg_end {
                if seg < current {
                    seg += 1;
                    off = 0;
                    continue;
                }
                break;
            }

            let mut file = File::open(segment_path(&self.dir, seg))?;
            file.seek(SeekFrom::Start(off))?;

            while off < seg_end && records.len() < limit {
                let mut len = [0u8; 4];
                file.read_exact(&mut len)?;
                let len = u32::from_le_bytes(len) as usize;
                if len > MAX_RECORD_SIZE || off + 4 + len as u64 > seg_end {
                    return Err(Error::Corrupt);
                }
                let mut record = vec![0u8; len];
                file.read_exact(&mut record)?;
                records.push(Bytes::from(record));
                off += 4 + len as u64;
            }
        }

        Ok((records, seg, off))
    }

    pub fn earliest(&self) -> u32 {
        self.inner.lock().earliest
    }

    pub fn latest(&self) -> u32 {
        self.inner.lock().current
    }

    /// Position after the last appended record.
    pub fn tail_position(&self) -> (u32, u64) {
        let inner = self.inner.lock();
        (inner.current, inner.offset)
    }

    /// Future that resolves on the next append. Callers must `enable`
    /// it before re-checking the tail, so an append racing the check is
    /// not missed.
    pub fn appended(&self) -> Notified<'_> {
        self.notify.notified()
    }

    pub fn shutdown(&self) {
        let inner = self.inner.lock();
        if let Err(err) = inner.writer.sync_data() {
            warn!("{}: binlog sync on shutdown: {}", self.dir.display(), err);
        }
    }
}

fn segment_path(dir: &Path, segment: u32) -> PathBuf {
    dir.join(format!("{}.log", segment))
}

/// Walk the segment from the start and return the offset after the last
/// complete record.
fn recovered_end_offset(path: &Path) -> Result<u64, Error> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err.into()),
    };
    let len = file.metadata()?.len();

    let mut offset = 0u64;
    loop {
        if offset + 4 > len {
            break;
        }
        let mut header = [0u8; 4];
        file.read_exact(&mut header)?;
        let record_len = u32::from_le_bytes(header) as u64;
        if record_len as usize > MAX_RECORD_SIZE || offset + 4 + record_len > len {
            break;
        }
        file.seek(SeekFrom::Current(record_len as i64))?;
        offset += 4 + record_len;
    }

    Ok(offset)
}

#[cfg(test)]
mod test {
    use super::*;

    fn open_log(dir: &Path, size_mb: u32, count: u32) -> LogManager {
        LogManager::open(dir, size_mb, count).unwrap()
    }

    #[test]
    fn append_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let lm = open_log(dir.path(), 1, 3);

        let p1 = lm.append(b"one").unwrap();
        let p2 = lm.append(b"two").unwrap();
        assert!(p2 > p1);

        let (records, seg, off) = lm.read(0, 0, 10).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(&records[0][..], b"one");
        assert_eq!(&records[1][..], b"two");
        assert_eq!((seg, off), p2);

        // at the tail: empty, cursor unchanged
        let (records, seg2, off2) = lm.read(seg, off, 10).unwrap();
        assert!(records.is_empty());
        assert_eq!((seg2, off2), (seg, off));
    }

    #[test]
    fn limit_respected_and_resumable() {
        let dir = tempfile::tempdir().unwrap();
        let lm = open_log(dir.path(), 1, 3);
        for i in 0..10 {
            lm.append(format!("r{}", i).as_bytes()).unwrap();
        }

        let (first, seg, off) = lm.read(0, 0, 4).unwrap();
        assert_eq!(first.len(), 4);
        let (rest, ..) = lm.read(seg, off, 100).unwrap();
        assert_eq!(rest.len(), 6);
        assert_eq!(&rest[0][..], b"r4");
    }

    #[test]
    fn rotation_purges_old_segments() {
        let dir = tempfile::tempdir().unwrap();
        let lm = open_log(dir.path(), 1, 2);

        // each record is ~512KB framed; 2 fit per 1MB segment
        let big = vec![7u8; 512 * 1024 - 100];
        for _ in 0..6 {
            lm.append(&big).unwrap();
        }

        assert_eq!(lm.latest(), 2);
        assert_eq!(lm.earliest(), 1);

        // the purged segment is a stale cursor
        let err = lm.read(0, 0, 1).unwrap_err();
        assert!(err.stale_cursor());

        // reading from the earliest still works, and crosses segments
        let (records, seg, _) = lm.read(1, 0, 100).unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(seg, 2);
    }

    #[test]
    fn reopen_recovers_cursor_and_truncates_torn_record() {
        let dir = tempfile::tempdir().unwrap();
        let tail;
        {
            let lm = open_log(dir.path(), 1, 3);
            lm.append(b"alpha").unwrap();
            tail = lm.append(b"beta").unwrap();
            lm.shutdown();
        }

        // simulate a crash mid-append: a length prefix with no payload
        let path = dir.path().join("binlog").join("0.log");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&100u32.to_le_bytes()).unwrap();
        file.write_all(b"partial").unwrap();
        drop(file);

        let lm = open_log(dir.path(), 1, 3);
        assert_eq!(lm.tail_position(), tail);

        let (records, ..) = lm.read(0, 0, 10).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(&records[1][..], b"beta");

        // appends continue from the recovered position
        let p = lm.append(b"gamma").unwrap();
        assert!(p > tail);
        let (records, ..) = lm.read(0, 0, 10).unwrap();
        assert_eq!(records.len(), 3);
    }

    #[tokio::test]
    async fn appended_wakes_tail_readers() {
        let dir = tempfile::tempdir().unwrap();
        let lm = std::sync::Arc::new(open_log(dir.path(), 1, 3));

        let waiter = {
            let lm = lm.clone();
            tokio::spawn(async move {
                let notified = lm.appended();
                tokio::pin!(notified);
                notified.as_mut().enable();
                let (records, ..) = lm.read(0, 0, 10).unwrap();
                if records.is_empty() {
                    notified.await;
                }
                let (records, ..) = lm.read(0, 0, 10).unwrap();
                records.len()
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        lm.append(b"wake").unwrap();
        assert_eq!(waiter.await.unwrap(), 1);
    }
}
