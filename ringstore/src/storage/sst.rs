//! Sorted-file writer and reader, used for bulk bootstrap.
//!
//! Record format: `u32` key length, key, `u32` value length, value.
//! Keys must arrive in strictly ascending order; the peer streams its
//! ordered store, so out-of-order keys mean a broken peer.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;

use super::Error;

/// Append-only sorted-file writer.
#[derive(Debug)]
pub struct SstWriter {
    path: PathBuf,
    file: BufWriter<File>,
    last_key: Option<Vec<u8>>,
    count: u64,
}

impl SstWriter {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = path.into();
        let file = BufWriter::new(File::create(&path)?);
        Ok(Self {
            path,
            file,
            last_key: None,
            count: 0,
        })
    }

    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        if let Some(last) = &self.last_key {
            if key <= last.as_slice() {
                return Err(Error::OutOfOrder);
            }
        }

        self.file.write_all(&(key.len() as u32).to_le_bytes())?;
        self.file.write_all(key)?;
        self.file.write_all(&(value.len() as u32).to_le_bytes())?;
        self.file.write_all(value)?;

        self.last_key = Some(key.to_vec());
        self.count += 1;
        Ok(())
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Flush and close, returning the path and entry count.
    pub fn finish(mut self) -> Result<(PathBuf, u64), Error> {
        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        Ok((self.path, self.count))
    }
}

/// Read a sorted file back, record by record.
pub fn for_each_entry(
    path: &Path,
    mut f: impl FnMut(Vec<u8>, Bytes),
) -> Result<u64, Error> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut count = 0;

    loop {
        let mut len = [0u8; 4];
        match reader.read_exact(&mut len) {
            Ok(()) => (),
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err.into()),
        }

        let mut key = vec![0u8; u32::from_le_bytes(len) as usize];
        reader.read_exact(&mut key)?;

        reader.read_exact(&mut len)?;
        let mut value = vec![0u8; u32::from_le_bytes(len) as usize];
        reader.read_exact(&mut value)?;

        f(key, Bytes::from(value));
        count += 1;
    }

    Ok(count)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("copy.sst");

        let mut writer = SstWriter::create(&path).unwrap();
        writer.add(b"a", b"1").unwrap();
        writer.add(b"b", b"").unwrap();
        writer.add(b"c", b"3").unwrap();
        let (path, count) = writer.finish().unwrap();
        assert_eq!(count, 3);

        let mut entries = vec![];
        let read = for_each_entry(&path, |key, value| entries.push((key, value))).unwrap();
        assert_eq!(read, 3);
        assert_eq!(entries[0], (b"a".to_vec(), Bytes::from_static(b"1")));
        assert_eq!(entries[1], (b"b".to_vec(), Bytes::new()));
        assert_eq!(entries[2], (b"c".to_vec(), Bytes::from_static(b"3")));
    }

    #[test]
    fn out_of_order_keys_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SstWriter::create(dir.path().join("bad.sst")).unwrap();
        writer.add(b"b", b"1").unwrap();
        assert!(matches!(writer.add(b"a", b"2"), Err(Error::OutOfOrder)));
        assert!(matches!(writer.add(b"b", b"2"), Err(Error::OutOfOrder)));
    }
}
