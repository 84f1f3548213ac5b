//! On-disk row format.
//!
//! Fixed little-endian header, then the value bytes. The partition hash
//! is stored because clients may override it per request; the
//! compaction filter must use what the writer supplied, not a re-hash
//! of the key.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::Error;

const HEADER_LEN: usize = 8 + 8 + 4 + 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub partition_hash: u64,
    pub updated_at_ns: u64,
    pub ttl_second: u32,
    pub op_and_data_type: u8,
    pub value: Bytes,
}

impl Row {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.value.len());
        buf.put_u64_le(self.partition_hash);
        buf.put_u64_le(self.updated_at_ns);
        buf.put_u32_le(self.ttl_second);
        buf.put_u8(self.op_and_data_type);
        buf.put_slice(&self.value);
        buf.freeze()
    }

    pub fn from_bytes(mut bytes: Bytes) -> Result<Self, Error> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::Corrupt("row header"));
        }
        Ok(Self {
            partition_hash: bytes.get_u64_le(),
            updated_at_ns: bytes.get_u64_le(),
            ttl_second: bytes.get_u32_le(),
            op_and_data_type: bytes.get_u8(),
            value: bytes,
        })
    }

    /// A row with a TTL is expired once its age exceeds the TTL.
    pub fn is_expired(&self, now_ns: u64) -> bool {
        self.ttl_second > 0
            && now_ns.saturating_sub(self.updated_at_ns) > self.ttl_second as u64 * 1_000_000_000
    }
}
