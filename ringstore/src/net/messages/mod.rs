//! Message types and the byte codec they share.
//!
//! Payload layout: one message code byte, then fields. Integers are
//! little-endian; byte strings carry a `u32` length prefix.

pub mod cluster;
pub mod data;
pub mod entry;
pub mod master;
pub mod peer;

pub use data::{
    BatchRequest, BatchResponse, DeleteRequest, GetRequest, GetResponse, KeyValue, MergeRequest,
    PutRequest, Request, Response, ScanRequest, ScanResponse, WriteResponse, WRONG_SHARD,
};
pub use entry::{EntryOp, LogEntry};
pub use master::{
    ClientHeartbeat, ClusterFollow, ClusterUpdate, CreateClusterRequest, CreateClusterResponse,
    DeleteClusterRequest, DescRequest, DescResponse, ResizeClusterRequest, ShardStatus,
    StoreHeartbeat,
};
pub use peer::{
    BootstrapCopyBatch, BootstrapCopyRequest, CheckBinlogRequest, CheckBinlogResponse,
    CreateShardRequest, DeleteShardRequest, OkResponse, StreamEnd, TailBinlogBatch,
    TailBinlogRequest,
};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::Error;

/// Convert a message to its payload bytes (code byte included).
pub trait ToBytes {
    fn to_bytes(&self) -> Result<Bytes, Error>;
}

/// Parse a message from its payload bytes.
pub trait FromBytes: Sized {
    fn from_bytes(bytes: Bytes) -> Result<Self, Error>;
}

/// A wire message.
pub trait Protocol: ToBytes + FromBytes {
    fn code(&self) -> char;
}

/// Check the message code byte.
macro_rules! code {
    ($bytes:expr, $code:expr) => {
        let code = crate::net::messages::get_u8(&mut $bytes)? as char;
        if code != $code {
            return Err(crate::net::Error::UnexpectedCode(code, $code));
        }
    };
}

pub(crate) use code;

/// An unparsed message, as read off the wire.
#[derive(Debug, Clone)]
pub struct Message {
    payload: Bytes,
}

impl Message {
    pub fn new(payload: Bytes) -> Self {
        Self { payload }
    }

    /// Message code.
    pub fn code(&self) -> char {
        *self.payload.first().unwrap_or(&0) as char
    }

    /// Payload bytes, code byte included.
    pub fn payload(&self) -> Bytes {
        self.payload.clone()
    }

    /// Parse into a concrete message type.
    pub fn parse<T: FromBytes>(&self) -> Result<T, Error> {
        T::from_bytes(self.payload.clone())
    }
}

impl ToBytes for Message {
    fn to_bytes(&self) -> Result<Bytes, Error> {
        Ok(self.payload.clone())
    }
}

/// Payload builder.
#[derive(Debug)]
pub struct Payload {
    buf: BytesMut,
}

impl Payload {
    /// Start a payload with the given message code.
    pub fn named(code: char) -> Self {
        let mut buf = BytesMut::new();
        buf.put_u8(code as u8);
        Self { buf }
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn put_bool(&mut self, value: bool) {
        self.buf.put_u8(value as u8);
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.put_u32_le(value);
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.put_u64_le(value);
    }

    /// Length-prefixed byte string.
    pub fn put_bytes(&mut self, value: &[u8]) {
        self.buf.put_u32_le(value.len() as u32);
        self.buf.put_slice(value);
    }

    pub fn put_string(&mut self, value: &str) {
        self.put_bytes(value.as_bytes());
    }

    /// Optional byte string: presence flag, then the string.
    pub fn put_opt_bytes(&mut self, value: Option<&[u8]>) {
        match value {
            Some(value) => {
                self.put_bool(true);
                self.put_bytes(value);
            }
            None => self.put_bool(false),
        }
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

// Checked field readers. A short payload is a protocol error,
// never a panic.

pub fn get_u8(bytes: &mut Bytes) -> Result<u8, Error> {
    if bytes.remaining() < 1 {
        return Err(Error::Truncated);
    }
    Ok(bytes.get_u8())
}

pub fn get_bool(bytes: &mut Bytes) -> Result<bool, Error> {
    Ok(get_u8(bytes)? != 0)
}

pub fn get_u32(bytes: &mut Bytes) -> Result<u32, Error> {
    if bytes.remaining() < 4 {
        return Err(Error::Truncated);
    }
    Ok(bytes.get_u32_le())
}

pub fn get_u64(bytes: &mut Bytes) -> Result<u64, Error> {
    if bytes.remaining() < 8 {
        return Err(Error::Truncated);
    }
    Ok(bytes.get_u64_le())
}

pub fn get_bytes(bytes: &mut Bytes) -> Result<Bytes, Error> {
    let len = get_u32(bytes)? as usize;
    if bytes.remaining() < len {
        return Err(Error::Truncated);
    }
    Ok(bytes.split_to(len))
}

pub fn get_string(bytes: &mut Bytes) -> Result<String, Error> {
    Ok(String::from_utf8(get_bytes(bytes)?.to_vec())?)
}

pub fn get_opt_bytes(bytes: &mut Bytes) -> Result<Option<Bytes>, Error> {
    if get_bool(bytes)? {
        Ok(Some(get_bytes(bytes)?))
    } else {
        Ok(None)
    }
}

/// Shared imports for message definitions.
pub mod prelude {
    pub(crate) use super::code;
    pub use super::{
        get_bool, get_bytes, get_opt_bytes, get_string, get_u32, get_u64, get_u8, FromBytes,
        Payload, Protocol, ToBytes,
    };
    pub use crate::net::Error;
    pub use bytes::Bytes;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn payload_roundtrip() {
        let mut payload = Payload::named('x');
        payload.put_u32(42);
        payload.put_u64(1 << 40);
        payload.put_string("keyspace");
        payload.put_bytes(b"\x00\x01");
        payload.put_opt_bytes(None);
        payload.put_opt_bytes(Some(b"v"));

        let mut bytes = payload.freeze();
        assert_eq!(get_u8(&mut bytes).unwrap() as char, 'x');
        assert_eq!(get_u32(&mut bytes).unwrap(), 42);
        assert_eq!(get_u64(&mut bytes).unwrap(), 1 << 40);
        assert_eq!(get_string(&mut bytes).unwrap(), "keyspace");
        assert_eq!(&get_bytes(&mut bytes).unwrap()[..], b"\x00\x01");
        assert_eq!(get_opt_bytes(&mut bytes).unwrap(), None);
        assert_eq!(
            get_opt_bytes(&mut bytes).unwrap(),
            Some(Bytes::from_static(b"v"))
        );
        assert!(bytes.is_empty());
    }

    #[test]
    fn truncated_read_is_an_error() {
        let mut bytes = Bytes::from_static(b"\x05\x00\x00\x00ab");
        assert!(matches!(get_bytes(&mut bytes), Err(Error::Truncated)));
    }
}
