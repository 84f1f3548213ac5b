//! Log entry: one replicated mutation.
//!
//! This is both the `TailBinlog` stream element and the binlog record
//! payload, so a tailing peer replays exactly what was appended.

use super::prelude::*;

const OP_PUT: u8 = 1;
const OP_DELETE: u8 = 2;
const OP_MERGE: u8 = 3;

/// One mutation, stamped with the writer's clock.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub updated_at_ns: u64,
    pub op: EntryOp,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntryOp {
    Put {
        key: Bytes,
        partition_hash: u64,
        value: Bytes,
        ttl_second: u32,
        op_and_data_type: u8,
    },
    Delete {
        key: Bytes,
        partition_hash: u64,
    },
    Merge {
        key: Bytes,
        partition_hash: u64,
        value: Bytes,
        op_and_data_type: u8,
    },
}

impl LogEntry {
    pub fn key(&self) -> &Bytes {
        match &self.op {
            EntryOp::Put { key, .. } => key,
            EntryOp::Delete { key, .. } => key,
            EntryOp::Merge { key, .. } => key,
        }
    }

    pub fn partition_hash(&self) -> u64 {
        match &self.op {
            EntryOp::Put { partition_hash, .. } => *partition_hash,
            EntryOp::Delete { partition_hash, .. } => *partition_hash,
            EntryOp::Merge { partition_hash, .. } => *partition_hash,
        }
    }
}

impl ToBytes for LogEntry {
    fn to_bytes(&self) -> Result<Bytes, Error> {
        let mut payload = Payload::named(self.code());
        payload.put_u64(self.updated_at_ns);

        match &self.op {
            EntryOp::Put {
                key,
                partition_hash,
                value,
                ttl_second,
                op_and_data_type,
            } => {
                payload.put_u8(OP_PUT);
                payload.put_bytes(key);
                payload.put_u64(*partition_hash);
                payload.put_bytes(value);
                payload.put_u32(*ttl_second);
                payload.put_u8(*op_and_data_type);
            }
            EntryOp::Delete {
                key,
                partition_hash,
            } => {
                payload.put_u8(OP_DELETE);
                payload.put_bytes(key);
                payload.put_u64(*partition_hash);
            }
            EntryOp::Merge {
                key,
                partition_hash,
                value,
                op_and_data_type,
            } => {
                payload.put_u8(OP_MERGE);
                payload.put_bytes(key);
                payload.put_u64(*partition_hash);
                payload.put_bytes(value);
                payload.put_u8(*op_and_data_type);
            }
        }

        Ok(payload.freeze())
    }
}

impl FromBytes for LogEntry {
    fn from_bytes(mut bytes: Bytes) -> Result<Self, Error> {
        code!(bytes, 'e');
        let updated_at_ns = get_u64(&mut bytes)?;

        let op = match get_u8(&mut bytes)? {
            OP_PUT => EntryOp::Put {
                key: get_bytes(&mut bytes)?,
                partition_hash: get_u64(&mut bytes)?,
                value: get_bytes(&mut bytes)?,
                ttl_second: get_u32(&mut bytes)?,
                op_and_data_type: get_u8(&mut bytes)?,
            },
            OP_DELETE => EntryOp::Delete {
                key: get_bytes(&mut bytes)?,
                partition_hash: get_u64(&mut bytes)?,
            },
            OP_MERGE => EntryOp::Merge {
                key: get_bytes(&mut bytes)?,
                partition_hash: get_u64(&mut bytes)?,
                value: get_bytes(&mut bytes)?,
                op_and_data_type: get_u8(&mut bytes)?,
            },
            tag => return Err(Error::UnknownTag("entry op", tag)),
        };

        Ok(Self { updated_at_ns, op })
    }
}

impl Protocol for LogEntry {
    fn code(&self) -> char {
        'e'
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn put_roundtrip() {
        let entry = LogEntry {
            updated_at_ns: 123_456_789,
            op: EntryOp::Put {
                key: Bytes::from_static(b"k"),
                partition_hash: 42,
                value: Bytes::from_static(b"v"),
                ttl_second: 60,
                op_and_data_type: 0,
            },
        };

        let decoded = LogEntry::from_bytes(entry.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, entry);
        assert_eq!(decoded.key(), &Bytes::from_static(b"k"));
        assert_eq!(decoded.partition_hash(), 42);
    }

    #[test]
    fn delete_and_merge_roundtrip() {
        let delete = LogEntry {
            updated_at_ns: 1,
            op: EntryOp::Delete {
                key: Bytes::from_static(b""),
                partition_hash: 7,
            },
        };
        assert_eq!(
            LogEntry::from_bytes(delete.to_bytes().unwrap()).unwrap(),
            delete
        );

        let merge = LogEntry {
            updated_at_ns: 2,
            op: EntryOp::Merge {
                key: Bytes::from_static(b"list"),
                partition_hash: 8,
                value: Bytes::from_static(b"tail"),
                op_and_data_type: 1,
            },
        };
        assert_eq!(
            LogEntry::from_bytes(merge.to_bytes().unwrap()).unwrap(),
            merge
        );
    }

    #[test]
    fn unknown_op_rejected() {
        let mut payload = Payload::named('e');
        payload.put_u64(0);
        payload.put_u8(9);
        assert!(matches!(
            LogEntry::from_bytes(payload.freeze()),
            Err(Error::UnknownTag("entry op", 9))
        ));
    }
}
