//! The ordered store backing each shard, and the row format it holds.

pub mod db;
pub mod row;
pub mod sst;

pub use db::Db;
pub use row::Row;
pub use sst::SstWriter;

use thiserror::Error;

/// Storage error. These are local-fatal: the affected shard shuts down,
/// the store keeps serving other shards.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt {0}")]
    Corrupt(&'static str),

    #[error("keys out of order in sorted file")]
    OutOfOrder,
}

/// Merge operator, configured per keyspace and selected per entry by
/// its op-and-data-type code. Operators must be associative: partial
/// merges of operand runs happen during replication catch-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeOp {
    /// Concatenate operand bytes.
    #[default]
    BytesConcat,
    /// Append a length-prefixed element to a list value.
    ListAppend,
    /// Deployment-defined operator id. Unknown ids degrade to byte
    /// concatenation.
    Custom(u32),
}

impl MergeOp {
    pub fn from_op_code(code: u8) -> Self {
        match code {
            0 => MergeOp::BytesConcat,
            1 => MergeOp::ListAppend,
            code => MergeOp::Custom(code as u32),
        }
    }

    /// Merge an incoming operand row into the existing row, if any.
    /// Applied unconditionally: merge entries are not subject to
    /// last-writer-wins, but the merged row keeps the max timestamp so
    /// later puts and deletes order correctly against it.
    pub fn merge(&self, existing: Option<&Row>, incoming: &Row) -> Row {
        let mut value = Vec::new();

        if let Some(existing) = existing {
            value.extend_from_slice(&existing.value);
        }

        match self {
            MergeOp::ListAppend => {
                value.extend_from_slice(&(incoming.value.len() as u32).to_le_bytes());
                value.extend_from_slice(&incoming.value);
            }
            MergeOp::BytesConcat | MergeOp::Custom(_) => {
                value.extend_from_slice(&incoming.value);
            }
        }

        Row {
            partition_hash: incoming.partition_hash,
            updated_at_ns: incoming
                .updated_at_ns
                .max(existing.map(|r| r.updated_at_ns).unwrap_or(0)),
            ttl_second: 0,
            op_and_data_type: incoming.op_and_data_type,
            value: value.into(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::Bytes;

    fn row(value: &'static [u8], ts: u64) -> Row {
        Row {
            partition_hash: 1,
            updated_at_ns: ts,
            ttl_second: 0,
            op_and_data_type: 0,
            value: Bytes::from_static(value),
        }
    }

    #[test]
    fn concat_merges_operands_in_order() {
        let op = MergeOp::BytesConcat;
        let first = op.merge(None, &row(b"123", 10));
        assert_eq!(&first.value[..], b"123");

        let second = op.merge(Some(&first), &row(b"456", 5));
        assert_eq!(&second.value[..], b"123456");
        // max timestamp wins, even when the merge entry is older
        assert_eq!(second.updated_at_ns, 10);
    }

    #[test]
    fn list_append_frames_elements() {
        let op = MergeOp::ListAppend;
        let first = op.merge(None, &row(b"ab", 1));
        let second = op.merge(Some(&first), &row(b"c", 2));

        let mut expected = Vec::new();
        expected.extend_from_slice(&2u32.to_le_bytes());
        expected.extend_from_slice(b"ab");
        expected.extend_from_slice(&1u32.to_le_bytes());
        expected.extend_from_slice(b"c");
        assert_eq!(&second.value[..], &expected[..]);
    }

    #[test]
    fn op_code_selection() {
        assert_eq!(MergeOp::from_op_code(0), MergeOp::BytesConcat);
        assert_eq!(MergeOp::from_op_code(1), MergeOp::ListAppend);
        assert_eq!(MergeOp::from_op_code(7), MergeOp::Custom(7));
    }
}
