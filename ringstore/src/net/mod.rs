//! Framed wire protocol: typed messages over TCP.
//!
//! Every frame is an `i32` little-endian length prefix followed by the
//! payload; the first payload byte is the message code.

pub mod messages;
pub mod stream;

pub use messages::{FromBytes, Message, Payload, Protocol, ToBytes};
pub use stream::{MessageReader, MessageWriter, Stream};

use thiserror::Error;

/// Largest frame we are willing to read.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Wire protocol error.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    Eof,

    #[error("unexpected message code '{0}', expected '{1}'")]
    UnexpectedCode(char, char),

    #[error("unexpected message '{0}'")]
    UnexpectedMessage(char),

    #[error("message truncated")]
    Truncated,

    #[error("oversized message ({0} bytes)")]
    Oversized(usize),

    #[error("invalid utf-8 in message")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("unknown {0} tag {1}")]
    UnknownTag(&'static str, u8),

    #[error("{0}")]
    Remote(String),
}

impl Error {
    /// Peer hung up.
    pub fn disconnect(&self) -> bool {
        match self {
            Error::Eof => true,
            Error::Io(err) => err.kind() == std::io::ErrorKind::UnexpectedEof,
            _ => false,
        }
    }
}
