use thiserror::Error;

/// Failures of the wire codec. A decode failure discards one datagram.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("unknown packet tag {0}")]
    UnknownTag(u8),

    #[error("truncated packet: tag {tag} needs {expected} payload bytes, got {actual}")]
    Truncated { tag: u8, expected: usize, actual: usize },

    #[error("string of {len} bytes does not fit a {capacity}-byte field")]
    StringTooLong { len: usize, capacity: usize },

    #[error("string contains an embedded NUL byte at {position}")]
    EmbeddedNul { position: usize },

    #[error("string field is not valid UTF-8 at byte {position}")]
    InvalidUtf8 { position: usize },

    #[error("payload of {len} bytes exceeds capacity of {capacity}")]
    PayloadTooLarge { len: usize, capacity: usize },
}
