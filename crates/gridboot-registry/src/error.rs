//! Error types for gridboot-registry.

use thiserror::Error;

/// Result type for registry operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while encoding or decoding registry state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The input ended before a complete value could be read.
    #[error("truncated input: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    /// An encoded address did not have the expected IPv4 length.
    #[error("malformed address: length {len}, expected 4")]
    MalformedAddress { len: i16 },

    /// An address length prefix was negative. The record's extent is
    /// unknown, so nothing after it can be read.
    #[error("invalid address length {0}")]
    InvalidLength(i16),

    /// A count prefix was negative.
    #[error("invalid entry count {0}")]
    InvalidCount(i16),

    /// Too many entries to describe with an int16 count prefix.
    #[error("too many entries to encode: {0}")]
    TooManyEntries(usize),

    /// An identifier outside `0..128`.
    #[error("identifier {0} out of range")]
    IdentifierOutOfRange(i16),
}
