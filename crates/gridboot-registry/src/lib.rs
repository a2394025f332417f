//! Gridboot Registry - what a node knows about the grid
//!
//! This crate holds the shared state that grid bootstrap discovery reads and
//! mutates from two sides at once (the socket reactor and the orchestrator):
//!
//! - [`AddressAndPort`]: a peer's IPv4 address and replication port
//! - [`Identifier`] / [`IdentifierBitset`]: the 128 small integer identifiers
//!   and which of them are believed claimed somewhere in the grid
//! - [`KnownNodes`]: known peers plus the claimed-identifier bitset
//! - [`ProposedNode`] / [`ExpiringProposalMap`]: identifiers that peers are
//!   currently trying to claim, forgotten after a period of silence
//!
//! # Merging
//!
//! All registry mutation is monotonic. Peers are only ever added and bits are
//! only ever set, so merges commute, repeat safely and may be applied out of
//! order. That is what lets the lossy, unordered broadcast transport feed the
//! registry directly.
//!
//! # Wire format
//!
//! Every type has a fixed big-endian binary encoding (see [`codec`]). Decoding
//! never panics on short input; it reports [`Error::Truncated`].

pub mod address;
pub mod codec;
pub mod error;
pub mod identifier;
pub mod known_nodes;
pub mod proposal;

use std::time::{SystemTime, UNIX_EPOCH};

pub use address::{AddressAndPort, ADDRESS_LEN};
pub use error::{Error, Result};
pub use identifier::{Identifier, IdentifierBitset, BITSET_BYTES, MAX_IDENTIFIERS};
pub use known_nodes::{KnownNodes, KnownNodesSnapshot};
pub use proposal::{ExpiringProposalMap, ProposedNode};

/// Current wall-clock time in unix milliseconds.
///
/// A clock set before the epoch reads as zero rather than failing; proposal
/// timestamps only need to be comparable on the same node.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
