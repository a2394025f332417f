//! Grid identifiers and the claimed-identifier bitset.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::codec::{ensure_remaining, read_u64};
use crate::error::{Error, Result};

/// Number of identifiers available in a grid.
pub const MAX_IDENTIFIERS: usize = 128;

/// Encoded size of an [`IdentifierBitset`].
pub const BITSET_BYTES: usize = MAX_IDENTIFIERS / 8;

const WORDS: usize = MAX_IDENTIFIERS / 64;

/// A node identifier in `0..128`.
///
/// On the wire identifiers travel as int8, where a negative value means
/// "no identifier yet".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Identifier(u8);

impl Identifier {
    /// Create an identifier, or `None` if `value >= 128`.
    pub const fn new(value: u8) -> Option<Self> {
        if (value as usize) < MAX_IDENTIFIERS {
            Some(Self(value))
        } else {
            None
        }
    }

    pub const fn get(self) -> u8 {
        self.0
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Wire form: the identifier, or -1 for none.
    pub fn to_wire(identifier: Option<Self>) -> i8 {
        identifier.map_or(-1, |id| id.0 as i8)
    }

    /// Parse the wire form; any negative value means none.
    pub fn from_wire(value: i8) -> Option<Self> {
        u8::try_from(value).ok().and_then(Self::new)
    }
}

impl TryFrom<u8> for Identifier {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Self::new(value).ok_or(Error::IdentifierOutOfRange(value as i16))
    }
}

impl From<Identifier> for u8 {
    fn from(id: Identifier) -> Self {
        id.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lock-free set of claimed identifiers.
///
/// Bit `i` set means identifier `i` is believed claimed by some node. Bits are
/// never cleared: identifiers are not released when a node leaves.
///
/// Wire encoding (16 bytes): two big-endian u64 words, word 0 holding
/// identifiers 0..64 with identifier `i` at bit `i % 64`.
#[derive(Default)]
pub struct IdentifierBitset {
    words: [AtomicU64; WORDS],
}

impl IdentifierBitset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a bitset from raw words (word 0 holds identifiers 0..64).
    pub fn from_words(words: [u64; WORDS]) -> Self {
        Self {
            words: words.map(AtomicU64::new),
        }
    }

    pub fn words(&self) -> [u64; WORDS] {
        [
            self.words[0].load(Ordering::Acquire),
            self.words[1].load(Ordering::Acquire),
        ]
    }

    const fn locate(id: Identifier) -> (usize, u64) {
        (id.index() / 64, 1u64 << (id.index() % 64))
    }

    pub fn contains(&self, id: Identifier) -> bool {
        let (word, mask) = Self::locate(id);
        self.words[word].load(Ordering::Acquire) & mask != 0
    }

    /// Mark an identifier claimed.
    pub fn set(&self, id: Identifier) {
        let (word, mask) = Self::locate(id);
        self.words[word].fetch_or(mask, Ordering::AcqRel);
    }

    /// Atomically set the bit if it was clear.
    ///
    /// Returns `true` only for the caller that flipped the bit, so two local
    /// callers can never both claim the same identifier.
    pub fn set_if_clear(&self, id: Identifier) -> bool {
        let (word, mask) = Self::locate(id);
        self.words[word].fetch_or(mask, Ordering::AcqRel) & mask == 0
    }

    /// Set a bit by raw index, ignoring indices outside `0..128`.
    pub fn set_index(&self, index: usize) {
        if let Some(id) = u8::try_from(index).ok().and_then(Identifier::new) {
            self.set(id);
        }
    }

    /// OR another bitset into this one.
    pub fn union_with(&self, other: &IdentifierBitset) {
        self.union_words(other.words());
    }

    /// OR raw words into this bitset.
    pub fn union_words(&self, words: [u64; WORDS]) {
        for (slot, bits) in self.words.iter().zip(words) {
            if bits != 0 {
                slot.fetch_or(bits, Ordering::AcqRel);
            }
        }
    }

    /// Claimed identifiers in ascending order.
    pub fn iter_set(&self) -> impl Iterator<Item = Identifier> {
        let words = self.words();
        (0..MAX_IDENTIFIERS as u8)
            .filter_map(Identifier::new)
            .filter(move |id| words[id.index() / 64] & (1u64 << (id.index() % 64)) != 0)
    }

    pub fn count(&self) -> usize {
        self.words().iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_full(&self) -> bool {
        self.count() == MAX_IDENTIFIERS
    }

    /// Render as 128 `0`/`1` characters, identifier 0 first.
    pub fn to_bit_string(&self) -> String {
        let words = self.words();
        (0..MAX_IDENTIFIERS)
            .map(|i| if words[i / 64] & (1u64 << (i % 64)) != 0 { '1' } else { '0' })
            .collect()
    }

    pub fn encode(&self, out: &mut impl BufMut) {
        for word in self.words() {
            out.put_u64(word);
        }
    }

    /// Read an encoded bitset image as raw words.
    pub fn decode_words(input: &mut impl Buf) -> Result<[u64; WORDS]> {
        ensure_remaining(&*input, BITSET_BYTES)?;
        Ok([read_u64(input)?, read_u64(input)?])
    }

    pub fn decode(input: &mut impl Buf) -> Result<Self> {
        Self::decode_words(input).map(Self::from_words)
    }
}

impl Clone for IdentifierBitset {
    fn clone(&self) -> Self {
        Self::from_words(self.words())
    }
}

impl PartialEq for IdentifierBitset {
    fn eq(&self, other: &Self) -> bool {
        self.words() == other.words()
    }
}

impl Eq for IdentifierBitset {}

impl fmt::Debug for IdentifierBitset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("IdentifierBitset")
            .field(&self.to_bit_string())
            .finish()
    }
}
