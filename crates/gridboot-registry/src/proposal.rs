//! Identifier proposals and the expiring proposal map.
//!
//! While a node is booting it repeatedly announces the identifier it would
//! like to own. Peers remember the latest announcement from each node for a
//! short while so that concurrently booting nodes can see each other's claims.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::address::AddressAndPort;
use crate::codec::{put_count, read_count, read_i64, read_i8, MAX_PREALLOC};
use crate::error::{Error, Result};
use crate::identifier::Identifier;
use crate::now_millis;

/// A peer's claim (or intent to claim) an identifier.
///
/// Wire encoding:
/// - peer: [`AddressAndPort`]
/// - proposed_at_millis: int64
/// - identifier: int8, -1 for none
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedNode {
    peer: AddressAndPort,
    identifier: Option<Identifier>,
    proposed_at_millis: u64,
}

impl ProposedNode {
    /// Encoded size in bytes.
    pub const ENCODED_LEN: usize = AddressAndPort::ENCODED_LEN + 8 + 1;

    /// A proposal stamped with the current time.
    pub fn new(peer: AddressAndPort, identifier: Option<Identifier>) -> Self {
        Self::with_timestamp(peer, identifier, now_millis())
    }

    pub const fn with_timestamp(
        peer: AddressAndPort,
        identifier: Option<Identifier>,
        proposed_at_millis: u64,
    ) -> Self {
        Self {
            peer,
            identifier,
            proposed_at_millis,
        }
    }

    pub const fn peer(&self) -> AddressAndPort {
        self.peer
    }

    pub const fn identifier(&self) -> Option<Identifier> {
        self.identifier
    }

    pub const fn proposed_at_millis(&self) -> u64 {
        self.proposed_at_millis
    }

    pub fn encode(&self, out: &mut impl BufMut) {
        self.peer.encode(out);
        out.put_i64(self.proposed_at_millis as i64);
        out.put_i8(Identifier::to_wire(self.identifier));
    }

    pub fn decode(input: &mut impl Buf) -> Result<Self> {
        let peer = AddressAndPort::decode(input)?;
        let proposed_at_millis = read_i64(input)? as u64;
        let identifier = Identifier::from_wire(read_i8(input)?);
        Ok(Self::with_timestamp(peer, identifier, proposed_at_millis))
    }
}

/// Expiry bookkeeping for one `put`.
#[derive(Debug)]
struct QueuedProposal {
    peer: AddressAndPort,
    value: Arc<ProposedNode>,
    inserted_at_millis: u64,
}

/// Latest proposal per peer, with time-based eviction.
///
/// Every `put` also appends to an insertion queue that only drives expiry.
/// [`expire_entries`](Self::expire_entries) removes a peer's entry only if the
/// queued value is still the one mapped (pointer identity), so a stale queue
/// record can never evict a newer `put` for the same peer.
///
/// Wire encoding:
/// - count: int16
/// - count × ([`AddressAndPort`] key, [`ProposedNode`] value)
#[derive(Debug, Default)]
pub struct ExpiringProposalMap {
    entries: Mutex<HashMap<AddressAndPort, Arc<ProposedNode>>>,
    queue: Mutex<VecDeque<QueuedProposal>>,
}

impl ExpiringProposalMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert a peer's proposal, queued for expiry at the current time.
    pub fn put(&self, peer: AddressAndPort, proposal: ProposedNode) {
        self.put_at(peer, proposal, now_millis());
    }

    /// Upsert a peer's proposal, queued for expiry as if inserted at
    /// `inserted_at_millis`.
    pub fn put_at(&self, peer: AddressAndPort, proposal: ProposedNode, inserted_at_millis: u64) {
        let value = Arc::new(proposal);
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer, Arc::clone(&value));
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(QueuedProposal {
                peer,
                value,
                inserted_at_millis,
            });
    }

    /// Insert a relayed proposal unless we already hold one at least as new.
    ///
    /// Returns `true` if the proposal was stored.
    pub fn merge_newer(&self, peer: AddressAndPort, proposal: ProposedNode) -> bool {
        let value = Arc::new(proposal);
        {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = entries.get(&peer) {
                if existing.proposed_at_millis >= value.proposed_at_millis {
                    return false;
                }
            }
            entries.insert(peer, Arc::clone(&value));
        }
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(QueuedProposal {
                peer,
                value,
                inserted_at_millis: now_millis(),
            });
        true
    }

    pub fn get(&self, peer: &AddressAndPort) -> Option<ProposedNode> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer)
            .map(|v| ProposedNode::clone(v))
    }

    /// Snapshot of the current proposals.
    pub fn values(&self) -> Vec<ProposedNode> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|v| ProposedNode::clone(v))
            .collect()
    }

    /// Snapshot keyed and ordered by peer.
    pub fn snapshot(&self) -> BTreeMap<AddressAndPort, ProposedNode> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (*k, ProposedNode::clone(v)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain the expiry queue, evicting entries queued before `cutoff_millis`.
    ///
    /// The whole queue is drained on every call; records that have not yet
    /// expired are dropped without touching the map. Returns the number of
    /// entries removed.
    pub fn expire_entries(&self, cutoff_millis: u64) -> usize {
        let drained: Vec<QueuedProposal> = self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let mut removed = 0;
        for record in drained {
            if record.inserted_at_millis >= cutoff_millis {
                continue;
            }
            let unchanged = entries
                .get(&record.peer)
                .is_some_and(|current| Arc::ptr_eq(current, &record.value));
            if unchanged {
                entries.remove(&record.peer);
                removed += 1;
            }
        }
        removed
    }

    pub fn encode(&self, out: &mut impl BufMut) -> Result<()> {
        let snapshot = self.snapshot();
        put_count(out, snapshot.len())?;
        for (peer, proposal) in &snapshot {
            peer.encode(out);
            proposal.encode(out);
        }
        Ok(())
    }

    /// Decode an encoded map into a fresh map.
    pub fn decode(input: &mut impl Buf) -> Result<Self> {
        let map = Self::new();
        for (peer, proposal) in Self::decode_entries(input)? {
            map.put(peer, proposal);
        }
        Ok(map)
    }

    /// Decode the `(peer, proposal)` records of an encoded map.
    ///
    /// Best effort: a record with a malformed address is logged and skipped,
    /// and input that ends early yields the records read so far. Only an
    /// unreadable count fails.
    pub fn decode_entries(input: &mut impl Buf) -> Result<Vec<(AddressAndPort, ProposedNode)>> {
        let count = read_count(input)?;
        let mut records = Vec::with_capacity(count.min(MAX_PREALLOC));
        for index in 0..count {
            match Self::decode_entry(input) {
                Ok(record) => records.push(record),
                Err(e @ Error::MalformedAddress { .. }) => {
                    warn!(index, error = %e, "skipping malformed proposal record");
                }
                Err(e) => {
                    warn!(
                        index,
                        count,
                        error = %e,
                        "proposal map ended early, keeping decoded records"
                    );
                    break;
                }
            }
        }
        Ok(records)
    }

    fn decode_entry(input: &mut impl Buf) -> Result<(AddressAndPort, ProposedNode)> {
        // Read both halves before judging either, so a malformed key still
        // leaves the input positioned at the next record.
        let key = AddressAndPort::decode(input);
        let value = ProposedNode::decode(input);
        Ok((key?, value?))
    }
}
