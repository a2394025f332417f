//! The known-peer registry.

use std::collections::BTreeSet;
use std::sync::{PoisonError, RwLock};

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::address::AddressAndPort;
use crate::codec::{put_count, read_count, MAX_PREALLOC};
use crate::error::{Error, Result};
use crate::identifier::{Identifier, IdentifierBitset};

/// Peers known to this node and the identifiers believed claimed.
///
/// Shared between the socket reactor and the orchestrator. Each container is
/// individually thread-safe and every operation only adds, so a merge need not
/// be atomic as a whole: a half-applied merge is still a valid state.
///
/// Wire encoding:
/// - count: int16
/// - count × [`AddressAndPort`]
/// - 16-byte [`IdentifierBitset`] image
#[derive(Debug, Default)]
pub struct KnownNodes {
    peers: RwLock<BTreeSet<AddressAndPort>>,
    identifiers: IdentifierBitset,
}

/// Point-in-time copy of a [`KnownNodes`] registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownNodesSnapshot {
    pub peers: Vec<AddressAndPort>,
    pub identifiers: Vec<Identifier>,
}

impl KnownNodes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a peer together with the identifier it owns.
    pub fn add(&self, peer: AddressAndPort, identifier: Identifier) {
        self.identifiers.set(identifier);
        self.add_peer(peer);
    }

    /// Record a peer. Returns `true` if it was not known before.
    pub fn add_peer(&self, peer: AddressAndPort) -> bool {
        self.peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer)
    }

    pub fn contains_peer(&self, peer: &AddressAndPort) -> bool {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(peer)
    }

    /// Known peers in ascending order.
    pub fn peers(&self) -> Vec<AddressAndPort> {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn identifiers(&self) -> &IdentifierBitset {
        &self.identifiers
    }

    /// Union another registry into this one.
    ///
    /// Commutative, associative and idempotent.
    pub fn merge(&self, other: &KnownNodes) {
        let incoming = other.peers();
        if !incoming.is_empty() {
            self.peers
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .extend(incoming);
        }
        self.identifiers.union_with(&other.identifiers);
    }

    pub fn snapshot(&self) -> KnownNodesSnapshot {
        KnownNodesSnapshot {
            peers: self.peers(),
            identifiers: self.identifiers.iter_set().collect(),
        }
    }

    pub fn encode(&self, out: &mut impl BufMut) -> Result<()> {
        let peers = self.peers();
        put_count(out, peers.len())?;
        for peer in &peers {
            peer.encode(out);
        }
        self.identifiers.encode(out);
        Ok(())
    }

    /// Decode a registry image into a fresh registry.
    pub fn decode(input: &mut impl Buf) -> Result<Self> {
        let nodes = Self::new();
        nodes.decode_into(input)?;
        Ok(nodes)
    }

    /// Decode a registry image and merge it into `self`.
    ///
    /// Incoming bits are OR-ed into the ones already set, never replacing
    /// them. A peer record with a malformed address is skipped.
    pub fn decode_into(&self, input: &mut impl Buf) -> Result<()> {
        let count = read_count(input)?;
        let mut peers = Vec::with_capacity(count.min(MAX_PREALLOC));
        for _ in 0..count {
            match AddressAndPort::decode(input) {
                Ok(peer) => peers.push(peer),
                Err(e @ Error::MalformedAddress { .. }) => {
                    warn!(error = %e, "skipping malformed known peer");
                }
                Err(e) => return Err(e),
            }
        }
        let words = IdentifierBitset::decode_words(input)?;

        self.peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(peers);
        self.identifiers.union_words(words);
        Ok(())
    }
}

impl Clone for KnownNodes {
    fn clone(&self) -> Self {
        Self {
            peers: RwLock::new(self.peers().into_iter().collect()),
            identifiers: self.identifiers.clone(),
        }
    }
}

impl PartialEq for KnownNodes {
    fn eq(&self, other: &Self) -> bool {
        self.peers() == other.peers() && self.identifiers == other.identifiers
    }
}

impl Eq for KnownNodes {}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::net::Ipv4Addr;

    fn peer(last: u8) -> AddressAndPort {
        AddressAndPort::new(Ipv4Addr::new(10, 0, 0, last), 9000)
    }

    fn id(v: u8) -> Identifier {
        Identifier::new(v).unwrap()
    }

    fn nodes(entries: &[(u8, u8)]) -> KnownNodes {
        let nodes = KnownNodes::new();
        for &(last, identifier) in entries {
            nodes.add(peer(last), id(identifier));
        }
        nodes
    }

    #[test]
    fn add_is_idempotent() {
        let nodes = KnownNodes::new();
        nodes.add(peer(1), id(1));
        nodes.add(peer(1), id(1));
        assert_eq!(nodes.peer_count(), 1);
        assert_eq!(nodes.identifiers().count(), 1);
    }

    #[test]
    fn merge_unions_peers_and_bits() {
        let a = nodes(&[(1, 1), (2, 2)]);
        let b = nodes(&[(2, 2), (3, 99)]);

        a.merge(&b);

        assert_eq!(a.peers(), vec![peer(1), peer(2), peer(3)]);
        assert_eq!(
            a.identifiers().iter_set().collect::<Vec<_>>(),
            vec![id(1), id(2), id(99)]
        );
    }

    #[test]
    fn merge_preserves_identifier_zero() {
        let a = KnownNodes::new();
        a.merge(&nodes(&[(1, 0)]));
        assert!(a.identifiers().contains(id(0)));
    }

    #[test]
    fn empty_round_trip() {
        let mut out = Vec::new();
        KnownNodes::new().encode(&mut out).unwrap();
        assert_eq!(out.len(), 2 + 16);

        let decoded = KnownNodes::decode(&mut out.as_slice()).unwrap();
        assert_eq!(decoded, KnownNodes::new());
    }

    #[test]
    fn populated_round_trip() {
        let original = nodes(&[(5, 5), (9, 64), (200, 127)]);
        let mut out = Vec::new();
        original.encode(&mut out).unwrap();

        let decoded = KnownNodes::decode(&mut out.as_slice()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn decode_into_ors_bits() {
        let local = nodes(&[(1, 1)]);
        let mut out = Vec::new();
        nodes(&[(2, 2)]).encode(&mut out).unwrap();

        local.decode_into(&mut out.as_slice()).unwrap();

        assert!(local.identifiers().contains(id(1)));
        assert!(local.identifiers().contains(id(2)));
        assert_eq!(local.peers(), vec![peer(1), peer(2)]);
    }

    #[test]
    fn decode_skips_malformed_peer() {
        let mut out = Vec::new();
        out.put_i16(2);
        out.put_i16(3);
        out.put_slice(&[1, 2, 3]);
        out.put_u16(1);
        peer(7).encode(&mut out);
        IdentifierBitset::new().encode(&mut out);

        let decoded = KnownNodes::decode(&mut out.as_slice()).unwrap();
        assert_eq!(decoded.peers(), vec![peer(7)]);
    }

    #[test]
    fn negative_address_length_rejects_whole_image() {
        // Without the address extent, the trailing bytes cannot be told apart
        // from a bitset image; none of them may be merged.
        let mut out = Vec::new();
        out.put_i16(1);
        out.put_i16(-1);
        out.put_slice(&[0xff; 16]);

        let local = nodes(&[(1, 1)]);
        assert_eq!(
            local.decode_into(&mut out.as_slice()),
            Err(Error::InvalidLength(-1))
        );
        assert_eq!(local.identifiers().count(), 1);
        assert_eq!(local.peers(), vec![peer(1)]);
    }

    #[test]
    fn negative_address_length_sets_no_bits() {
        let mut out = Vec::new();
        out.put_i16(1);
        out.put_i16(-1);
        out.put_slice(&[0xaa; 6]);
        out.put_slice(&[0; 16]);

        assert!(matches!(
            KnownNodes::decode(&mut out.as_slice()),
            Err(Error::InvalidLength(-1))
        ));
    }

    #[test]
    fn truncated_bitset_fails() {
        let mut out = Vec::new();
        nodes(&[(1, 1)]).encode(&mut out).unwrap();
        out.truncate(out.len() - 1);

        assert!(matches!(
            KnownNodes::decode(&mut out.as_slice()),
            Err(Error::Truncated { .. })
        ));
    }

    fn arb_nodes() -> impl Strategy<Value = Vec<(u8, u8)>> {
        prop::collection::vec((any::<u8>(), 0u8..128), 0..12)
    }

    proptest! {
        #[test]
        fn merge_order_does_not_matter(inputs in prop::collection::vec(arb_nodes(), 1..5)) {
            let forward = KnownNodes::new();
            for entries in &inputs {
                forward.merge(&nodes(entries));
            }

            // Reverse order, each input merged twice.
            let backward = KnownNodes::new();
            for entries in inputs.iter().rev() {
                let n = nodes(entries);
                backward.merge(&n);
                backward.merge(&n);
            }

            let all: Vec<(u8, u8)> = inputs.concat();
            let single = KnownNodes::new();
            single.merge(&nodes(&all));

            prop_assert_eq!(&forward, &single);
            prop_assert_eq!(&backward, &single);
        }

        #[test]
        fn merge_is_associative(a in arb_nodes(), b in arb_nodes(), c in arb_nodes()) {
            // (a ∪ b) ∪ c
            let left = nodes(&a);
            left.merge(&nodes(&b));
            left.merge(&nodes(&c));

            // a ∪ (b ∪ c)
            let bc = nodes(&b);
            bc.merge(&nodes(&c));
            let right = nodes(&a);
            right.merge(&bc);

            prop_assert_eq!(left, right);
        }
    }
}
