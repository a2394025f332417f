//! Identifier allocation.
//!
//! A joining node picks a candidate identifier, then walks forward from it
//! (wrapping at 128) to the first identifier not yet known to be claimed and
//! claims it locally with an atomic test-and-set. This only guarantees local
//! exclusivity; grid-wide exclusivity comes from the orchestrator announcing
//! the candidate and backing off on collision.

use gridboot_registry::{AddressAndPort, Identifier, IdentifierBitset, MAX_IDENTIFIERS};
use rand::Rng;

use crate::error::{Error, Result};

/// The first-attempt candidate derived from our own address.
///
/// Uses the last address octet so that nodes on different hosts start from
/// different places before they know anything about each other. Octets above
/// 127 are folded down by 127, at most twice.
pub fn first_candidate(local: &AddressAndPort) -> u8 {
    let mut candidate = local.last_octet();
    for _ in 0..2 {
        if candidate as usize >= MAX_IDENTIFIERS {
            candidate -= 127;
        }
    }
    candidate
}

/// Pick and locally claim an unused identifier.
///
/// The first attempt starts from [`first_candidate`]; later attempts start
/// from a uniformly random identifier. The returned identifier's bit is set
/// in `claimed`.
///
/// Fails with [`Error::GridFull`] when all 128 identifiers are claimed.
pub fn propose_identifier<R: Rng + ?Sized>(
    claimed: &IdentifierBitset,
    local: &AddressAndPort,
    first_attempt: bool,
    rng: &mut R,
) -> Result<Identifier> {
    let start = if first_attempt {
        first_candidate(local)
    } else {
        rng.gen_range(0..MAX_IDENTIFIERS as u8)
    };
    claim_from(claimed, start)
}

/// Claim the first clear identifier at or after `start`, wrapping at 128.
pub fn claim_from(claimed: &IdentifierBitset, start: u8) -> Result<Identifier> {
    (0..MAX_IDENTIFIERS)
        .filter_map(|offset| Identifier::new(((start as usize + offset) % MAX_IDENTIFIERS) as u8))
        .find(|&candidate| claimed.set_if_clear(candidate))
        .ok_or(Error::GridFull)
}
