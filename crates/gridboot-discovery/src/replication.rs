//! Hand-off to the replication transport.
//!
//! Discovery ends by describing how to open the reliable point-to-point
//! replication session: which identifier we own, where we listen, and which
//! peers to dial.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use gridboot_registry::{Identifier, KnownNodes};
use tracing::warn;

/// Called by the replication transport for every identifier a remote peer
/// presents during its handshake.
pub trait IdentifierListener: Send + Sync {
    /// Returns `false` if `identifier` is already in use by another address.
    fn is_identifier_unique(&self, identifier: Identifier, remote: SocketAddr) -> bool;
}

/// Tracks which address first presented each identifier.
///
/// Every reported identifier is also marked claimed in the shared registry,
/// so identifiers learned over the replication transport are never proposed
/// by later discovery rounds.
#[derive(Debug)]
pub struct UniqueIdentifierGuard {
    known: Arc<KnownNodes>,
    owners: Mutex<HashMap<Identifier, SocketAddr>>,
}

impl UniqueIdentifierGuard {
    pub fn new(known: Arc<KnownNodes>) -> Self {
        Self {
            known,
            owners: Mutex::new(HashMap::new()),
        }
    }

    /// The address that first presented `identifier`, if any.
    pub fn owner(&self, identifier: Identifier) -> Option<SocketAddr> {
        self.owners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&identifier)
            .copied()
    }
}

impl IdentifierListener for UniqueIdentifierGuard {
    fn is_identifier_unique(&self, identifier: Identifier, remote: SocketAddr) -> bool {
        self.known.identifiers().set(identifier);

        let owner = *self
            .owners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(identifier)
            .or_insert(remote);

        if owner != remote {
            warn!(
                %identifier,
                %remote,
                %owner,
                "Identifier presented by a second address"
            );
            return false;
        }
        true
    }
}

/// Everything the replication transport needs to start.
#[derive(Clone)]
pub struct ReplicationConfig {
    /// The identifier this node owns in the grid.
    pub identifier: Identifier,
    /// TCP port to accept replication sessions on.
    pub listen_port: u16,
    /// Heartbeat interval for replication sessions.
    pub heartbeat_interval: Duration,
    /// Known peers to dial, excluding ourselves.
    pub endpoints: Vec<SocketAddr>,
    /// Consulted when a peer presents an identifier.
    pub identifier_listener: Arc<dyn IdentifierListener>,
}

impl fmt::Debug for ReplicationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationConfig")
            .field("identifier", &self.identifier)
            .field("listen_port", &self.listen_port)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("endpoints", &self.endpoints)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(v: u8) -> Identifier {
        Identifier::new(v).unwrap()
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn first_presenter_owns_identifier() {
        let known = Arc::new(KnownNodes::new());
        let guard = UniqueIdentifierGuard::new(known.clone());

        assert!(guard.is_identifier_unique(id(4), addr("10.0.0.1:8000")));
        assert!(known.identifiers().contains(id(4)));
        assert_eq!(guard.owner(id(4)), Some(addr("10.0.0.1:8000")));

        // Same address again is still fine.
        assert!(guard.is_identifier_unique(id(4), addr("10.0.0.1:8000")));
    }

    #[test]
    fn second_presenter_is_rejected() {
        let guard = UniqueIdentifierGuard::new(Arc::new(KnownNodes::new()));

        assert!(guard.is_identifier_unique(id(4), addr("10.0.0.1:8000")));
        assert!(!guard.is_identifier_unique(id(4), addr("10.0.0.2:8000")));
        assert_eq!(guard.owner(id(4)), Some(addr("10.0.0.1:8000")));
        assert!(guard.is_identifier_unique(id(5), addr("10.0.0.2:8000")));
    }

    #[test]
    fn debug_omits_listener() {
        let config = ReplicationConfig {
            identifier: id(1),
            listen_port: 8000,
            heartbeat_interval: Duration::from_secs(1),
            endpoints: vec![addr("10.0.0.9:8000")],
            identifier_listener: Arc::new(UniqueIdentifierGuard::new(Arc::new(KnownNodes::new()))),
        };
        let rendered = format!("{config:?}");
        assert!(rendered.contains("10.0.0.9:8000"));
        assert!(!rendered.contains("identifier_listener"));
    }
}
