//! Bootstrap protocol engine.
//!
//! The engine is the marshalling state machine between the socket reactor and
//! the shared registry. It knows two payload kinds:
//!
//! - **Bootstrap**: [`BOOTSTRAP_MARKER`] followed by one [`ProposedNode`]. A
//!   node announcing itself, possibly with a candidate identifier.
//! - **Full state**: [`KnownNodes`] followed by an [`ExpiringProposalMap`].
//!   Everything the sender knows, broadcast in reply to bootstraps.
//!
//! The engine never touches a socket. The reactor hands it validated payloads
//! through [`BootstrapEngine::on_frame_received`] and asks for payloads to send
//! through [`BootstrapEngine::on_write_requested`]; the engine asks for a write
//! through [`WriteNotifier`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use gridboot_registry::{
    now_millis, ExpiringProposalMap, KnownNodes, KnownNodesSnapshot, ProposedNode,
};
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::config::{DEFAULT_PROPOSAL_TTL, DEFAULT_REPLY_JITTER};
use crate::error::Result;

/// Literal prefix of a bootstrap payload: int16 length, then `BOOTSTRAP`.
pub const BOOTSTRAP_MARKER: [u8; 11] = *b"\x00\x09BOOTSTRAP";

/// Reactor-side hook the engine uses to ask for a write.
pub trait WriteNotifier: Send + Sync {
    /// Arrange for [`BootstrapEngine::on_write_requested`] to be called once
    /// `delay` has passed. Must not block the caller for `delay`.
    fn request_write(&self, delay: Duration);
}

/// Emitted after a full-state frame has been merged.
#[derive(Debug, Clone)]
pub struct StateUpdate {
    /// The local registry after the merge.
    pub known: KnownNodesSnapshot,
    /// Every proposal currently held, ours included if it was echoed back.
    pub proposals: Vec<ProposedNode>,
}

/// What a received payload turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// A peer announced itself.
    Bootstrap(ProposedNode),
    /// A full-state frame was merged.
    FullState { peers: usize, proposals: usize },
    /// The payload could not be decoded and was dropped.
    Dropped,
}

/// Marshalling state machine for discovery frames.
pub struct BootstrapEngine {
    known: Arc<KnownNodes>,
    proposals: Arc<ExpiringProposalMap>,
    pending: Mutex<Option<ProposedNode>>,
    bootstrap_due: AtomicBool,
    notifier: Arc<dyn WriteNotifier>,
    events: mpsc::Sender<StateUpdate>,
    reply_jitter: Duration,
    proposal_ttl: Duration,
}

impl BootstrapEngine {
    pub fn new(
        known: Arc<KnownNodes>,
        proposals: Arc<ExpiringProposalMap>,
        notifier: Arc<dyn WriteNotifier>,
        events: mpsc::Sender<StateUpdate>,
    ) -> Self {
        Self {
            known,
            proposals,
            pending: Mutex::new(None),
            bootstrap_due: AtomicBool::new(false),
            notifier,
            events,
            reply_jitter: DEFAULT_REPLY_JITTER,
            proposal_ttl: DEFAULT_PROPOSAL_TTL,
        }
    }

    /// Set the upper bound of the delay before answering a bootstrap.
    #[must_use]
    pub fn with_reply_jitter(mut self, jitter: Duration) -> Self {
        self.reply_jitter = jitter;
        self
    }

    /// Set how long silent peers' proposals are kept.
    #[must_use]
    pub fn with_proposal_ttl(mut self, ttl: Duration) -> Self {
        self.proposal_ttl = ttl;
        self
    }

    pub fn known_nodes(&self) -> &Arc<KnownNodes> {
        &self.known
    }

    pub fn proposals(&self) -> &Arc<ExpiringProposalMap> {
        &self.proposals
    }

    /// Queue a bootstrap frame carrying `proposal` for the next write.
    ///
    /// Nothing is sent here; the reactor is asked for a write and the frame
    /// is produced when it calls [`on_write_requested`](Self::on_write_requested).
    pub fn request_bootstrap(&self, proposal: ProposedNode) {
        trace!(
            peer = %proposal.peer(),
            identifier = ?proposal.identifier(),
            "Bootstrap requested"
        );
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = Some(proposal);
        self.bootstrap_due.store(true, Ordering::Release);
        self.notifier.request_write(Duration::ZERO);
    }

    pub fn is_bootstrap_due(&self) -> bool {
        self.bootstrap_due.load(Ordering::Acquire)
    }

    /// Produce the next payload to broadcast.
    ///
    /// A due bootstrap wins; otherwise this is a full-state payload, built
    /// after forgetting proposals older than the proposal TTL.
    pub fn on_write_requested(&self) -> Result<Bytes> {
        if self.bootstrap_due.swap(false, Ordering::AcqRel) {
            let pending = self
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if let Some(proposal) = pending {
                let mut out = BytesMut::with_capacity(BOOTSTRAP_MARKER.len() + ProposedNode::ENCODED_LEN);
                out.put_slice(&BOOTSTRAP_MARKER);
                proposal.encode(&mut out);
                return Ok(out.freeze());
            }
        }

        let cutoff = now_millis().saturating_sub(self.proposal_ttl.as_millis() as u64);
        let expired = self.proposals.expire_entries(cutoff);
        if expired > 0 {
            trace!(expired, "Expired stale proposals");
        }

        let mut out = BytesMut::new();
        self.known.encode(&mut out)?;
        self.proposals.encode(&mut out)?;
        Ok(out.freeze())
    }

    /// Handle one validated payload.
    ///
    /// Undecodable payloads are logged and dropped; the transport is lossy and
    /// peers re-broadcast, so there is nothing to report to a caller.
    pub fn on_frame_received(&self, payload: &[u8]) -> Received {
        match payload.strip_prefix(BOOTSTRAP_MARKER.as_slice()) {
            Some(mut body) => match ProposedNode::decode(&mut body) {
                Ok(proposal) => {
                    self.on_bootstrap(proposal.clone());
                    Received::Bootstrap(proposal)
                }
                Err(e) => {
                    warn!(error = %e, "Dropping undecodable bootstrap frame");
                    Received::Dropped
                }
            },
            None => self.on_full_state(payload),
        }
    }

    fn on_bootstrap(&self, proposal: ProposedNode) {
        debug!(
            peer = %proposal.peer(),
            identifier = ?proposal.identifier(),
            "Received bootstrap"
        );
        self.proposals.put(proposal.peer(), proposal);

        // Spread out the replies of everyone who heard this bootstrap.
        let delay = if self.reply_jitter.is_zero() {
            Duration::ZERO
        } else {
            rand::thread_rng().gen_range(Duration::ZERO..self.reply_jitter)
        };
        self.notifier.request_write(delay);
    }

    fn on_full_state(&self, payload: &[u8]) -> Received {
        let mut input = payload;
        let remote = match KnownNodes::decode(&mut input) {
            Ok(remote) => remote,
            Err(e) => {
                warn!(error = %e, len = payload.len(), "Dropping undecodable full-state frame");
                return Received::Dropped;
            }
        };
        let records = match ExpiringProposalMap::decode_entries(&mut input) {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "Dropping full-state frame with unreadable proposals");
                return Received::Dropped;
            }
        };

        self.known.merge(&remote);
        let proposals = records.len();
        for (peer, proposal) in records {
            self.proposals.merge_newer(peer, proposal);
        }

        trace!(
            peers = remote.peer_count(),
            proposals,
            identifiers = %self.known.identifiers().to_bit_string(),
            "Merged full state"
        );

        let update = StateUpdate {
            known: self.known.snapshot(),
            proposals: self.proposals.values(),
        };
        if let Err(e) = self.events.try_send(update) {
            trace!(error = %e, "State update not delivered");
        }

        Received::FullState {
            peers: remote.peer_count(),
            proposals,
        }
    }
}

impl std::fmt::Debug for BootstrapEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrapEngine")
            .field("known", &self.known)
            .field("proposals", &self.proposals.len())
            .field("bootstrap_due", &self.is_bootstrap_due())
            .finish_non_exhaustive()
    }
}
