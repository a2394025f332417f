//! Discovery orchestrator - claims an identifier for this node.
//!
//! The join sequence:
//!
//! 1. **Prime**: announce ourselves without an identifier a couple of times,
//!    so peers reply with what they know.
//! 2. **Propose**: pick a candidate (address-derived first, random after)
//!    and announce it once per round. Every full-state update received in the
//!    meantime is checked for another peer proposing the same identifier.
//! 3. **Settle**: a candidate that survives the stability window is recorded
//!    in the registry and turned into a [`ReplicationConfig`].
//!
//! # Known limitation
//!
//! This is best-effort agreement, not consensus. Two nodes whose frames never
//! reach each other within the stability window can both settle on the same
//! identifier. The replication transport's [`IdentifierListener`] is the
//! backstop for that case.
//!
//! [`IdentifierListener`]: crate::replication::IdentifierListener

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use gridboot_registry::{AddressAndPort, Identifier, KnownNodes, ProposedNode};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::allocation::propose_identifier;
use crate::config::DiscoveryConfig;
use crate::engine::{BootstrapEngine, StateUpdate};
use crate::error::{Error, Result};
use crate::replication::{ReplicationConfig, UniqueIdentifierGuard};

/// Where the orchestrator is in the join sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    /// Announcing ourselves without an identifier.
    Priming,
    /// Announcing a candidate identifier.
    Proposing { identifier: Identifier, attempt: usize },
    /// The identifier is ours.
    Claimed(Identifier),
    /// Shut down before claiming an identifier.
    Aborted,
}

impl fmt::Display for DiscoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Priming => write!(f, "Priming"),
            Self::Proposing { identifier, attempt } => {
                write!(f, "Proposing({identifier}, attempt {attempt})")
            }
            Self::Claimed(identifier) => write!(f, "Claimed({identifier})"),
            Self::Aborted => write!(f, "Aborted"),
        }
    }
}

/// Result of a successful discovery.
#[derive(Debug, Clone)]
pub struct Discovery {
    /// The identifier this node settled on.
    pub identifier: Identifier,
    /// Candidates tried, the settled one included.
    pub attempts: usize,
    /// Configuration for the replication transport.
    pub replication: ReplicationConfig,
}

/// Drives the join sequence for one node.
pub struct Orchestrator {
    local: AddressAndPort,
    known: Arc<KnownNodes>,
    engine: Arc<BootstrapEngine>,
    events: mpsc::Receiver<StateUpdate>,
    shutdown: watch::Receiver<bool>,
    priming_announcements: usize,
    announcements: usize,
    announce_interval: Duration,
    heartbeat_interval: Duration,
    rng: StdRng,
    state: DiscoveryState,
    proposed: Option<Identifier>,
    collision: bool,
}

impl Orchestrator {
    pub fn new(
        local: AddressAndPort,
        engine: Arc<BootstrapEngine>,
        events: mpsc::Receiver<StateUpdate>,
        shutdown: watch::Receiver<bool>,
        config: &DiscoveryConfig,
    ) -> Self {
        Self {
            local,
            known: Arc::clone(engine.known_nodes()),
            engine,
            events,
            shutdown,
            priming_announcements: config.priming_announcements,
            announcements: config.announcements_per_candidate(),
            announce_interval: config.announce_interval,
            heartbeat_interval: config.heartbeat_interval,
            rng: StdRng::from_entropy(),
            state: DiscoveryState::Priming,
            proposed: None,
            collision: false,
        }
    }

    /// Use a seeded generator for random candidates.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub const fn state(&self) -> DiscoveryState {
        self.state
    }

    pub const fn local(&self) -> AddressAndPort {
        self.local
    }

    /// Run the join sequence until an identifier is claimed.
    ///
    /// Fails with [`Error::GridFull`] if every identifier is taken and with
    /// [`Error::Aborted`] if shutdown is signalled between rounds.
    pub async fn run(mut self) -> Result<Discovery> {
        info!(local = %self.local, "Starting grid discovery");

        self.prime().await?;

        let mut attempt = 0;
        let identifier = loop {
            self.check_shutdown()?;
            attempt += 1;

            let candidate = propose_identifier(
                self.known.identifiers(),
                &self.local,
                attempt == 1,
                &mut self.rng,
            )?;
            self.proposed = Some(candidate);
            self.collision = false;
            self.state = DiscoveryState::Proposing {
                identifier: candidate,
                attempt,
            };
            debug!(identifier = %candidate, attempt, "Proposing identifier");

            if self.announce_candidate(candidate).await? {
                break candidate;
            }
            info!(
                identifier = %candidate,
                attempt,
                "Identifier proposed by another node, choosing another"
            );
        };

        self.state = DiscoveryState::Claimed(identifier);
        self.known.add(self.local, identifier);

        let replication = self.replication_config(identifier);
        info!(
            identifier = %identifier,
            attempts = attempt,
            peers = replication.endpoints.len(),
            "Claimed grid identifier"
        );

        Ok(Discovery {
            identifier,
            attempts: attempt,
            replication,
        })
    }

    async fn prime(&mut self) -> Result<()> {
        self.state = DiscoveryState::Priming;
        for _ in 0..self.priming_announcements {
            self.check_shutdown()?;
            self.engine
                .request_bootstrap(ProposedNode::new(self.local, None));
            self.wait(self.announce_interval).await;
        }
        Ok(())
    }

    /// Announce a candidate once per round. Returns `false` as soon as a
    /// collision is seen, `true` once the stability window has passed clean.
    async fn announce_candidate(&mut self, candidate: Identifier) -> Result<bool> {
        let proposal = ProposedNode::new(self.local, Some(candidate));

        for round in 0..self.announcements {
            self.check_shutdown()?;
            self.engine.request_bootstrap(proposal.clone());
            self.wait(self.announce_interval).await;

            if self.collision {
                return Ok(false);
            }
            trace!(identifier = %candidate, round, "Round passed without collision");
        }
        Ok(true)
    }

    /// Sleep for `duration` while folding in state updates as they arrive.
    async fn wait(&mut self, duration: Duration) {
        let deadline = Instant::now() + duration;
        loop {
            let received = tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return,
                update = self.events.recv() => update,
            };
            match received {
                Some(update) => self.observe(update),
                None => {
                    tokio::time::sleep_until(deadline).await;
                    return;
                }
            }
        }
    }

    /// Fold a state update into the registry and check it for a collision
    /// with our current candidate.
    fn observe(&mut self, update: StateUpdate) {
        for proposal in &update.proposals {
            let peer = proposal.peer();
            if peer == self.local {
                continue;
            }
            self.known.add_peer(peer);

            let Some(identifier) = proposal.identifier() else {
                continue;
            };
            self.known.identifiers().set(identifier);

            if self.proposed == Some(identifier) && !self.collision {
                debug!(%peer, %identifier, "Collision with another node's proposal");
                self.collision = true;
            }
        }
    }

    fn check_shutdown(&mut self) -> Result<()> {
        if *self.shutdown.borrow() {
            self.state = DiscoveryState::Aborted;
            return Err(Error::Aborted);
        }
        Ok(())
    }

    fn replication_config(&self, identifier: Identifier) -> ReplicationConfig {
        let endpoints = self
            .known
            .peers()
            .into_iter()
            .filter(|peer| *peer != self.local)
            .map(|peer| peer.socket_addr())
            .collect();

        ReplicationConfig {
            identifier,
            listen_port: self.local.port(),
            heartbeat_interval: self.heartbeat_interval,
            endpoints,
            identifier_listener: Arc::new(UniqueIdentifierGuard::new(Arc::clone(&self.known))),
        }
    }
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("local", &self.local)
            .field("state", &self.state)
            .field("collision", &self.collision)
            .finish_non_exhaustive()
    }
}
