//! Discovery node - wires socket, engine, reactor and orchestrator together.

use std::net::SocketAddr;
use std::sync::Arc;

use gridboot_registry::{AddressAndPort, ExpiringProposalMap, KnownNodes};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::DiscoveryConfig;
use crate::engine::BootstrapEngine;
use crate::error::{Error, Result};
use crate::orchestrator::{Discovery, Orchestrator};
use crate::reactor::{bind_socket, BroadcastReactor, WriteSignal};

/// Cloneable trigger for stopping a [`DiscoveryNode`] from another task.
///
/// Triggering aborts a [`discover`](DiscoveryNode::discover) in progress at
/// its next round with [`Error::Aborted`] and stops the reactor.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until shutdown has been triggered.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|stop| *stop).await;
    }
}

/// A running discovery participant.
///
/// The reactor keeps answering peers' bootstraps after [`discover`] returns,
/// so late joiners still learn about this node, until [`shutdown`] is called.
///
/// [`discover`]: DiscoveryNode::discover
/// [`shutdown`]: DiscoveryNode::shutdown
pub struct DiscoveryNode {
    local: AddressAndPort,
    local_addr: SocketAddr,
    known: Arc<KnownNodes>,
    engine: Arc<BootstrapEngine>,
    orchestrator: Option<Orchestrator>,
    shutdown: ShutdownHandle,
    reactor: JoinHandle<Result<()>>,
}

impl DiscoveryNode {
    /// Bind the discovery socket and start the reactor.
    pub async fn start(config: DiscoveryConfig) -> Result<Self> {
        config.validate()?;

        let local = AddressAndPort::new(config.resolve_local_address(), config.replication_port);
        let socket = bind_socket(config.bind_socket_addr(), config.sndbuf, config.rcvbuf)?;
        let local_addr = socket.local_addr()?;

        let known = Arc::new(KnownNodes::new());
        let signal = WriteSignal::new();
        let (events_tx, events_rx) = mpsc::channel(config.event_capacity);
        let engine = Arc::new(
            BootstrapEngine::new(
                Arc::clone(&known),
                Arc::new(ExpiringProposalMap::new()),
                Arc::new(signal.clone()),
                events_tx,
            )
            .with_reply_jitter(config.reply_jitter)
            .with_proposal_ttl(config.proposal_ttl),
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        let reactor = BroadcastReactor::new(
            socket,
            config.broadcast_socket_addr(),
            Arc::clone(&engine),
            signal,
            config.max_datagram,
        );
        let reactor = tokio::spawn(reactor.run(shutdown_rx.clone()));

        let orchestrator =
            Orchestrator::new(local, Arc::clone(&engine), events_rx, shutdown_rx, &config);

        info!(
            %local,
            %local_addr,
            broadcast = %config.broadcast_socket_addr(),
            "Discovery node started"
        );

        Ok(Self {
            local,
            local_addr,
            known,
            engine,
            orchestrator: Some(orchestrator),
            shutdown: ShutdownHandle {
                tx: Arc::new(shutdown),
            },
            reactor,
        })
    }

    /// Use a seeded generator for random candidates.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.orchestrator = self.orchestrator.take().map(|o| o.with_seed(seed));
        self
    }

    /// Run the join sequence. Only the first call does anything; later calls
    /// fail with [`Error::AlreadyDiscovered`].
    pub async fn discover(&mut self) -> Result<Discovery> {
        let orchestrator = self.orchestrator.take().ok_or(Error::AlreadyDiscovered)?;
        orchestrator.run().await
    }

    /// Our address as announced to peers.
    pub fn local(&self) -> AddressAndPort {
        self.local
    }

    /// Address the discovery socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn known_nodes(&self) -> &Arc<KnownNodes> {
        &self.known
    }

    pub fn engine(&self) -> &Arc<BootstrapEngine> {
        &self.engine
    }

    /// A handle that can stop this node while `discover` holds it.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Stop the reactor and wait for it to finish.
    ///
    /// A reactor task that panicked or was cancelled is reported as
    /// [`Error::Io`].
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.shutdown();
        join_reactor(self.reactor).await
    }
}

async fn join_reactor(reactor: JoinHandle<Result<()>>) -> Result<()> {
    match reactor.await {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "Broadcast reactor task failed");
            Err(Error::Io(std::io::Error::other(e)))
        }
    }
}

impl std::fmt::Debug for DiscoveryNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryNode")
            .field("local", &self.local)
            .field("local_addr", &self.local_addr)
            .field("discovered", &self.orchestrator.is_none())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn loopback_config() -> DiscoveryConfig {
        DiscoveryConfig::default()
            .with_bind_addr(Ipv4Addr::LOCALHOST)
            .with_broadcast_addr(Ipv4Addr::LOCALHOST)
            .with_broadcast_port(free_udp_port())
            .with_local_address(Ipv4Addr::LOCALHOST)
    }

    #[tokio::test]
    async fn shutdown_handle_aborts_discovery() {
        let config = loopback_config().with_announce_interval(Duration::from_millis(50));
        let mut node = DiscoveryNode::start(config).await.unwrap();
        let handle = node.shutdown_handle();

        tokio::spawn({
            let handle = handle.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                handle.shutdown();
            }
        });

        assert!(matches!(node.discover().await, Err(Error::Aborted)));
        assert!(handle.is_shutdown());
        handle.wait().await;
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn panicked_reactor_is_reported() {
        let reactor: JoinHandle<Result<()>> = tokio::spawn(async { panic!("reactor failed") });
        assert!(matches!(join_reactor(reactor).await, Err(Error::Io(_))));

        let reactor: JoinHandle<Result<()>> = tokio::spawn(async { Ok(()) });
        assert!(join_reactor(reactor).await.is_ok());
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_before_binding() {
        let config = DiscoveryConfig::default().with_broadcast_port(0);
        assert!(matches!(
            DiscoveryNode::start(config).await,
            Err(Error::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn announced_address_uses_replication_port() {
        let config = DiscoveryConfig::default()
            .with_bind_addr(Ipv4Addr::LOCALHOST)
            .with_broadcast_addr(Ipv4Addr::LOCALHOST)
            .with_broadcast_port(free_udp_port())
            .with_local_address(Ipv4Addr::new(10, 1, 2, 3))
            .with_replication_port(7100);

        let node = DiscoveryNode::start(config).await.unwrap();
        assert_eq!(
            node.local(),
            AddressAndPort::new(Ipv4Addr::new(10, 1, 2, 3), 7100)
        );
        assert!(node.known_nodes().peers().is_empty());
        node.shutdown().await.unwrap();
    }

    fn free_udp_port() -> u16 {
        std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }
}
