//! In-memory broadcast bus for driving several discovery nodes under paused
//! tokio time.
//!
//! Every write a node's engine asks for is produced after the requested delay,
//! framed, and delivered to every engine on the bus, the sender included, the
//! way a broadcast socket loops frames back to itself.

#![allow(dead_code)]

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use gridboot_discovery::{
    decode_frame, encode_frame, BootstrapEngine, DiscoveryConfig, Orchestrator, WriteNotifier,
};
use gridboot_registry::{AddressAndPort, ExpiringProposalMap, KnownNodes};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

struct BusNotifier {
    index: usize,
    writes: mpsc::UnboundedSender<(usize, Duration)>,
}

impl WriteNotifier for BusNotifier {
    fn request_write(&self, delay: Duration) {
        let _ = self.writes.send((self.index, delay));
    }
}

pub struct SimNode {
    pub local: AddressAndPort,
    pub known: Arc<KnownNodes>,
    pub engine: Arc<BootstrapEngine>,
    pub orchestrator: Option<Orchestrator>,
}

pub struct SimBus {
    pub nodes: Vec<SimNode>,
    pub shutdown: watch::Sender<bool>,
    pump: JoinHandle<()>,
}

pub fn addr(last: u8, port: u16) -> AddressAndPort {
    AddressAndPort::new(Ipv4Addr::new(10, 0, 0, last), port)
}

impl SimBus {
    /// One node per entry of `locals`; node `i` draws random candidates from
    /// a generator seeded with `i`.
    pub fn new(locals: &[AddressAndPort], config: &DiscoveryConfig) -> Self {
        let (writes_tx, writes_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let mut nodes = Vec::with_capacity(locals.len());
        for (index, &local) in locals.iter().enumerate() {
            let known = Arc::new(KnownNodes::new());
            let (events_tx, events_rx) = mpsc::channel(config.event_capacity);
            let notifier = Arc::new(BusNotifier {
                index,
                writes: writes_tx.clone(),
            });
            let engine = Arc::new(
                BootstrapEngine::new(
                    known.clone(),
                    Arc::new(ExpiringProposalMap::new()),
                    notifier,
                    events_tx,
                )
                .with_reply_jitter(config.reply_jitter)
                .with_proposal_ttl(config.proposal_ttl),
            );
            let orchestrator =
                Orchestrator::new(local, engine.clone(), events_rx, shutdown_rx.clone(), config)
                    .with_seed(index as u64);
            nodes.push(SimNode {
                local,
                known,
                engine,
                orchestrator: Some(orchestrator),
            });
        }

        let engines: Arc<Vec<Arc<BootstrapEngine>>> =
            Arc::new(nodes.iter().map(|n| n.engine.clone()).collect());
        let pump = tokio::spawn(pump(engines, writes_rx));

        Self {
            nodes,
            shutdown,
            pump,
        }
    }

    /// Spawn the join sequence of node `index`.
    pub fn spawn(
        &mut self,
        index: usize,
    ) -> JoinHandle<gridboot_discovery::Result<gridboot_discovery::Discovery>> {
        let orchestrator = self.nodes[index]
            .orchestrator
            .take()
            .expect("node already spawned");
        tokio::spawn(orchestrator.run())
    }
}

impl Drop for SimBus {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

async fn pump(
    engines: Arc<Vec<Arc<BootstrapEngine>>>,
    mut writes: mpsc::UnboundedReceiver<(usize, Duration)>,
) {
    while let Some((index, delay)) = writes.recv().await {
        let engines = engines.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            broadcast(&engines, index);
        });
    }
}

fn broadcast(engines: &[Arc<BootstrapEngine>], from: usize) {
    let payload = engines[from]
        .on_write_requested()
        .expect("payload encodes");
    let frame = encode_frame(&payload).expect("payload fits a frame");
    for engine in engines {
        let payload = decode_frame(&frame).expect("frame decodes");
        engine.on_frame_received(payload);
    }
}
