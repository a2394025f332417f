//! JSON summary printed once discovery has settled.

use std::net::SocketAddr;

use gridboot_discovery::Discovery;
use gridboot_registry::{AddressAndPort, Identifier, KnownNodes, KnownNodesSnapshot};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoverySummary {
    pub identifier: Identifier,
    pub attempts: usize,
    pub local: AddressAndPort,
    pub listen_port: u16,
    pub heartbeat_ms: u64,
    pub endpoints: Vec<SocketAddr>,
    pub known: KnownNodesSnapshot,
}

impl DiscoverySummary {
    pub fn new(local: AddressAndPort, discovery: &Discovery, known: &KnownNodes) -> Self {
        let replication = &discovery.replication;
        Self {
            identifier: discovery.identifier,
            attempts: discovery.attempts,
            local,
            listen_port: replication.listen_port,
            heartbeat_ms: replication.heartbeat_interval.as_millis() as u64,
            endpoints: replication.endpoints.clone(),
            known: known.snapshot(),
        }
    }
}
