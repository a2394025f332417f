use std::net::Ipv4Addr;
use std::time::Duration;

use gridboot_discovery::{DiscoveryConfig, DiscoveryNode, Error};
use gridboot_registry::Identifier;

fn free_udp_port() -> u16 {
    std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn loopback_config() -> DiscoveryConfig {
    DiscoveryConfig::default()
        .with_bind_addr(Ipv4Addr::LOCALHOST)
        .with_broadcast_addr(Ipv4Addr::LOCALHOST)
        .with_broadcast_port(free_udp_port())
        .with_local_address(Ipv4Addr::LOCALHOST)
}

#[tokio::test]
async fn lone_node_claims_identifier_over_loopback() {
    let mut node = DiscoveryNode::start(loopback_config()).await.unwrap();

    let discovery = tokio::time::timeout(Duration::from_secs(5), node.discover())
        .await
        .unwrap()
        .unwrap();

    // 127.0.0.1 derives candidate 1.
    assert_eq!(discovery.identifier, Identifier::new(1).unwrap());
    assert!(discovery.replication.endpoints.is_empty());
    assert!(node.known_nodes().contains_peer(&node.local()));

    assert!(matches!(node.discover().await, Err(Error::AlreadyDiscovered)));
    node.shutdown().await.unwrap();
}
