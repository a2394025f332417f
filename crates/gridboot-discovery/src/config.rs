//! Discovery configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use crate::error::{Error, Result};

/// Default UDP port discovery broadcasts on.
pub const DEFAULT_BROADCAST_PORT: u16 = 8888;

/// Default TCP port the replication transport listens on.
pub const DEFAULT_REPLICATION_PORT: u16 = 8000;

/// How long a peer's proposal survives without being re-announced.
pub const DEFAULT_PROPOSAL_TTL: Duration = Duration::from_secs(1);

/// Upper bound of the random delay before answering a bootstrap frame.
pub const DEFAULT_REPLY_JITTER: Duration = Duration::from_millis(9);

/// Configuration for grid discovery.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// UDP port to bind and broadcast to.
    pub broadcast_port: u16,

    /// Destination address for outbound frames.
    pub broadcast_addr: Ipv4Addr,

    /// Local address the UDP socket binds to.
    pub bind_addr: Ipv4Addr,

    /// TCP port of the replication transport; announced as part of our
    /// address.
    pub replication_port: u16,

    /// Our IPv4 address as announced to peers. Detected when unset.
    pub local_address: Option<Ipv4Addr>,

    /// Bootstrap frames without an identifier sent before claiming anything.
    pub priming_announcements: usize,

    /// Consecutive collision-free rounds after the first announcement of a
    /// candidate before it is accepted. Each round is one re-announcement.
    pub stability_rounds: usize,

    /// Delay between announcements.
    pub announce_interval: Duration,

    /// Upper bound of the random delay before answering a bootstrap frame.
    pub reply_jitter: Duration,

    /// Age after which a silent peer's proposal is forgotten.
    pub proposal_ttl: Duration,

    /// Heartbeat interval handed to the replication transport.
    pub heartbeat_interval: Duration,

    /// Receive buffer size for a single datagram.
    pub max_datagram: usize,

    /// Socket send buffer size in bytes.
    pub sndbuf: usize,

    /// Socket receive buffer size in bytes.
    pub rcvbuf: usize,

    /// Capacity of the engine → orchestrator event channel.
    pub event_capacity: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            broadcast_port: DEFAULT_BROADCAST_PORT,
            broadcast_addr: Ipv4Addr::BROADCAST,
            bind_addr: Ipv4Addr::UNSPECIFIED,
            replication_port: DEFAULT_REPLICATION_PORT,
            local_address: None,
            priming_announcements: 2,
            stability_rounds: 3,
            announce_interval: Duration::from_millis(10),
            reply_jitter: DEFAULT_REPLY_JITTER,
            proposal_ttl: DEFAULT_PROPOSAL_TTL,
            heartbeat_interval: Duration::from_secs(1),
            max_datagram: 64 * 1024,
            sndbuf: 256 * 1024,
            rcvbuf: 256 * 1024,
            event_capacity: 64,
        }
    }
}

impl DiscoveryConfig {
    /// Create config from `GRIDBOOT_*` environment variables, falling back to
    /// the defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(port) = env_parse::<u16>("GRIDBOOT_UDP_PORT")? {
            config.broadcast_port = port;
        }
        if let Some(port) = env_parse::<u16>("GRIDBOOT_TCP_PORT")? {
            config.replication_port = port;
        }
        if let Some(addr) = env_parse::<Ipv4Addr>("GRIDBOOT_BROADCAST_ADDR")? {
            config.broadcast_addr = addr;
        }
        if let Some(addr) = env_parse::<Ipv4Addr>("GRIDBOOT_BIND_ADDR")? {
            config.bind_addr = addr;
        }
        config.local_address = env_parse::<Ipv4Addr>("GRIDBOOT_LOCAL_ADDR")?;
        if let Some(secs) = env_parse::<u64>("GRIDBOOT_HEARTBEAT_SECS")? {
            config.heartbeat_interval = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Set the UDP broadcast port.
    #[must_use]
    pub fn with_broadcast_port(mut self, port: u16) -> Self {
        self.broadcast_port = port;
        self
    }

    /// Set the broadcast destination address.
    #[must_use]
    pub fn with_broadcast_addr(mut self, addr: Ipv4Addr) -> Self {
        self.broadcast_addr = addr;
        self
    }

    /// Set the local bind address.
    #[must_use]
    pub fn with_bind_addr(mut self, addr: Ipv4Addr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the replication transport port.
    #[must_use]
    pub fn with_replication_port(mut self, port: u16) -> Self {
        self.replication_port = port;
        self
    }

    /// Announce an explicit local address instead of detecting one.
    #[must_use]
    pub fn with_local_address(mut self, addr: Ipv4Addr) -> Self {
        self.local_address = Some(addr);
        self
    }

    /// Set the number of collision-free rounds needed to accept a candidate.
    #[must_use]
    pub fn with_stability_rounds(mut self, rounds: usize) -> Self {
        self.stability_rounds = rounds;
        self
    }

    /// Set the delay between announcements.
    #[must_use]
    pub fn with_announce_interval(mut self, interval: Duration) -> Self {
        self.announce_interval = interval;
        self
    }

    /// Set the upper bound of the bootstrap reply jitter.
    #[must_use]
    pub fn with_reply_jitter(mut self, jitter: Duration) -> Self {
        self.reply_jitter = jitter;
        self
    }

    /// Set the replication heartbeat interval.
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Announcements sent for each candidate identifier.
    pub fn announcements_per_candidate(&self) -> usize {
        self.stability_rounds + 1
    }

    pub fn bind_socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.bind_addr, self.broadcast_port))
    }

    pub fn broadcast_socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.broadcast_addr, self.broadcast_port))
    }

    /// The address we announce: the configured one, else the address of the
    /// interface holding the default route, else loopback.
    pub fn resolve_local_address(&self) -> Ipv4Addr {
        self.local_address
            .or_else(detect_local_ipv4)
            .unwrap_or(Ipv4Addr::LOCALHOST)
    }

    pub fn validate(&self) -> Result<()> {
        if self.broadcast_port == 0 {
            return Err(Error::InvalidConfig("broadcast port must be non-zero".into()));
        }
        if self.replication_port == 0 {
            return Err(Error::InvalidConfig("replication port must be non-zero".into()));
        }
        if self.announce_interval.is_zero() {
            return Err(Error::InvalidConfig("announce interval must be non-zero".into()));
        }
        if self.max_datagram < crate::framing::FRAME_HEADER_LEN {
            return Err(Error::InvalidConfig(format!(
                "max datagram of {} bytes cannot hold a frame header",
                self.max_datagram
            )));
        }
        if self.event_capacity == 0 {
            return Err(Error::InvalidConfig("event capacity must be non-zero".into()));
        }
        Ok(())
    }
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::InvalidConfig(format!("{name}={raw}: {e}"))),
        _ => Ok(None),
    }
}

/// Find the IPv4 address of the interface that holds the default route.
///
/// Connecting a UDP socket sends nothing; it only makes the kernel pick a
/// source address.
pub fn detect_local_ipv4() -> Option<Ipv4Addr> {
    let socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9)).ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(addr) if !addr.is_unspecified() => Some(addr),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = DiscoveryConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.announcements_per_candidate(), 4);
        assert_eq!(config.proposal_ttl, Duration::from_secs(1));
        assert_eq!(
            config.broadcast_socket_addr(),
            "255.255.255.255:8888".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn builders() {
        let config = DiscoveryConfig::default()
            .with_broadcast_port(9999)
            .with_replication_port(7001)
            .with_local_address(Ipv4Addr::new(10, 1, 1, 5))
            .with_stability_rounds(5)
            .with_announce_interval(Duration::from_millis(50));

        assert_eq!(config.bind_socket_addr().port(), 9999);
        assert_eq!(config.replication_port, 7001);
        assert_eq!(config.resolve_local_address(), Ipv4Addr::new(10, 1, 1, 5));
        assert_eq!(config.announcements_per_candidate(), 6);
    }

    #[test]
    fn rejects_zero_ports() {
        assert!(DiscoveryConfig::default().with_broadcast_port(0).validate().is_err());
        assert!(DiscoveryConfig::default().with_replication_port(0).validate().is_err());
    }

    #[test]
    fn rejects_zero_interval() {
        let config = DiscoveryConfig::default().with_announce_interval(Duration::ZERO);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }
}
