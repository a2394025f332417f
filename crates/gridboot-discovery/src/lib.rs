//! Gridboot Discovery - zero-configuration identifier allocation over UDP
//!
//! Nodes joining a LAN grid find each other by UDP broadcast and agree, without
//! a coordinator, on a unique small identifier (0..128) each. The result is a
//! [`ReplicationConfig`] naming our identifier and every peer heard from, ready
//! for a replication transport.
//!
//! # Architecture
//!
//! ```text
//!   UDP socket <-> BroadcastReactor <-> BootstrapEngine <-> KnownNodes
//!                       ^                     |              ExpiringProposalMap
//!                       | request_write       | StateUpdate
//!                       +---------------------+------> Orchestrator
//! ```
//!
//! - [`framing`]: the `!size | size | payload` datagram header
//! - [`engine`]: bootstrap and full-state payloads, merging into the registry
//! - [`reactor`]: the socket event loop
//! - [`allocation`]: choosing candidate identifiers
//! - [`orchestrator`]: the prime / propose / settle join sequence
//! - [`node`]: everything above wired to one socket
//!
//! # Example
//!
//! ```no_run
//! use gridboot_discovery::{DiscoveryConfig, DiscoveryNode};
//!
//! # async fn example() -> gridboot_discovery::Result<()> {
//! let mut node = DiscoveryNode::start(DiscoveryConfig::from_env()?).await?;
//! let discovery = node.discover().await?;
//! println!("we are node {}", discovery.identifier);
//! # Ok(())
//! # }
//! ```

pub mod allocation;
pub mod config;
pub mod engine;
pub mod error;
pub mod framing;
pub mod node;
pub mod orchestrator;
pub mod reactor;
pub mod replication;

pub use allocation::{first_candidate, propose_identifier};
pub use config::DiscoveryConfig;
pub use engine::{BootstrapEngine, Received, StateUpdate, WriteNotifier, BOOTSTRAP_MARKER};
pub use error::{Error, Result};
pub use framing::{decode_frame, encode_frame, FrameError};
pub use node::{DiscoveryNode, ShutdownHandle};
pub use orchestrator::{Discovery, DiscoveryState, Orchestrator};
pub use reactor::{BroadcastReactor, WriteSignal};
pub use replication::{IdentifierListener, ReplicationConfig, UniqueIdentifierGuard};
