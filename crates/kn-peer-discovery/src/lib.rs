//! # Role-Aware Peer Discovery
//!
//! UDP node discovery for a permissioned network of four node roles:
//! consensus nodes (CN), proxy nodes (PN), endpoint nodes (EN) and boot
//! nodes (BN). Peers find each other with PING/PONG/FINDNODE/NEIGHBORS
//! datagrams and are kept in per-role routing stores.
//!
//! ## Architecture
//!
//! The crate follows Hexagonal Architecture with:
//! - **Domain Layer:** Node records, the XOR metric, address policy
//! - **Ports Layer:** [`Discovery`] façade and [`Transport`] SPI
//! - **Wire Layer:** Packet payloads and signed framing
//! - **Storage Layer:** Kademlia buckets and flat role stores
//! - **Table:** Bonding, iterative lookup and the maintenance scheduler
//! - **Adapters:** UDP transport, node database, TOML configuration
//!
//! ## Store layout
//!
//! Each role keeps only the stores it needs. Endpoint nodes run a Kademlia
//! table among themselves; consensus and proxy nodes are few and are held in
//! flat lists. Boot nodes additionally gate CN and PN admission through an
//! allow-list.
//!
//! ## Example
//!
//! ```rust,no_run
//! use kn_peer_discovery::{listen_udp, Config, Discovery, NodeType};
//!
//! # async fn run() -> Result<(), kn_peer_discovery::DiscoveryError> {
//! let (table, _transport) = listen_udp(Config::for_testing(NodeType::En)).await?;
//! let peers = table.get_nodes(NodeType::Pn, 2).await;
//! println!("{} proxy nodes", peers.len());
//! table.close().await;
//! # Ok(())
//! # }
//! ```

// =============================================================================
// CORE MODULES
// =============================================================================

pub mod domain;
pub mod ports;
pub mod wire;

// =============================================================================
// ROUTING
// =============================================================================

pub mod nodedb;
pub mod storage;
pub mod table;

// =============================================================================
// ADAPTERS
// =============================================================================

pub mod adapters;
pub mod udp;

/// In-memory transport double.
/// Requires feature: `test-utils`
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

// =============================================================================
// RE-EXPORTS
// =============================================================================

pub use domain::{DiscoveryError, Netlist, Node, NodeId, NodeType, NodesByDistance};
pub use nodedb::NodeDb;
pub use ports::{Discovery, Transport};
pub use storage::{DiscoverStorage, KademliaStorage, SimpleStorage};
pub use table::Table;
pub use udp::{listen_udp, Config, ReadPacket, UdpTransport};

pub use adapters::{ConfigError, TomlConfigProvider};
