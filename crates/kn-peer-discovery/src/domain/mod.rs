//! # Domain Layer
//!
//! Pure types and rules of peer discovery: node records, the XOR metric,
//! address policy and protocol constants. Nothing here does I/O.

pub mod constants;
pub mod distance;
pub mod errors;
pub mod netutil;
pub mod node;

pub use constants::*;
pub use distance::{bucket_index, dist_cmp, log_distance, NodesByDistance};
pub use errors::{DiscoveryError, ParseNodeError};
pub use netutil::{check_relay_ip, is_lan, is_special_network, DistinctNetSet, NetError, Netlist};
pub use node::{Node, NodeId, NodeType, NODE_URI_SCHEME};
