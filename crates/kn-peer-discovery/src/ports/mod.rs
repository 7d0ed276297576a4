//! # Ports Layer - Hexagonal Architecture Boundaries
//!
//! - **Driving Ports (Inbound):** [`Discovery`], the façade the node uses to
//!   find and manage peers.
//! - **Driven Ports (Outbound):** [`Transport`] for the UDP protocol and
//!   [`KeyValueStore`] for the node database backend.

pub mod inbound;
pub mod outbound;

pub use inbound::Discovery;
pub use outbound::{BatchOperation, KVStoreError, KeyValueStore, Transport};
