//! # Driven Ports (Outbound SPI)
//!
//! Interfaces the routing table requires from its environment.

use std::net::SocketAddr;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{DiscoveryError, Node, NodeId, NodeType};

/// Discovery RPCs issued by the routing table.
///
/// Implemented by [`crate::udp::UdpTransport`]; tests substitute an
/// in-memory double so that tables can be exercised without sockets.
///
/// # Thread Safety
///
/// Lookups query several peers concurrently, so implementations must be
/// `Send + Sync`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a PING and wait for the matching PONG.
    async fn ping(&self, to: NodeId, addr: SocketAddr) -> Result<(), DiscoveryError>;

    /// Wait for a PING from `from`.
    ///
    /// Used during bonding to give the remote side a chance to ping us.
    async fn wait_ping(&self, from: NodeId) -> Result<(), DiscoveryError>;

    /// Send a FINDNODE and collect up to `max` validated neighbors.
    ///
    /// # Arguments
    ///
    /// * `to`, `addr` - The peer to query
    /// * `target` - Lookup target; does not need to be a valid key
    /// * `target_type` - Role of the requested peers
    /// * `max` - Number of records after which the reply is complete
    async fn find_node(
        &self,
        to: NodeId,
        addr: SocketAddr,
        target: NodeId,
        target_type: NodeType,
        max: usize,
    ) -> Result<Vec<Node>, DiscoveryError>;

    /// Stop the transport. Outstanding requests fail with `Closed`.
    fn close(&self);
}

/// Errors from a key-value backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KVStoreError {
    /// Backend I/O failure
    #[error("I/O error: {message}")]
    IOError {
        /// Backend message
        message: String,
    },
}

impl From<KVStoreError> for DiscoveryError {
    fn from(e: KVStoreError) -> Self {
        DiscoveryError::Database(e.to_string())
    }
}

/// Batch operation for atomic writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOperation {
    /// Put a key-value pair.
    Put { key: Vec<u8>, value: Vec<u8> },
    /// Delete a key.
    Delete { key: Vec<u8> },
}

impl BatchOperation {
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        BatchOperation::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        BatchOperation::Delete { key: key.into() }
    }
}

/// Abstract key-value storage behind the node database.
///
/// Production: `RocksDbStore` (feature `rocksdb`).
/// Testing and ephemeral nodes: `MemoryStore`.
pub trait KeyValueStore: Send + Sync {
    /// Get a value by key.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KVStoreError>;

    /// Put a single key-value pair.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), KVStoreError>;

    /// Delete a key. Deleting a missing key is not an error.
    fn delete(&self, key: &[u8]) -> Result<(), KVStoreError>;

    /// Apply all operations or none.
    fn atomic_batch_write(&self, operations: Vec<BatchOperation>) -> Result<(), KVStoreError>;

    /// All pairs whose key starts with `prefix`, in key order.
    fn prefix_scan(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, KVStoreError>;

    /// Flush and release the backend.
    fn close(&self) {}
}
