//! Protocol and table constants.

use std::time::Duration;

// =============================================================================
// Kademlia
// =============================================================================

/// Lookup concurrency factor.
pub const ALPHA: usize = 3;
/// Entries per bucket.
pub const BUCKET_SIZE: usize = 16;
/// Replacement candidates kept per bucket.
pub const MAX_REPLACEMENTS: usize = 10;

/// Width of the distance coordinate (keccak-256 of the node id).
pub const HASH_BITS: usize = 32 * 8;
/// Number of buckets in a bucketed store.
pub const N_BUCKETS: usize = HASH_BITS / 15;
/// Log distance at or below which every peer shares bucket 0.
pub const BUCKET_MIN_DISTANCE: usize = HASH_BITS - N_BUCKETS;

/// /24 prefix used for both IP quotas.
pub const BUCKET_SUBNET: u8 = 24;
/// Peers per /24 in a single bucket.
pub const BUCKET_IP_LIMIT: u32 = 2;
/// Peers per /24 across a bucketed store.
pub const TABLE_SUBNET: u8 = 24;
/// Peers per /24 across a bucketed store.
pub const TABLE_IP_LIMIT: u32 = 10;

// =============================================================================
// Bonding and maintenance
// =============================================================================

/// Concurrent ping/pong handshakes.
pub const MAX_BONDING_PING_PONGS: usize = 16;
/// Findnode failures after which a peer is evicted.
pub const MAX_FINDNODE_FAILURES: u32 = 5;

pub const REFRESH_INTERVAL: Duration = Duration::from_secs(30 * 60);
pub const REVALIDATE_INTERVAL: Duration = Duration::from_secs(10);
pub const COPY_NODES_INTERVAL: Duration = Duration::from_secs(30);
/// Minimum time since the last pong before a peer is pinged again by revalidation.
pub const REVALIDATE_HOLD: Duration = Duration::from_secs(10);

/// Seeds read from the node database per refresh.
pub const SEED_COUNT: usize = 30;
/// Maximum bond age of a database seed.
pub const SEED_MAX_AGE: Duration = Duration::from_secs(5 * 24 * 60 * 60);
/// Time in a bucket before an entry is persisted.
pub const SEED_MIN_TABLE_TIME: Duration = Duration::from_secs(5 * 60);

// =============================================================================
// Node database
// =============================================================================

/// Bond lifetime; older entries are dropped by the expirer.
pub const NODE_DB_NODE_EXPIRATION: Duration = Duration::from_secs(24 * 60 * 60);
/// Expirer period.
pub const NODE_DB_CLEANUP_CYCLE: Duration = Duration::from_secs(60 * 60);
/// Schema version; bump to wipe persisted databases on upgrade.
pub const NODE_DB_VERSION: u64 = 4;

// =============================================================================
// UDP protocol
// =============================================================================

/// Protocol version carried in PING.
pub const PROTOCOL_VERSION: u32 = 4;

/// Reply window for a single request.
pub const RESP_TIMEOUT: Duration = Duration::from_millis(500);
/// Packet lifetime stamped into the expiration field.
pub const EXPIRATION: Duration = Duration::from_secs(20);

/// Continuous timeouts before a clock drift check.
pub const NTP_FAILURE_THRESHOLD: u32 = 32;
/// Minimum time between two clock drift warnings.
pub const NTP_WARNING_COOLDOWN: Duration = Duration::from_secs(10 * 60);
/// Allowed drift before warning.
pub const DRIFT_THRESHOLD: Duration = Duration::from_secs(1);

/// Maximum datagram size.
pub const MAX_PACKET_SIZE: usize = 1280;

/// Lowest UDP port accepted for a relayed neighbor.
pub const MIN_RELAY_UDP_PORT: u16 = 1025;
