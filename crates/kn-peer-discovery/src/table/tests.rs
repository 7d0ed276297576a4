use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use shared_crypto::Secp256k1KeyPair;

use super::*;
use crate::domain::{bucket_index, BUCKET_SIZE, MAX_FINDNODE_FAILURES, N_BUCKETS};
use crate::ports::inbound::Discovery;
use crate::test_utils::MockTransport;

// =============================================================================
// Helpers
// =============================================================================

/// Node with an id derived from a real key, as bootstrap validation requires.
fn make_keyed_node(ip: &str, node_type: NodeType) -> Node {
    let key = Secp256k1KeyPair::generate();
    let id = NodeId::from_public_key(&key.public_key().unwrap());
    Node::new(id, ip.parse().unwrap(), 32323, 32323, node_type)
}

fn make_node(i: usize, node_type: NodeType) -> Node {
    let ip = format!("1.{}.{}.1", i / 256, i % 256);
    Node::new(NodeId::random(), ip.parse().unwrap(), 32323, 32323, node_type)
}

fn make_nodes(range: std::ops::Range<usize>, node_type: NodeType) -> Vec<Node> {
    range.map(|i| make_node(i, node_type)).collect()
}

fn make_table(
    node_type: NodeType,
    net: &Arc<MockTransport>,
    bootnodes: &[Node],
    authorized: &[Node],
) -> Arc<Table> {
    let self_node = make_keyed_node("127.0.0.1", node_type);
    let db = Arc::new(NodeDb::new_memory(self_node.id).unwrap());
    Table::new(
        Arc::clone(net) as Arc<dyn Transport>,
        self_node,
        db,
        bootnodes,
        authorized,
    )
    .unwrap()
}

fn store_name(tab: &Table, node_type: NodeType) -> Option<String> {
    tab.storage(node_type).map(|s| s.name())
}

fn entry_ids(tab: &Table) -> Vec<NodeId> {
    tab.get_bucket_entries().iter().map(|n| n.id).collect()
}

fn addr(n: &Node) -> SocketAddr {
    n.udp_addr()
}

// =============================================================================
// Construction
// =============================================================================

#[tokio::test]
async fn test_store_layout_per_role() {
    let net = Arc::new(MockTransport::new());

    let cn = make_table(NodeType::Cn, &net, &[], &[]);
    assert_eq!(store_name(&cn, NodeType::Cn).as_deref(), Some("CN simple"));
    assert_eq!(store_name(&cn, NodeType::Bn).as_deref(), Some("BN simple"));
    assert!(cn.storage(NodeType::Pn).is_none());
    assert!(cn.storage(NodeType::En).is_none());

    let pn = make_table(NodeType::Pn, &net, &[], &[]);
    assert_eq!(store_name(&pn, NodeType::Pn).as_deref(), Some("PN simple"));
    assert_eq!(store_name(&pn, NodeType::En).as_deref(), Some("EN kademlia"));
    assert_eq!(store_name(&pn, NodeType::Bn).as_deref(), Some("BN simple"));
    assert!(pn.storage(NodeType::Cn).is_none());

    let en = make_table(NodeType::En, &net, &[], &[]);
    assert_eq!(store_name(&en, NodeType::Pn).as_deref(), Some("PN simple"));
    assert_eq!(store_name(&en, NodeType::En).as_deref(), Some("EN kademlia"));
    assert_eq!(store_name(&en, NodeType::Bn).as_deref(), Some("BN simple"));
    assert!(en.storage(NodeType::Cn).is_none());

    let bn = make_table(NodeType::Bn, &net, &[], &[]);
    for t in [NodeType::Cn, NodeType::Pn, NodeType::En, NodeType::Bn] {
        assert!(bn.storage(t).is_some(), "BN table lacks a {t} store");
    }

    let unknown = make_table(NodeType::Unknown, &net, &[], &[]);
    assert!(unknown.all_storages().is_empty());
    assert_eq!(en.name(), "EN discovery table");
}

#[tokio::test]
async fn test_flat_store_capacities() {
    let net = Arc::new(MockTransport::new());

    let pn = make_table(NodeType::Pn, &net, &[], &[]);
    for n in make_nodes(0..3, NodeType::Pn) {
        pn.add(n);
    }
    assert_eq!(pn.storage(NodeType::Pn).unwrap().len(), PN_PN_STORE_MAX);

    let en = make_table(NodeType::En, &net, &[], &[]);
    for n in make_nodes(0..3, NodeType::Pn) {
        en.add(n);
    }
    assert_eq!(en.storage(NodeType::Pn).unwrap().len(), EN_PN_STORE_MAX);

    for n in make_nodes(10..15, NodeType::Bn) {
        en.add(n);
    }
    assert_eq!(en.storage(NodeType::Bn).unwrap().len(), BN_STORE_MAX);
}

#[tokio::test]
async fn test_rejects_incomplete_bootnode() {
    let net = Arc::new(MockTransport::new());
    let self_node = make_keyed_node("127.0.0.1", NodeType::En);
    let db = Arc::new(NodeDb::new_memory(self_node.id).unwrap());
    let mut boot = make_keyed_node("10.0.0.1", NodeType::Bn);
    boot.udp = 0;

    let res = Table::new(net as Arc<dyn Transport>, self_node, db, &[boot], &[]);
    assert!(matches!(res, Err(DiscoveryError::InvalidNode(_))));
}

#[tokio::test]
async fn test_bootnodes_admitted_before_first_refresh() {
    let net = Arc::new(MockTransport::new());
    let boot = make_keyed_node("10.0.0.1", NodeType::Bn);
    let tab = make_table(NodeType::En, &net, &[boot.clone()], &[]);

    // Boot nodes go to every store.
    assert_eq!(entry_ids(&tab).iter().filter(|id| **id == boot.id).count(), 3);
    assert_eq!(tab.nursery().len(), 1);
}

// =============================================================================
// Bonding
// =============================================================================

#[tokio::test]
async fn test_bond_admits_and_persists() {
    let net = Arc::new(MockTransport::new());
    let tab = make_table(NodeType::En, &net, &[], &[]);
    let peer = make_node(1, NodeType::En);

    let node = tab
        .bond(false, peer.id, addr(&peer), peer.tcp, NodeType::En)
        .await
        .unwrap();
    assert_eq!(node.id, peer.id);
    assert_eq!(net.ping_count(&peer.id), 1);
    assert_eq!(net.wait_ping_count(&peer.id), 1);
    assert!(tab.has_bond(&peer.id));
    assert_eq!(tab.get_node_from_db(&peer.id).unwrap().id, peer.id);
    assert!(entry_ids(&tab).contains(&peer.id));
}

#[tokio::test]
async fn test_fresh_bond_skips_handshake() {
    let net = Arc::new(MockTransport::new());
    let tab = make_table(NodeType::En, &net, &[], &[]);
    let peer = make_node(1, NodeType::En);

    tab.bond(false, peer.id, addr(&peer), peer.tcp, NodeType::En)
        .await
        .unwrap();
    tab.bond(false, peer.id, addr(&peer), peer.tcp, NodeType::En)
        .await
        .unwrap();
    assert_eq!(net.ping_count(&peer.id), 1);
}

#[tokio::test]
async fn test_bond_with_self_fails() {
    let net = Arc::new(MockTransport::new());
    let tab = make_table(NodeType::En, &net, &[], &[]);
    let me = tab.self_node().clone();

    let res = tab.bond(false, me.id, addr(&me), me.tcp, NodeType::En).await;
    assert_eq!(res, Err(DiscoveryError::SelfBond));
    assert_eq!(net.ping_count(&me.id), 0);
}

#[tokio::test]
async fn test_bond_from_ping_waits_for_init() {
    let net = Arc::new(MockTransport::new());
    let tab = make_table(NodeType::En, &net, &[], &[]);
    let peer = make_node(1, NodeType::En);

    // The scheduler has not run yet on this single-threaded runtime.
    let res = tab.bond(true, peer.id, addr(&peer), peer.tcp, NodeType::En).await;
    assert_eq!(res, Err(DiscoveryError::StillInitializing));

    tab.refresh().await;
    assert!(tab.bond(true, peer.id, addr(&peer), peer.tcp, NodeType::En).await.is_ok());
    assert_eq!(net.wait_ping_count(&peer.id), 0);
}

#[tokio::test]
async fn test_concurrent_bonds_share_one_handshake() {
    let net = Arc::new(MockTransport::new());
    net.set_ping_delay(Duration::from_millis(50));
    let tab = make_table(NodeType::En, &net, &[], &[]);
    let peer = make_node(1, NodeType::En);

    let (a, b) = tokio::join!(
        tab.bond(false, peer.id, addr(&peer), peer.tcp, NodeType::En),
        tab.bond(false, peer.id, addr(&peer), peer.tcp, NodeType::En),
    );
    assert_eq!(a.unwrap().id, peer.id);
    assert_eq!(b.unwrap().id, peer.id);
    assert_eq!(net.ping_count(&peer.id), 1);
}

#[tokio::test]
async fn test_failed_bond_still_admits_known_node() {
    let net = Arc::new(MockTransport::new());
    let tab = make_table(NodeType::En, &net, &[], &[]);
    let peer = make_node(1, NodeType::En);
    tab.create_update_node_on_db(&peer).unwrap();
    // A recorded failure forces a new handshake.
    tab.db().update_find_fails(&peer.id, 1).unwrap();
    net.fail_ping(peer.id);

    let res = tab.bond(false, peer.id, addr(&peer), peer.tcp, NodeType::En).await;
    assert_eq!(res, Err(DiscoveryError::Timeout));
    assert!(entry_ids(&tab).contains(&peer.id));
    assert_eq!(tab.db().find_fails(&peer.id), 0);
}

#[tokio::test]
async fn test_failed_bond_with_unknown_node() {
    let net = Arc::new(MockTransport::new());
    let tab = make_table(NodeType::En, &net, &[], &[]);
    let peer = make_node(1, NodeType::En);
    net.fail_ping(peer.id);

    let res = tab.bond(false, peer.id, addr(&peer), peer.tcp, NodeType::En).await;
    assert_eq!(res, Err(DiscoveryError::Timeout));
    assert!(!entry_ids(&tab).contains(&peer.id));
}

// =============================================================================
// Routing
// =============================================================================

#[tokio::test]
async fn test_boot_nodes_fan_out_to_every_store() {
    let net = Arc::new(MockTransport::new());
    let tab = make_table(NodeType::Bn, &net, &[], &[]);
    let boot = make_node(1, NodeType::Bn);

    tab.create_update_node_on_table(boot.clone()).unwrap();
    for t in [NodeType::Cn, NodeType::Pn, NodeType::En, NodeType::Bn] {
        let store = tab.storage(t).unwrap();
        assert!(store.node_all().iter().any(|n| n.id == boot.id), "missing in {t} store");
    }

    tab.delete_node_from_table(&boot).unwrap();
    assert!(!entry_ids(&tab).contains(&boot.id));
}

#[tokio::test]
async fn test_unknown_type_is_never_admitted() {
    let net = Arc::new(MockTransport::new());
    let tab = make_table(NodeType::En, &net, &[], &[]);
    tab.add(make_node(1, NodeType::Unknown));
    assert!(tab.is_empty());
}

#[tokio::test]
async fn test_create_update_rejects_unsupported_type() {
    let net = Arc::new(MockTransport::new());
    let tab = make_table(NodeType::Cn, &net, &[], &[]);
    let en = make_node(1, NodeType::En);
    assert_eq!(
        tab.create_update_node_on_table(en),
        Err(DiscoveryError::UnsupportedNodeType(NodeType::En))
    );
}

#[tokio::test]
async fn test_retrieve_nodes_strips_boot_nodes() {
    let net = Arc::new(MockTransport::new());
    let tab = make_table(NodeType::En, &net, &[], &[]);
    let ens = make_nodes(0..4, NodeType::En);
    let boot = make_node(10, NodeType::Bn);
    for n in &ens {
        tab.add(n.clone());
    }
    tab.add(boot.clone());

    let target = NodeId::random().sha();
    let got = tab.retrieve_nodes(&target, NodeType::En, BUCKET_SIZE);
    assert_eq!(got.len(), ens.len());
    assert!(got.iter().all(|n| n.node_type == NodeType::En));

    let boots = tab.retrieve_nodes(&target, NodeType::Bn, BUCKET_SIZE);
    assert_eq!(boots.iter().map(|n| n.id).collect::<Vec<_>>(), vec![boot.id]);

    assert!(tab.retrieve_nodes(&target, NodeType::Cn, BUCKET_SIZE).is_empty());
}

#[tokio::test]
async fn test_read_random_nodes_waits_for_init() {
    let net = Arc::new(MockTransport::new());
    let tab = make_table(NodeType::En, &net, &[], &[]);
    tab.add(make_node(1, NodeType::En));

    assert!(tab.read_random_nodes(10, NodeType::En).is_empty());
    tab.refresh().await;
    assert_eq!(tab.read_random_nodes(10, NodeType::En).len(), 1);
}

#[tokio::test]
async fn test_read_random_nodes_distinct() {
    let net = Arc::new(MockTransport::new());
    let tab = make_table(NodeType::En, &net, &[], &[]);
    for n in make_nodes(0..40, NodeType::En) {
        tab.add(n);
    }
    tab.refresh().await;

    let got = tab.read_random_nodes(10, NodeType::En);
    let ids: HashSet<NodeId> = got.iter().map(|n| n.id).collect();
    assert_eq!(got.len(), 10);
    assert_eq!(ids.len(), 10);
}

#[tokio::test]
async fn test_resolve_known_node() {
    let net = Arc::new(MockTransport::new());
    let tab = make_table(NodeType::En, &net, &[], &[]);
    let peer = make_node(1, NodeType::En);
    tab.add(peer.clone());

    assert_eq!(tab.resolve(peer.id, NodeType::En).await.map(|n| n.id), Some(peer.id));
}

// =============================================================================
// Lookups
// =============================================================================

#[tokio::test]
async fn test_endpoint_refresh_discovers_through_boot_node() {
    let net = Arc::new(MockTransport::new());
    let boot = make_keyed_node("10.0.0.1", NodeType::Bn);
    let ens = make_nodes(0..8, NodeType::En);
    net.set_neighbors(boot.id, ens.clone());
    let tab = make_table(NodeType::En, &net, &[boot.clone()], &[]);

    tab.refresh().await;
    let known: HashSet<NodeId> = ens.iter().map(|n| n.id).collect();
    let store = tab.storage(NodeType::En).unwrap();
    assert!(known.iter().all(|id| store.node_all().iter().any(|n| n.id == *id)));
    assert!(net.find_node_calls().contains(&(boot.id, NodeType::En)));

    let found = tab.lookup(NodeId::random(), NodeType::En).await;
    assert!(!found.is_empty());
    assert!(found.iter().all(|n| known.contains(&n.id)));
}

#[tokio::test]
async fn test_consensus_get_nodes_asks_boot_nodes() {
    let net = Arc::new(MockTransport::new());
    let boot = make_keyed_node("10.0.0.1", NodeType::Bn);
    let cns = make_nodes(0..6, NodeType::Cn);
    net.set_neighbors(boot.id, cns.clone());
    let tab = make_table(NodeType::Cn, &net, &[boot.clone()], &[]);
    tab.refresh().await;

    let got = tab.get_nodes(NodeType::Cn, 3).await;
    assert_eq!(got.len(), 3);
    assert!(got.iter().all(|n| n.node_type == NodeType::Cn));
    assert!(net.find_node_calls().contains(&(boot.id, NodeType::Cn)));
    assert!(tab.storage(NodeType::Cn).unwrap().len() > 3);
}

#[tokio::test]
async fn test_unsupported_lookup_is_empty() {
    let net = Arc::new(MockTransport::new());
    let tab = make_table(NodeType::Cn, &net, &[], &[]);
    assert!(tab.lookup(NodeId::random(), NodeType::En).await.is_empty());
    assert!(tab.get_nodes(NodeType::Pn, 4).await.is_empty());
}

#[tokio::test]
async fn test_findnode_failures_evict_peer() {
    let net = Arc::new(MockTransport::new());
    let boot = make_keyed_node("10.0.0.1", NodeType::Bn);
    net.fail_find_node(boot.id);
    let tab = make_table(NodeType::En, &net, &[boot.clone()], &[]);
    tab.refresh().await;

    let mut evicted = !entry_ids(&tab).contains(&boot.id);
    for _ in 0..MAX_FINDNODE_FAILURES {
        if evicted {
            break;
        }
        tab.lookup(NodeId::random(), NodeType::En).await;
        evicted = !entry_ids(&tab).contains(&boot.id);
    }
    assert!(evicted);
}

// =============================================================================
// Revalidation
// =============================================================================

#[tokio::test]
async fn test_revalidation_swaps_in_replacement() {
    let net = Arc::new(MockTransport::new());
    let tab = make_table(NodeType::Pn, &net, &[], &[]);
    let self_id = tab.self_node().id;
    let store = KademliaStorage::new(NodeType::En, true, self_id, Arc::clone(tab.db()));

    let bi = N_BUCKETS - 1;
    let own = self_id.sha();
    let mut nodes = Vec::new();
    let mut i = 0;
    while nodes.len() < BUCKET_SIZE + 1 {
        let n = make_node(i, NodeType::En);
        i += 1;
        if bucket_index(&own, n.sha()) == bi {
            nodes.push(n);
        }
    }
    for n in &nodes {
        store.add(n.clone());
    }
    let oldest = nodes[0].clone();
    let spare = nodes[BUCKET_SIZE].clone();
    net.fail_ping(oldest.id);

    store.do_revalidate(&tab).await;

    let bucket = store.bucket(bi).unwrap();
    assert_eq!(bucket.entries().len(), BUCKET_SIZE);
    assert_eq!(bucket.entries().last().map(|n| n.id), Some(spare.id));
    assert!(bucket.entries().iter().all(|n| n.id != oldest.id));
    assert!(bucket.replacements().is_empty());
    // The dropped node's address no longer counts against the quotas.
    assert_eq!(store.counted_ips(), BUCKET_SIZE);
    assert_eq!(bucket.counted_ips(), BUCKET_SIZE);
    assert!(!bucket.ips.contains(oldest.ip));
    assert!(bucket.ips.contains(spare.ip));
}

#[tokio::test]
async fn test_revalidation_bumps_live_node() {
    let net = Arc::new(MockTransport::new());
    let tab = make_table(NodeType::En, &net, &[], &[]);
    let self_id = tab.self_node().id;
    let store = KademliaStorage::new(NodeType::En, true, self_id, Arc::clone(tab.db()));

    let bi = N_BUCKETS - 1;
    let own = self_id.sha();
    let mut nodes = Vec::new();
    let mut i = 0;
    while nodes.len() < 2 {
        let n = make_node(i, NodeType::En);
        i += 1;
        if bucket_index(&own, n.sha()) == bi {
            nodes.push(n);
        }
    }
    store.add(nodes[0].clone());
    store.add(nodes[1].clone());

    store.do_revalidate(&tab).await;
    let bucket = store.bucket(bi).unwrap();
    assert_eq!(bucket.entries()[0].id, nodes[0].id);
    assert_eq!(net.ping_count(&nodes[0].id), 1);
}

#[tokio::test]
async fn test_flat_revalidation_drops_dead_node() {
    let net = Arc::new(MockTransport::new());
    let tab = make_table(NodeType::Cn, &net, &[], &[]);
    let peer = make_node(1, NodeType::Cn);
    tab.add(peer.clone());
    net.fail_ping(peer.id);

    tab.storage(NodeType::Cn).unwrap().do_revalidate(&tab).await;
    assert!(tab.storage(NodeType::Cn).unwrap().is_empty());
}

// =============================================================================
// Authorization and administration
// =============================================================================

#[tokio::test]
async fn test_boot_node_authorization() {
    let net = Arc::new(MockTransport::new());
    let allowed = make_node(1, NodeType::Cn);
    let stranger = make_node(2, NodeType::Cn);
    let tab = make_table(NodeType::Bn, &net, &[], &[allowed.clone()]);

    assert!(tab.is_authorized(&allowed.id, NodeType::Cn));
    assert!(!tab.is_authorized(&stranger.id, NodeType::Cn));
    // The PN list is still empty, so every proxy node may join.
    assert!(tab.is_authorized(&stranger.id, NodeType::Pn));
    assert!(tab.is_authorized(&stranger.id, NodeType::En));

    tab.add(stranger.clone());
    assert!(!entry_ids(&tab).contains(&stranger.id));

    tab.put_authorized_nodes(&[stranger.clone()]);
    assert!(tab.is_authorized(&stranger.id, NodeType::Cn));
    assert_eq!(tab.get_authorized_nodes().len(), 2);

    tab.delete_authorized_nodes(&[allowed.clone(), stranger.clone()]);
    assert!(tab.get_authorized_nodes().is_empty());
    assert!(tab.is_authorized(&NodeId::random(), NodeType::Cn));
}

#[tokio::test]
async fn test_db_admin_crud() {
    let net = Arc::new(MockTransport::new());
    let tab = make_table(NodeType::En, &net, &[], &[]);
    let peer = make_node(1, NodeType::En);

    assert_eq!(tab.get_node_from_db(&peer.id), Err(DiscoveryError::NodeNotFound));
    tab.create_update_node_on_db(&peer).unwrap();
    assert_eq!(tab.get_node_from_db(&peer.id).unwrap().udp, peer.udp);

    tab.delete_node_from_db(&peer).unwrap();
    assert_eq!(tab.get_node_from_db(&peer.id), Err(DiscoveryError::NodeNotFound));
}

#[tokio::test]
async fn test_replacements_listed() {
    let net = Arc::new(MockTransport::new());
    let tab = make_table(NodeType::En, &net, &[], &[]);
    let own = tab.self_node().id.sha();
    let mut i = 0;
    let mut in_last = 0;
    while in_last < BUCKET_SIZE + 2 {
        let n = make_node(i, NodeType::En);
        i += 1;
        if bucket_index(&own, n.sha()) == N_BUCKETS - 1 {
            in_last += 1;
            tab.add(n);
        }
    }
    assert_eq!(tab.get_replacements().len(), 2);
}

// =============================================================================
// Shutdown
// =============================================================================

#[tokio::test]
async fn test_close_stops_transport() {
    let net = Arc::new(MockTransport::new());
    let tab = make_table(NodeType::En, &net, &[], &[]);

    Discovery::close(tab.as_ref()).await;
    assert!(net.is_closed());

    // Idempotent, and refresh no longer blocks.
    Discovery::close(tab.as_ref()).await;
    tab.refresh().await;
}
