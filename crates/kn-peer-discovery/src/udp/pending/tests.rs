use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use super::*;
use crate::wire::{Neighbors, Pong, RpcNode};

fn make_queue() -> (PendingQueue, watch::Sender<bool>) {
    let (closing_tx, closing_rx) = watch::channel(false);
    (PendingQueue::spawn(closing_rx), closing_tx)
}

fn make_neighbors(target_type: NodeType, n: usize) -> Packet {
    let node = RpcNode {
        ip: "10.0.0.1".parse().unwrap(),
        udp: 30303,
        tcp: 30303,
        id: NodeId::random(),
        node_type: target_type,
    };
    Packet::Neighbors(Neighbors {
        target_type,
        nodes: vec![node; n],
        expiration: u64::MAX,
    })
}

fn make_pong(tok: u8) -> Packet {
    Packet::Pong(Pong {
        to: crate::wire::Endpoint::new("127.0.0.1:1".parse().unwrap(), 0, NodeType::Unknown),
        reply_tok: vec![tok; 32],
        expiration: u64::MAX,
    })
}

fn counting_callback(total: Arc<AtomicUsize>, want: usize) -> Callback {
    Box::new(move |p: &Packet| {
        let Packet::Neighbors(n) = p else {
            return false;
        };
        total.fetch_add(n.nodes.len(), Ordering::SeqCst) + n.nodes.len() >= want
    })
}

#[tokio::test]
async fn test_reply_completes_matching_entry() {
    let (queue, _closing) = make_queue();
    let peer = NodeId::random();

    let rx = queue
        .add(peer, PacketType::Pong, NodeType::Unknown, Box::new(|p: &Packet| {
            matches!(p, Packet::Pong(pong) if pong.reply_tok == vec![7u8; 32])
        }))
        .await;

    assert!(queue.handle_reply(peer, PacketType::Pong, make_pong(1)).await);
    assert!(queue.handle_reply(peer, PacketType::Pong, make_pong(7)).await);
    assert_eq!(wait(rx).await, Ok(()));

    // Entry is gone once completed.
    assert!(!queue.handle_reply(peer, PacketType::Pong, make_pong(7)).await);
}

#[tokio::test]
async fn test_reply_from_other_peer_does_not_match() {
    let (queue, _closing) = make_queue();
    let peer = NodeId::random();
    let _rx = queue
        .add(peer, PacketType::Pong, NodeType::Unknown, Box::new(|_: &Packet| true))
        .await;

    assert!(!queue.handle_reply(NodeId::random(), PacketType::Pong, make_pong(0)).await);
    assert!(!queue.handle_reply(peer, PacketType::Ping, make_pong(0)).await);
}

#[tokio::test]
async fn test_neighbors_matched_by_target_type() {
    let (queue, _closing) = make_queue();
    let peer = NodeId::random();
    let en_total = Arc::new(AtomicUsize::new(0));
    let cn_total = Arc::new(AtomicUsize::new(0));

    let en_rx = queue
        .add(peer, PacketType::Neighbors, NodeType::En, counting_callback(Arc::clone(&en_total), 16))
        .await;
    let cn_rx = queue
        .add(peer, PacketType::Neighbors, NodeType::Cn, counting_callback(Arc::clone(&cn_total), 4))
        .await;

    // Datagrams for the two lookups arrive interleaved.
    assert!(queue.handle_reply(peer, PacketType::Neighbors, make_neighbors(NodeType::En, 12)).await);
    assert!(queue.handle_reply(peer, PacketType::Neighbors, make_neighbors(NodeType::Cn, 4)).await);
    assert_eq!(wait(cn_rx).await, Ok(()));
    assert_eq!(en_total.load(Ordering::SeqCst), 12);

    assert!(queue.handle_reply(peer, PacketType::Neighbors, make_neighbors(NodeType::En, 4)).await);
    assert_eq!(wait(en_rx).await, Ok(()));
    assert_eq!(en_total.load(Ordering::SeqCst), 16);
    assert_eq!(cn_total.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_out_of_order_neighbors_complete_their_own_requests() {
    let (queue, _closing) = make_queue();
    let peers: Vec<NodeId> = (0..5).map(|_| NodeId::random()).collect();

    let mut waiting = Vec::new();
    for peer in &peers {
        let rx = queue
            .add(*peer, PacketType::Neighbors, NodeType::En, Box::new(|p: &Packet| {
                matches!(p, Packet::Neighbors(n) if n.target_type == NodeType::En)
            }))
            .await;
        waiting.push(rx);
    }

    for peer in peers.iter().rev() {
        assert!(queue.handle_reply(*peer, PacketType::Neighbors, make_neighbors(NodeType::En, 3)).await);
    }
    for rx in waiting {
        assert_eq!(wait(rx).await, Ok(()));
    }

    for peer in &peers {
        assert!(!queue.handle_reply(*peer, PacketType::Neighbors, make_neighbors(NodeType::En, 3)).await);
    }
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_request_times_out() {
    let (queue, _closing) = make_queue();
    let rx = queue
        .add(NodeId::random(), PacketType::Pong, NodeType::Unknown, Box::new(|_: &Packet| true))
        .await;

    let started = Instant::now();
    assert_eq!(wait(rx).await, Err(DiscoveryError::Timeout));
    assert!(started.elapsed() >= RESP_TIMEOUT);
}

#[tokio::test(start_paused = true)]
async fn test_partial_reply_keeps_entry_until_timeout() {
    let (queue, _closing) = make_queue();
    let peer = NodeId::random();
    let total = Arc::new(AtomicUsize::new(0));
    let rx = queue
        .add(peer, PacketType::Neighbors, NodeType::En, counting_callback(Arc::clone(&total), 16))
        .await;

    assert!(queue.handle_reply(peer, PacketType::Neighbors, make_neighbors(NodeType::En, 3)).await);
    assert_eq!(wait(rx).await, Err(DiscoveryError::Timeout));
    assert_eq!(total.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_far_deadline_fails_with_clock_warp() {
    let (queue, _closing) = make_queue();
    let rx = queue
        .add_with_deadline(
            NodeId::random(),
            PacketType::Pong,
            NodeType::Unknown,
            Some(Instant::now() + Duration::from_secs(60)),
            Box::new(|_: &Packet| true),
        )
        .await;
    assert_eq!(wait(rx).await, Err(DiscoveryError::ClockWarp));
}

#[tokio::test]
async fn test_closing_fails_outstanding_requests() {
    let (queue, closing) = make_queue();
    let rx = queue
        .add(NodeId::random(), PacketType::Ping, NodeType::Unknown, Box::new(|_: &Packet| true))
        .await;

    closing.send_replace(true);
    assert_eq!(wait(rx).await, Err(DiscoveryError::Closed));

    // Registrations after closing fail right away.
    let late = queue
        .add(NodeId::random(), PacketType::Ping, NodeType::Unknown, Box::new(|_: &Packet| true))
        .await;
    assert_eq!(wait(late).await, Err(DiscoveryError::Closed));
    assert!(!queue.handle_reply(NodeId::random(), PacketType::Ping, make_pong(0)).await);
}
