use std::net::IpAddr;

use shared_crypto::Secp256k1KeyPair;

use super::*;
use crate::domain::NetError;
use crate::ports::inbound::Discovery;

fn make_rpc_node(ip: &str, udp: u16) -> RpcNode {
    let key = Secp256k1KeyPair::generate();
    RpcNode {
        ip: ip.parse().unwrap(),
        udp,
        tcp: udp,
        id: NodeId::from_public_key(&key.public_key().unwrap()),
        node_type: NodeType::En,
    }
}

fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

#[test]
fn test_node_from_rpc_accepts_valid_record() {
    let rn = make_rpc_node("8.8.8.8", 30303);
    let node = node_from_rpc(addr("1.2.3.4:30303"), &rn, None).unwrap();
    assert_eq!(node.id, rn.id);
    assert_eq!(node.ip, "8.8.8.8".parse::<IpAddr>().unwrap());
    assert_eq!(node.node_type, NodeType::En);
}

#[test]
fn test_node_from_rpc_rejects_low_port() {
    let rn = make_rpc_node("8.8.8.8", 1024);
    assert_eq!(
        node_from_rpc(addr("1.2.3.4:30303"), &rn, None),
        Err(DiscoveryError::LowPort)
    );
}

#[test]
fn test_node_from_rpc_rejects_lan_relay_from_internet() {
    let rn = make_rpc_node("192.168.1.5", 30303);
    assert!(matches!(
        node_from_rpc(addr("8.8.8.8:30303"), &rn, None),
        Err(DiscoveryError::RelayIp(NetError::Lan))
    ));
}

#[test]
fn test_node_from_rpc_applies_net_restrict() {
    let restrict = Netlist::parse("10.0.0.0/8").unwrap();
    let inside = make_rpc_node("10.1.2.3", 30303);
    let outside = make_rpc_node("11.1.2.3", 30303);
    let sender = addr("10.0.0.1:30303");

    assert!(node_from_rpc(sender, &inside, Some(&restrict)).is_ok());
    assert_eq!(
        node_from_rpc(sender, &outside, Some(&restrict)),
        Err(DiscoveryError::Restricted)
    );
}

#[test]
fn test_node_from_rpc_rejects_invalid_id() {
    let mut rn = make_rpc_node("8.8.8.8", 30303);
    rn.id = NodeId::new([0u8; 64]);
    assert!(node_from_rpc(addr("1.2.3.4:30303"), &rn, None).is_err());
}

#[test]
fn test_is_temporary() {
    assert!(is_temporary(&io::Error::from(io::ErrorKind::WouldBlock)));
    assert!(!is_temporary(&io::Error::from(io::ErrorKind::PermissionDenied)));
}

#[tokio::test]
async fn test_listen_udp_reports_self_endpoint() {
    let config = Config::for_testing(NodeType::Cn);
    let (tab, transport) = listen_udp(config).await.unwrap();

    let local = transport.local_addr().unwrap();
    assert_eq!(transport.our_endpoint().udp, local.port());
    assert_eq!(transport.our_endpoint().node_type, NodeType::Cn);
    assert_eq!(tab.self_node().udp, local.port());

    Discovery::close(tab.as_ref()).await;
    assert!(transport.is_closed());
}

#[tokio::test]
async fn test_ping_to_silent_peer_times_out() {
    let (tab, transport) = listen_udp(Config::for_testing(NodeType::En)).await.unwrap();
    // Nobody listens here.
    let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let to = silent.local_addr().unwrap();

    let res = transport.ping(NodeId::random(), to).await;
    assert_eq!(res, Err(DiscoveryError::Timeout));

    Discovery::close(tab.as_ref()).await;
    assert_eq!(
        transport.ping(NodeId::random(), to).await,
        Err(DiscoveryError::Closed)
    );
}
