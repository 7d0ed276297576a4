use super::*;
use shared_crypto::Secp256k1KeyPair;

fn make_node_id() -> NodeId {
    let key = Secp256k1KeyPair::generate();
    NodeId::from_public_key(&key.public_key().unwrap())
}

fn make_node(ip: &str, udp: u16, tcp: u16, node_type: NodeType) -> Node {
    Node::new(make_node_id(), ip.parse().unwrap(), udp, tcp, node_type)
}

// =============================================================================
// NodeId
// =============================================================================

#[test]
fn test_node_id_hex_round_trip() {
    let id = make_node_id();
    let text = id.to_string();
    assert_eq!(text.len(), 128);
    assert_eq!(NodeId::from_hex(&text).unwrap(), id);
    assert_eq!(NodeId::from_hex(&format!("0x{}", text)).unwrap(), id);
}

#[test]
fn test_node_id_rejects_wrong_length() {
    assert!(matches!(
        NodeId::from_hex("abcd"),
        Err(ParseNodeError::InvalidId(_))
    ));
    assert!(NodeId::from_slice(&[0u8; 63]).is_err());
}

#[test]
fn test_node_id_sha_is_keccak_of_id() {
    let id = make_node_id();
    assert_eq!(id.sha(), keccak256(id.as_bytes()));
}

#[test]
fn test_node_type_wire_mapping() {
    for role in NodeType::ROLES {
        assert_eq!(NodeType::from(role.as_u8()), role);
    }
    assert_eq!(NodeType::from(0), NodeType::Unknown);
    assert_eq!(NodeType::from(200), NodeType::Unknown);
}

#[test]
fn test_node_type_parse_and_display() {
    assert_eq!("cn".parse::<NodeType>().unwrap(), NodeType::Cn);
    assert_eq!("BN".parse::<NodeType>().unwrap(), NodeType::Bn);
    assert!("xx".parse::<NodeType>().is_err());
    assert_eq!(NodeType::En.to_string(), "EN");
}

// =============================================================================
// Node records
// =============================================================================

#[test]
fn test_node_normalizes_mapped_ipv4() {
    let n = make_node("::ffff:10.3.58.6", 30303, 30303, NodeType::Pn);
    assert_eq!(n.ip, "10.3.58.6".parse::<IpAddr>().unwrap());
}

#[test]
fn test_node_equality_ignores_added_at() {
    let a = make_node("10.0.0.1", 30303, 30303, NodeType::En);
    let mut b = a.clone();
    b.set_added_at(SystemTime::now());
    assert_eq!(a, b);
    assert!(a.added_at().is_none());
}

#[test]
fn test_validate_complete() {
    assert!(make_node("10.0.0.1", 30303, 30303, NodeType::En)
        .validate_complete()
        .is_ok());

    assert_eq!(
        make_node("0.0.0.0", 30303, 30303, NodeType::En).validate_complete(),
        Err(DiscoveryError::IncompleteNode("missing IP address"))
    );
    assert_eq!(
        make_node("10.0.0.1", 0, 30303, NodeType::En).validate_complete(),
        Err(DiscoveryError::IncompleteNode("missing UDP port"))
    );
    assert_eq!(
        make_node("10.0.0.1", 30303, 0, NodeType::En).validate_complete(),
        Err(DiscoveryError::IncompleteNode("missing TCP port"))
    );
    assert!(matches!(
        make_node("224.0.0.1", 30303, 30303, NodeType::En).validate_complete(),
        Err(DiscoveryError::InvalidNode(_))
    ));

    let off_curve = Node::new(
        NodeId::new([0xff; 64]),
        "10.0.0.1".parse().unwrap(),
        30303,
        30303,
        NodeType::En,
    );
    assert!(matches!(
        off_curve.validate_complete(),
        Err(DiscoveryError::Crypto(_))
    ));
}

// =============================================================================
// URI form
// =============================================================================

#[test]
fn test_uri_full_form() {
    let id = make_node_id();
    let uri = format!("kni://{}@10.3.58.6:30303?discport=30301&ntype=bn", id);
    let node: Node = uri.parse().unwrap();

    assert_eq!(node.id, id);
    assert_eq!(node.ip, "10.3.58.6".parse::<IpAddr>().unwrap());
    assert_eq!(node.tcp, 30303);
    assert_eq!(node.udp, 30301);
    assert_eq!(node.node_type, NodeType::Bn);
    assert_eq!(node.to_string(), uri);
}

#[test]
fn test_uri_defaults() {
    let id = make_node_id();
    let node: Node = format!("kni://{}@127.0.0.1:52150", id).parse().unwrap();
    assert_eq!(node.udp, 52150);
    assert_eq!(node.tcp, 52150);
    assert_eq!(node.node_type, NodeType::Unknown);
    assert_eq!(node.to_string(), format!("kni://{}@127.0.0.1:52150", id));
}

#[test]
fn test_uri_ipv6_host() {
    let id = make_node_id();
    let uri = format!("kni://{}@[::1]:30303?ntype=en", id);
    let node: Node = uri.parse().unwrap();
    assert_eq!(node.ip, "::1".parse::<IpAddr>().unwrap());
    assert_eq!(node.to_string(), uri);
}

#[test]
fn test_uri_without_host_is_incomplete() {
    let id = make_node_id();
    let node: Node = format!("kni://{}", id).parse().unwrap();
    assert!(node.incomplete());
    assert_eq!(node.to_string(), format!("kni://{}", id));
}

#[test]
fn test_uri_errors() {
    let id = make_node_id();
    assert_eq!(
        format!("enode://{}@1.2.3.4:1", id).parse::<Node>(),
        Err(ParseNodeError::InvalidScheme)
    );
    assert!(matches!(
        "kni://1234@1.2.3.4:30303".parse::<Node>(),
        Err(ParseNodeError::InvalidId(_))
    ));
    assert!(matches!(
        format!("kni://{}@foo.example:30303", id).parse::<Node>(),
        Err(ParseNodeError::InvalidHost(_))
    ));
    assert!(matches!(
        format!("kni://{}@1.2.3.4:30303?discport=99999", id).parse::<Node>(),
        Err(ParseNodeError::InvalidPort(_))
    ));
    assert!(matches!(
        format!("kni://{}@1.2.3.4:30303?ntype=zz", id).parse::<Node>(),
        Err(ParseNodeError::InvalidNodeType(_))
    ));
}
