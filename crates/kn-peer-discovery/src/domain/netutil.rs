//! Network address policy: LAN and special-purpose ranges, relay checks,
//! CIDR allow-lists and per-subnet counters.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use thiserror::Error;

/// Address policy violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetError {
    /// 0.0.0.0 or ::
    #[error("is unspecified")]
    Unspecified,
    /// Multicast, documentation, benchmarking or other reserved range
    #[error("is special network")]
    Special,
    /// Loopback relayed by a non-loopback sender
    #[error("is loopback")]
    Loopback,
    /// LAN address relayed by a sender outside the LAN
    #[error("is LAN")]
    Lan,
    /// Unparseable CIDR string
    #[error("invalid CIDR mask {0:?}")]
    InvalidCidr(String),
}

const LAN4: &[(Ipv4Addr, u8)] = &[
    (Ipv4Addr::new(0, 0, 0, 0), 8),
    (Ipv4Addr::new(10, 0, 0, 0), 8),
    (Ipv4Addr::new(172, 16, 0, 0), 12),
    (Ipv4Addr::new(192, 168, 0, 0), 16),
];

const LAN6: &[(Ipv6Addr, u8)] = &[
    (Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0), 10),
    (Ipv6Addr::new(0xfc00, 0, 0, 0, 0, 0, 0, 0), 7),
];

const SPECIAL4: &[(Ipv4Addr, u8)] = &[
    (Ipv4Addr::new(192, 0, 0, 0), 29),
    (Ipv4Addr::new(192, 0, 0, 9), 32),
    (Ipv4Addr::new(192, 0, 0, 170), 32),
    (Ipv4Addr::new(192, 0, 0, 171), 32),
    (Ipv4Addr::new(192, 0, 2, 0), 24),
    (Ipv4Addr::new(192, 31, 196, 0), 24),
    (Ipv4Addr::new(192, 52, 193, 0), 24),
    (Ipv4Addr::new(192, 88, 99, 0), 24),
    (Ipv4Addr::new(192, 175, 48, 0), 24),
    (Ipv4Addr::new(198, 18, 0, 0), 15),
    (Ipv4Addr::new(198, 51, 100, 0), 24),
    (Ipv4Addr::new(203, 0, 113, 0), 24),
    (Ipv4Addr::new(255, 255, 255, 255), 32),
];

const SPECIAL6: &[(Ipv6Addr, u8)] = &[
    (Ipv6Addr::new(0x0100, 0, 0, 0, 0, 0, 0, 0), 64),
    (Ipv6Addr::new(0x2001, 0, 0, 0, 0, 0, 0, 0), 32),
    (Ipv6Addr::new(0x2001, 0x1, 0, 0, 0, 0, 0, 1), 128),
    (Ipv6Addr::new(0x2001, 0x2, 0, 0, 0, 0, 0, 0), 48),
    (Ipv6Addr::new(0x2001, 0x3, 0, 0, 0, 0, 0, 0), 32),
    (Ipv6Addr::new(0x2001, 0x4, 0x112, 0, 0, 0, 0, 0), 48),
    (Ipv6Addr::new(0x2001, 0x5, 0, 0, 0, 0, 0, 0), 32),
    (Ipv6Addr::new(0x2001, 0x10, 0, 0, 0, 0, 0, 0), 28),
    (Ipv6Addr::new(0x2001, 0x20, 0, 0, 0, 0, 0, 0), 28),
    (Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 0), 32),
    (Ipv6Addr::new(0x2002, 0, 0, 0, 0, 0, 0, 0), 16),
];

fn mask_v4(ip: Ipv4Addr, prefix: u8) -> u32 {
    let mask = match prefix {
        0 => 0,
        p if p >= 32 => u32::MAX,
        p => u32::MAX << (32 - p),
    };
    u32::from(ip) & mask
}

fn mask_v6(ip: Ipv6Addr, prefix: u8) -> u128 {
    let mask = match prefix {
        0 => 0,
        p if p >= 128 => u128::MAX,
        p => u128::MAX << (128 - p),
    };
    u128::from(ip) & mask
}

fn in_v4(ip: Ipv4Addr, nets: &[(Ipv4Addr, u8)]) -> bool {
    nets.iter()
        .any(|(net, prefix)| mask_v4(ip, *prefix) == mask_v4(*net, *prefix))
}

fn in_v6(ip: Ipv6Addr, nets: &[(Ipv6Addr, u8)]) -> bool {
    nets.iter()
        .any(|(net, prefix)| mask_v6(ip, *prefix) == mask_v6(*net, *prefix))
}

/// Reports whether `ip` is a loopback or private network address.
///
/// LAN addresses are exempt from subnet quotas.
pub fn is_lan(ip: IpAddr) -> bool {
    let ip = ip.to_canonical();
    if ip.is_loopback() {
        return true;
    }
    match ip {
        IpAddr::V4(v4) => in_v4(v4, LAN4),
        IpAddr::V6(v6) => in_v6(v6, LAN6),
    }
}

/// Reports whether `ip` is multicast or lies in a reserved special-purpose
/// range (documentation, benchmarking, relays and the like).
pub fn is_special_network(ip: IpAddr) -> bool {
    let ip = ip.to_canonical();
    if ip.is_multicast() {
        return true;
    }
    match ip {
        IpAddr::V4(v4) => in_v4(v4, SPECIAL4),
        IpAddr::V6(v6) => in_v6(v6, SPECIAL6),
    }
}

/// Checks whether `sender` may legitimately relay a node at `addr`.
///
/// A public sender must not point us at loopback or LAN addresses, and no
/// sender may relay unspecified or special-purpose addresses.
pub fn check_relay_ip(sender: IpAddr, addr: IpAddr) -> Result<(), NetError> {
    let sender = sender.to_canonical();
    let addr = addr.to_canonical();
    if addr.is_unspecified() {
        return Err(NetError::Unspecified);
    }
    if is_special_network(addr) {
        return Err(NetError::Special);
    }
    if addr.is_loopback() && !sender.is_loopback() {
        return Err(NetError::Loopback);
    }
    if is_lan(addr) && !is_lan(sender) {
        return Err(NetError::Lan);
    }
    Ok(())
}

// =============================================================================
// CIDR allow-list
// =============================================================================

/// A single CIDR network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpNet {
    addr: IpAddr,
    prefix: u8,
}

impl IpNet {
    /// Create a network, rejecting prefixes longer than the address.
    pub fn new(addr: IpAddr, prefix: u8) -> Result<Self, NetError> {
        let addr = addr.to_canonical();
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(NetError::InvalidCidr(format!("{}/{}", addr, prefix)));
        }
        Ok(Self { addr, prefix })
    }

    /// Reports whether `ip` lies inside the network.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip.to_canonical()) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                mask_v4(ip, self.prefix) == mask_v4(net, self.prefix)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                mask_v6(ip, self.prefix) == mask_v6(net, self.prefix)
            }
            _ => false,
        }
    }
}

impl FromStr for IpNet {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || NetError::InvalidCidr(s.to_string());
        let (addr, prefix) = s.split_once('/').ok_or_else(invalid)?;
        let addr: IpAddr = addr.trim().parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.trim().parse().map_err(|_| invalid())?;
        Self::new(addr, prefix).map_err(|_| invalid())
    }
}

impl fmt::Display for IpNet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// A list of CIDR networks, used to restrict which relayed nodes we accept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Netlist(Vec<IpNet>);

impl Netlist {
    /// Create an empty list.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Parse a comma-separated list such as `"10.0.0.0/8, 192.168.0.0/16"`.
    pub fn parse(s: &str) -> Result<Self, NetError> {
        let mut list = Self::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            list.add(part)?;
        }
        Ok(list)
    }

    /// Append a CIDR network.
    pub fn add(&mut self, cidr: &str) -> Result<(), NetError> {
        self.0.push(cidr.parse()?);
        Ok(())
    }

    /// Reports whether `ip` lies in any of the networks.
    pub fn contains(&self, ip: IpAddr) -> bool {
        self.0.iter().any(|net| net.contains(ip))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromStr for Netlist {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Netlist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        write!(f, "{}", parts.join(", "))
    }
}

// =============================================================================
// Per-subnet counter
// =============================================================================

/// Counts addresses per subnet and refuses additions beyond `limit`.
#[derive(Debug, Clone)]
pub struct DistinctNetSet {
    subnet: u8,
    limit: u32,
    members: HashMap<IpAddr, u32>,
}

impl DistinctNetSet {
    /// Create a counter for `/subnet` prefixes allowing `limit` members each.
    pub fn new(subnet: u8, limit: u32) -> Self {
        Self {
            subnet,
            limit,
            members: HashMap::new(),
        }
    }

    /// Count `ip`, returning false if its subnet is already at the limit.
    pub fn add(&mut self, ip: IpAddr) -> bool {
        let key = self.key(ip);
        let n = self.members.entry(key).or_insert(0);
        if *n < self.limit {
            *n += 1;
            true
        } else {
            if *n == 0 {
                self.members.remove(&key);
            }
            false
        }
    }

    /// Release one count for the subnet of `ip`.
    pub fn remove(&mut self, ip: IpAddr) {
        let key = self.key(ip);
        if let Some(n) = self.members.get_mut(&key) {
            if *n <= 1 {
                self.members.remove(&key);
            } else {
                *n -= 1;
            }
        }
    }

    /// Reports whether the subnet of `ip` has any members.
    pub fn contains(&self, ip: IpAddr) -> bool {
        self.members.contains_key(&self.key(ip))
    }

    /// Number of members counted for the subnet of `ip`.
    pub fn count(&self, ip: IpAddr) -> u32 {
        self.members.get(&self.key(ip)).copied().unwrap_or(0)
    }

    /// Total number of counted addresses.
    pub fn len(&self) -> usize {
        self.members.values().map(|n| *n as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    fn key(&self, ip: IpAddr) -> IpAddr {
        match ip.to_canonical() {
            IpAddr::V4(v4) => IpAddr::V4(Ipv4Addr::from(mask_v4(v4, self.subnet))),
            IpAddr::V6(v6) => IpAddr::V6(Ipv6Addr::from(mask_v6(v6, self.subnet))),
        }
    }
}
