//! Tunnel Configuration
//!
//! Interface and peer sections of a WireGuard tunnel profile, plus the
//! validation the OS profile store expects before anything is saved.

use crate::keys::{PresharedKey, PrivateKey, PublicKey};
use std::collections::HashSet;
use std::fmt::{self, Write as _};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::SystemTime;

/// Smallest MTU accepted for the tunnel interface
pub const MIN_MTU: u16 = 576;

/// Network endpoint (IP + port)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// IP address
    pub addr: IpAddr,
    /// UDP port
    pub port: u16,
}

impl Endpoint {
    /// Create a new endpoint
    pub fn new(addr: IpAddr, port: u16) -> Self {
        Self { addr, port }
    }

    /// Convert to SocketAddr
    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_socket_addr())
    }
}

impl FromStr for Endpoint {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let addr: SocketAddr = s.trim().parse().map_err(|_| ConfigError::EndpointInvalid)?;
        Ok(Self::new(addr.ip(), addr.port()))
    }
}

/// Address with prefix length, e.g. `10.8.0.2/32`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpRange {
    pub addr: IpAddr,
    pub prefix: u8,
}

impl IpRange {
    pub fn new(addr: IpAddr, prefix: u8) -> Self {
        Self { addr, prefix }
    }

    /// Single-host range (`/32` or `/128`)
    pub fn host(addr: IpAddr) -> Self {
        let prefix = if addr.is_ipv4() { 32 } else { 128 };
        Self { addr, prefix }
    }

    /// `0.0.0.0/0`, all IPv4 traffic
    pub fn ipv4_default_route() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    }
}

impl fmt::Display for IpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl FromStr for IpRange {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (ip, prefix) = match s.split_once('/') {
            Some((ip, prefix)) => (ip, Some(prefix)),
            None => (s, None),
        };
        let addr: IpAddr = ip.parse().map_err(|_| ConfigError::AddressInvalid(s.to_string()))?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix {
            Some(p) => p.parse::<u8>()
                .ok()
                .filter(|p| *p <= max)
                .ok_or_else(|| ConfigError::AddressInvalid(s.to_string()))?,
            None => max,
        };
        Ok(Self::new(addr, prefix))
    }
}

/// Split a comma separated DNS list into server addresses and search domains
pub fn parse_dns_list(list: &str) -> (Vec<IpAddr>, Vec<String>) {
    let mut servers = Vec::new();
    let mut search = Vec::new();

    for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        match entry.parse::<IpAddr>() {
            Ok(ip) => servers.push(ip),
            Err(_) => search.push(entry.to_string()),
        }
    }

    (servers, search)
}

/// `[Interface]` section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceConfig {
    pub private_key: PrivateKey,
    pub addresses: Vec<IpRange>,
    pub listen_port: Option<u16>,
    pub dns: Vec<IpAddr>,
    pub dns_search: Vec<String>,
    pub mtu: Option<u16>,
}

impl InterfaceConfig {
    pub fn new(private_key: PrivateKey) -> Self {
        Self {
            private_key,
            addresses: Vec::new(),
            listen_port: None,
            dns: Vec::new(),
            dns_search: Vec::new(),
            mtu: None,
        }
    }

    /// Public key derived from the interface private key
    pub fn public_key(&self) -> PublicKey {
        self.private_key.public_key()
    }
}

/// `[Peer]` section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    /// Peer's public key
    pub public_key: PublicKey,
    /// Preshared key (optional, for post-quantum resistance)
    pub preshared_key: Option<PresharedKey>,
    /// Allowed IPs (what traffic to route through this peer)
    pub allowed_ips: Vec<IpRange>,
    /// Peer's endpoint
    pub endpoint: Option<Endpoint>,
    /// Persistent keepalive interval (seconds)
    pub persistent_keepalive: Option<u16>,
    /// Traffic counters reported by the tunnel engine
    pub rx_bytes: Option<u64>,
    pub tx_bytes: Option<u64>,
    pub last_handshake: Option<SystemTime>,
}

impl PeerConfig {
    /// Create a new peer configuration
    pub fn new(public_key: PublicKey) -> Self {
        Self {
            public_key,
            preshared_key: None,
            allowed_ips: Vec::new(),
            endpoint: None,
            persistent_keepalive: None,
            rx_bytes: None,
            tx_bytes: None,
            last_handshake: None,
        }
    }
}

/// Complete tunnel profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfiguration {
    /// Logical profile name shown by the OS
    pub name: String,
    pub interface: InterfaceConfig,
    pub peers: Vec<PeerConfig>,
}

impl TunnelConfiguration {
    pub fn new(name: impl Into<String>, interface: InterfaceConfig, peers: Vec<PeerConfig>) -> Self {
        Self {
            name: name.into(),
            interface,
            peers,
        }
    }

    /// Validate before handing the profile to the OS
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::NameRequired);
        }

        if let Some(mtu) = self.interface.mtu {
            if mtu < MIN_MTU {
                return Err(ConfigError::MtuInvalid(mtu));
            }
        }

        let mut seen = HashSet::with_capacity(self.peers.len());
        for peer in &self.peers {
            if !seen.insert(peer.public_key) {
                return Err(ConfigError::PublicKeyDuplicated);
            }
        }

        Ok(())
    }

    /// Render in wg-quick format
    pub fn to_wg_quick(&self) -> String {
        let mut out = String::from("[Interface]\n");
        let iface = &self.interface;

        let _ = writeln!(out, "PrivateKey = {}", iface.private_key.to_base64());
        if let Some(port) = iface.listen_port {
            let _ = writeln!(out, "ListenPort = {}", port);
        }
        if !iface.addresses.is_empty() {
            let _ = writeln!(out, "Address = {}", join(&iface.addresses));
        }
        if !iface.dns.is_empty() || !iface.dns_search.is_empty() {
            let mut entries: Vec<String> = iface.dns.iter().map(ToString::to_string).collect();
            entries.extend(iface.dns_search.iter().cloned());
            let _ = writeln!(out, "DNS = {}", entries.join(", "));
        }
        if let Some(mtu) = iface.mtu {
            let _ = writeln!(out, "MTU = {}", mtu);
        }

        for peer in &self.peers {
            out.push_str("\n[Peer]\n");
            let _ = writeln!(out, "PublicKey = {}", peer.public_key.to_base64());
            if let Some(psk) = peer.preshared_key {
                let _ = writeln!(out, "PresharedKey = {}", psk.to_base64());
            }
            if !peer.allowed_ips.is_empty() {
                let _ = writeln!(out, "AllowedIPs = {}", join(&peer.allowed_ips));
            }
            if let Some(endpoint) = peer.endpoint {
                let _ = writeln!(out, "Endpoint = {}", endpoint);
            }
            if let Some(keepalive) = peer.persistent_keepalive {
                let _ = writeln!(out, "PersistentKeepalive = {}", keepalive);
            }
        }

        out
    }
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

/// Tunnel profile validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Tunnel name is required")]
    NameRequired,

    #[error("Invalid address: {0}")]
    AddressInvalid(String),

    #[error("MTU {0} is below the minimum of 576")]
    MtuInvalid(u16),

    #[error("Invalid peer endpoint")]
    EndpointInvalid,

    #[error("Two or more peers share the same public key")]
    PublicKeyDuplicated,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(byte: u8) -> PeerConfig {
        PeerConfig::new(PublicKey::from_bytes([byte; 32]))
    }

    fn config(peers: Vec<PeerConfig>) -> TunnelConfiguration {
        TunnelConfiguration::new(
            "dVPN tunnel",
            InterfaceConfig::new(PrivateKey::from_bytes([1u8; 32])),
            peers,
        )
    }

    #[test]
    fn test_ip_range_parse() {
        let range: IpRange = "10.8.0.2/32".parse().unwrap();
        assert_eq!(range, IpRange::host("10.8.0.2".parse().unwrap()));
        assert_eq!("0.0.0.0/0".parse::<IpRange>().unwrap(), IpRange::ipv4_default_route());
        assert!("10.0.0.1/33".parse::<IpRange>().is_err());
        assert!("nonsense/8".parse::<IpRange>().is_err());
    }

    #[test]
    fn test_endpoint_parse_and_display() {
        let ep: Endpoint = "185.22.153.7:51820".parse().unwrap();
        assert_eq!(ep.port, 51820);
        assert_eq!(ep.to_string(), "185.22.153.7:51820");
        assert_eq!("no-port".parse::<Endpoint>(), Err(ConfigError::EndpointInvalid));
    }

    #[test]
    fn test_dns_list_split() {
        let (servers, search) = parse_dns_list("1.1.1.1, 1.0.0.1, corp.local");
        assert_eq!(servers.len(), 2);
        assert_eq!(search, vec!["corp.local".to_string()]);
    }

    #[test]
    fn test_duplicate_peer_keys_rejected() {
        assert!(config(vec![peer(2), peer(3)]).validate().is_ok());
        assert_eq!(
            config(vec![peer(2), peer(2)]).validate(),
            Err(ConfigError::PublicKeyDuplicated)
        );
    }

    #[test]
    fn test_name_and_mtu_validation() {
        let mut cfg = config(vec![peer(2)]);
        cfg.interface.mtu = Some(500);
        assert_eq!(cfg.validate(), Err(ConfigError::MtuInvalid(500)));

        cfg.interface.mtu = Some(1420);
        cfg.name = "  ".into();
        assert_eq!(cfg.validate(), Err(ConfigError::NameRequired));
    }

    #[test]
    fn test_wg_quick_render() {
        let mut p = peer(2);
        p.allowed_ips = vec![IpRange::ipv4_default_route()];
        p.endpoint = Some("185.22.153.7:51820".parse().unwrap());
        p.persistent_keepalive = Some(25);

        let mut cfg = config(vec![p]);
        cfg.interface.addresses = vec!["10.8.0.2/32".parse().unwrap()];
        cfg.interface.listen_port = Some(51820);
        cfg.interface.dns = vec!["1.1.1.1".parse().unwrap()];

        let text = cfg.to_wg_quick();
        assert!(text.starts_with("[Interface]\nPrivateKey = "));
        assert!(text.contains("ListenPort = 51820\n"));
        assert!(text.contains("Address = 10.8.0.2/32\n"));
        assert!(text.contains("DNS = 1.1.1.1\n"));
        assert!(text.contains("\n[Peer]\n"));
        assert!(text.contains("AllowedIPs = 0.0.0.0/0\n"));
        assert!(text.contains("Endpoint = 185.22.153.7:51820\n"));
        assert!(text.contains("PersistentKeepalive = 25\n"));
        assert!(!text.contains("MTU"));
    }
}
