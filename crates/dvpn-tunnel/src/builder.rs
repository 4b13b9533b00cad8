//! Maps negotiated session material onto a tunnel profile.

use crate::config::{parse_dns_list, ConfigError, InterfaceConfig, IpRange, PeerConfig, TunnelConfiguration};
use crate::keys::PrivateKey;
use crate::material::SessionMaterial;
use std::net::IpAddr;

/// Profile name used for the single tunnel this client manages
pub const DEFAULT_TUNNEL_NAME: &str = "dVPN tunnel";

/// Keepalive sent to the node, in seconds
pub const PERSISTENT_KEEPALIVE: u16 = 25;

/// Builds a [`TunnelConfiguration`] from session material and local settings.
///
/// Pure: identical inputs always produce an identical configuration.
#[derive(Debug, Clone)]
pub struct TunnelConfigBuilder {
    name: String,
}

impl TunnelConfigBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Build the profile.
    ///
    /// `dns` is the selected DNS server's address string, e.g.
    /// `"1.1.1.1, 1.0.0.1"`.
    pub fn build(
        &self,
        material: &SessionMaterial,
        private_key: &PrivateKey,
        dns: &str,
    ) -> Result<TunnelConfiguration, ConfigError> {
        let mut interface = InterfaceConfig::new(private_key.clone());
        interface.addresses = vec![IpRange::host(IpAddr::V4(material.local_address))];
        interface.listen_port = Some(material.remote_port);

        let (servers, search) = parse_dns_list(dns);
        interface.dns = servers;
        interface.dns_search = search;

        let mut peer = PeerConfig::new(material.remote_public_key);
        peer.endpoint = Some(material.endpoint());
        peer.allowed_ips = vec![IpRange::ipv4_default_route()];
        peer.persistent_keepalive = Some(PERSISTENT_KEEPALIVE);

        let config = TunnelConfiguration::new(self.name.clone(), interface, vec![peer]);
        config.validate()?;
        Ok(config)
    }
}

impl Default for TunnelConfigBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_TUNNEL_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::PublicKey;
    use std::net::Ipv4Addr;

    fn material() -> SessionMaterial {
        SessionMaterial::new(
            Ipv4Addr::new(10, 8, 0, 2),
            Ipv4Addr::new(185, 22, 153, 7),
            51820,
            PublicKey::from_bytes([4u8; 32]),
        )
    }

    #[test]
    fn test_build_maps_material() {
        let key = PrivateKey::from_bytes([3u8; 32]);
        let config = TunnelConfigBuilder::default()
            .build(&material(), &key, "103.196.38.38, 103.196.38.39")
            .unwrap();

        assert_eq!(config.name, DEFAULT_TUNNEL_NAME);
        assert_eq!(config.interface.addresses[0].to_string(), "10.8.0.2/32");
        assert_eq!(config.interface.listen_port, Some(51820));
        assert_eq!(config.interface.dns.len(), 2);
        assert_eq!(config.interface.public_key(), key.public_key());

        let peer = &config.peers[0];
        assert_eq!(config.peers.len(), 1);
        assert_eq!(peer.endpoint.unwrap().to_string(), "185.22.153.7:51820");
        assert_eq!(peer.public_key, PublicKey::from_bytes([4u8; 32]));
        assert_eq!(peer.allowed_ips, vec![IpRange::ipv4_default_route()]);
        assert_eq!(peer.persistent_keepalive, Some(25));
    }

    #[test]
    fn test_build_is_deterministic() {
        let key = PrivateKey::from_bytes([3u8; 32]);
        let builder = TunnelConfigBuilder::default();
        let a = builder.build(&material(), &key, "1.1.1.1").unwrap();
        let b = builder.build(&material(), &key, "1.1.1.1").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_wg_quick(), b.to_wg_quick());
    }

    #[test]
    fn test_empty_name_rejected() {
        let key = PrivateKey::from_bytes([3u8; 32]);
        let result = TunnelConfigBuilder::new("").build(&material(), &key, "1.1.1.1");
        assert_eq!(result, Err(ConfigError::NameRequired));
    }
}
