//! Session Material
//!
//! Decodes the connection blob a node returns when a session is started.
//!
//! # Wire Format
//!
//! The node answers with a base64 string that must decode to exactly
//! 58 bytes:
//!
//! | Offset | Length | Field |
//! |--------|--------|-------|
//! | 0 | 4 | Local tunnel IPv4 address |
//! | 4 | 16 | Reserved |
//! | 20 | 4 | Remote endpoint IPv4 address |
//! | 24 | 2 | Remote port (big-endian) |
//! | 26 | 32 | Remote Curve25519 public key |

use crate::config::Endpoint;
use crate::keys::{PublicKey, KEY_LEN};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use std::net::{IpAddr, Ipv4Addr};

/// Exact length of a decoded session blob
pub const SESSION_MATERIAL_LEN: usize = 58;

const LOCAL_ADDR: std::ops::Range<usize> = 0..4;
const RESERVED: std::ops::Range<usize> = 4..20;
const REMOTE_ADDR: std::ops::Range<usize> = 20..24;
const REMOTE_PORT: std::ops::Range<usize> = 24..26;
const REMOTE_KEY: std::ops::Range<usize> = 26..58;

/// Peer and interface data handed out by a node for one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMaterial {
    /// Address assigned to our side of the tunnel
    pub local_address: Ipv4Addr,
    /// Node endpoint address
    pub remote_address: Ipv4Addr,
    /// Node endpoint port, also used as our listen port
    pub remote_port: u16,
    /// Node WireGuard public key
    pub remote_public_key: PublicKey,
    reserved: [u8; 16],
}

impl SessionMaterial {
    pub fn new(
        local_address: Ipv4Addr,
        remote_address: Ipv4Addr,
        remote_port: u16,
        remote_public_key: PublicKey,
    ) -> Self {
        Self {
            local_address,
            remote_address,
            remote_port,
            remote_public_key,
            reserved: [0u8; 16],
        }
    }

    /// Decode from the raw 58-byte layout
    pub fn from_bytes(data: &[u8]) -> Result<Self, MaterialError> {
        if data.len() != SESSION_MATERIAL_LEN {
            return Err(MaterialError::InvalidLength {
                expected: SESSION_MATERIAL_LEN,
                actual: data.len(),
            });
        }

        let ipv4 = |range: std::ops::Range<usize>| {
            let b = &data[range];
            Ipv4Addr::new(b[0], b[1], b[2], b[3])
        };

        let mut reserved = [0u8; 16];
        reserved.copy_from_slice(&data[RESERVED]);

        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&data[REMOTE_KEY]);

        Ok(Self {
            local_address: ipv4(LOCAL_ADDR),
            remote_address: ipv4(REMOTE_ADDR),
            remote_port: u16::from_be_bytes([data[REMOTE_PORT.start], data[REMOTE_PORT.start + 1]]),
            remote_public_key: PublicKey::from_bytes(key),
            reserved,
        })
    }

    /// Decode from the base64 string carried in the node response
    pub fn from_base64(s: &str) -> Result<Self, MaterialError> {
        let data = BASE64.decode(s.trim())
            .map_err(|_| MaterialError::InvalidBase64)?;
        Self::from_bytes(&data)
    }

    /// Encode back into the wire layout
    pub fn to_bytes(&self) -> [u8; SESSION_MATERIAL_LEN] {
        let mut out = [0u8; SESSION_MATERIAL_LEN];
        out[LOCAL_ADDR].copy_from_slice(&self.local_address.octets());
        out[RESERVED].copy_from_slice(&self.reserved);
        out[REMOTE_ADDR].copy_from_slice(&self.remote_address.octets());
        out[REMOTE_PORT].copy_from_slice(&self.remote_port.to_be_bytes());
        out[REMOTE_KEY].copy_from_slice(&self.remote_public_key.to_bytes());
        out
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.to_bytes())
    }

    /// Node endpoint as `remote_address:remote_port`
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(IpAddr::V4(self.remote_address), self.remote_port)
    }
}

/// Session material decoding errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MaterialError {
    #[error("Session material is not valid base64")]
    InvalidBase64,

    #[error("Session material has {actual} bytes (expected {expected})")]
    InvalidLength { expected: usize, actual: usize },
}
