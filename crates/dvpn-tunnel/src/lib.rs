//! dVPN Tunnel - WireGuard profile lifecycle
//!
//! Turns session material handed out by a node into a WireGuard profile,
//! stores it through the OS tunnel API, and drives it up and down.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐   ┌────────────────────┐   ┌──────────────────┐
//! │ SessionMaterial │──▶│ TunnelConfigBuilder│──▶│  TunnelManager   │
//! │  (58-byte blob) │   │  (interface+peer)  │   │ (single profile) │
//! └─────────────────┘   └────────────────────┘   └────────┬─────────┘
//!                                                         │
//!                                               ┌─────────▼─────────┐
//!                                               │  TunnelsService   │
//!                                               │ registry + state  │
//!                                               │     machine       │
//!                                               └─────────┬─────────┘
//!                                                         │
//!                                               ┌─────────▼─────────┐
//!                                               │  TunnelProvider   │
//!                                               │   (OS VPN API)    │
//!                                               └───────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - At most one tunnel is in operation at a time
//! - Transient start failures are retried at most 8 times
//! - OS notifications and local transitions are applied one at a time

mod builder;
mod config;
mod error;
mod handle;
mod keys;
mod manager;
mod material;
mod service;
mod status;
pub mod provider;

pub use builder::{TunnelConfigBuilder, DEFAULT_TUNNEL_NAME, PERSISTENT_KEEPALIVE};
pub use config::{
    parse_dns_list, ConfigError, Endpoint, InterfaceConfig, IpRange, PeerConfig,
    TunnelConfiguration, MIN_MTU,
};
pub use error::TunnelError;
pub use handle::{natural_cmp, TunnelInfo};
pub use keys::{KeyError, KeyPair, PresharedKey, PrivateKey, PublicKey, KEY_LEN};
pub use manager::TunnelManager;
pub use material::{MaterialError, SessionMaterial, SESSION_MATERIAL_LEN};
pub use provider::{Profile, ProfileId, ProviderError, ProviderNotification, TunnelProvider};
pub use service::{
    ActivationError, TunnelEvent, TunnelsService, TunnelsServiceError,
    DEFAULT_POLL_INTERVAL, MAX_ACTIVATION_ATTEMPTS,
};
pub use status::{OsStatus, TunnelStatus};
