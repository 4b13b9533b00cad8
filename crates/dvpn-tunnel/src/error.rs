//! Crate-level error type

use crate::config::ConfigError;
use crate::keys::KeyError;
use crate::material::MaterialError;
use crate::service::{ActivationError, TunnelsServiceError};

/// Errors surfaced by [`TunnelManager`](crate::TunnelManager)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TunnelError {
    #[error("No tunnel profile exists")]
    NoTunnel,

    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("Session material error: {0}")]
    Material(#[from] MaterialError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Tunnel registry error: {0}")]
    Service(#[from] TunnelsServiceError),

    #[error("Activation error: {0}")]
    Activation(#[from] ActivationError),
}
