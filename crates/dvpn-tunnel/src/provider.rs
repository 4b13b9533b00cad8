//! OS Tunnel Provider
//!
//! The operating system owns the persisted VPN profiles and the tunnel
//! engine. This module describes the slice of that API the client relies
//! on: listing, saving and removing profiles, starting and stopping a
//! session, and a stream of status notifications.
//!
//! An in-memory implementation lives in [`memory`].

pub mod memory;

use crate::config::{ConfigError, TunnelConfiguration};
use crate::status::OsStatus;
use async_trait::async_trait;
use std::fmt;
use tokio::sync::mpsc;

/// Identifier the OS assigns to a saved profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProfileId(pub u64);

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A VPN profile as persisted by the OS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    /// `None` until the profile has been saved once
    pub id: Option<ProfileId>,
    pub configuration: TunnelConfiguration,
    /// The OS may disable a profile when another VPN app takes over
    pub enabled: bool,
    /// Let the OS bring the tunnel back up on its own
    pub on_demand_enabled: bool,
}

impl Profile {
    /// New unsaved profile, enabled, with on-demand switched on
    pub fn new(configuration: TunnelConfiguration) -> Self {
        Self {
            id: None,
            configuration,
            enabled: true,
            on_demand_enabled: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.configuration.name
    }
}

/// Asynchronous notifications from the OS
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderNotification {
    /// Connection status of a profile changed
    StatusChanged {
        id: ProfileId,
        status: OsStatus,
        /// Attempt id passed to [`TunnelProvider::start`], when the change
        /// belongs to a start request
        attempt_id: Option<String>,
    },
    /// The set of saved profiles, or one of them, changed
    ConfigurationChanged,
}

/// Errors reported by the OS tunnel API
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("Tunnel configuration is invalid")]
    ConfigurationInvalid,

    #[error("Tunnel configuration is stale")]
    ConfigurationStale,

    #[error("Tunnel configuration is disabled")]
    ConfigurationDisabled,

    #[error("Tunnel configuration is in an unknown state")]
    ConfigurationUnknown,

    #[error("Profile {0} not found")]
    NotFound(ProfileId),

    #[error("Profile rejected: {0}")]
    Rejected(#[from] ConfigError),

    #[error("Tunnel API error: {0}")]
    Io(String),
}

impl ProviderError {
    /// Errors cured by reloading the profile from the OS and trying again
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::ConfigurationInvalid | ProviderError::ConfigurationStale
        )
    }
}

/// Operating system VPN API
#[async_trait]
pub trait TunnelProvider: Send + Sync {
    /// Load every profile this application owns
    async fn load_all(&self) -> Result<Vec<Profile>, ProviderError>;

    /// Persist a profile, assigning an id to new ones
    async fn save(&self, profile: Profile) -> Result<Profile, ProviderError>;

    /// Delete a profile
    async fn remove(&self, id: ProfileId) -> Result<(), ProviderError>;

    /// Ask the OS to start the tunnel. Returns once the request is accepted;
    /// the outcome arrives as status notifications tagged with `attempt_id`.
    fn start(&self, id: ProfileId, attempt_id: &str) -> Result<(), ProviderError>;

    /// Ask the OS to stop the tunnel
    fn stop(&self, id: ProfileId);

    /// Current OS status of a profile
    fn status(&self, id: ProfileId) -> OsStatus;

    /// Register for notifications
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ProviderNotification>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(ProviderError::ConfigurationStale.is_transient());
        assert!(ProviderError::ConfigurationInvalid.is_transient());
        assert!(!ProviderError::ConfigurationDisabled.is_transient());
        assert!(!ProviderError::Io("denied".into()).is_transient());
    }
}
