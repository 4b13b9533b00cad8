//! Client settings
//!
//! Loaded from TOML or JSON; every field has a default so an empty file
//! is a valid configuration.

use crate::coordinator::CoordinatorConfig;
use crate::store::DnsServer;
use dvpn_network::HttpClientConfig;
use dvpn_tunnel::{TunnelConfigBuilder, DEFAULT_TUNNEL_NAME};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid setting: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Wallet the subscriptions belong to
    #[serde(default)]
    pub wallet_address: String,
    #[serde(default)]
    pub dns: DnsServer,
    #[serde(default = "default_tunnel_name")]
    pub tunnel_name: String,
    #[serde(default = "default_fee_denom")]
    pub fee_denom: String,
    /// Node request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Delay before reporting tunnel activity, in milliseconds
    #[serde(default = "default_activity_delay")]
    pub activity_delay_ms: u64,
    /// Status poll while an activation is pending, in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

fn default_tunnel_name() -> String {
    DEFAULT_TUNNEL_NAME.to_string()
}

fn default_fee_denom() -> String {
    "udvpn".to_string()
}

fn default_request_timeout() -> u64 {
    15
}

fn default_user_agent() -> String {
    format!("dvpn-client/{}", env!("CARGO_PKG_VERSION"))
}

fn default_activity_delay() -> u64 {
    2000
}

fn default_poll_interval() -> u64 {
    5
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            wallet_address: String::new(),
            dns: DnsServer::default(),
            tunnel_name: default_tunnel_name(),
            fee_denom: default_fee_denom(),
            request_timeout_secs: default_request_timeout(),
            user_agent: default_user_agent(),
            activity_delay_ms: default_activity_delay(),
            poll_interval_secs: default_poll_interval(),
        }
    }
}

impl ClientSettings {
    /// Load from a file; `.json` is read as JSON, anything else as TOML
    pub fn from_file(path: &Path) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SettingsError::IoError(e.to_string()))?;

        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        if is_json {
            Self::from_json(&content)
        } else {
            Self::from_toml(&content)
        }
    }

    pub fn from_toml(content: &str) -> Result<Self, SettingsError> {
        let settings: Self = toml::from_str(content)
            .map_err(|e| SettingsError::ParseError(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_json(content: &str) -> Result<Self, SettingsError> {
        let settings: Self = serde_json::from_str(content)
            .map_err(|e| SettingsError::ParseError(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.tunnel_name.trim().is_empty() {
            return Err(SettingsError::Invalid("tunnel_name must not be empty".into()));
        }
        if self.fee_denom.trim().is_empty() {
            return Err(SettingsError::Invalid("fee_denom must not be empty".into()));
        }
        if self.request_timeout_secs == 0 {
            return Err(SettingsError::Invalid("request_timeout_secs must be positive".into()));
        }
        if self.poll_interval_secs == 0 {
            return Err(SettingsError::Invalid("poll_interval_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn activity_delay(&self) -> Duration {
        Duration::from_millis(self.activity_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.request_timeout(),
            user_agent: self.user_agent.clone(),
            ..HttpClientConfig::default()
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            fee_denom: self.fee_denom.clone(),
            activity_delay: self.activity_delay(),
        }
    }

    pub fn tunnel_builder(&self) -> TunnelConfigBuilder {
        TunnelConfigBuilder::new(self.tunnel_name.clone())
    }
}
