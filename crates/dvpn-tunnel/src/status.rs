//! Tunnel status as tracked by the client and as reported by the OS.

use std::fmt;

/// Client-side status of a managed tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TunnelStatus {
    /// Not running
    Disconnected,
    /// Start requested, handshake in progress
    Connecting,
    /// Traffic is flowing
    Connected,
    /// Stop requested
    Disconnecting,
    /// OS is re-establishing after a network change
    Reasserting,
    /// Configuration changed while up; will start again once stopped
    Restarting,
    /// Queued behind another tunnel that is still shutting down
    Waiting,
}

impl TunnelStatus {
    /// Up, or on the way up
    pub fn is_operating(&self) -> bool {
        matches!(
            self,
            TunnelStatus::Connected
                | TunnelStatus::Connecting
                | TunnelStatus::Disconnecting
                | TunnelStatus::Reasserting
                | TunnelStatus::Restarting
        )
    }

    /// Connected or connecting, the states that refuse a new connect
    pub fn is_active(&self) -> bool {
        matches!(self, TunnelStatus::Connected | TunnelStatus::Connecting)
    }
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TunnelStatus::Disconnected => "disconnected",
            TunnelStatus::Connecting => "connecting",
            TunnelStatus::Connected => "connected",
            TunnelStatus::Disconnecting => "disconnecting",
            TunnelStatus::Reasserting => "reasserting",
            TunnelStatus::Restarting => "restarting",
            TunnelStatus::Waiting => "waiting",
        };
        f.write_str(s)
    }
}

/// Connection status of a profile as reported by the OS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OsStatus {
    /// Profile is not usable (removed or misconfigured)
    Invalid,
    Disconnected,
    Connecting,
    Connected,
    Reasserting,
    Disconnecting,
}

impl From<OsStatus> for TunnelStatus {
    fn from(status: OsStatus) -> Self {
        match status {
            OsStatus::Invalid | OsStatus::Disconnected => TunnelStatus::Disconnected,
            OsStatus::Connecting => TunnelStatus::Connecting,
            OsStatus::Connected => TunnelStatus::Connected,
            OsStatus::Reasserting => TunnelStatus::Reasserting,
            OsStatus::Disconnecting => TunnelStatus::Disconnecting,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_os_status_mapping() {
        assert_eq!(TunnelStatus::from(OsStatus::Invalid), TunnelStatus::Disconnected);
        assert_eq!(TunnelStatus::from(OsStatus::Connected), TunnelStatus::Connected);
        assert_eq!(TunnelStatus::from(OsStatus::Reasserting), TunnelStatus::Reasserting);
    }

    #[test]
    fn test_operating_states() {
        assert!(TunnelStatus::Restarting.is_operating());
        assert!(!TunnelStatus::Waiting.is_operating());
        assert!(!TunnelStatus::Disconnected.is_operating());
        assert!(TunnelStatus::Connecting.is_active());
        assert!(!TunnelStatus::Reasserting.is_active());
    }
}
