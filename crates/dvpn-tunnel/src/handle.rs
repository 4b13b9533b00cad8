//! Tunnel handle: the client's view of one OS profile.

use crate::config::TunnelConfiguration;
use crate::provider::{Profile, ProfileId};
use crate::status::{OsStatus, TunnelStatus};
use std::cmp::Ordering;
use tokio::task::JoinHandle;

/// Wraps exactly one OS profile. Owned by the tunnels service; only the
/// activation machine and OS notifications change its status.
pub struct TunnelHandle {
    id: ProfileId,
    profile: Profile,
    status: TunnelStatus,
    attempting_activation: bool,
    activation_attempt_id: Option<String>,
    watchdog: Option<JoinHandle<()>>,
}

impl TunnelHandle {
    pub(crate) fn new(id: ProfileId, profile: Profile, os_status: OsStatus) -> Self {
        Self {
            id,
            profile,
            status: os_status.into(),
            attempting_activation: false,
            activation_attempt_id: None,
            watchdog: None,
        }
    }

    pub fn id(&self) -> ProfileId {
        self.id
    }

    pub fn name(&self) -> &str {
        self.profile.name()
    }

    pub fn status(&self) -> TunnelStatus {
        self.status
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn on_demand_enabled(&self) -> bool {
        self.profile.on_demand_enabled
    }

    pub fn is_attempting_activation(&self) -> bool {
        self.attempting_activation
    }

    pub(crate) fn activation_attempt_id(&self) -> Option<&str> {
        self.activation_attempt_id.as_deref()
    }

    pub(crate) fn set_status(&mut self, status: TunnelStatus) {
        self.status = status;
    }

    pub(crate) fn set_profile(&mut self, profile: Profile) {
        self.profile = profile;
    }

    /// Adopt the OS status, except while a restart or a queued start is pending
    pub(crate) fn refresh_status(&mut self, os_status: OsStatus) {
        if matches!(self.status, TunnelStatus::Restarting | TunnelStatus::Waiting) {
            return;
        }
        self.status = os_status.into();
    }

    pub(crate) fn begin_attempt(&mut self, attempt_id: String) {
        self.clear_attempt();
        self.attempting_activation = true;
        self.activation_attempt_id = Some(attempt_id);
    }

    pub(crate) fn set_watchdog(&mut self, watchdog: JoinHandle<()>) {
        if let Some(old) = self.watchdog.replace(watchdog) {
            old.abort();
        }
    }

    pub(crate) fn clear_attempt(&mut self) {
        self.attempting_activation = false;
        self.activation_attempt_id = None;
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.abort();
        }
    }

    /// Detached copy for callers outside the service
    pub fn info(&self) -> TunnelInfo {
        TunnelInfo {
            id: self.id,
            name: self.name().to_string(),
            status: self.status,
            on_demand_enabled: self.profile.on_demand_enabled,
            configuration: self.profile.configuration.clone(),
        }
    }
}

impl Drop for TunnelHandle {
    fn drop(&mut self) {
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.abort();
        }
    }
}

/// Snapshot of a tunnel handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelInfo {
    pub id: ProfileId,
    pub name: String,
    pub status: TunnelStatus,
    pub on_demand_enabled: bool,
    pub configuration: TunnelConfiguration,
}

/// Case-insensitive ordering that compares digit runs by value,
/// so "tunnel 2" sorts before "tunnel 10".
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut a = a.chars().peekable();
    let mut b = b.chars().peekable();

    loop {
        match (a.peek().copied(), b.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let left = take_number(&mut a);
                let right = take_number(&mut b);
                let ord = left.trim_start_matches('0').len()
                    .cmp(&right.trim_start_matches('0').len())
                    .then_with(|| left.trim_start_matches('0').cmp(right.trim_start_matches('0')));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            (Some(x), Some(y)) => {
                let ord = x.to_lowercase().cmp(y.to_lowercase());
                if ord != Ordering::Equal {
                    return ord;
                }
                a.next();
                b.next();
            }
        }
    }
}

fn take_number(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut digits = String::new();
    while let Some(c) = chars.peek().copied().filter(char::is_ascii_digit) {
        digits.push(c);
        chars.next();
    }
    digits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::PrivateKey;
    use crate::config::InterfaceConfig;

    fn handle(status: OsStatus) -> TunnelHandle {
        let iface = InterfaceConfig::new(PrivateKey::from_bytes([1u8; 32]));
        let profile = Profile::new(TunnelConfiguration::new("t", iface, Vec::new()));
        TunnelHandle::new(ProfileId(1), profile, status)
    }

    #[test]
    fn test_natural_order() {
        let mut names = vec!["Tunnel 10", "tunnel 2", "alpha", "Tunnel 1"];
        names.sort_by(|a, b| natural_cmp(a, b));
        assert_eq!(names, vec!["alpha", "Tunnel 1", "tunnel 2", "Tunnel 10"]);
        assert_eq!(natural_cmp("ABC", "abc"), Ordering::Equal);
        assert_eq!(natural_cmp("a007", "a7"), Ordering::Equal);
    }

    #[test]
    fn test_initial_status_from_os() {
        assert_eq!(handle(OsStatus::Invalid).status(), TunnelStatus::Disconnected);
        assert_eq!(handle(OsStatus::Connected).status(), TunnelStatus::Connected);
    }

    #[test]
    fn test_refresh_skipped_while_restarting() {
        let mut h = handle(OsStatus::Connected);
        h.set_status(TunnelStatus::Restarting);
        h.refresh_status(OsStatus::Disconnected);
        assert_eq!(h.status(), TunnelStatus::Restarting);
    }

    #[test]
    fn test_attempt_bookkeeping() {
        let mut h = handle(OsStatus::Disconnected);
        h.begin_attempt("a1".into());
        assert!(h.is_attempting_activation());
        assert_eq!(h.activation_attempt_id(), Some("a1"));
        h.clear_attempt();
        assert!(!h.is_attempting_activation());
        assert_eq!(h.activation_attempt_id(), None);
    }
}
