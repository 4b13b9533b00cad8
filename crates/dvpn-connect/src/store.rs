//! Small persisted choices: which DNS to push into the tunnel, which node
//! was picked last and which session was opened for it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

/// DNS servers offered to the user
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DnsServer {
    #[default]
    Handshake,
    Google,
    Cloudflare,
}

impl DnsServer {
    pub const ALL: [DnsServer; 3] = [DnsServer::Handshake, DnsServer::Google, DnsServer::Cloudflare];

    /// Comma-separated addresses, as written into the interface DNS line
    pub fn address(&self) -> &'static str {
        match self {
            DnsServer::Handshake => "103.196.38.38, 103.196.38.39",
            DnsServer::Google => "8.8.8.8, 8.8.4.4",
            DnsServer::Cloudflare => "1.1.1.1, 1.0.0.1",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DnsServer::Handshake => "handshake",
            DnsServer::Google => "google",
            DnsServer::Cloudflare => "cloudflare",
        }
    }
}

impl fmt::Display for DnsServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DnsServer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|server| server.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown DNS server '{}'", s))
    }
}

pub trait DnsStore: Send + Sync {
    fn selected_dns(&self) -> DnsServer;
    fn set_selected_dns(&self, server: DnsServer);
}

pub trait ConnectInfoStore: Send + Sync {
    fn last_selected_node(&self) -> Option<String>;
    fn set_last_selected_node(&self, node: &str);
    fn last_session_id(&self) -> Option<u64>;
    fn set_last_session_id(&self, id: u64);
}

#[derive(Debug, Default)]
struct Stored {
    dns: DnsServer,
    last_node: Option<String>,
    last_session: Option<u64>,
}

/// Both stores in memory, lost on exit
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Stored>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dns(dns: DnsServer) -> Self {
        let store = Self::new();
        store.set_selected_dns(dns);
        store
    }

    fn inner(&self) -> MutexGuard<'_, Stored> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl DnsStore for MemoryStore {
    fn selected_dns(&self) -> DnsServer {
        self.inner().dns
    }

    fn set_selected_dns(&self, server: DnsServer) {
        self.inner().dns = server;
    }
}

impl ConnectInfoStore for MemoryStore {
    fn last_selected_node(&self) -> Option<String> {
        self.inner().last_node.clone()
    }

    fn set_last_selected_node(&self, node: &str) {
        self.inner().last_node = Some(node.to_string());
    }

    fn last_session_id(&self) -> Option<u64> {
        self.inner().last_session
    }

    fn set_last_session_id(&self, id: u64) {
        self.inner().last_session = Some(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dns_addresses() {
        assert_eq!(DnsServer::default(), DnsServer::Handshake);
        assert_eq!(DnsServer::Cloudflare.address(), "1.1.1.1, 1.0.0.1");
        assert_eq!("Google".parse::<DnsServer>(), Ok(DnsServer::Google));
        assert!("quad9".parse::<DnsServer>().is_err());
    }

    #[test]
    fn test_dns_serde_names() {
        assert_eq!(serde_json::to_string(&DnsServer::Cloudflare).unwrap(), "\"cloudflare\"");
        let parsed: DnsServer = serde_json::from_str("\"handshake\"").unwrap();
        assert_eq!(parsed, DnsServer::Handshake);
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::with_dns(DnsServer::Google);
        assert_eq!(store.selected_dns(), DnsServer::Google);
        assert_eq!(store.last_session_id(), None);

        store.set_last_selected_node("sent1node");
        store.set_last_session_id(9);
        assert_eq!(store.last_selected_node().as_deref(), Some("sent1node"));
        assert_eq!(store.last_session_id(), Some(9));
    }
}
