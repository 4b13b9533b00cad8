//! In-memory tunnel provider
//!
//! Stands in for the OS VPN API in tests and offline tools. Start results
//! can be scripted, and every mutation is counted so callers can assert
//! that an operation did or did not touch the OS.

use super::{Profile, ProfileId, ProviderError, ProviderNotification, TunnelProvider};
use crate::status::OsStatus;
use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;

struct Stored {
    profile: Profile,
    status: OsStatus,
}

#[derive(Default)]
struct State {
    profiles: BTreeMap<ProfileId, Stored>,
    next_id: u64,
    start_results: VecDeque<Result<(), ProviderError>>,
    save_results: VecDeque<Result<(), ProviderError>>,
    start_attempts: Vec<(ProfileId, String)>,
    stops: usize,
    saves: usize,
    removes: usize,
    subscribers: Vec<mpsc::UnboundedSender<ProviderNotification>>,
}

impl State {
    fn notify(&mut self, notification: ProviderNotification) {
        self.subscribers.retain(|tx| tx.send(notification.clone()).is_ok());
    }

    fn set_status(&mut self, id: ProfileId, status: OsStatus, attempt_id: Option<String>) {
        if let Some(stored) = self.profiles.get_mut(&id) {
            stored.status = status;
            self.notify(ProviderNotification::StatusChanged { id, status, attempt_id });
        }
    }
}

/// OS tunnel API backed by a map
pub struct MemoryProvider {
    state: Mutex<State>,
    /// Report `connected` straight after a successful start
    auto_connect: bool,
    /// Saving a new profile knocks other running tunnels offline
    save_disconnects_others: bool,
}

impl MemoryProvider {
    /// Provider whose tunnels connect as soon as they are started
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            auto_connect: true,
            save_disconnects_others: false,
        }
    }

    /// Leave started tunnels in `connecting` until the test moves them on
    pub fn manual() -> Self {
        Self {
            auto_connect: false,
            ..Self::new()
        }
    }

    /// Mimic OSes that stop the running tunnel when a profile is added
    pub fn with_save_disconnects_others(mut self) -> Self {
        self.save_disconnects_others = true;
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue the result of the next [`TunnelProvider::start`] call
    pub fn push_start_result(&self, result: Result<(), ProviderError>) {
        self.state().start_results.push_back(result);
    }

    /// Queue the result of the next [`TunnelProvider::save`] call
    pub fn push_save_result(&self, result: Result<(), ProviderError>) {
        self.state().save_results.push_back(result);
    }

    /// Change a profile's status as the OS would, notifying subscribers
    pub fn set_os_status(&self, id: ProfileId, status: OsStatus, attempt_id: Option<String>) {
        self.state().set_status(id, status, attempt_id);
    }

    /// Change a profile's status without telling anyone, as when a
    /// notification gets lost
    pub fn set_os_status_quietly(&self, id: ProfileId, status: OsStatus) {
        if let Some(stored) = self.state().profiles.get_mut(&id) {
            stored.status = status;
        }
    }

    /// Add a profile behind the client's back
    pub fn insert_external(&self, mut profile: Profile) -> ProfileId {
        let mut state = self.state();
        state.next_id += 1;
        let id = ProfileId(state.next_id);
        profile.id = Some(id);
        state.profiles.insert(id, Stored { profile, status: OsStatus::Disconnected });
        state.notify(ProviderNotification::ConfigurationChanged);
        id
    }

    /// Delete a profile behind the client's back
    pub fn remove_external(&self, id: ProfileId) {
        let mut state = self.state();
        if state.profiles.remove(&id).is_some() {
            state.notify(ProviderNotification::ConfigurationChanged);
        }
    }

    /// Disable a profile, as the OS does when another VPN app takes over
    pub fn disable_external(&self, id: ProfileId) {
        let mut state = self.state();
        if let Some(stored) = state.profiles.get_mut(&id) {
            stored.profile.enabled = false;
        }
    }

    pub fn profile(&self, id: ProfileId) -> Option<Profile> {
        self.state().profiles.get(&id).map(|s| s.profile.clone())
    }

    pub fn profile_count(&self) -> usize {
        self.state().profiles.len()
    }

    /// `(profile, attempt id)` for every start call, in order
    pub fn start_attempts(&self) -> Vec<(ProfileId, String)> {
        self.state().start_attempts.clone()
    }

    pub fn stop_count(&self) -> usize {
        self.state().stops
    }

    pub fn save_count(&self) -> usize {
        self.state().saves
    }

    /// Every call that changed OS state: starts, stops, saves, removes
    pub fn mutation_count(&self) -> usize {
        let state = self.state();
        state.start_attempts.len() + state.stops + state.saves + state.removes
    }
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TunnelProvider for MemoryProvider {
    async fn load_all(&self) -> Result<Vec<Profile>, ProviderError> {
        Ok(self.state().profiles.values().map(|s| s.profile.clone()).collect())
    }

    async fn save(&self, mut profile: Profile) -> Result<Profile, ProviderError> {
        let mut state = self.state();
        state.saves += 1;
        if let Some(result) = state.save_results.pop_front() {
            result?;
        }
        profile.configuration.validate()?;

        let id = match profile.id {
            Some(id) if state.profiles.contains_key(&id) => id,
            Some(id) => return Err(ProviderError::NotFound(id)),
            None => {
                state.next_id += 1;
                let id = ProfileId(state.next_id);
                if self.save_disconnects_others {
                    let running: Vec<ProfileId> = state.profiles.iter()
                        .filter(|(_, s)| matches!(s.status, OsStatus::Connected | OsStatus::Connecting))
                        .map(|(id, _)| *id)
                        .collect();
                    for other in running {
                        state.set_status(other, OsStatus::Disconnected, None);
                    }
                }
                id
            }
        };

        profile.id = Some(id);
        let status = state.profiles.get(&id).map_or(OsStatus::Disconnected, |s| s.status);
        state.profiles.insert(id, Stored { profile: profile.clone(), status });
        state.notify(ProviderNotification::ConfigurationChanged);
        debug!("Saved profile {} '{}'", id, profile.name());
        Ok(profile)
    }

    async fn remove(&self, id: ProfileId) -> Result<(), ProviderError> {
        let mut state = self.state();
        state.removes += 1;
        state.profiles.remove(&id).ok_or(ProviderError::NotFound(id))?;
        state.notify(ProviderNotification::ConfigurationChanged);
        Ok(())
    }

    fn start(&self, id: ProfileId, attempt_id: &str) -> Result<(), ProviderError> {
        let mut state = self.state();
        state.start_attempts.push((id, attempt_id.to_string()));
        if let Some(result) = state.start_results.pop_front() {
            result?;
        }

        let stored = state.profiles.get(&id).ok_or(ProviderError::NotFound(id))?;
        if !stored.profile.enabled {
            return Err(ProviderError::ConfigurationDisabled);
        }

        state.set_status(id, OsStatus::Connecting, Some(attempt_id.to_string()));
        if self.auto_connect {
            state.set_status(id, OsStatus::Connected, Some(attempt_id.to_string()));
        }
        Ok(())
    }

    fn stop(&self, id: ProfileId) {
        let mut state = self.state();
        state.stops += 1;
        state.set_status(id, OsStatus::Disconnected, None);
    }

    fn status(&self, id: ProfileId) -> OsStatus {
        self.state().profiles.get(&id).map_or(OsStatus::Invalid, |s| s.status)
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ProviderNotification> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state().subscribers.push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InterfaceConfig, TunnelConfiguration};
    use crate::keys::PrivateKey;

    fn profile(name: &str) -> Profile {
        let iface = InterfaceConfig::new(PrivateKey::from_bytes([1u8; 32]));
        Profile::new(TunnelConfiguration::new(name, iface, Vec::new()))
    }

    #[tokio::test]
    async fn test_save_assigns_ids() {
        let provider = MemoryProvider::new();
        let a = provider.save(profile("a")).await.unwrap();
        let b = provider.save(profile("b")).await.unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(provider.load_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_start_notifies_with_attempt_id() {
        let provider = MemoryProvider::new();
        let mut rx = provider.subscribe();
        let id = provider.save(profile("a")).await.unwrap().id.unwrap();
        assert_eq!(rx.recv().await, Some(ProviderNotification::ConfigurationChanged));

        provider.start(id, "attempt-1").unwrap();
        assert_eq!(
            rx.recv().await,
            Some(ProviderNotification::StatusChanged {
                id,
                status: OsStatus::Connecting,
                attempt_id: Some("attempt-1".into()),
            })
        );
        assert_eq!(provider.status(id), OsStatus::Connected);
    }

    #[tokio::test]
    async fn test_scripted_start_failure() {
        let provider = MemoryProvider::new();
        let id = provider.save(profile("a")).await.unwrap().id.unwrap();
        provider.push_start_result(Err(ProviderError::ConfigurationStale));

        assert_eq!(provider.start(id, "x"), Err(ProviderError::ConfigurationStale));
        assert_eq!(provider.status(id), OsStatus::Disconnected);
        assert!(provider.start(id, "y").is_ok());
        assert_eq!(provider.start_attempts().len(), 2);
    }

    #[tokio::test]
    async fn test_disabled_profile_refuses_start() {
        let provider = MemoryProvider::new();
        let id = provider.save(profile("a")).await.unwrap().id.unwrap();
        provider.disable_external(id);
        assert_eq!(provider.start(id, "x"), Err(ProviderError::ConfigurationDisabled));
    }

    #[tokio::test]
    async fn test_unknown_profile_is_invalid() {
        let provider = MemoryProvider::new();
        assert_eq!(provider.status(ProfileId(42)), OsStatus::Invalid);
        assert_eq!(provider.mutation_count(), 0);
    }
}
