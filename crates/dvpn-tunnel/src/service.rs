//! Tunnels Service
//!
//! Registry of tunnel handles plus the activation state machine that
//! drives them through the OS tunnel API.
//!
//! # Activation
//!
//! ```text
//! disconnected ──start──► connecting ──OS──► connected
//!       ▲                                        │
//!       └──────────── disconnecting ◄──stop──────┘
//! ```
//!
//! Only one tunnel may be in operation at a time. Activating a second
//! tunnel parks it in `waiting`, stops the first, and starts the second
//! once the first is down.
//!
//! Transient start failures (stale or invalid configuration) reload the
//! profile and try again, at most [`MAX_ACTIVATION_ATTEMPTS`] times.
//!
//! # Notifications
//!
//! OS status changes, watchdog polls and queued activations all go through
//! one observer task, so they never interleave with each other. Each
//! notification is applied under the registry lock.

use crate::config::{ConfigError, TunnelConfiguration};
use crate::handle::{natural_cmp, TunnelHandle, TunnelInfo};
use crate::provider::{Profile, ProfileId, ProviderError, ProviderNotification, TunnelProvider};
use crate::status::{OsStatus, TunnelStatus};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Upper bound on start attempts for one activation
pub const MAX_ACTIVATION_ATTEMPTS: u32 = 8;

/// How often a pending activation re-reads the OS status
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Activation and deactivation failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActivationError {
    #[error("Tunnel is not inactive")]
    Inactive,

    #[error("Unknown tunnel {0}")]
    UnknownTunnel(ProfileId),

    #[error("Failed to start tunnel: {0}")]
    StartingFailed(ProviderError),

    #[error("Failed to save tunnel: {0}")]
    SavingFailed(ProviderError),

    #[error("Failed to reload tunnel: {0}")]
    LoadingFailed(ProviderError),

    #[error("Activation retry limit reached (last error: {last:?})")]
    RetryLimitReached { last: Option<ProviderError> },

    #[error("Tunnel went down while activating")]
    ActivationAttemptFailed { was_on_demand_enabled: bool },
}

/// Registry errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TunnelsServiceError {
    #[error("Tunnel name is empty")]
    EmptyName,

    #[error("A tunnel named '{0}' already exists")]
    NameAlreadyExists(String),

    #[error("Unknown tunnel {0}")]
    UnknownTunnel(ProfileId),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(#[from] ConfigError),

    #[error("Failed to load tunnels: {0}")]
    LoadTunnelsFailed(ProviderError),

    #[error("Failed to add tunnel: {0}")]
    AddTunnelFailed(ProviderError),

    #[error("Failed to modify tunnel: {0}")]
    ModifyTunnelFailed(ProviderError),

    #[error("Failed to remove tunnel: {0}")]
    RemoveTunnelFailed(ProviderError),
}

/// Outcome reports, drained by the owner of the service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    /// The start request itself was refused or never made
    ActivationAttemptFailed { id: ProfileId, error: ActivationError },
    /// The OS accepted the start request
    ActivationAttemptSucceeded { id: ProfileId },
    /// The OS reported the tunnel down before it came up
    ActivationFailed { id: ProfileId, error: ActivationError },
    /// The OS reported the tunnel up
    ActivationSucceeded { id: ProfileId },
    DeactivationSucceeded { id: ProfileId },
}

enum Command {
    Notification(ProviderNotification),
    Activate(ProfileId),
}

#[derive(Debug, Clone, Copy)]
struct Awaiting {
    waiter: ProfileId,
    waitee: ProfileId,
}

#[derive(Default)]
struct Inner {
    tunnels: Vec<TunnelHandle>,
    awaiting: Option<Awaiting>,
}

impl Inner {
    fn get(&self, id: ProfileId) -> Option<&TunnelHandle> {
        self.tunnels.iter().find(|t| t.id() == id)
    }

    fn get_mut(&mut self, id: ProfileId) -> Option<&mut TunnelHandle> {
        self.tunnels.iter_mut().find(|t| t.id() == id)
    }

    fn sort(&mut self) {
        self.tunnels.sort_by(|a, b| {
            natural_cmp(a.name(), b.name()).then_with(|| a.id().cmp(&b.id()))
        });
    }

    /// A tunnel other than `except` the OS is running. Waiting handles hold
    /// no OS session and never count.
    fn in_operation(&self, except: ProfileId) -> Option<&TunnelHandle> {
        self.tunnels.iter()
            .find(|t| t.id() != except && t.status().is_operating())
    }

    /// Drop every queued activation except `keep`'s
    fn release_waiters(&mut self, keep: ProfileId) {
        self.awaiting = None;
        for handle in self.tunnels.iter_mut() {
            if handle.id() != keep && handle.status() == TunnelStatus::Waiting {
                debug!("Tunnel {} no longer waits", handle.id());
                handle.set_status(TunnelStatus::Disconnected);
            }
        }
    }

    /// If a tunnel was queued behind `id`, release it
    fn take_waiter(&mut self, id: ProfileId) -> Option<ProfileId> {
        match self.awaiting {
            Some(awaiting) if awaiting.waitee == id => {
                self.awaiting = None;
                self.get(awaiting.waiter)
                    .filter(|t| t.status() == TunnelStatus::Waiting)
                    .map(|t| t.id())
            }
            _ => None,
        }
    }

    fn forget(&mut self, id: ProfileId) {
        if self.awaiting.is_some_and(|a| a.waiter == id || a.waitee == id) {
            self.awaiting = None;
        }
    }
}

/// Tunnel registry and activation machine
pub struct TunnelsService {
    provider: Arc<dyn TunnelProvider>,
    inner: Mutex<Inner>,
    events: mpsc::UnboundedSender<TunnelEvent>,
    commands: mpsc::UnboundedSender<Command>,
    observing_configurations: AtomicBool,
    poll_interval: Duration,
}

impl TunnelsService {
    /// Load all profiles and start observing the OS.
    ///
    /// Returns the service and the receiving end of its event stream.
    pub async fn create(
        provider: Arc<dyn TunnelProvider>,
        poll_interval: Duration,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<TunnelEvent>), TunnelsServiceError> {
        let notifications = provider.subscribe();
        let profiles = provider.load_all().await
            .map_err(TunnelsServiceError::LoadTunnelsFailed)?;

        let mut inner = Inner::default();
        for profile in profiles {
            if let Some(id) = profile.id {
                let status = provider.status(id);
                inner.tunnels.push(TunnelHandle::new(id, profile, status));
            }
        }
        inner.sort();
        info!("Loaded {} tunnel profile(s)", inner.tunnels.len());

        let (events, events_rx) = mpsc::unbounded_channel();
        let (commands, commands_rx) = mpsc::unbounded_channel();

        let service = Arc::new(Self {
            provider,
            inner: Mutex::new(inner),
            events,
            commands,
            observing_configurations: AtomicBool::new(true),
            poll_interval,
        });

        tokio::spawn(observe(Arc::downgrade(&service), notifications, commands_rx));

        Ok((service, events_rx))
    }

    fn emit(&self, event: TunnelEvent) {
        debug!("Tunnel event: {:?}", event);
        let _ = self.events.send(event);
    }

    fn resume(&self, id: ProfileId) {
        let _ = self.commands.send(Command::Activate(id));
    }

    // ---- Snapshots ----

    pub async fn tunnels(&self) -> Vec<TunnelInfo> {
        self.inner.lock().await.tunnels.iter().map(TunnelHandle::info).collect()
    }

    pub async fn tunnel(&self, id: ProfileId) -> Option<TunnelInfo> {
        self.inner.lock().await.get(id).map(TunnelHandle::info)
    }

    /// The authoritative tunnel when only one is kept
    pub async fn last_tunnel(&self) -> Option<TunnelInfo> {
        self.inner.lock().await.tunnels.last().map(TunnelHandle::info)
    }

    pub async fn status(&self, id: ProfileId) -> Option<TunnelStatus> {
        self.inner.lock().await.get(id).map(TunnelHandle::status)
    }

    // ---- Registry ----

    /// Save a new profile, enabled and with on-demand switched on
    pub async fn add(&self, configuration: TunnelConfiguration) -> Result<ProfileId, TunnelsServiceError> {
        if configuration.name.trim().is_empty() {
            return Err(TunnelsServiceError::EmptyName);
        }
        configuration.validate()?;

        let active = {
            let inner = self.inner.lock().await;
            if inner.tunnels.iter().any(|t| t.name() == configuration.name) {
                return Err(TunnelsServiceError::NameAlreadyExists(configuration.name));
            }
            inner.tunnels.iter().find(|t| t.status().is_active()).map(TunnelHandle::id)
        };

        let saved = self.provider.save(Profile::new(configuration)).await
            .map_err(TunnelsServiceError::AddTunnelFailed)?;
        let id = saved.id
            .ok_or(TunnelsServiceError::AddTunnelFailed(ProviderError::ConfigurationUnknown))?;
        info!("Added tunnel '{}' ({})", saved.name(), id);

        let os_status = self.provider.status(id);
        let mut reactivate = None;
        {
            let mut inner = self.inner.lock().await;
            match inner.get_mut(id) {
                Some(handle) => handle.set_profile(saved),
                None => inner.tunnels.push(TunnelHandle::new(id, saved, os_status)),
            }
            inner.sort();

            // Saving a profile can knock the running tunnel offline
            if let Some(handle) = active.and_then(|a| inner.get_mut(a)) {
                match handle.status() {
                    TunnelStatus::Disconnected => reactivate = Some(handle.id()),
                    TunnelStatus::Connected | TunnelStatus::Connecting | TunnelStatus::Disconnecting => {
                        info!("Tunnel '{}' will restart after the profile change", handle.name());
                        handle.clear_attempt();
                        handle.set_status(TunnelStatus::Restarting);
                    }
                    _ => {}
                }
            }
        }

        if let Some(active) = reactivate {
            warn!("Tunnel {} dropped while adding a profile, reactivating", active);
            if let Err(e) = self.start_activation(active).await {
                warn!("Reactivation of {} failed: {}", active, e);
            }
        }

        Ok(id)
    }

    /// Replace a profile's configuration. A tunnel that is up restarts
    /// when its configuration actually changed.
    pub async fn modify(&self, id: ProfileId, configuration: TunnelConfiguration) -> Result<(), TunnelsServiceError> {
        if configuration.name.trim().is_empty() {
            return Err(TunnelsServiceError::EmptyName);
        }
        configuration.validate()?;

        let mut profile = {
            let inner = self.inner.lock().await;
            let handle = inner.get(id).ok_or(TunnelsServiceError::UnknownTunnel(id))?;
            if handle.name() != configuration.name
                && inner.tunnels.iter().any(|t| t.name() == configuration.name)
            {
                return Err(TunnelsServiceError::NameAlreadyExists(configuration.name));
            }
            handle.profile().clone()
        };

        let changed = profile.configuration != configuration;
        profile.configuration = configuration;
        profile.enabled = true;

        let saved = self.provider.save(profile).await
            .map_err(TunnelsServiceError::ModifyTunnelFailed)?;

        let mut inner = self.inner.lock().await;
        let Some(handle) = inner.get_mut(id) else {
            return Ok(());
        };
        handle.set_profile(saved);

        if changed && matches!(
            handle.status(),
            TunnelStatus::Connected | TunnelStatus::Connecting | TunnelStatus::Reasserting
        ) {
            info!("Configuration of '{}' changed while up, restarting", handle.name());
            handle.clear_attempt();
            handle.set_status(TunnelStatus::Restarting);
            self.provider.stop(id);
        }
        inner.sort();

        Ok(())
    }

    /// Toggle OS on-demand activation; always leaves the profile enabled
    pub async fn set_on_demand(&self, id: ProfileId, enabled: bool) -> Result<(), TunnelsServiceError> {
        self.save_on_demand(id, enabled).await
            .map_err(TunnelsServiceError::ModifyTunnelFailed)
    }

    async fn save_on_demand(&self, id: ProfileId, enabled: bool) -> Result<(), ProviderError> {
        let mut profile = {
            let inner = self.inner.lock().await;
            inner.get(id).map(|t| t.profile().clone()).ok_or(ProviderError::NotFound(id))?
        };
        if profile.enabled && profile.on_demand_enabled == enabled {
            return Ok(());
        }

        profile.enabled = true;
        profile.on_demand_enabled = enabled;
        let saved = self.provider.save(profile).await?;
        debug!("On-demand for '{}' is now {}", saved.name(), if enabled { "on" } else { "off" });

        if let Some(handle) = self.inner.lock().await.get_mut(id) {
            handle.set_profile(saved);
        }
        Ok(())
    }

    pub async fn remove(&self, id: ProfileId) -> Result<(), TunnelsServiceError> {
        if self.inner.lock().await.get(id).is_none() {
            return Err(TunnelsServiceError::UnknownTunnel(id));
        }
        self.provider.remove(id).await
            .map_err(TunnelsServiceError::RemoveTunnelFailed)?;

        let mut inner = self.inner.lock().await;
        inner.forget(id);
        inner.tunnels.retain(|t| t.id() != id);
        info!("Removed tunnel {}", id);
        Ok(())
    }

    /// Remove every profile, then reload
    pub async fn remove_all(&self) -> Result<(), TunnelsServiceError> {
        let ids: Vec<ProfileId> = self.inner.lock().await.tunnels.iter().map(TunnelHandle::id).collect();

        self.observing_configurations.store(false, Ordering::SeqCst);
        let mut first_error = None;
        for id in ids {
            if let Err(e) = self.provider.remove(id).await {
                warn!("Failed to remove tunnel {}: {}", id, e);
                first_error.get_or_insert(TunnelsServiceError::RemoveTunnelFailed(e));
            }
        }
        self.observing_configurations.store(true, Ordering::SeqCst);

        self.reload().await?;
        first_error.map_or(Ok(()), Err)
    }

    /// Reconcile handles with the profiles the OS holds
    pub async fn reload(&self) -> Result<(), TunnelsServiceError> {
        let profiles = self.provider.load_all().await
            .map_err(TunnelsServiceError::LoadTunnelsFailed)?;
        let present: HashSet<ProfileId> = profiles.iter().filter_map(|p| p.id).collect();

        let mut inner = self.inner.lock().await;

        let vanished: Vec<ProfileId> = inner.tunnels.iter()
            .map(TunnelHandle::id)
            .filter(|id| !present.contains(id))
            .collect();
        for id in vanished {
            info!("Tunnel {} no longer exists in the OS", id);
            inner.forget(id);
            inner.tunnels.retain(|t| t.id() != id);
        }

        for profile in profiles {
            let Some(id) = profile.id else { continue };
            let os_status = self.provider.status(id);
            match inner.get_mut(id) {
                Some(handle) => {
                    handle.set_profile(profile);
                    if !handle.is_attempting_activation() {
                        handle.refresh_status(os_status);
                    }
                }
                None => {
                    info!("Adopting tunnel '{}' ({})", profile.name(), id);
                    inner.tunnels.push(TunnelHandle::new(id, profile, os_status));
                }
            }
        }

        inner.sort();
        Ok(())
    }

    /// Remove surplus profiles so that at most one remains. Keeps the
    /// tunnel in operation if there is one, otherwise the last in order.
    pub async fn converge(&self) -> Result<Option<ProfileId>, TunnelsServiceError> {
        let (keep, surplus) = {
            let mut inner = self.inner.lock().await;
            let keep = inner.tunnels.iter()
                .find(|t| t.status() != TunnelStatus::Disconnected)
                .or_else(|| inner.tunnels.last())
                .map(TunnelHandle::id);

            let surplus: Vec<ProfileId> = inner.tunnels.iter()
                .map(TunnelHandle::id)
                .filter(|id| Some(*id) != keep)
                .collect();
            for id in &surplus {
                inner.forget(*id);
            }
            inner.tunnels.retain(|t| Some(t.id()) == keep);
            (keep, surplus)
        };

        if !surplus.is_empty() {
            warn!("Removing {} surplus tunnel profile(s)", surplus.len());
        }
        for id in surplus {
            self.provider.remove(id).await
                .map_err(TunnelsServiceError::RemoveTunnelFailed)?;
        }
        Ok(keep)
    }

    /// Re-read every handle's status from the OS
    pub async fn refresh_statuses(&self) {
        let mut inner = self.inner.lock().await;
        for handle in inner.tunnels.iter_mut().filter(|t| !t.is_attempting_activation()) {
            handle.refresh_status(self.provider.status(handle.id()));
        }
    }

    // ---- Activation machine ----

    /// Switch on-demand on and start the tunnel
    pub async fn activate(&self, id: ProfileId) -> Result<(), ActivationError> {
        let status = self.status(id).await.ok_or(ActivationError::UnknownTunnel(id))?;
        if status != TunnelStatus::Disconnected {
            warn!("Tunnel {} is {}, not activating", id, status);
            self.emit(TunnelEvent::ActivationAttemptFailed { id, error: ActivationError::Inactive });
            return Err(ActivationError::Inactive);
        }

        if let Err(e) = self.save_on_demand(id, true).await {
            let error = ActivationError::SavingFailed(e);
            self.emit(TunnelEvent::ActivationAttemptFailed { id, error: error.clone() });
            return Err(error);
        }

        self.start_activation(id).await
    }

    /// Like [`activate`](Self::activate), but a tunnel still going down is
    /// marked to restart once the OS reports it stopped
    pub async fn activate_after_stop(&self, id: ProfileId) -> Result<(), ActivationError> {
        {
            let mut inner = self.inner.lock().await;
            let handle = inner.get_mut(id).ok_or(ActivationError::UnknownTunnel(id))?;
            if handle.status() == TunnelStatus::Disconnecting {
                info!("Tunnel '{}' is stopping, starting it again afterwards", handle.name());
                handle.set_status(TunnelStatus::Restarting);
                return Ok(());
            }
        }
        self.activate(id).await
    }

    /// Start a tunnel that is at rest. If another tunnel is in operation,
    /// this one waits for it to stop.
    pub async fn start_activation(&self, id: ProfileId) -> Result<(), ActivationError> {
        let mut inner = self.inner.lock().await;
        let status = inner.get(id).map(TunnelHandle::status)
            .ok_or(ActivationError::UnknownTunnel(id))?;
        if status != TunnelStatus::Disconnected {
            drop(inner);
            self.emit(TunnelEvent::ActivationAttemptFailed { id, error: ActivationError::Inactive });
            return Err(ActivationError::Inactive);
        }

        // Only one tunnel may wait at a time. That includes a waiter already
        // released but not yet restarted.
        inner.release_waiters(id);

        if let Some(other) = inner.in_operation(id) {
            let (other_id, other_status) = (other.id(), other.status());
            info!("Tunnel {} waits for {} ({}) to stop", id, other_id, other_status);
            if let Some(handle) = inner.get_mut(id) {
                handle.set_status(TunnelStatus::Waiting);
            }
            inner.awaiting = Some(Awaiting { waiter: id, waitee: other_id });
            drop(inner);

            if other_status != TunnelStatus::Disconnecting {
                self.deactivate(other_id).await?;
            }
            return Ok(());
        }

        drop(inner);
        self.run_activation(id).await
    }

    /// Bounded start loop. Transient failures reload the profile and retry.
    async fn run_activation(&self, id: ProfileId) -> Result<(), ActivationError> {
        let mut attempt: u32 = 0;
        let mut last_error: Option<ProviderError> = None;

        loop {
            if attempt >= MAX_ACTIVATION_ATTEMPTS {
                error!("Giving up on tunnel {} after {} attempts", id, attempt);
                return self.fail_activation(id, ActivationError::RetryLimitReached { last: last_error }).await;
            }

            let mut inner = self.inner.lock().await;
            let handle = inner.get_mut(id).ok_or(ActivationError::UnknownTunnel(id))?;
            handle.set_status(TunnelStatus::Connecting);

            if !handle.profile().enabled {
                info!("Re-enabling disabled tunnel '{}'", handle.name());
                let mut profile = handle.profile().clone();
                profile.enabled = true;
                drop(inner);

                match self.provider.save(profile).await {
                    Ok(saved) => {
                        if let Some(handle) = self.inner.lock().await.get_mut(id) {
                            handle.set_profile(saved);
                        }
                    }
                    Err(e) => return self.fail_activation(id, ActivationError::SavingFailed(e)).await,
                }
                attempt += 1;
                last_error = Some(ProviderError::ConfigurationUnknown);
                continue;
            }

            let attempt_id = Uuid::new_v4().to_string();
            info!(
                "Starting tunnel '{}' (attempt {}/{})",
                handle.name(), attempt + 1, MAX_ACTIVATION_ATTEMPTS
            );
            handle.begin_attempt(attempt_id.clone());

            match self.provider.start(id, &attempt_id) {
                Ok(()) => {
                    handle.set_watchdog(self.spawn_watchdog(id, attempt_id));
                    drop(inner);
                    self.emit(TunnelEvent::ActivationAttemptSucceeded { id });
                    return Ok(());
                }
                Err(e) if e.is_transient() => {
                    warn!("Starting tunnel {} failed: {}. Reloading and retrying", id, e);
                    handle.clear_attempt();
                    drop(inner);
                    if let Err(reload_error) = self.reload_profile(id).await {
                        return self.fail_activation(id, ActivationError::LoadingFailed(reload_error)).await;
                    }
                    attempt += 1;
                    last_error = Some(e);
                }
                Err(e) => {
                    error!("Starting tunnel {} failed: {}", id, e);
                    drop(inner);
                    return self.fail_activation(id, ActivationError::StartingFailed(e)).await;
                }
            }
        }
    }

    async fn fail_activation(&self, id: ProfileId, error: ActivationError) -> Result<(), ActivationError> {
        let waiter = {
            let mut inner = self.inner.lock().await;
            if let Some(handle) = inner.get_mut(id) {
                handle.clear_attempt();
                handle.set_status(TunnelStatus::Disconnected);
            }
            inner.take_waiter(id)
        };
        self.emit(TunnelEvent::ActivationAttemptFailed { id, error: error.clone() });
        if let Some(waiter) = waiter {
            self.resume(waiter);
        }
        Err(error)
    }

    async fn reload_profile(&self, id: ProfileId) -> Result<(), ProviderError> {
        let profile = self.provider.load_all().await?
            .into_iter()
            .find(|p| p.id == Some(id))
            .ok_or(ProviderError::NotFound(id))?;
        if let Some(handle) = self.inner.lock().await.get_mut(id) {
            handle.set_profile(profile);
        }
        Ok(())
    }

    fn spawn_watchdog(&self, id: ProfileId, attempt_id: String) -> JoinHandle<()> {
        let provider = Arc::clone(&self.provider);
        let commands = self.commands.clone();
        let period = self.poll_interval;

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                let status = provider.status(id);
                debug!("No status update for tunnel {} yet, OS reports {:?}", id, status);

                let settled = matches!(status, OsStatus::Connected | OsStatus::Disconnected | OsStatus::Invalid);
                let notification = ProviderNotification::StatusChanged {
                    id,
                    status,
                    attempt_id: Some(attempt_id.clone()),
                };
                if commands.send(Command::Notification(notification)).is_err() || settled {
                    break;
                }
            }
        })
    }

    /// Stop a tunnel. Returns `false`, touching nothing, when it is
    /// already down or going down.
    pub async fn deactivate(&self, id: ProfileId) -> Result<bool, ActivationError> {
        {
            let mut inner = self.inner.lock().await;
            let handle = inner.get_mut(id).ok_or(ActivationError::UnknownTunnel(id))?;
            handle.clear_attempt();

            match handle.status() {
                TunnelStatus::Disconnected | TunnelStatus::Disconnecting => {
                    debug!("Tunnel {} already {}", id, handle.status());
                    return Ok(false);
                }
                TunnelStatus::Waiting => {
                    handle.set_status(TunnelStatus::Disconnected);
                    let waiter = inner.take_waiter(id);
                    inner.forget(id);
                    drop(inner);
                    self.emit(TunnelEvent::DeactivationSucceeded { id });
                    if let Some(waiter) = waiter {
                        self.resume(waiter);
                    }
                    return Ok(true);
                }
                _ => {}
            }
        }

        if let Err(e) = self.save_on_demand(id, false).await {
            warn!("Could not switch off on-demand for tunnel {}: {}", id, e);
        }

        info!("Stopping tunnel {}", id);
        self.provider.stop(id);

        let waiter = {
            let mut inner = self.inner.lock().await;
            if let Some(handle) = inner.get_mut(id) {
                handle.clear_attempt();
                handle.set_status(TunnelStatus::Disconnected);
            }
            inner.take_waiter(id)
        };
        self.emit(TunnelEvent::DeactivationSucceeded { id });
        if let Some(waiter) = waiter {
            self.resume(waiter);
        }

        Ok(true)
    }

    // ---- Notifications ----

    async fn handle_command(&self, command: Command) {
        match command {
            Command::Notification(ProviderNotification::ConfigurationChanged) => {
                if self.observing_configurations.load(Ordering::SeqCst) {
                    if let Err(e) = self.reload().await {
                        warn!("Reload after configuration change failed: {}", e);
                    }
                }
            }
            Command::Notification(ProviderNotification::StatusChanged { id, status, attempt_id }) => {
                self.apply_status(id, status, attempt_id).await;
            }
            Command::Activate(id) => {
                let pending = matches!(
                    self.status(id).await,
                    Some(TunnelStatus::Waiting | TunnelStatus::Restarting)
                );
                if pending {
                    if let Err(e) = self.run_activation(id).await {
                        warn!("Deferred activation of tunnel {} failed: {}", id, e);
                    }
                }
            }
        }
    }

    async fn apply_status(&self, id: ProfileId, os_status: OsStatus, attempt_id: Option<String>) {
        let mut inner = self.inner.lock().await;
        let Some(handle) = inner.get_mut(id) else { return };
        debug!("Tunnel '{}' OS status {:?}", handle.name(), os_status);

        // Stale report from an earlier start request
        if let Some(incoming) = attempt_id.as_deref() {
            if handle.activation_attempt_id() != Some(incoming) {
                debug!("Ignoring status for superseded attempt {}", incoming);
                return;
            }
        }

        let mut follow_up = None;

        if handle.is_attempting_activation() {
            match os_status {
                OsStatus::Connected => {
                    handle.clear_attempt();
                    handle.set_status(TunnelStatus::Connected);
                    info!("Tunnel '{}' connected", handle.name());
                    self.emit(TunnelEvent::ActivationSucceeded { id });
                }
                OsStatus::Disconnected => {
                    let was_on_demand_enabled = handle.on_demand_enabled();
                    handle.clear_attempt();
                    handle.set_status(TunnelStatus::Disconnected);
                    warn!("Tunnel '{}' went down while activating", handle.name());
                    self.emit(TunnelEvent::ActivationFailed {
                        id,
                        error: ActivationError::ActivationAttemptFailed { was_on_demand_enabled },
                    });
                    follow_up = inner.take_waiter(id);
                }
                OsStatus::Invalid => {
                    handle.clear_attempt();
                    handle.set_status(TunnelStatus::Disconnected);
                    self.emit(TunnelEvent::DeactivationSucceeded { id });
                    follow_up = inner.take_waiter(id);
                }
                other => handle.set_status(other.into()),
            }
        } else if os_status == OsStatus::Invalid {
            handle.set_status(TunnelStatus::Disconnected);
            self.emit(TunnelEvent::DeactivationSucceeded { id });
            follow_up = inner.take_waiter(id);
        } else if handle.status() == TunnelStatus::Restarting {
            match os_status {
                OsStatus::Disconnected => {
                    info!("Tunnel '{}' stopped for restart", handle.name());
                    follow_up = Some(id);
                }
                OsStatus::Connected => {
                    handle.set_status(TunnelStatus::Connected);
                    self.emit(TunnelEvent::ActivationSucceeded { id });
                }
                _ => {}
            }
        } else {
            handle.refresh_status(os_status);
            if handle.status() == TunnelStatus::Disconnected {
                follow_up = inner.take_waiter(id);
            }
        }

        drop(inner);
        if let Some(next) = follow_up {
            self.resume(next);
        }
    }
}

async fn observe(
    service: Weak<TunnelsService>,
    mut notifications: mpsc::UnboundedReceiver<ProviderNotification>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    loop {
        let command = tokio::select! {
            Some(notification) = notifications.recv() => Command::Notification(notification),
            Some(command) = commands.recv() => command,
            else => break,
        };

        let Some(service) = service.upgrade() else { break };
        service.handle_command(command).await;
    }
    debug!("Tunnel observer stopped");
}
