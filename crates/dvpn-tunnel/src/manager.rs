//! Tunnel Manager
//!
//! Keeps the application down to a single WireGuard profile and wraps the
//! tunnels service with the operations a connection flow needs.
//!
//! # Usage
//!
//! ```rust,ignore
//! let (manager, mut events) = TunnelManager::create(provider, TunnelConfigBuilder::default(), DEFAULT_POLL_INTERVAL).await?;
//!
//! // Build a profile from what the node returned and bring it up
//! let material = SessionMaterial::from_base64(&result)?;
//! manager.create_new_profile(&material, &KeyPair::generate().private, "1.1.1.1, 1.0.0.1").await?;
//!
//! // Later
//! manager.deactivate_active().await?;
//! ```

use crate::builder::TunnelConfigBuilder;
use crate::config::{parse_dns_list, TunnelConfiguration};
use crate::error::TunnelError;
use crate::handle::TunnelInfo;
use crate::keys::PrivateKey;
use crate::material::SessionMaterial;
use crate::provider::{ProfileId, TunnelProvider};
use crate::service::{TunnelEvent, TunnelsService};
use crate::status::TunnelStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Single-profile front end over [`TunnelsService`]
pub struct TunnelManager {
    service: Arc<TunnelsService>,
    builder: TunnelConfigBuilder,
}

impl TunnelManager {
    /// Load the OS profiles and drop any surplus ones
    pub async fn create(
        provider: Arc<dyn TunnelProvider>,
        builder: TunnelConfigBuilder,
        poll_interval: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TunnelEvent>), TunnelError> {
        let (service, events) = TunnelsService::create(provider, poll_interval).await?;
        service.converge().await?;
        Ok((Self { service, builder }, events))
    }

    pub fn service(&self) -> &Arc<TunnelsService> {
        &self.service
    }

    pub fn builder(&self) -> &TunnelConfigBuilder {
        &self.builder
    }

    pub async fn last_tunnel(&self) -> Option<TunnelInfo> {
        self.service.last_tunnel().await
    }

    /// Connected or connecting
    pub async fn is_tunnel_active(&self) -> bool {
        self.last_tunnel().await.is_some_and(|t| t.status.is_active())
    }

    /// Build a profile from fresh session material and bring it up
    pub async fn create_new_profile(
        &self,
        material: &SessionMaterial,
        private_key: &PrivateKey,
        dns: &str,
    ) -> Result<ProfileId, TunnelError> {
        let configuration = self.builder.build(material, private_key, dns)?;
        info!("Created tunnel profile for endpoint {}", material.endpoint());
        self.commit(configuration, true).await
    }

    /// Save the configuration into the single profile, creating it if
    /// needed, and optionally start it.
    pub async fn commit(
        &self,
        configuration: TunnelConfiguration,
        start_activation: bool,
    ) -> Result<ProfileId, TunnelError> {
        let id = match self.last_tunnel().await {
            Some(tunnel) => {
                self.service.modify(tunnel.id, configuration).await?;
                tunnel.id
            }
            None => self.service.add(configuration).await?,
        };

        if !start_activation {
            return Ok(id);
        }

        // A running tunnel whose configuration changed restarts by itself
        match self.service.status(id).await {
            Some(TunnelStatus::Disconnected | TunnelStatus::Disconnecting) => {
                self.service.activate_after_stop(id).await?
            }
            Some(status) => debug!("Tunnel {} is {}, not starting", id, status),
            None => return Err(TunnelError::NoTunnel),
        }
        Ok(id)
    }

    /// Bring the existing profile up again
    pub async fn activate_last(&self) -> Result<(), TunnelError> {
        let tunnel = self.last_tunnel().await.ok_or(TunnelError::NoTunnel)?;
        self.service.activate(tunnel.id).await?;
        Ok(())
    }

    /// Returns `false` when there was nothing to stop
    pub async fn deactivate_active(&self) -> Result<bool, TunnelError> {
        let Some(tunnel) = self.last_tunnel().await else {
            return Ok(false);
        };
        Ok(self.service.deactivate(tunnel.id).await?)
    }

    /// Point the running tunnel at other DNS servers. Does nothing unless
    /// a tunnel is active; never starts one.
    pub async fn update_dns(&self, dns: &str) -> Result<bool, TunnelError> {
        let Some(tunnel) = self.last_tunnel().await.filter(|t| t.status.is_active()) else {
            return Ok(false);
        };

        let mut configuration = tunnel.configuration;
        let (servers, search) = parse_dns_list(dns);
        configuration.interface.dns = servers;
        configuration.interface.dns_search = search;

        info!("Switching tunnel DNS to {}", dns);
        self.commit(configuration, false).await?;
        Ok(true)
    }

    /// Delete every profile
    pub async fn reset(&self) -> Result<(), TunnelError> {
        self.service.remove_all().await?;
        Ok(())
    }

    /// Reconcile with the OS and drop surplus profiles
    pub async fn reload(&self) -> Result<(), TunnelError> {
        self.service.reload().await?;
        self.service.converge().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::PublicKey;
    use crate::provider::memory::MemoryProvider;
    use crate::provider::Profile;
    use crate::status::OsStatus;
    use std::net::Ipv4Addr;

    fn material(port: u16) -> SessionMaterial {
        SessionMaterial::new(
            Ipv4Addr::new(10, 8, 0, 2),
            Ipv4Addr::new(185, 22, 153, 7),
            port,
            PublicKey::from_bytes([4u8; 32]),
        )
    }

    async fn manager(provider: &Arc<MemoryProvider>) -> (TunnelManager, mpsc::UnboundedReceiver<TunnelEvent>) {
        TunnelManager::create(provider.clone(), TunnelConfigBuilder::default(), Duration::from_millis(20))
            .await
            .unwrap()
    }

    async fn wait_connected(events: &mut mpsc::UnboundedReceiver<TunnelEvent>) {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .expect("timed out")
                .expect("closed");
            if matches!(event, TunnelEvent::ActivationSucceeded { .. }) {
                return;
            }
        }
    }

    #[tokio::test]
    async fn test_create_new_profile_connects() {
        let provider = Arc::new(MemoryProvider::new());
        let (manager, mut events) = manager(&provider).await;
        let key = PrivateKey::generate();

        manager.create_new_profile(&material(51820), &key, "1.1.1.1, 1.0.0.1").await.unwrap();
        wait_connected(&mut events).await;

        assert!(manager.is_tunnel_active().await);
        assert_eq!(provider.profile_count(), 1);
    }

    #[tokio::test]
    async fn test_second_profile_reuses_existing() {
        let provider = Arc::new(MemoryProvider::new());
        let (manager, mut events) = manager(&provider).await;
        let key = PrivateKey::generate();

        let first = manager.create_new_profile(&material(51820), &key, "1.1.1.1").await.unwrap();
        wait_connected(&mut events).await;
        assert!(manager.deactivate_active().await.unwrap());

        let second = manager.create_new_profile(&material(443), &key, "1.1.1.1").await.unwrap();
        wait_connected(&mut events).await;

        assert_eq!(first, second);
        assert_eq!(provider.profile_count(), 1);
        let tunnel = manager.last_tunnel().await.unwrap();
        assert_eq!(tunnel.configuration.interface.listen_port, Some(443));
    }

    #[tokio::test]
    async fn test_commit_while_stopping_restarts_afterwards() {
        let provider = Arc::new(MemoryProvider::new());
        let (manager, mut events) = manager(&provider).await;
        let key = PrivateKey::generate();

        let id = manager.create_new_profile(&material(51820), &key, "1.1.1.1").await.unwrap();
        wait_connected(&mut events).await;

        provider.set_os_status(id, OsStatus::Disconnecting, None);
        for _ in 0..100 {
            if manager.service().status(id).await == Some(TunnelStatus::Disconnecting) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(manager.service().status(id).await, Some(TunnelStatus::Disconnecting));

        manager.create_new_profile(&material(443), &key, "1.1.1.1").await.unwrap();
        assert_eq!(manager.service().status(id).await, Some(TunnelStatus::Restarting));

        provider.set_os_status(id, OsStatus::Disconnected, None);
        wait_connected(&mut events).await;
        assert!(manager.is_tunnel_active().await);
        assert_eq!(provider.start_attempts().len(), 2);
    }

    #[tokio::test]
    async fn test_update_dns_only_when_active() {
        let provider = Arc::new(MemoryProvider::new());
        let (manager, mut events) = manager(&provider).await;
        assert_eq!(manager.update_dns("8.8.8.8").await, Ok(false));

        manager.create_new_profile(&material(51820), &PrivateKey::generate(), "1.1.1.1").await.unwrap();
        wait_connected(&mut events).await;

        assert_eq!(manager.update_dns("8.8.8.8, 8.8.4.4").await, Ok(true));
        let tunnel = manager.last_tunnel().await.unwrap();
        assert_eq!(tunnel.configuration.interface.dns.len(), 2);
        assert_eq!(provider.stop_count(), 1);
    }

    #[tokio::test]
    async fn test_deactivate_without_tunnel() {
        let provider = Arc::new(MemoryProvider::new());
        let (manager, _events) = manager(&provider).await;
        assert_eq!(manager.deactivate_active().await, Ok(false));
        assert_eq!(manager.activate_last().await, Err(TunnelError::NoTunnel));
    }

    #[tokio::test]
    async fn test_create_converges_surplus_profiles() {
        let provider = Arc::new(MemoryProvider::new());
        let builder = TunnelConfigBuilder::default();
        let key = PrivateKey::from_bytes([5u8; 32]);
        for _ in 0..3 {
            let config = builder.build(&material(51820), &key, "1.1.1.1").unwrap();
            provider.insert_external(Profile::new(config));
        }

        let (manager, _events) = manager(&provider).await;
        assert_eq!(provider.profile_count(), 1);
        assert_eq!(manager.service().tunnels().await.len(), 1);
    }

    #[tokio::test]
    async fn test_reset_removes_everything() {
        let provider = Arc::new(MemoryProvider::new());
        let (manager, mut events) = manager(&provider).await;
        manager.create_new_profile(&material(51820), &PrivateKey::generate(), "1.1.1.1").await.unwrap();
        wait_connected(&mut events).await;

        manager.reset().await.unwrap();
        assert!(manager.last_tunnel().await.is_none());
        assert_eq!(provider.profile_count(), 0);
    }
}
