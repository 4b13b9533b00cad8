//! Connection Coordinator
//!
//! Runs the connect flow for one node, strictly in order:
//!
//! ```text
//! connect(node)
//!   ├─ tunnel already up? ─────────────────────────▶ AlreadyConnected
//!   ├─ QuotaGate: subscription for node? ──── no ──▶ Error(NoSubscription)
//!   ├─ QuotaGate: quota left? ──────────────── no ──▶ Error(NoQuotaLeft)
//!   ├─ last session still live on the chain?
//!   │     ├─ tunnel up too ───────────────────────▶ Error(TunnelIsAlreadyActive)
//!   │     └─ tunnel down ─────────────────────────▶ reactivate last tunnel
//!   └─ negotiate
//!         ├─ node directory: remote URL
//!         ├─ balance below fee ───────────────────▶ Warning(NotEnoughTokens), carry on
//!         ├─ SessionNegotiator: start session, sign, fetch material
//!         └─ TunnelManager: build + commit profile, activate
//! ```
//!
//! Results reach the caller only as [`ConnectionEvent`]s. Every branch
//! ends with a `TunnelActivityChanged`, either right away or, after a
//! tunnel event, once a short smoothing delay has passed.

use crate::error::ConnectionError;
use crate::events::{ConnectionEvent, EventSink, SUBSCRIPTION_CANCELED};
use crate::ledger::{LedgerError, NodeDirectory, Subscription, SubscriptionLedger, WalletSigner};
use crate::negotiator::{SessionError, SessionNegotiator};
use crate::quota::QuotaGate;
use crate::store::{ConnectInfoStore, DnsServer, DnsStore};
use crossbeam_channel::Receiver;
use dvpn_network::NodeSessionApi;
use dvpn_tunnel::{TunnelError, TunnelEvent, TunnelManager, TunnelStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// External services the coordinator is wired to
#[derive(Clone)]
pub struct Collaborators {
    pub ledger: Arc<dyn SubscriptionLedger>,
    pub nodes: Arc<dyn NodeDirectory>,
    pub node_api: Arc<dyn NodeSessionApi>,
    pub signer: Arc<dyn WalletSigner>,
    pub dns: Arc<dyn DnsStore>,
    pub connect_info: Arc<dyn ConnectInfoStore>,
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Denom the session fee is paid in
    pub fee_denom: String,
    /// Wait before reporting activity after a tunnel event
    pub activity_delay: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            fee_denom: "udvpn".to_string(),
            activity_delay: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// The flow runs in the background; watch the event stream
    Accepted,
    AlreadyConnected,
    /// Another connect is still running
    InProgress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectOutcome {
    Deactivating,
    AlreadyDisconnected,
    /// Reported on the event stream
    Failed,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct ConnectionCoordinator {
    quota: QuotaGate,
    negotiator: SessionNegotiator,
    tunnels: TunnelManager,
    ledger: Arc<dyn SubscriptionLedger>,
    nodes: Arc<dyn NodeDirectory>,
    signer: Arc<dyn WalletSigner>,
    dns: Arc<dyn DnsStore>,
    connect_info: Arc<dyn ConnectInfoStore>,
    events: EventSink,
    config: CoordinatorConfig,
    last_subscription: Mutex<Option<Subscription>>,
    connecting: AtomicBool,
    activity_timer: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionCoordinator {
    /// Wire everything up and start relaying tunnel events. Must be called
    /// from within a tokio runtime.
    pub fn new(
        collaborators: Collaborators,
        tunnels: TunnelManager,
        tunnel_events: mpsc::UnboundedReceiver<TunnelEvent>,
        config: CoordinatorConfig,
    ) -> (Arc<Self>, Receiver<ConnectionEvent>) {
        let (events, rx) = EventSink::channel();
        let Collaborators {
            ledger,
            nodes,
            node_api,
            signer,
            dns,
            connect_info,
        } = collaborators;

        let coordinator = Arc::new(Self {
            quota: QuotaGate::new(ledger.clone(), signer.clone()),
            negotiator: SessionNegotiator::new(ledger.clone(), signer.clone(), node_api),
            tunnels,
            ledger,
            nodes,
            signer,
            dns,
            connect_info,
            events,
            config,
            last_subscription: Mutex::new(None),
            connecting: AtomicBool::new(false),
            activity_timer: Mutex::new(None),
        });

        tokio::spawn(relay_tunnel_events(Arc::downgrade(&coordinator), tunnel_events));
        (coordinator, rx)
    }

    pub fn tunnels(&self) -> &TunnelManager {
        &self.tunnels
    }

    /// Subscription resolved by the latest connect
    pub fn last_subscription(&self) -> Option<Subscription> {
        lock(&self.last_subscription).clone()
    }

    pub fn is_connecting(&self) -> bool {
        self.connecting.load(Ordering::Acquire)
    }

    pub fn selected_dns(&self) -> DnsServer {
        self.dns.selected_dns()
    }

    /// Start connecting to `node` unless a tunnel is already up or another
    /// connect is running
    pub async fn connect(self: &Arc<Self>, node: &str) -> ConnectOutcome {
        if self.tunnels.is_tunnel_active().await {
            info!("Connect to {} refused: tunnel already active", node);
            return ConnectOutcome::AlreadyConnected;
        }
        if self.connecting.swap(true, Ordering::AcqRel) {
            info!("Connect to {} refused: another connect is running", node);
            return ConnectOutcome::InProgress;
        }

        info!("Connecting to {}", node);
        self.events.send(ConnectionEvent::Loading);
        self.connect_info.set_last_selected_node(node);

        let this = Arc::clone(self);
        let node = node.to_string();
        tokio::spawn(async move {
            let result = this.run_connect(&node).await;
            this.connecting.store(false, Ordering::Release);
            match result {
                Ok(()) => this.settle_unless_pending().await,
                // The tunnel service reports these on its own event stream
                Err(ConnectionError::Tunnel(TunnelError::Activation(e))) => {
                    debug!("Activation for {} failed: {}", node, e);
                    this.stop_loading().await;
                }
                Err(e) => this.show_error(e).await,
            }
        });

        ConnectOutcome::Accepted
    }

    /// Stop the tunnel. Touches nothing when it is already down.
    pub async fn disconnect(&self) -> DisconnectOutcome {
        let running = self
            .tunnels
            .last_tunnel()
            .await
            .is_some_and(|t| t.status != TunnelStatus::Disconnected);
        if !running {
            self.stop_loading().await;
            return DisconnectOutcome::AlreadyDisconnected;
        }

        self.events.send(ConnectionEvent::Loading);
        match self.tunnels.deactivate_active().await {
            Ok(true) => DisconnectOutcome::Deactivating,
            Ok(false) => {
                self.stop_loading().await;
                DisconnectOutcome::AlreadyDisconnected
            }
            Err(e) => {
                self.show_error(e.into()).await;
                DisconnectOutcome::Failed
            }
        }
    }

    /// Cancel every active subscription the wallet holds for `node`
    pub async fn cancel_subscriptions(&self, node: &str) -> bool {
        self.events.send(ConnectionEvent::Loading);
        match self.try_cancel_subscriptions(node).await {
            Ok(()) => {
                info!("Subscriptions for {} cancelled", node);
                self.events.send(ConnectionEvent::Info(SUBSCRIPTION_CANCELED.to_string()));
                self.stop_loading().await;
                true
            }
            Err(e) => {
                self.show_error(e).await;
                false
            }
        }
    }

    /// Remember the DNS choice and push it into the running tunnel, if any
    pub async fn update_dns(&self, server: DnsServer) -> bool {
        self.dns.set_selected_dns(server);
        match self.tunnels.update_dns(server.address()).await {
            Ok(updated) => updated,
            Err(e) => {
                self.show_error(e.into()).await;
                false
            }
        }
    }

    async fn run_connect(&self, node: &str) -> Result<(), ConnectionError> {
        let subscription = self
            .quota
            .load_subscription(node)
            .await?
            .ok_or(ConnectionError::NoSubscription)?;
        *lock(&self.last_subscription) = Some(subscription.clone());

        if !subscription.is_active {
            return Err(ConnectionError::NoSubscription);
        }

        let quota = self.quota.query_quota(&subscription).await?;
        if !QuotaGate::has_usable_quota(&quota, subscription.is_active) {
            return Err(ConnectionError::NoQuotaLeft);
        }

        match self.detect_connection(node).await {
            Ok((true, true)) => Err(ConnectionError::TunnelIsAlreadyActive),
            Ok((false, true)) if self.tunnels.last_tunnel().await.is_some() => {
                info!("Session for {} is still live, reactivating the tunnel", node);
                self.tunnels.activate_last().await?;
                Ok(())
            }
            Ok(_) => self.negotiate(&subscription).await,
            Err(e) => {
                warn!("Could not load active sessions ({}), negotiating a new one", e);
                self.negotiate(&subscription).await
            }
        }
    }

    /// `(tunnel active, last session still live for node)`
    async fn detect_connection(&self, node: &str) -> Result<(bool, bool), LedgerError> {
        let tunnel_active = self.tunnels.is_tunnel_active().await;

        let Some(session_id) = self.connect_info.last_session_id() else {
            return Ok((tunnel_active, false));
        };

        let sessions = self.ledger.active_sessions(&self.signer.current_address()).await?;
        let session_active = sessions.iter().any(|s| s.id == session_id && s.node == node);
        debug!(
            "Detected tunnel active: {}, session {} active: {}",
            tunnel_active, session_id, session_active
        );
        Ok((tunnel_active, session_active))
    }

    async fn negotiate(&self, subscription: &Subscription) -> Result<(), ConnectionError> {
        let node = self.nodes.node(&subscription.node).await?;
        self.check_balance().await;

        let session_id = self
            .negotiator
            .start_session(subscription.id, &subscription.node)
            .await?;
        self.connect_info.set_last_selected_node(&subscription.node);

        let signature = self.negotiator.sign_session(session_id)?;
        let negotiated = self
            .negotiator
            .fetch_session_material(
                &node.remote_url,
                session_id,
                &self.signer.current_address(),
                &signature,
            )
            .await?;
        self.connect_info.set_last_session_id(session_id);

        let dns = self.dns.selected_dns();
        self.tunnels
            .create_new_profile(&negotiated.material, &negotiated.private_key, dns.address())
            .await?;
        Ok(())
    }

    /// A low balance only warns; the chain has the final say
    async fn check_balance(&self) {
        let owner = self.signer.current_address();
        match self.ledger.balances(&owner).await {
            Err(e) => debug!("Failed to fetch balance ({}), starting the session anyway", e),
            Ok(balances) => {
                let fee = self.signer.fee();
                let funded = balances
                    .iter()
                    .any(|coin| coin.denom == self.config.fee_denom && coin.amount_value() >= fee);
                if !funded {
                    warn!("Balance below the {} {} fee", fee, self.config.fee_denom);
                    self.events.send(ConnectionEvent::Warning(ConnectionError::NotEnoughTokens));
                }
            }
        }
    }

    async fn try_cancel_subscriptions(&self, node: &str) -> Result<(), ConnectionError> {
        let owner = self.signer.current_address();
        let ids: Vec<u64> = self
            .ledger
            .active_subscriptions(&owner)
            .await?
            .into_iter()
            .filter(|s| s.node == node)
            .map(|s| s.id)
            .collect();

        let sender = self
            .signer
            .create_transaction_sender()
            .ok_or(SessionError::MissingSigner)?;

        info!("Cancelling subscriptions {:?} for {}", ids, node);
        let result = self.ledger.cancel_subscriptions(&sender, &ids, node).await?;
        if result.success {
            return Ok(());
        }

        warn!("Cancel rejected: {}", result.raw_log);
        if result.raw_log.contains("can not cancel") {
            Err(ConnectionError::ActiveSession)
        } else {
            Err(ConnectionError::CancelFailed)
        }
    }

    async fn handle_tunnel_event(self: &Arc<Self>, event: TunnelEvent) {
        match event {
            TunnelEvent::ActivationAttemptSucceeded { id } => {
                debug!("Tunnel {} accepted the start request", id);
                self.schedule_activity_update();
            }
            TunnelEvent::ActivationSucceeded { id } => {
                info!("Tunnel {} activated", id);
                self.schedule_activity_update();
            }
            TunnelEvent::DeactivationSucceeded { id } => {
                info!("Tunnel {} deactivated", id);
                self.schedule_activity_update();
            }
            TunnelEvent::ActivationAttemptFailed { id, error }
            | TunnelEvent::ActivationFailed { id, error } => {
                warn!("Tunnel {} failed to activate: {}", id, error);
                self.show_error(error.into()).await;
            }
        }
    }

    /// Report activity after the smoothing delay; a newer call replaces
    /// the pending one
    fn schedule_activity_update(self: &Arc<Self>) {
        let coordinator = Arc::downgrade(self);
        let delay = self.config.activity_delay;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(coordinator) = coordinator.upgrade() {
                coordinator.stop_loading().await;
            }
        });

        if let Some(previous) = lock(&self.activity_timer).replace(timer) {
            previous.abort();
        }
    }

    fn cancel_activity_update(&self) {
        if let Some(pending) = lock(&self.activity_timer).take() {
            pending.abort();
        }
    }

    /// Resolve loading unless the tunnel is still on its way up, in which
    /// case a tunnel event will
    async fn settle_unless_pending(&self) {
        let pending = self.tunnels.last_tunnel().await.is_some_and(|t| {
            matches!(
                t.status,
                TunnelStatus::Connecting | TunnelStatus::Restarting | TunnelStatus::Waiting
            )
        });
        if !pending {
            self.stop_loading().await;
        }
    }

    async fn stop_loading(&self) {
        let is_active = self.tunnels.is_tunnel_active().await;
        self.events.send(ConnectionEvent::TunnelActivityChanged { is_active });
    }

    async fn show_error(&self, error: ConnectionError) {
        error!("{}", error);
        self.cancel_activity_update();
        self.events.send(ConnectionEvent::Error(error));
        self.stop_loading().await;
    }
}

impl Drop for ConnectionCoordinator {
    fn drop(&mut self) {
        self.cancel_activity_update();
    }
}

async fn relay_tunnel_events(
    coordinator: Weak<ConnectionCoordinator>,
    mut events: mpsc::UnboundedReceiver<TunnelEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(coordinator) = coordinator.upgrade() else {
            break;
        };
        coordinator.handle_tunnel_event(event).await;
    }
}
