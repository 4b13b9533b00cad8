//! In-memory chain collaborators
//!
//! State is seeded up front; failures are switched on per call kind.
//! Every call is counted so tests can assert what was never reached.

use super::{
    Coin, LedgerError, NodeDirectory, NodeInfo, Quota, Session, Subscription, SubscriptionLedger,
    TransactionSender, TxResult, WalletSigner,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use dvpn_network::{NodeApiError, NodeSessionApi, StartSessionRequest, StartSessionResponse};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use url::Url;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct LedgerState {
    subscriptions: Vec<Subscription>,
    quotas: HashMap<u64, Quota>,
    sessions: Vec<Session>,
    balances: Vec<Coin>,
    nodes: HashMap<String, NodeInfo>,
    next_session_id: u64,
    cancel_result: Option<TxResult>,
    failing: Vec<&'static str>,
    calls: HashMap<&'static str, usize>,
}

impl LedgerState {
    fn enter(&mut self, call: &'static str) -> Result<(), LedgerError> {
        *self.calls.entry(call).or_default() += 1;
        if self.failing.contains(&call) {
            return Err(LedgerError::Unavailable(format!("{} failed", call)));
        }
        Ok(())
    }
}

/// Ledger and node directory backed by maps
pub struct MockLedger {
    state: Mutex<LedgerState>,
}

impl MockLedger {
    pub const SUBSCRIPTIONS: &'static str = "active_subscriptions";
    pub const QUOTA: &'static str = "quota";
    pub const SESSIONS: &'static str = "active_sessions";
    pub const BALANCES: &'static str = "balances";
    pub const START_SESSION: &'static str = "start_session";
    pub const CANCEL: &'static str = "cancel_subscriptions";
    pub const NODE: &'static str = "node";

    pub fn new() -> Self {
        Self {
            state: Mutex::new(LedgerState {
                next_session_id: 1,
                ..LedgerState::default()
            }),
        }
    }

    pub fn add_subscription(&self, subscription: Subscription, quota: Quota) {
        let mut state = lock(&self.state);
        state.quotas.insert(subscription.id, quota);
        state.subscriptions.push(subscription);
    }

    pub fn set_quota(&self, subscription_id: u64, quota: Quota) {
        lock(&self.state).quotas.insert(subscription_id, quota);
    }

    pub fn add_session(&self, session: Session) {
        lock(&self.state).sessions.push(session);
    }

    pub fn set_balances(&self, balances: Vec<Coin>) {
        lock(&self.state).balances = balances;
    }

    pub fn add_node(&self, address: &str, remote_url: &str) {
        lock(&self.state).nodes.insert(
            address.to_string(),
            NodeInfo {
                address: address.to_string(),
                remote_url: remote_url.to_string(),
            },
        );
    }

    /// Id handed out by the next `start_session`
    pub fn set_next_session_id(&self, id: u64) {
        lock(&self.state).next_session_id = id;
    }

    pub fn set_cancel_result(&self, result: TxResult) {
        lock(&self.state).cancel_result = Some(result);
    }

    /// Make every call of this kind fail, e.g. [`MockLedger::QUOTA`]
    pub fn fail(&self, call: &'static str) {
        lock(&self.state).failing.push(call);
    }

    pub fn calls(&self, call: &'static str) -> usize {
        lock(&self.state).calls.get(call).copied().unwrap_or(0)
    }

    pub fn sessions(&self) -> Vec<Session> {
        lock(&self.state).sessions.clone()
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        lock(&self.state).subscriptions.clone()
    }
}

impl Default for MockLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SubscriptionLedger for MockLedger {
    async fn active_subscriptions(&self, owner: &str) -> Result<Vec<Subscription>, LedgerError> {
        let mut state = lock(&self.state);
        state.enter(Self::SUBSCRIPTIONS)?;
        Ok(state
            .subscriptions
            .iter()
            .filter(|s| s.owner == owner && s.is_active)
            .cloned()
            .collect())
    }

    async fn quota(&self, _owner: &str, subscription_id: u64) -> Result<Quota, LedgerError> {
        let mut state = lock(&self.state);
        state.enter(Self::QUOTA)?;
        state
            .quotas
            .get(&subscription_id)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("quota for subscription {}", subscription_id)))
    }

    async fn active_sessions(&self, _owner: &str) -> Result<Vec<Session>, LedgerError> {
        let mut state = lock(&self.state);
        state.enter(Self::SESSIONS)?;
        Ok(state.sessions.clone())
    }

    async fn balances(&self, _owner: &str) -> Result<Vec<Coin>, LedgerError> {
        let mut state = lock(&self.state);
        state.enter(Self::BALANCES)?;
        Ok(state.balances.clone())
    }

    async fn start_session(
        &self,
        _sender: &TransactionSender,
        subscription_id: u64,
        node: &str,
    ) -> Result<u64, LedgerError> {
        let mut state = lock(&self.state);
        state.enter(Self::START_SESSION)?;
        let id = state.next_session_id;
        state.next_session_id += 1;
        state.sessions.push(Session {
            id,
            subscription_id,
            node: node.to_string(),
        });
        Ok(id)
    }

    async fn cancel_subscriptions(
        &self,
        _sender: &TransactionSender,
        subscription_ids: &[u64],
        _node: &str,
    ) -> Result<TxResult, LedgerError> {
        let mut state = lock(&self.state);
        state.enter(Self::CANCEL)?;
        let result = state.cancel_result.clone().unwrap_or(TxResult {
            success: true,
            raw_log: String::new(),
        });
        if result.success {
            state.subscriptions.retain(|s| !subscription_ids.contains(&s.id));
        }
        Ok(result)
    }
}

#[async_trait]
impl NodeDirectory for MockLedger {
    async fn node(&self, address: &str) -> Result<NodeInfo, LedgerError> {
        let mut state = lock(&self.state);
        state.enter(Self::NODE)?;
        state
            .nodes
            .get(address)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("node {}", address)))
    }
}

/// Wallet that signs with a fixed marker instead of a real key
pub struct MockSigner {
    address: String,
    fee: u128,
    can_sign: bool,
    has_sender: bool,
    signed: Mutex<Vec<Vec<u8>>>,
}

impl MockSigner {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            fee: 10_000,
            can_sign: true,
            has_sender: true,
            signed: Mutex::new(Vec::new()),
        }
    }

    pub fn with_fee(mut self, fee: u128) -> Self {
        self.fee = fee;
        self
    }

    /// No key loaded: signing returns `None`
    pub fn without_key(mut self) -> Self {
        self.can_sign = false;
        self
    }

    /// No mnemonic: no transactions can be broadcast
    pub fn without_sender(mut self) -> Self {
        self.has_sender = false;
        self
    }

    /// Every payload passed to [`WalletSigner::sign`]
    pub fn signed_payloads(&self) -> Vec<Vec<u8>> {
        lock(&self.signed).clone()
    }
}

impl WalletSigner for MockSigner {
    fn current_address(&self) -> String {
        self.address.clone()
    }

    fn sign(&self, data: &[u8]) -> Option<String> {
        lock(&self.signed).push(data.to_vec());
        self.can_sign
            .then(|| STANDARD.encode([b"sig:".as_slice(), data].concat()))
    }

    fn fee(&self) -> u128 {
        self.fee
    }

    fn create_transaction_sender(&self) -> Option<TransactionSender> {
        self.has_sender.then(|| TransactionSender {
            owner: self.address.clone(),
        })
    }
}

/// One recorded `create_client` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeCall {
    pub remote_url: Url,
    pub address: String,
    pub session_id: u64,
    pub request: StartSessionRequest,
}

/// Node endpoint replaying queued responses, first in first out
pub struct MockNodeApi {
    responses: Mutex<VecDeque<Result<StartSessionResponse, NodeApiError>>>,
    calls: Mutex<Vec<NodeCall>>,
}

impl MockNodeApi {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn push_response(&self, response: Result<StartSessionResponse, NodeApiError>) {
        lock(&self.responses).push_back(response);
    }

    /// Queue a successful response carrying `result`
    pub fn push_result(&self, result: &str) {
        self.push_response(Ok(StartSessionResponse {
            success: true,
            result: Some(result.to_string()),
        }));
    }

    pub fn calls(&self) -> Vec<NodeCall> {
        lock(&self.calls).clone()
    }
}

impl Default for MockNodeApi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeSessionApi for MockNodeApi {
    async fn create_client(
        &self,
        remote_url: &Url,
        address: &str,
        session_id: u64,
        request: &StartSessionRequest,
    ) -> Result<StartSessionResponse, NodeApiError> {
        lock(&self.calls).push(NodeCall {
            remote_url: remote_url.clone(),
            address: address.to_string(),
            session_id,
            request: request.clone(),
        });
        lock(&self.responses)
            .pop_front()
            .unwrap_or_else(|| Err(NodeApiError::Decode("no mock response".to_string())))
    }
}
