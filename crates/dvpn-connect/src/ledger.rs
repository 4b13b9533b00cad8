//! Chain-side collaborators
//!
//! Subscriptions, quotas, sessions and balances live on a blockchain this
//! crate never talks to directly. Whatever light client the application
//! embeds implements these traits; [`mock`] holds in-memory versions for
//! tests and offline tools.

use async_trait::async_trait;
use thiserror::Error;

pub mod mock;

/// Right to consume bandwidth from one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: u64,
    /// Node address
    pub node: String,
    /// Wallet that paid for it
    pub owner: String,
    pub is_active: bool,
}

/// Bandwidth counters, as decimal strings the way the chain reports them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quota {
    pub allocated: String,
    pub consumed: String,
}

impl Quota {
    pub fn new(allocated: impl Into<String>, consumed: impl Into<String>) -> Self {
        Self {
            allocated: allocated.into(),
            consumed: consumed.into(),
        }
    }

    /// `allocated - consumed`. Counters that do not parse count as 0 and
    /// the subtraction saturates instead of wrapping.
    pub fn remaining(&self) -> i64 {
        parse_counter(&self.allocated).saturating_sub(parse_counter(&self.consumed))
    }
}

fn parse_counter(value: &str) -> i64 {
    value.trim().parse().unwrap_or(0)
}

/// Node-side authorization for one tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: u64,
    pub subscription_id: u64,
    pub node: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coin {
    pub denom: String,
    pub amount: String,
}

impl Coin {
    pub fn new(denom: impl Into<String>, amount: impl Into<String>) -> Self {
        Self {
            denom: denom.into(),
            amount: amount.into(),
        }
    }

    /// Amount as an integer, 0 when it does not parse
    pub fn amount_value(&self) -> u128 {
        self.amount.trim().parse().unwrap_or(0)
    }
}

/// Where a node can be reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub address: String,
    pub remote_url: String,
}

/// Handle a wallet hands out for broadcasting transactions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionSender {
    pub owner: String,
}

/// Broadcast result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxResult {
    pub success: bool,
    pub raw_log: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("Ledger unavailable: {0}")]
    Unavailable(String),

    #[error("Transaction rejected: {0}")]
    Rejected(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Subscription and session queries plus the two transactions the
/// connection flow broadcasts
#[async_trait]
pub trait SubscriptionLedger: Send + Sync {
    async fn active_subscriptions(&self, owner: &str) -> Result<Vec<Subscription>, LedgerError>;

    async fn quota(&self, owner: &str, subscription_id: u64) -> Result<Quota, LedgerError>;

    async fn active_sessions(&self, owner: &str) -> Result<Vec<Session>, LedgerError>;

    async fn balances(&self, owner: &str) -> Result<Vec<Coin>, LedgerError>;

    /// Not idempotent: every successful call opens and bills a new session
    async fn start_session(
        &self,
        sender: &TransactionSender,
        subscription_id: u64,
        node: &str,
    ) -> Result<u64, LedgerError>;

    async fn cancel_subscriptions(
        &self,
        sender: &TransactionSender,
        subscription_ids: &[u64],
        node: &str,
    ) -> Result<TxResult, LedgerError>;
}

#[async_trait]
pub trait NodeDirectory: Send + Sync {
    async fn node(&self, address: &str) -> Result<NodeInfo, LedgerError>;
}

/// Wallet holding the account keys
pub trait WalletSigner: Send + Sync {
    fn current_address(&self) -> String;

    /// Base64 signature, or `None` when no key is loaded
    fn sign(&self, data: &[u8]) -> Option<String>;

    /// Fee for one transaction, in the fee denom
    fn fee(&self) -> u128;

    fn create_transaction_sender(&self) -> Option<TransactionSender>;
}
