//! dVPN Connect - connection orchestration
//!
//! Takes a node address and ends with a running tunnel, or with an event
//! telling the user why not.
//!
//! # Architecture
//!
//! ```text
//!                 ┌───────────────────────┐
//!   connect() ───▶│ ConnectionCoordinator │───▶ ConnectionEvent stream
//!                 └───┬───────┬───────┬───┘
//!                     │       │       │
//!          ┌──────────▼─┐ ┌───▼──────────────┐ ┌──▼────────────┐
//!          │ QuotaGate  │ │SessionNegotiator │ │ TunnelManager │
//!          │subscription│ │chain + node API  │ │ (dvpn-tunnel) │
//!          │  + quota   │ │  58-byte blob    │ │               │
//!          └─────┬──────┘ └───┬──────────┬───┘ └───────────────┘
//!                │            │          │
//!          ┌─────▼────────────▼──┐  ┌────▼───────────┐
//!          │ SubscriptionLedger  │  │ NodeSessionApi │
//!          │   WalletSigner      │  │ (dvpn-network) │
//!          └─────────────────────┘  └────────────────┘
//! ```

mod coordinator;
mod error;
mod events;
mod negotiator;
mod quota;
mod settings;
mod store;
pub mod ledger;

pub use coordinator::{
    Collaborators, ConnectOutcome, ConnectionCoordinator, CoordinatorConfig, DisconnectOutcome,
};
pub use error::ConnectionError;
pub use events::{ConnectionEvent, EventSink, SUBSCRIPTION_CANCELED};
pub use ledger::{
    Coin, LedgerError, NodeDirectory, NodeInfo, Quota, Session, Subscription, SubscriptionLedger,
    TransactionSender, TxResult, WalletSigner,
};
pub use negotiator::{NegotiatedSession, SessionError, SessionNegotiator};
pub use quota::QuotaGate;
pub use settings::{ClientSettings, SettingsError};
pub use store::{ConnectInfoStore, DnsServer, DnsStore, MemoryStore};
