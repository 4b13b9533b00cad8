//! Subscription and quota gate

use crate::ledger::{LedgerError, Quota, Subscription, SubscriptionLedger, WalletSigner};
use std::sync::Arc;
use tracing::{debug, info};

/// Decides whether the wallet may connect to a node at all
pub struct QuotaGate {
    ledger: Arc<dyn SubscriptionLedger>,
    signer: Arc<dyn WalletSigner>,
}

impl QuotaGate {
    pub fn new(ledger: Arc<dyn SubscriptionLedger>, signer: Arc<dyn WalletSigner>) -> Self {
        Self { ledger, signer }
    }

    /// Newest active subscription for `node`, if any
    pub async fn load_subscription(&self, node: &str) -> Result<Option<Subscription>, LedgerError> {
        let owner = self.signer.current_address();
        let subscriptions = self.ledger.active_subscriptions(&owner).await?;
        let found = subscriptions.into_iter().rev().find(|s| s.node == node);

        match &found {
            Some(subscription) => debug!("Subscription {} covers node {}", subscription.id, node),
            None => info!("No subscription for node {}", node),
        }
        Ok(found)
    }

    /// Always a fresh query; errors are passed on as they are
    pub async fn query_quota(&self, subscription: &Subscription) -> Result<Quota, LedgerError> {
        let owner = self.signer.current_address();
        let quota = self.ledger.quota(&owner, subscription.id).await?;
        debug!(
            "Subscription {} quota: allocated {}, consumed {}",
            subscription.id, quota.allocated, quota.consumed
        );
        Ok(quota)
    }

    pub fn has_usable_quota(quota: &Quota, subscription_active: bool) -> bool {
        let usable = quota.remaining() != 0 && subscription_active;
        if !usable {
            info!(
                "Quota refused (remaining {}, active {})",
                quota.remaining(),
                subscription_active
            );
        }
        usable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::mock::{MockLedger, MockSigner};

    fn subscription(id: u64, node: &str) -> Subscription {
        Subscription {
            id,
            node: node.into(),
            owner: "sent1me".into(),
            is_active: true,
        }
    }

    fn gate(ledger: &Arc<MockLedger>) -> QuotaGate {
        QuotaGate::new(ledger.clone(), Arc::new(MockSigner::new("sent1me")))
    }

    #[tokio::test]
    async fn test_load_subscription_picks_last_match() {
        let ledger = Arc::new(MockLedger::new());
        ledger.add_subscription(subscription(1, "node-a"), Quota::new("1", "0"));
        ledger.add_subscription(subscription(2, "node-b"), Quota::new("1", "0"));
        ledger.add_subscription(subscription(3, "node-a"), Quota::new("1", "0"));

        let found = gate(&ledger).load_subscription("node-a").await.unwrap();
        assert_eq!(found.map(|s| s.id), Some(3));
        assert_eq!(gate(&ledger).load_subscription("node-c").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_query_quota_surfaces_errors() {
        let ledger = Arc::new(MockLedger::new());
        ledger.add_subscription(subscription(1, "node-a"), Quota::new("5", "2"));
        let gate = gate(&ledger);

        let quota = gate.query_quota(&subscription(1, "node-a")).await.unwrap();
        assert_eq!(quota.remaining(), 3);

        ledger.fail(MockLedger::QUOTA);
        assert!(gate.query_quota(&subscription(1, "node-a")).await.is_err());
    }

    #[test]
    fn test_has_usable_quota() {
        let cases = [
            ("1000", "1000", true, false),
            ("1000", "999", true, true),
            ("1000", "999", false, false),
            ("0", "0", true, false),
            ("100", "200", true, true),
            ("garbage", "0", true, false),
            ("9223372036854775807", "-9223372036854775808", true, true),
        ];

        for (allocated, consumed, active, expected) in cases {
            let quota = Quota::new(allocated, consumed);
            assert_eq!(
                QuotaGate::has_usable_quota(&quota, active),
                expected,
                "allocated={} consumed={} active={}",
                allocated,
                consumed,
                active
            );
        }
    }
}
