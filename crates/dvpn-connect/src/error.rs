//! Errors at the coordinator boundary

use crate::ledger::LedgerError;
use crate::negotiator::SessionError;
use dvpn_tunnel::{ActivationError, TunnelError};
use thiserror::Error;

/// Everything the connection flow can report to the facade
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("No subscription for the selected node")]
    NoSubscription,

    #[error("No quota left on the subscription")]
    NoQuotaLeft,

    #[error("Tunnel is already active")]
    TunnelIsAlreadyActive,

    #[error("Not enough tokens to pay the transaction fee")]
    NotEnoughTokens,

    #[error("Subscription has active sessions and cannot be cancelled")]
    ActiveSession,

    #[error("Failed to cancel subscription")]
    CancelFailed,

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Ledger request failed: {0}")]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),
}

impl From<ActivationError> for ConnectionError {
    fn from(error: ActivationError) -> Self {
        ConnectionError::Tunnel(TunnelError::Activation(error))
    }
}

impl ConnectionError {
    /// Stable key the facade relays to clients
    pub fn code(&self) -> &'static str {
        match self {
            ConnectionError::NoSubscription => "no_subscription",
            ConnectionError::NoQuotaLeft => "no_quota_left",
            ConnectionError::TunnelIsAlreadyActive => "tunnel_is_already_active",
            ConnectionError::NotEnoughTokens => "not_enough_tokens",
            ConnectionError::ActiveSession => "active_session",
            ConnectionError::CancelFailed => "fail_to_cancel_subscription",
            ConnectionError::Session(error) => match error {
                SessionError::InvalidUrl => "invalid_url",
                SessionError::MissingSigner => "missing_mnemonic",
                SessionError::SignatureGenerationFailed => "signature_generation_failed",
                SessionError::NodeMisconfigured => "node_misconfigured",
                SessionError::NoQuota => "no_quota",
                SessionError::ConnectionParsingFailed => "connection_parsing_failed",
                SessionError::Ledger(_) => "session_start_failed",
                SessionError::Network(_) => "node_request_failed",
            },
            ConnectionError::Ledger(_) => "ledger_request_failed",
            ConnectionError::Tunnel(_) => "tunnel_error",
        }
    }

    /// The user has to buy or renew a plan before trying again
    pub fn needs_plan(&self) -> bool {
        matches!(
            self,
            ConnectionError::NoSubscription
                | ConnectionError::NoQuotaLeft
                | ConnectionError::Session(SessionError::NoQuota)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(ConnectionError::NoQuotaLeft.code(), "no_quota_left");
        assert_eq!(ConnectionError::from(SessionError::NodeMisconfigured).code(), "node_misconfigured");
        assert_eq!(ConnectionError::from(ActivationError::Inactive).code(), "tunnel_error");
    }

    #[test]
    fn test_needs_plan() {
        assert!(ConnectionError::NoSubscription.needs_plan());
        assert!(ConnectionError::from(SessionError::NoQuota).needs_plan());
        assert!(!ConnectionError::TunnelIsAlreadyActive.needs_plan());
    }
}
