//! Session negotiation
//!
//! Two steps, each against a different party:
//! 1. A `start_session` transaction on the chain bills a new session
//!    against the subscription and returns its id.
//! 2. The node is asked for tunnel material for that session. The request
//!    carries a fresh WireGuard public key and the wallet's signature over
//!    the session id (8 bytes, big-endian); the node answers with a base64
//!    58-byte blob.
//!
//! Neither step is retried here: a session start that fails ambiguously
//! may still have been billed.

use crate::ledger::{LedgerError, SubscriptionLedger, WalletSigner};
use dvpn_network::{NodeApiError, NodeSessionApi, StartSessionRequest};
use dvpn_tunnel::{PrivateKey, SessionMaterial};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Invalid node URL")]
    InvalidUrl,

    #[error("No wallet is available to sign transactions")]
    MissingSigner,

    #[error("Failed to sign the session request")]
    SignatureGenerationFailed,

    #[error("Node is misconfigured")]
    NodeMisconfigured,

    #[error("Node reports no quota left")]
    NoQuota,

    #[error("Failed to parse connection data")]
    ConnectionParsingFailed,

    #[error("Session start failed: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Node request failed: {0}")]
    Network(NodeApiError),
}

impl From<NodeApiError> for SessionError {
    fn from(error: NodeApiError) -> Self {
        match error {
            NodeApiError::Network(network) => match network.code {
                3..=5 => SessionError::NodeMisconfigured,
                6..=8 => SessionError::ConnectionParsingFailed,
                9 | 10 => SessionError::NoQuota,
                _ => SessionError::Network(NodeApiError::Network(network)),
            },
            NodeApiError::Decode(_) => SessionError::ConnectionParsingFailed,
            other => SessionError::Network(other),
        }
    }
}

/// Material for a tunnel plus the private key that goes with it
#[derive(Debug, Clone)]
pub struct NegotiatedSession {
    pub material: SessionMaterial,
    pub private_key: PrivateKey,
}

pub struct SessionNegotiator {
    ledger: Arc<dyn SubscriptionLedger>,
    signer: Arc<dyn WalletSigner>,
    node_api: Arc<dyn NodeSessionApi>,
}

impl SessionNegotiator {
    pub fn new(
        ledger: Arc<dyn SubscriptionLedger>,
        signer: Arc<dyn WalletSigner>,
        node_api: Arc<dyn NodeSessionApi>,
    ) -> Self {
        Self {
            ledger,
            signer,
            node_api,
        }
    }

    /// Broadcast the session start; returns the new session id
    pub async fn start_session(&self, subscription_id: u64, node: &str) -> Result<u64, SessionError> {
        let sender = self
            .signer
            .create_transaction_sender()
            .ok_or(SessionError::MissingSigner)?;

        info!("Starting session on subscription {} with node {}", subscription_id, node);
        let id = self.ledger.start_session(&sender, subscription_id, node).await?;
        info!("Session {} started", id);
        Ok(id)
    }

    /// Wallet signature over the big-endian session id
    pub fn sign_session(&self, session_id: u64) -> Result<String, SessionError> {
        self.signer
            .sign(&session_id.to_be_bytes())
            .ok_or(SessionError::SignatureGenerationFailed)
    }

    /// Ask the node for tunnel material for `session_id`
    pub async fn fetch_session_material(
        &self,
        remote_url: &str,
        session_id: u64,
        account_address: &str,
        signature: &str,
    ) -> Result<NegotiatedSession, SessionError> {
        let url = plain_http_url(remote_url)?;
        let private_key = PrivateKey::generate();
        let request = StartSessionRequest {
            key: private_key.public_key().to_base64(),
            signature: signature.to_string(),
        };

        debug!("Fetching connection data for session {} from {}", session_id, url);
        let response = self
            .node_api
            .create_client(&url, account_address, session_id, &request)
            .await
            .map_err(|e| {
                warn!("Node refused session {}: {}", session_id, e);
                SessionError::from(e)
            })?;

        let result = match response.result {
            Some(result) if response.success => result,
            _ => {
                warn!("Node answered session {} without connection data", session_id);
                return Err(SessionError::ConnectionParsingFailed);
            }
        };

        let material = SessionMaterial::from_base64(&result).map_err(|e| {
            warn!("Malformed connection data for session {}: {}", session_id, e);
            SessionError::ConnectionParsingFailed
        })?;

        info!("Session {} material received, endpoint {}", session_id, material.endpoint());
        Ok(NegotiatedSession {
            material,
            private_key,
        })
    }
}

/// Nodes serve the session API over plain HTTP whatever scheme they
/// advertise
fn plain_http_url(remote_url: &str) -> Result<Url, SessionError> {
    let trimmed = remote_url.trim();
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    };

    let mut url = Url::parse(&candidate).map_err(|_| SessionError::InvalidUrl)?;
    if url.scheme() != "http" {
        url.set_scheme("http").map_err(|_| SessionError::InvalidUrl)?;
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(SessionError::InvalidUrl);
    }
    Ok(url)
}
