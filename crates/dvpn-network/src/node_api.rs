//! Node session API
//!
//! A node hands out tunnel material once the client proves it owns the
//! on-chain session: `POST accounts/{address}/sessions/{id}` with the
//! client's WireGuard public key and a signature over the session id.
//!
//! Errors from the node come back as JSON in one of two shapes,
//! `{"errors": [{code, message}, ...]}` or `{"error": {code, message}}`.
//! The first entry wins; anything else falls back to the HTTP status.

use crate::client::{HttpClient, HttpError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

/// Body of the session start call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartSessionRequest {
    /// Base64 WireGuard public key of the client
    pub key: String,
    /// Base64 signature over the big-endian session id
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartSessionResponse {
    pub success: bool,
    /// Base64 session material, present on success
    #[serde(default)]
    pub result: Option<String>,
}

/// Error reported by a node
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Node error {code}: {}", message.as_deref().unwrap_or("no message"))]
pub struct NetworkError {
    pub code: i64,
    pub message: Option<String>,
}

impl NetworkError {
    pub fn is_server_error(&self) -> bool {
        (500..=511).contains(&self.code)
    }

    pub fn is_not_found(&self) -> bool {
        self.code == 404
    }
}

#[derive(Deserialize)]
struct InnerError {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct InnerErrors {
    errors: Vec<InnerError>,
}

#[derive(Deserialize)]
struct SingleInnerError {
    error: InnerError,
}

/// Decode a failed response body into the node's own error code
pub fn parse_network_error(status: u16, body: &[u8]) -> NetworkError {
    if let Ok(inner) = serde_json::from_slice::<InnerErrors>(body) {
        if let Some(first) = inner.errors.into_iter().next() {
            return NetworkError { code: first.code, message: Some(first.message) };
        }
    }

    if let Ok(single) = serde_json::from_slice::<SingleInnerError>(body) {
        return NetworkError { code: single.error.code, message: Some(single.error.message) };
    }

    NetworkError {
        code: i64::from(status),
        message: std::str::from_utf8(body)
            .ok()
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(str::to_string),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeApiError {
    #[error("Invalid node URL: {0}")]
    InvalidUrl(String),

    #[error(transparent)]
    Http(#[from] HttpError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("Malformed node response: {0}")]
    Decode(String),
}

/// Remote node session endpoint
#[async_trait]
pub trait NodeSessionApi: Send + Sync {
    async fn create_client(
        &self,
        remote_url: &Url,
        address: &str,
        session_id: u64,
        request: &StartSessionRequest,
    ) -> Result<StartSessionResponse, NodeApiError>;
}

/// [`NodeSessionApi`] over [`HttpClient`]
pub struct HttpNodeSessionApi {
    client: HttpClient,
}

impl HttpNodeSessionApi {
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }

    /// `{remote_url}/accounts/{address}/sessions/{id}`, keeping any path
    /// prefix the node advertises
    pub fn session_url(remote_url: &Url, address: &str, session_id: u64) -> Result<Url, NodeApiError> {
        let mut base = remote_url.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        base.join(&format!("accounts/{}/sessions/{}", address, session_id))
            .map_err(|e| NodeApiError::InvalidUrl(e.to_string()))
    }
}

#[async_trait]
impl NodeSessionApi for HttpNodeSessionApi {
    async fn create_client(
        &self,
        remote_url: &Url,
        address: &str,
        session_id: u64,
        request: &StartSessionRequest,
    ) -> Result<StartSessionResponse, NodeApiError> {
        let url = Self::session_url(remote_url, address, session_id)?;
        debug!("Requesting session material from {}", url);

        let response = self.client.post_json(url.as_str(), request).await?;

        if !response.is_success() {
            let error = parse_network_error(response.status.as_u16(), &response.body);
            warn!("Node refused session {}: {}", session_id, error);
            return Err(error.into());
        }

        response.json().map_err(|e| NodeApiError::Decode(e.to_string()))
    }
}
