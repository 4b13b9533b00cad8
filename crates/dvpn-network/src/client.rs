//! HTTP Client
//!
//! Uses hyper with tokio for async HTTP/1.1.
//! Features:
//! - Plain HTTP for node endpoints, HTTPS with rustls when asked for
//! - Whole-request timeout and a cap on response size
//! - JSON request/response helpers

use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderValue, CONTENT_TYPE, HOST, USER_AGENT};
use hyper::{Method, Request, StatusCode, Uri};
use rustls::ClientConfig;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

/// HTTP client errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HttpError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Request timeout")]
    Timeout,

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Body read error: {0}")]
    BodyError(String),

    #[error("Invalid request body: {0}")]
    InvalidBody(String),
}

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Whole-request timeout
    pub timeout: Duration,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// User-Agent string
    pub user_agent: String,
    /// Maximum response body size
    pub max_body_size: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(10),
            user_agent: format!("dvpn-client/{}", env!("CARGO_PKG_VERSION")),
            max_body_size: 1024 * 1024, // 1 MB
        }
    }
}

/// HTTP response wrapper
#[derive(Debug)]
pub struct Response {
    /// Status code
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Response body
    pub body: Vec<u8>,
    /// Time to first byte
    pub ttfb: Duration,
    /// Total download time
    pub total_time: Duration,
    /// Requested URL
    pub final_url: String,
}

impl Response {
    /// Check if response was successful (2xx)
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Get body as string
    pub fn text(&self) -> Result<String, std::string::FromUtf8Error> {
        String::from_utf8(self.body.clone())
    }

    /// Decode the body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// Get Content-Type header
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE)?.to_str().ok()
    }
}

/// Client statistics
#[derive(Debug, Default)]
pub struct ClientStats {
    pub requests_made: AtomicU64,
    pub requests_failed: AtomicU64,
    pub bytes_downloaded: AtomicU64,
}

/// HTTP client
pub struct HttpClient {
    /// Configuration
    config: HttpClientConfig,
    /// Statistics
    stats: ClientStats,
}

impl HttpClient {
    /// Create a new HTTP client
    pub fn new(config: HttpClientConfig) -> Self {
        info!(
            "HTTP client initialized (timeout: {:?}, max body: {} bytes)",
            config.timeout, config.max_body_size
        );

        Self {
            config,
            stats: ClientStats::default(),
        }
    }

    /// Create with default configuration
    pub fn with_defaults() -> Self {
        Self::new(HttpClientConfig::default())
    }

    pub fn config(&self) -> &HttpClientConfig {
        &self.config
    }

    /// Perform a GET request
    pub async fn get(&self, url: &str) -> Result<Response, HttpError> {
        self.request(Method::GET, url, None).await
    }

    /// Perform a POST request with a JSON body
    pub async fn post_json<T: Serialize + ?Sized>(&self, url: &str, body: &T) -> Result<Response, HttpError> {
        let bytes = serde_json::to_vec(body)
            .map_err(|e| HttpError::InvalidBody(e.to_string()))?;
        self.request(Method::POST, url, Some(bytes)).await
    }

    /// Perform an HTTP request, bounded by the configured timeout
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        body: Option<Vec<u8>>,
    ) -> Result<Response, HttpError> {
        self.stats.requests_made.fetch_add(1, Ordering::Relaxed);

        let result = match tokio::time::timeout(self.config.timeout, self.send(method, url, body)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Request to {} timed out after {:?}", url, self.config.timeout);
                Err(HttpError::Timeout)
            }
        };

        if result.is_err() {
            self.stats.requests_failed.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<Vec<u8>>,
    ) -> Result<Response, HttpError> {
        let start = Instant::now();

        // 1. Parse URL
        let uri: Uri = url.parse()
            .map_err(|e: hyper::http::uri::InvalidUri| HttpError::InvalidUrl(e.to_string()))?;

        let host = uri.host()
            .ok_or_else(|| HttpError::InvalidUrl("No host in URL".to_string()))?
            .to_string();
        let is_https = uri.scheme_str() == Some("https");
        let port = uri.port_u16().unwrap_or(if is_https { 443 } else { 80 });
        let authority = uri.authority()
            .map(|a| a.as_str().to_string())
            .unwrap_or_else(|| host.clone());
        let path = uri.path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/");

        // 2. Build request
        let mut builder = Request::builder()
            .method(method.clone())
            .uri(path)
            .header(USER_AGENT, &self.config.user_agent)
            .header(HOST, authority);
        if body.is_some() {
            builder = builder.header(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }
        let request = builder
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| HttpError::HttpError(e.to_string()))?;

        // 3. Connect
        let addr = format!("{}:{}", host, port);
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| HttpError::ConnectionFailed(format!("connect to {} timed out", addr)))?
            .map_err(|e| HttpError::ConnectionFailed(e.to_string()))?;

        let ttfb_start = Instant::now();
        let response = if is_https {
            let mut root_store = rustls::RootCertStore::empty();
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

            let tls_config = ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth();

            let connector = TlsConnector::from(Arc::new(tls_config));
            let server_name = rustls::pki_types::ServerName::try_from(host.clone())
                .map_err(|_| HttpError::TlsError("Invalid server name".to_string()))?;

            let tls_stream = connector.connect(server_name, stream).await
                .map_err(|e| HttpError::TlsError(e.to_string()))?;
            exchange(tls_stream, request).await?
        } else {
            exchange(stream, request).await?
        };
        let ttfb = ttfb_start.elapsed();

        // 4. Read response with size limit
        let status = response.status();
        let headers = response.headers().clone();
        let collected = Limited::new(response.into_body(), self.config.max_body_size)
            .collect()
            .await
            .map_err(|e| HttpError::BodyError(e.to_string()))?;
        let body_bytes = collected.to_bytes().to_vec();

        self.stats.bytes_downloaded.fetch_add(body_bytes.len() as u64, Ordering::Relaxed);

        debug!(
            "HTTP {} {} -> {} ({} bytes, {:?} TTFB)",
            method, url, status, body_bytes.len(), ttfb
        );

        Ok(Response {
            status,
            headers,
            body: body_bytes,
            ttfb,
            total_time: start.elapsed(),
            final_url: url.to_string(),
        })
    }

    /// `(requests made, requests failed, bytes downloaded)`
    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.stats.requests_made.load(Ordering::Relaxed),
            self.stats.requests_failed.load(Ordering::Relaxed),
            self.stats.bytes_downloaded.load(Ordering::Relaxed),
        )
    }
}

async fn exchange<S>(
    stream: S,
    request: Request<Full<Bytes>>,
) -> Result<hyper::Response<hyper::body::Incoming>, HttpError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await
        .map_err(|e| HttpError::HttpError(e.to_string()))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            warn!("Connection error: {}", e);
        }
    });

    sender.send_request(request).await
        .map_err(|e| HttpError::HttpError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{serve_once, serve_silently};

    #[test]
    fn test_client_creation() {
        let client = HttpClient::with_defaults();
        assert_eq!(client.config().timeout, Duration::from_secs(15));
        assert!(client.config().user_agent.starts_with("dvpn-client/"));
    }

    #[tokio::test]
    async fn test_post_json_roundtrip() {
        let (base, server) = serve_once("200 OK", r#"{"ok":true}"#).await;
        let client = HttpClient::with_defaults();

        let response = client
            .post_json(&format!("{}/accounts/abc/sessions/7", base), &serde_json::json!({"key": "k"}))
            .await
            .unwrap();

        assert!(response.is_success());
        assert_eq!(response.content_type(), Some("application/json"));
        assert_eq!(response.json::<serde_json::Value>().unwrap()["ok"], true);

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /accounts/abc/sessions/7 HTTP/1.1\r\n"));
        assert!(request.ends_with(r#"{"key":"k"}"#));
        assert_eq!(client.stats().0, 1);
    }

    #[tokio::test]
    async fn test_error_status_is_not_an_error() {
        let (base, _server) = serve_once("404 Not Found", "{}").await;
        let client = HttpClient::with_defaults();

        let response = client.get(&base).await.unwrap();
        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert!(!response.is_success());
    }

    #[tokio::test]
    async fn test_timeout() {
        let base = serve_silently().await;
        let client = HttpClient::new(HttpClientConfig {
            timeout: Duration::from_millis(100),
            ..HttpClientConfig::default()
        });

        assert_eq!(client.get(&base).await.unwrap_err(), HttpError::Timeout);
        assert_eq!(client.stats().1, 1);
    }

    #[tokio::test]
    async fn test_invalid_url() {
        let client = HttpClient::with_defaults();
        assert!(matches!(client.get("not a url").await, Err(HttpError::InvalidUrl(_))));
    }
}
