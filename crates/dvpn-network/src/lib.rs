//! dVPN Network Layer
//!
//! HTTP transport for talking to dVPN nodes.
//!
//! Architecture:
//! 1. `HttpClient` opens a connection per request (plain TCP or rustls)
//! 2. `NodeSessionApi` posts the signed session request to the node
//! 3. Failures are decoded into the node's own error codes

mod client;
mod node_api;

#[cfg(test)]
mod test_support;

pub use client::{HttpClient, HttpClientConfig, HttpError, Response};
pub use node_api::{
    parse_network_error, HttpNodeSessionApi, NetworkError, NodeApiError, NodeSessionApi,
    StartSessionRequest, StartSessionResponse,
};
