//! API transport and authentication
//!
//! [`ApiTransport`] is the seam between the extraction engine and the wire:
//! the engine only ever sees a status code, an optional `Retry-After` hint,
//! and a JSON body. [`HttpTransport`] is the reqwest-backed production
//! implementation; tests swap in scripted transports.

mod auth;
mod http;

pub use auth::Auth;
pub use http::HttpTransport;

use crate::endpoint::EndpointDescriptor;
use crate::fetch::PageRequest;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// One API response, reduced to what the engine needs.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    /// Parsed `Retry-After` header, if the response carried one
    pub retry_after: Option<Duration>,
    /// Response body; `Null` when the body was absent or not JSON
    pub body: Value,
}

impl ApiResponse {
    pub fn ok(body: Value) -> Self {
        Self {
            status: 200,
            retry_after: None,
            body,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Failures below the HTTP layer: the request never produced a status code.
///
/// All variants are treated as transient and retried like a 5xx.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("transport error: {0}")]
    Other(String),
}

/// An authenticated request function for one upstream API.
///
/// Implementors issue a single request for one page of one endpoint and
/// return the response verbatim. Retry, rate limiting, and pagination all
/// live above this seam.
pub trait ApiTransport: Send + Sync {
    fn request(
        &self,
        endpoint: &EndpointDescriptor,
        page: &PageRequest,
    ) -> impl Future<Output = Result<ApiResponse, TransportError>> + Send;
}
