//! reqwest-backed transport for live APIs

use super::{ApiResponse, ApiTransport, Auth, TransportError};
use crate::endpoint::{EndpointDescriptor, PaginationMode};
use crate::fetch::PageRequest;
use eyre::{Context, Result};
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use url::Url;

/// Production [`ApiTransport`] speaking HTTPS to one API base URL.
///
/// Pagination is expressed with conventional query parameters: `page` and
/// `per_page` for paged endpoints (or `cursor` once the upstream hands one
/// back), `limit` for single-shot endpoints. Endpoint-specific parameters
/// from the manifest are sent on every request.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: Client,
    base_url: Url,
}

impl HttpTransport {
    /// Build a transport for `base_url` using `auth`.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built or the auth
    /// header value is malformed.
    pub fn try_new(base_url: Url, auth: Auth) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::ACCEPT, "application/json".parse()?);
        if let Some(value) = auth.header_value() {
            headers.insert(reqwest::header::AUTHORIZATION, value.parse()?);
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Pagination query parameters for one page request.
    fn page_query(endpoint: &EndpointDescriptor, page: &PageRequest) -> Vec<(String, String)> {
        let mut query: Vec<(String, String)> = endpoint
            .params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        match endpoint.mode {
            PaginationMode::Paged { .. } => {
                query.push(("per_page".to_string(), page.size.to_string()));
                match &page.cursor {
                    Some(cursor) => query.push(("cursor".to_string(), cursor.clone())),
                    None => query.push(("page".to_string(), page.index.to_string())),
                }
            }
            PaginationMode::SingleShot { .. } => {
                query.push(("limit".to_string(), page.size.to_string()));
            }
        }

        query
    }

    fn classify(error: reqwest::Error) -> TransportError {
        if error.is_timeout() {
            TransportError::Timeout
        } else if error.is_connect() {
            TransportError::Connect(error.to_string())
        } else {
            TransportError::Other(error.to_string())
        }
    }
}

impl ApiTransport for HttpTransport {
    async fn request(
        &self,
        endpoint: &EndpointDescriptor,
        page: &PageRequest,
    ) -> Result<ApiResponse, TransportError> {
        let path = endpoint.path.strip_prefix('/').unwrap_or(&endpoint.path);
        let url = self
            .base_url
            .join(path)
            .map_err(|e| TransportError::Other(format!("invalid request URL: {}", e)))?;

        let query = Self::page_query(endpoint, page);
        log::trace!("GET {} {:?}", url, query);

        let response = self
            .client
            .get(url)
            .query(&query)
            .send()
            .await
            .map_err(Self::classify)?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs);

        // Error bodies are frequently HTML or empty; the engine only needs
        // the status code in that case.
        let body = response.json::<Value>().await.unwrap_or(Value::Null);

        Ok(ApiResponse {
            status,
            retry_after,
            body,
        })
    }
}
