//! Single-page fetching under rate-limit and retry discipline

use crate::client::{ApiTransport, TransportError};
use crate::endpoint::{EndpointDescriptor, RecordMapper};
use crate::limiter::RateLimiter;
use crate::retry::{RetryDecision, RetryPolicy};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

/// Parameters for one page request.
#[derive(Debug, Clone)]
pub struct PageRequest {
    /// 1-based page number
    pub index: u64,
    /// Records requested
    pub size: u32,
    /// Cursor returned by the previous page, when the API paginates by cursor
    pub cursor: Option<String>,
}

impl PageRequest {
    pub fn first(size: u32) -> Self {
        Self {
            index: 1,
            size,
            cursor: None,
        }
    }

    /// The request that follows this one.
    pub fn next(&self, cursor: Option<String>) -> Self {
        Self {
            index: self.index + 1,
            size: self.size,
            cursor,
        }
    }
}

/// One fetched page, owned by the extractor for a single loop iteration.
#[derive(Debug)]
pub struct Page {
    /// Records requested
    pub requested: u32,
    /// Raw records as returned by the API
    pub records: Vec<Value>,
    /// The API explicitly said this is the final page
    pub last_page: bool,
    /// Cursor for the next page, if the API supplied one
    pub next_cursor: Option<String>,
}

impl Page {
    pub fn count(&self) -> usize {
        self.records.len()
    }
}

/// A fetch that cannot succeed by retrying.
///
/// Callers must not swallow this and keep paginating; it terminates the run
/// for that endpoint.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Non-429 4xx: our request or configuration is wrong
    #[error("endpoint '{endpoint}' page {page}: HTTP {status} is not retryable: {detail}")]
    Permanent {
        endpoint: String,
        page: u64,
        status: u16,
        detail: String,
    },

    /// Transient failures outlived the retry budget
    #[error("endpoint '{endpoint}' page {page}: gave up after {attempts} attempts: {detail}")]
    RetriesExhausted {
        endpoint: String,
        page: u64,
        attempts: u32,
        detail: String,
    },

    /// The response arrived but its shape defeated the mapper
    #[error("endpoint '{endpoint}' page {page}: unusable payload: {detail}")]
    Payload {
        endpoint: String,
        page: u64,
        detail: String,
    },
}

/// Fetches pages for one endpoint, one at a time.
///
/// Every attempt, including retries, acquires a token from the shared
/// [`RateLimiter`] before touching the transport, so backoff never lets an
/// endpoint jump the process-wide queue.
pub struct PageFetcher<T: ApiTransport> {
    transport: Arc<T>,
    limiter: Arc<RateLimiter>,
    policy: RetryPolicy,
}

impl<T: ApiTransport> PageFetcher<T> {
    pub fn new(transport: Arc<T>, limiter: Arc<RateLimiter>, policy: RetryPolicy) -> Self {
        Self {
            transport,
            limiter,
            policy,
        }
    }

    /// Fetch one page, retrying transient failures per the policy.
    ///
    /// # Errors
    /// [`FetchError::Permanent`] for non-retryable statuses,
    /// [`FetchError::RetriesExhausted`] when the retry budget runs out, and
    /// [`FetchError::Payload`] when a 2xx body has no usable record list.
    pub async fn fetch(
        &self,
        endpoint: &EndpointDescriptor,
        mapper: &dyn RecordMapper,
        request: &PageRequest,
    ) -> Result<Page, FetchError> {
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            self.limiter.acquire().await;

            let failure = match self.transport.request(endpoint, request).await {
                Ok(response) if response.is_success() => {
                    return self.unpack(endpoint, mapper, request, &response.body);
                }
                Ok(response) => {
                    log::debug!(
                        "Endpoint '{}' page {}: HTTP {} on attempt {}",
                        endpoint.id,
                        request.index,
                        response.status,
                        attempt
                    );
                    (Some(response.status), response.retry_after)
                }
                Err(error) => {
                    log::debug!(
                        "Endpoint '{}' page {}: {} on attempt {}",
                        endpoint.id,
                        request.index,
                        error,
                        attempt
                    );
                    (None, None)
                }
            };

            match self.policy.decide(failure.0, attempt, failure.1) {
                RetryDecision::RetryAfter(delay) => {
                    log::warn!(
                        "Endpoint '{}' page {}: retrying in {:?} (attempt {}/{})",
                        endpoint.id,
                        request.index,
                        delay,
                        attempt,
                        self.policy.max_attempts()
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::Fail => {
                    return Err(self.fail(endpoint, request, attempt, failure.0));
                }
            }
        }
    }

    fn unpack(
        &self,
        endpoint: &EndpointDescriptor,
        mapper: &dyn RecordMapper,
        request: &PageRequest,
        body: &Value,
    ) -> Result<Page, FetchError> {
        let mut records = mapper.records(body).map_err(|e| FetchError::Payload {
            endpoint: endpoint.id.clone(),
            page: request.index,
            detail: e.to_string(),
        })?;

        // An over-long page is out of contract; keep the requested prefix so
        // downstream counts stay meaningful.
        if records.len() > request.size as usize {
            log::warn!(
                "Endpoint '{}' page {} returned {} records for a request of {}, truncating",
                endpoint.id,
                request.index,
                records.len(),
                request.size
            );
            records.truncate(request.size as usize);
        }

        Ok(Page {
            requested: request.size,
            last_page: mapper.last_page_signal(body).unwrap_or(false),
            next_cursor: mapper.next_cursor(body),
            records,
        })
    }

    fn fail(
        &self,
        endpoint: &EndpointDescriptor,
        request: &PageRequest,
        attempts: u32,
        status: Option<u16>,
    ) -> FetchError {
        match status {
            Some(code) if (400..500).contains(&code) && code != 429 => FetchError::Permanent {
                endpoint: endpoint.id.clone(),
                page: request.index,
                status: code,
                detail: "client error, not retried".to_string(),
            },
            Some(code) => FetchError::RetriesExhausted {
                endpoint: endpoint.id.clone(),
                page: request.index,
                attempts,
                detail: format!("last failure was HTTP {}", code),
            },
            None => FetchError::RetriesExhausted {
                endpoint: endpoint.id.clone(),
                page: request.index,
                attempts,
                detail: "last failure was a transport error".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ApiResponse, TransportError};
    use crate::endpoint::{FieldMapper, FieldSpec, PaginationMode};
    use crate::retry::RetryPolicy;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Transport that plays back a scripted sequence of responses.
    struct ScriptedTransport {
        script: Mutex<Vec<Result<ApiResponse, TransportError>>>,
        calls: std::sync::atomic::AtomicU32,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Result<ApiResponse, TransportError>>) -> Self {
            let mut script = script;
            script.reverse();
            Self {
                script: Mutex::new(script),
                calls: std::sync::atomic::AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    impl ApiTransport for ScriptedTransport {
        async fn request(
            &self,
            _endpoint: &EndpointDescriptor,
            _page: &PageRequest,
        ) -> Result<ApiResponse, TransportError> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Ok(ApiResponse::ok(json!([]))))
        }
    }

    fn descriptor() -> EndpointDescriptor {
        EndpointDescriptor {
            id: "orders".to_string(),
            category: "sales".to_string(),
            output_name: "orders".to_string(),
            path: "/v2/orders".to_string(),
            mode: PaginationMode::Paged { page_size: 2 },
            params: BTreeMap::new(),
            assume_complete_on_full_final_page: false,
        }
    }

    fn mapper() -> FieldMapper {
        FieldMapper::new(vec![FieldSpec::named("id")]).with_records_key("items")
    }

    fn status(code: u16) -> Result<ApiResponse, TransportError> {
        Ok(ApiResponse {
            status: code,
            retry_after: None,
            body: Value::Null,
        })
    }

    fn fetcher(transport: Arc<ScriptedTransport>, limiter: Arc<RateLimiter>) -> PageFetcher<ScriptedTransport> {
        let policy = RetryPolicy::new(5, Duration::from_millis(10), Duration::from_secs(1));
        PageFetcher::new(transport, limiter, policy)
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_returns_page() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(ApiResponse::ok(
            json!({"items": [{"id": 1}, {"id": 2}]}),
        ))]));
        let limiter = RateLimiter::shared(1000, Duration::from_secs(1), 0.0);

        let page = fetcher(transport.clone(), limiter)
            .fetch(&descriptor(), &mapper(), &PageRequest::first(2))
            .await
            .unwrap();

        assert_eq!(page.count(), 2);
        assert!(!page.last_page);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_429_retries_then_succeeds_consuming_one_token_per_attempt() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            status(429),
            status(429),
            status(429),
            Ok(ApiResponse::ok(json!({"items": [{"id": 1}]}))),
        ]));
        let limiter = RateLimiter::shared(1000, Duration::from_secs(1), 0.0);

        let page = fetcher(transport.clone(), limiter.clone())
            .fetch(&descriptor(), &mapper(), &PageRequest::first(2))
            .await
            .unwrap();

        assert_eq!(page.count(), 1);
        assert_eq!(transport.calls(), 4);
        assert_eq!(limiter.issued(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_error_is_permanent_and_never_retried() {
        let transport = Arc::new(ScriptedTransport::new(vec![status(404)]));
        let limiter = RateLimiter::shared(1000, Duration::from_secs(1), 0.0);

        let error = fetcher(transport.clone(), limiter)
            .fetch(&descriptor(), &mapper(), &PageRequest::first(2))
            .await
            .unwrap_err();

        assert!(matches!(error, FetchError::Permanent { status: 404, .. }));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_errors_exhaust_retry_budget() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            status(503),
            status(503),
            status(503),
            status(503),
            status(503),
            status(503),
        ]));
        let limiter = RateLimiter::shared(1000, Duration::from_secs(1), 0.0);

        let error = fetcher(transport.clone(), limiter)
            .fetch(&descriptor(), &mapper(), &PageRequest::first(2))
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            FetchError::RetriesExhausted { attempts: 5, .. }
        ));
        assert_eq!(transport.calls(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_errors_are_retried() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Err(TransportError::Timeout),
            Ok(ApiResponse::ok(json!({"items": []}))),
        ]));
        let limiter = RateLimiter::shared(1000, Duration::from_secs(1), 0.0);

        let page = fetcher(transport.clone(), limiter)
            .fetch(&descriptor(), &mapper(), &PageRequest::first(2))
            .await
            .unwrap();

        assert_eq!(page.count(), 0);
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unusable_payload_is_permanent() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(ApiResponse::ok(
            json!({"unexpected": "shape"}),
        ))]));
        let limiter = RateLimiter::shared(1000, Duration::from_secs(1), 0.0);

        let error = fetcher(transport.clone(), limiter)
            .fetch(&descriptor(), &mapper(), &PageRequest::first(2))
            .await
            .unwrap_err();

        assert!(matches!(error, FetchError::Payload { .. }));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_over_long_page_is_truncated_to_request_size() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(ApiResponse::ok(
            json!({"items": [{"id": 1}, {"id": 2}, {"id": 3}]}),
        ))]));
        let limiter = RateLimiter::shared(1000, Duration::from_secs(1), 0.0);

        let page = fetcher(transport.clone(), limiter)
            .fetch(&descriptor(), &mapper(), &PageRequest::first(2))
            .await
            .unwrap();

        assert_eq!(page.count(), 2);
        assert_eq!(page.requested, 2);
    }
}
