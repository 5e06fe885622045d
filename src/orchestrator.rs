//! Fan-out of extraction runs across a selection of endpoints
//!
//! The orchestrator resolves a [`Selection`] against the registry, runs the
//! chosen extractors with bounded concurrency, records every terminal run in
//! the metadata store, and folds the results into a [`HarvestSummary`]. All
//! tasks share one [`RateLimiter`]; per-endpoint limiters would let the
//! aggregate rate blow past the upstream ceiling.

use crate::client::ApiTransport;
use crate::config::HarvestConfig;
use crate::endpoint::{RegisteredEndpoint, Registry};
use crate::extractor::Extractor;
use crate::fetch::PageFetcher;
use crate::limiter::RateLimiter;
use crate::metadata::{ExtractionRun, MetadataStore, RunStatus};
use crate::retry::RetryPolicy;
use crate::writer::BatchWriter;
use chrono::{Duration, Utc};
use eyre::{Result, bail};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Which endpoints to harvest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    All,
    Category(String),
    Endpoints(Vec<String>),
}

/// Terminal state of one endpoint within a harvest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    Completed,
    Failed,
    /// Fresh and complete within the incremental window, not re-extracted
    Skipped,
}

/// Per-endpoint result surfaced to the caller.
#[derive(Debug, Clone)]
pub struct EndpointOutcome {
    pub endpoint: String,
    pub status: OutcomeStatus,
    pub total_records: u64,
    pub is_complete: bool,
    pub error: Option<String>,
}

/// Every selected endpoint's outcome, failures included.
#[derive(Debug, Default)]
pub struct HarvestSummary {
    pub outcomes: Vec<EndpointOutcome>,
}

impl HarvestSummary {
    pub fn completed(&self) -> usize {
        self.count(OutcomeStatus::Completed)
    }

    pub fn failed(&self) -> usize {
        self.count(OutcomeStatus::Failed)
    }

    pub fn skipped(&self) -> usize {
        self.count(OutcomeStatus::Skipped)
    }

    fn count(&self, status: OutcomeStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }
}

/// Drives a harvest across many endpoints.
pub struct Orchestrator<T: ApiTransport + 'static> {
    registry: Arc<Registry>,
    transport: Arc<T>,
    limiter: Arc<RateLimiter>,
    policy: RetryPolicy,
    store: Arc<MetadataStore>,
    output_root: PathBuf,
    config: HarvestConfig,
}

impl<T: ApiTransport + 'static> Orchestrator<T> {
    /// Wire up an orchestrator; the rate limiter is built from the config.
    pub fn new(
        registry: Arc<Registry>,
        transport: Arc<T>,
        store: Arc<MetadataStore>,
        output_root: impl Into<PathBuf>,
        config: HarvestConfig,
    ) -> Self {
        let limiter = RateLimiter::shared(
            config.rate_limit_calls,
            config.rate_limit_period(),
            config.rate_limit_safety_margin,
        );

        Self {
            registry,
            transport,
            limiter,
            policy: RetryPolicy::default(),
            store,
            output_root: output_root.into(),
            config,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Harvest every endpoint in the selection.
    ///
    /// Runs up to `concurrency` extractors at once. One endpoint failing
    /// never halts its siblings; the summary carries each endpoint's terminal
    /// status and any error text. With `max_age` set, endpoints whose last
    /// run is complete and fresh are skipped.
    ///
    /// Dropping the returned future cancels the in-flight extractions;
    /// segments already flushed stay on disk, and cancelled runs leave no
    /// trace in the metadata history.
    ///
    /// # Errors
    /// Returns an error only when the selection itself is invalid (unknown
    /// endpoint id or empty category). Extraction failures are reported in
    /// the summary, not as errors.
    pub async fn run(
        &self,
        selection: &Selection,
        max_age: Option<Duration>,
    ) -> Result<HarvestSummary> {
        let selected = self.resolve(selection)?;
        log::info!("Harvesting {} endpoint(s)", selected.len());

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for endpoint in selected {
            let semaphore = semaphore.clone();
            let transport = self.transport.clone();
            let limiter = self.limiter.clone();
            let policy = self.policy;
            let store = self.store.clone();
            let output_root = self.output_root.clone();
            let batch_size = self.config.batch_size;
            let max_pages = self.config.max_pages_per_run;

            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                harvest_one(
                    endpoint, transport, limiter, policy, store, output_root, batch_size,
                    max_pages, max_age,
                )
                .await
            });
        }

        let mut summary = HarvestSummary::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => summary.outcomes.push(outcome),
                Err(error) => {
                    log::error!("Extraction task died: {}", error);
                    summary.outcomes.push(EndpointOutcome {
                        endpoint: "<unknown>".to_string(),
                        status: OutcomeStatus::Failed,
                        total_records: 0,
                        is_complete: false,
                        error: Some(format!("extraction task died: {}", error)),
                    });
                }
            }
        }

        summary.outcomes.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        Ok(summary)
    }

    fn resolve(&self, selection: &Selection) -> Result<Vec<RegisteredEndpoint>> {
        match selection {
            Selection::All => Ok(self.registry.iter().cloned().collect()),
            Selection::Category(category) => {
                let selected: Vec<_> = self
                    .registry
                    .iter()
                    .filter(|e| &e.descriptor.category == category)
                    .cloned()
                    .collect();
                if selected.is_empty() {
                    bail!(
                        "No endpoints in category '{}'. Known endpoints: {}",
                        category,
                        self.registry.ids().join(", ")
                    );
                }
                Ok(selected)
            }
            Selection::Endpoints(ids) => ids
                .iter()
                .map(|id| match self.registry.get(id) {
                    Some(endpoint) => Ok(endpoint.clone()),
                    None => bail!(
                        "Unknown endpoint '{}'. Known endpoints: {}",
                        id,
                        self.registry.ids().join(", ")
                    ),
                })
                .collect(),
        }
    }
}

/// One endpoint's full harvest: skip check, writer setup, extraction, and
/// metadata recording.
#[allow(clippy::too_many_arguments)]
async fn harvest_one<T: ApiTransport>(
    endpoint: RegisteredEndpoint,
    transport: Arc<T>,
    limiter: Arc<RateLimiter>,
    policy: RetryPolicy,
    store: Arc<MetadataStore>,
    output_root: PathBuf,
    batch_size: usize,
    max_pages: u64,
    max_age: Option<Duration>,
) -> EndpointOutcome {
    let descriptor = endpoint.descriptor.clone();
    let id = descriptor.id.clone();
    let filename = format!("{}/{}.parquet", descriptor.category, descriptor.output_name);

    if let Some(max_age) = max_age {
        let (due, last) = store.should_extract_incremental(&id, max_age).await;
        if !due {
            log::info!(
                "Endpoint '{}': last complete extraction at {}, skipping",
                id,
                last.map(|t| t.to_rfc3339()).unwrap_or_default()
            );
            return EndpointOutcome {
                endpoint: id,
                status: OutcomeStatus::Skipped,
                total_records: 0,
                is_complete: true,
                error: None,
            };
        }
    }

    let writer = match BatchWriter::create(
        descriptor.output_path(&output_root),
        id.clone(),
        endpoint.mapper.columns().to_vec(),
        batch_size,
    ) {
        Ok(writer) => writer,
        Err(error) => {
            // The run never started fetching, but a failed attempt is still
            // part of this endpoint's history.
            log::error!("Endpoint '{}': {}", id, error);
            let run = ExtractionRun {
                timestamp: Utc::now(),
                total_records: 0,
                total_pages: 0,
                is_complete: false,
                completeness_notes: Vec::new(),
                duration_seconds: 0.0,
                status: RunStatus::Failed,
                error: Some(error.to_string()),
            };
            return record_and_report(&store, &descriptor.category, &filename, id, run).await;
        }
    };

    let extractor = Extractor::new(
        descriptor.clone(),
        endpoint.mapper.clone(),
        PageFetcher::new(transport, limiter, policy),
        max_pages,
    );

    let run = extractor.run(writer).await;
    record_and_report(&store, &descriptor.category, &filename, id, run).await
}

async fn record_and_report(
    store: &MetadataStore,
    category: &str,
    filename: &str,
    endpoint_id: String,
    run: ExtractionRun,
) -> EndpointOutcome {
    if let Err(error) = store
        .record_run(&endpoint_id, category, filename, run.clone())
        .await
    {
        log::error!(
            "Endpoint '{}': failed to record run in metadata store: {}",
            endpoint_id,
            error
        );
    }

    EndpointOutcome {
        endpoint: endpoint_id,
        status: match run.status {
            RunStatus::Completed => OutcomeStatus::Completed,
            RunStatus::Failed => OutcomeStatus::Failed,
        },
        total_records: run.total_records,
        is_complete: run.is_complete,
        error: run.error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ApiResponse, TransportError};
    use crate::endpoint::{EndpointDescriptor, FieldMapper, FieldSpec, PaginationMode};
    use crate::fetch::PageRequest;
    use serde_json::{Value, json};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    /// Transport driven by a closure, so tests can route per endpoint/page.
    struct FnTransport<F>(F);

    impl<F> ApiTransport for FnTransport<F>
    where
        F: Fn(&EndpointDescriptor, &PageRequest) -> Result<ApiResponse, TransportError>
            + Send
            + Sync,
    {
        async fn request(
            &self,
            endpoint: &EndpointDescriptor,
            page: &PageRequest,
        ) -> Result<ApiResponse, TransportError> {
            (self.0)(endpoint, page)
        }
    }

    fn registry(ids: &[(&str, &str)]) -> Arc<Registry> {
        let mut registry = Registry::new();
        for (id, category) in ids {
            let descriptor = EndpointDescriptor {
                id: id.to_string(),
                category: category.to_string(),
                output_name: id.to_string(),
                path: format!("/v2/{}", id),
                mode: PaginationMode::Paged { page_size: 2 },
                params: BTreeMap::new(),
                assume_complete_on_full_final_page: false,
            };
            let mapper =
                Arc::new(FieldMapper::new(vec![FieldSpec::named("id")]).with_records_key("items"));
            registry.register(descriptor, mapper);
        }
        Arc::new(registry)
    }

    fn config() -> HarvestConfig {
        HarvestConfig {
            rate_limit_calls: 1000,
            rate_limit_period_secs: 1,
            rate_limit_safety_margin: 0.0,
            batch_size: 100,
            concurrency: 4,
            max_pages_per_run: 100,
        }
    }

    fn pages_of(total: u64, page: &PageRequest) -> Result<ApiResponse, TransportError> {
        let start = (page.index - 1) * 2;
        let end = (start + 2).min(total);
        let items: Vec<Value> = (start..end).map(|i| json!({"id": i})).collect();
        Ok(ApiResponse::ok(json!({"items": items})))
    }

    fn orchestrator<F>(
        temp: &TempDir,
        registry: Arc<Registry>,
        respond: F,
    ) -> (Orchestrator<FnTransport<F>>, Arc<MetadataStore>)
    where
        F: Fn(&EndpointDescriptor, &PageRequest) -> Result<ApiResponse, TransportError>
            + Send
            + Sync
            + 'static,
    {
        let store = Arc::new(MetadataStore::load(temp.path().join("metadata.json")));
        let orchestrator = Orchestrator::new(
            registry,
            Arc::new(FnTransport(respond)),
            store.clone(),
            temp.path().join("bronze"),
            config(),
        )
        .with_retry_policy(RetryPolicy::new(
            2,
            std::time::Duration::from_millis(1),
            std::time::Duration::from_millis(5),
        ));
        (orchestrator, store)
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_endpoint_does_not_halt_siblings() {
        let temp = TempDir::new().unwrap();
        let reg = registry(&[("bad", "sales"), ("good", "sales")]);
        let (orchestrator, store) = orchestrator(&temp, reg, |endpoint, page| {
            if endpoint.id == "bad" {
                Ok(ApiResponse {
                    status: 403,
                    retry_after: None,
                    body: Value::Null,
                })
            } else {
                pages_of(3, page)
            }
        });

        let summary = orchestrator.run(&Selection::All, None).await.unwrap();

        assert_eq!(summary.outcomes.len(), 2);
        assert_eq!(summary.failed(), 1);
        assert_eq!(summary.completed(), 1);

        let bad = &summary.outcomes[0];
        assert_eq!(bad.endpoint, "bad");
        assert!(bad.error.as_deref().unwrap_or_default().contains("403"));

        let good = &summary.outcomes[1];
        assert_eq!(good.endpoint, "good");
        assert_eq!(good.total_records, 3);
        assert!(good.is_complete);

        // Both terminal runs are in the history
        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.get("bad").unwrap().history.len(), 1);
        assert_eq!(snapshot.get("good").unwrap().history.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_selection_by_category_and_id() {
        let temp = TempDir::new().unwrap();
        let reg = registry(&[("a", "crm"), ("b", "sales"), ("c", "sales")]);
        let (orchestrator, _) = orchestrator(&temp, reg, |_, page| pages_of(1, page));

        let summary = orchestrator
            .run(&Selection::Category("sales".to_string()), None)
            .await
            .unwrap();
        let names: Vec<_> = summary.outcomes.iter().map(|o| o.endpoint.as_str()).collect();
        assert_eq!(names, vec!["b", "c"]);

        let summary = orchestrator
            .run(&Selection::Endpoints(vec!["a".to_string()]), None)
            .await
            .unwrap();
        assert_eq!(summary.outcomes.len(), 1);
        assert_eq!(summary.outcomes[0].endpoint, "a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_selection_is_an_error() {
        let temp = TempDir::new().unwrap();
        let reg = registry(&[("a", "crm")]);
        let (orchestrator, _) = orchestrator(&temp, reg, |_, page| pages_of(1, page));

        assert!(
            orchestrator
                .run(&Selection::Endpoints(vec!["nope".to_string()]), None)
                .await
                .is_err()
        );
        assert!(
            orchestrator
                .run(&Selection::Category("nope".to_string()), None)
                .await
                .is_err()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_incremental_skip_of_fresh_complete_endpoints() {
        let temp = TempDir::new().unwrap();
        let reg = registry(&[("a", "crm")]);
        let (orchestrator, _) = orchestrator(&temp, reg, |_, page| pages_of(1, page));

        let first = orchestrator.run(&Selection::All, None).await.unwrap();
        assert_eq!(first.completed(), 1);

        let second = orchestrator
            .run(&Selection::All, Some(Duration::hours(24)))
            .await
            .unwrap();
        assert_eq!(second.skipped(), 1);
        assert_eq!(second.completed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rerun_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let reg = registry(&[("a", "crm")]);
        let (orchestrator, store) = orchestrator(&temp, reg, |_, page| pages_of(5, page));

        let first = orchestrator.run(&Selection::All, None).await.unwrap();
        let second = orchestrator.run(&Selection::All, None).await.unwrap();

        for summary in [&first, &second] {
            assert_eq!(summary.outcomes[0].total_records, 5);
            assert!(summary.outcomes[0].is_complete);
        }

        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.get("a").unwrap().history.len(), 2);
    }
}
