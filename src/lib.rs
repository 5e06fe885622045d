//! REST Harvester
//!
//! A rate-limit-aware harvester that lands paginated REST API datasets as
//! Parquet files, verifies each extraction actually captured the full
//! dataset, and keeps an auditable history of every run.

pub mod cli;
pub mod client;
pub mod completeness;
pub mod config;
pub mod endpoint;
pub mod extractor;
pub mod fetch;
pub mod limiter;
pub mod metadata;
pub mod orchestrator;
pub mod retry;
pub mod writer;

// Re-exports for convenience
pub use client::{ApiResponse, ApiTransport, Auth, HttpTransport, TransportError};
pub use completeness::{CompletenessDetector, RunStats};
pub use config::HarvestConfig;
pub use endpoint::{
    EndpointDescriptor, FieldMapper, FieldSpec, HarvestManifest, PaginationMode, RecordMapper,
    Registry,
};
pub use extractor::Extractor;
pub use fetch::{FetchError, Page, PageFetcher, PageRequest};
pub use limiter::RateLimiter;
pub use metadata::{ExtractionRun, MetadataStore, RunStatus};
pub use orchestrator::{HarvestSummary, Orchestrator, Selection};
pub use retry::{RetryDecision, RetryPolicy};
pub use writer::{BatchWriter, WriteError, WriterStats};
