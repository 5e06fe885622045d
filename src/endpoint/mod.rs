//! Endpoint descriptors and the harvest registry
//!
//! An [`EndpointDescriptor`] is the immutable configuration for one
//! harvestable resource. Descriptors are registered once at startup, paired
//! with the [`RecordMapper`] that knows the shape of that endpoint's payloads.

mod manifest;
mod mapper;

pub use manifest::HarvestManifest;
pub use mapper::{FieldMapper, FieldSpec, RecordMapper};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// How an endpoint serves its result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaginationMode {
    /// Iterate explicit pages of `page_size` records each
    Paged { page_size: u32 },
    /// Request everything in one call; the API silently caps results at `cap`
    SingleShot { cap: u32 },
}

impl PaginationMode {
    /// Record count requested per fetch.
    pub fn request_size(&self) -> u32 {
        match self {
            Self::Paged { page_size } => *page_size,
            Self::SingleShot { cap } => *cap,
        }
    }
}

/// Immutable configuration for one harvestable endpoint.
#[derive(Debug, Clone)]
pub struct EndpointDescriptor {
    /// Unique identifier, used as the metadata key and provenance tag
    pub id: String,
    /// Grouping for selection and output layout
    pub category: String,
    /// Basename of the output file, without extension
    pub output_name: String,
    /// Request path relative to the API base URL
    pub path: String,
    pub mode: PaginationMode,
    /// Static query parameters sent with every request
    pub params: BTreeMap<String, String>,
    /// Treat a full final page with no last-page signal as complete.
    /// Only set this for APIs known to always serve an empty terminal page.
    pub assume_complete_on_full_final_page: bool,
}

impl EndpointDescriptor {
    /// Output file location under `root`, as `{category}/{output_name}.parquet`.
    pub fn output_path(&self, root: &Path) -> PathBuf {
        root.join(&self.category)
            .join(format!("{}.parquet", self.output_name))
    }
}

/// One registered endpoint: its descriptor plus the mapper for its payloads.
#[derive(Clone)]
pub struct RegisteredEndpoint {
    pub descriptor: EndpointDescriptor,
    pub mapper: Arc<dyn RecordMapper>,
}

/// Immutable registry of every endpoint the process can harvest.
///
/// Built once at startup, usually from [`HarvestManifest`], then shared
/// read-only across extraction tasks.
#[derive(Default)]
pub struct Registry {
    endpoints: BTreeMap<String, RegisteredEndpoint>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("endpoints", &self.ids())
            .finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint. Re-registering an id replaces the prior entry.
    pub fn register(&mut self, descriptor: EndpointDescriptor, mapper: Arc<dyn RecordMapper>) {
        if self.endpoints.contains_key(&descriptor.id) {
            log::warn!("Endpoint '{}' registered twice, replacing", descriptor.id);
        }
        self.endpoints.insert(
            descriptor.id.clone(),
            RegisteredEndpoint { descriptor, mapper },
        );
    }

    pub fn get(&self, id: &str) -> Option<&RegisteredEndpoint> {
        self.endpoints.get(id)
    }

    /// All endpoints in id order.
    pub fn iter(&self) -> impl Iterator<Item = &RegisteredEndpoint> {
        self.endpoints.values()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.endpoints.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}
