//! Durable, bounded history of past extraction runs
//!
//! One JSON file records, per endpoint, the last few runs and convenience
//! fields about the most recent one. The file is the source of truth for
//! "what do we already have and can we trust it": staleness checks,
//! incompleteness reports, and incremental-skip decisions all read from here.
//!
//! Persistence is deliberately paranoid: every write goes to a temporary
//! file and renames over the original, and a corrupt or missing file loads
//! as an empty store rather than an error.

use chrono::{DateTime, Duration, Utc};
use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Runs kept per endpoint; the oldest entry is evicted beyond this.
pub const HISTORY_CAPACITY: usize = 10;

/// Terminal state of a recorded run.
///
/// Cancelled runs are never recorded, so these two are the only states that
/// reach the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Failed,
}

/// One finished harvesting attempt for one endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionRun {
    /// Run start time
    pub timestamp: DateTime<Utc>,
    pub total_records: u64,
    pub total_pages: u64,
    pub is_complete: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub completeness_notes: Vec<String>,
    pub duration_seconds: f64,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-endpoint history plus convenience fields about the latest run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointHistory {
    pub category: String,
    pub filename: String,
    #[serde(default)]
    pub last_extraction: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_total_records: u64,
    #[serde(default)]
    pub last_is_complete: bool,
    /// Past runs, oldest first, at most [`HISTORY_CAPACITY`]
    #[serde(default)]
    pub history: Vec<ExtractionRun>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MetadataFile {
    #[serde(default)]
    endpoints: BTreeMap<String, EndpointHistory>,
}

/// Owned handle to the metadata file.
///
/// Extraction runs proceed concurrently, but every load-mutate-write cycle
/// on the file goes through one internal lock, so writers never interleave.
pub struct MetadataStore {
    path: PathBuf,
    state: Mutex<MetadataFile>,
}

impl MetadataStore {
    /// Load the store from `path`.
    ///
    /// A missing file is an empty store. An unreadable or malformed file is
    /// logged and also treated as empty; losing bookkeeping history must not
    /// block harvesting.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();

        let state = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<MetadataFile>(&content) {
                Ok(state) => state,
                Err(error) => {
                    log::warn!(
                        "Metadata file {} is corrupt ({}), starting fresh",
                        path.display(),
                        error
                    );
                    MetadataFile::default()
                }
            },
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => MetadataFile::default(),
            Err(error) => {
                log::warn!(
                    "Metadata file {} is unreadable ({}), starting fresh",
                    path.display(),
                    error
                );
                MetadataFile::default()
            }
        };

        log::debug!(
            "Metadata store loaded: {} endpoint(s) from {}",
            state.endpoints.len(),
            path.display()
        );

        Self {
            path,
            state: Mutex::new(state),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record a finished run and persist the store atomically.
    ///
    /// The run is appended to the endpoint's history (evicting the oldest
    /// entry past capacity) and the `last_*` convenience fields are updated,
    /// failed runs included: a failed attempt is still the latest word on
    /// this endpoint.
    ///
    /// # Errors
    /// Returns an error if the file cannot be persisted; the in-memory state
    /// keeps the run either way.
    pub async fn record_run(
        &self,
        endpoint_id: &str,
        category: &str,
        filename: &str,
        run: ExtractionRun,
    ) -> Result<()> {
        let mut state = self.state.lock().await;

        let entry = state
            .endpoints
            .entry(endpoint_id.to_string())
            .or_insert_with(|| EndpointHistory {
                category: category.to_string(),
                filename: filename.to_string(),
                last_extraction: None,
                last_total_records: 0,
                last_is_complete: false,
                history: Vec::new(),
            });

        entry.category = category.to_string();
        entry.filename = filename.to_string();
        entry.last_extraction = Some(run.timestamp);
        entry.last_total_records = run.total_records;
        entry.last_is_complete = run.is_complete;

        entry.history.push(run);
        while entry.history.len() > HISTORY_CAPACITY {
            entry.history.remove(0);
        }

        persist(&self.path, &state)
    }

    /// Endpoints whose most recent run did not capture the full dataset.
    pub async fn incomplete_endpoints(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .endpoints
            .iter()
            .filter(|(_, entry)| !entry.last_is_complete)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Endpoints never extracted, or last extracted more than `max_age` ago.
    pub async fn stale_endpoints(&self, max_age: Duration) -> Vec<String> {
        let cutoff = Utc::now() - max_age;
        let state = self.state.lock().await;
        state
            .endpoints
            .iter()
            .filter(|(_, entry)| match entry.last_extraction {
                Some(when) => when < cutoff,
                None => true,
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Whether an endpoint is worth re-extracting, and when it last ran.
    ///
    /// Re-extraction is due unless the endpoint has a complete last run
    /// newer than `max_age`.
    pub async fn should_extract_incremental(
        &self,
        endpoint_id: &str,
        max_age: Duration,
    ) -> (bool, Option<DateTime<Utc>>) {
        let state = self.state.lock().await;

        let Some(entry) = state.endpoints.get(endpoint_id) else {
            return (true, None);
        };
        let Some(last) = entry.last_extraction else {
            return (true, None);
        };

        let fresh = last >= Utc::now() - max_age;
        (!(fresh && entry.last_is_complete), Some(last))
    }

    /// Read-only copy of every endpoint's history, for reporting.
    pub async fn snapshot(&self) -> BTreeMap<String, EndpointHistory> {
        self.state.lock().await.endpoints.clone()
    }
}

/// Write-temp-then-rename so a crash mid-write cannot corrupt prior history.
fn persist(path: &Path, state: &MetadataFile) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create metadata directory {}", parent.display()))?;
    }

    let content = serde_json::to_string_pretty(state).context("Failed to serialize metadata")?;

    let temp = path.with_extension("json.tmp");
    std::fs::write(&temp, content)
        .with_context(|| format!("Failed to write metadata temp file {}", temp.display()))?;
    std::fs::rename(&temp, path)
        .with_context(|| format!("Failed to replace metadata file {}", path.display()))?;

    Ok(())
}
