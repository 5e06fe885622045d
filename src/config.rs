//! Engine tunables with sensible defaults

use serde::Deserialize;
use std::time::Duration;

/// Harvest-wide settings, usually read from the top of the endpoint manifest.
///
/// Every field has a default so a minimal manifest only needs its endpoint
/// list.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarvestConfig {
    /// Documented upstream limit: calls per period
    pub rate_limit_calls: u32,
    /// Documented upstream limit: period length in seconds
    pub rate_limit_period_secs: u64,
    /// Fraction of the documented limit left unused as headroom
    pub rate_limit_safety_margin: f64,
    /// Records buffered before a segment is flushed to disk
    pub batch_size: usize,
    /// Endpoints harvested concurrently
    pub concurrency: usize,
    /// Hard ceiling on pages fetched in one run, against runaway pagination
    pub max_pages_per_run: u64,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            rate_limit_calls: 100,
            rate_limit_period_secs: 60,
            rate_limit_safety_margin: 0.2,
            batch_size: 500,
            concurrency: 4,
            max_pages_per_run: 1_000,
        }
    }
}

impl HarvestConfig {
    pub fn rate_limit_period(&self) -> Duration {
        Duration::from_secs(self.rate_limit_period_secs.max(1))
    }
}
