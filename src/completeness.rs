//! Truncation detection for finished extraction runs
//!
//! Paginated and "return everything" APIs routinely cap result sizes without
//! a trustworthy total-count signal, so a client can believe it captured a
//! full dataset when it did not. This evaluator inspects how a run ended and
//! classifies it as complete or possibly truncated. Ambiguous boundaries are
//! always flagged incomplete; a false "incomplete" costs a re-run, a false
//! "complete" silently loses data.

use crate::endpoint::PaginationMode;

/// How a finished run terminated, as seen by the extraction loop.
#[derive(Debug, Clone)]
pub struct RunStats {
    pub mode: PaginationMode,
    pub total_pages: u64,
    pub total_records: u64,
    /// Records requested on the final page
    pub final_page_requested: u32,
    /// Records returned on the final page
    pub final_page_count: u32,
    /// The API explicitly marked a page as the last one
    pub saw_last_page_signal: bool,
    /// The defensive page ceiling ended the run early
    pub hit_page_ceiling: bool,
    /// Per-endpoint override for the full-final-page ambiguity
    pub assume_complete_on_full_final_page: bool,
}

/// Classifies finished runs as complete or possibly truncated.
pub struct CompletenessDetector;

impl CompletenessDetector {
    /// Evaluate a finished run.
    ///
    /// Returns the completeness flag and human-readable notes explaining any
    /// doubt. Notes are recorded in the extraction history, so they should
    /// name what happened and what to do about it.
    pub fn evaluate(stats: &RunStats) -> (bool, Vec<String>) {
        if stats.hit_page_ceiling {
            return (
                false,
                vec![format!(
                    "Stopped at the page ceiling after {} pages; raise max_pages_per_run \
                     or narrow the endpoint to capture the remainder",
                    stats.total_pages
                )],
            );
        }

        match stats.mode {
            PaginationMode::SingleShot { cap } => Self::evaluate_single_shot(stats, cap),
            PaginationMode::Paged { .. } => Self::evaluate_paged(stats),
        }
    }

    /// A single-shot response that exactly fills the documented cap has
    /// almost certainly been truncated by it.
    fn evaluate_single_shot(stats: &RunStats, cap: u32) -> (bool, Vec<String>) {
        if stats.total_records >= cap as u64 {
            (
                false,
                vec![format!(
                    "Returned {} records, matching the documented cap of {}; \
                     switch this endpoint to explicit pagination",
                    stats.total_records, cap
                )],
            )
        } else {
            (true, Vec::new())
        }
    }

    fn evaluate_paged(stats: &RunStats) -> (bool, Vec<String>) {
        if stats.saw_last_page_signal {
            return (true, Vec::new());
        }

        if stats.final_page_count < stats.final_page_requested {
            return (true, Vec::new());
        }

        // Final page came back exactly full with nothing saying it was the
        // last. Some APIs would serve an empty terminal page next, some would
        // not; without the override we cannot tell a boundary hit from a cut.
        if stats.assume_complete_on_full_final_page {
            (
                true,
                vec![
                    "Final page was exactly full; treated as complete per endpoint override"
                        .to_string(),
                ],
            )
        } else {
            (
                false,
                vec![format!(
                    "Final page returned exactly the requested {} records with no \
                     last-page signal; the dataset may extend past it",
                    stats.final_page_requested
                )],
            )
        }
    }
}
