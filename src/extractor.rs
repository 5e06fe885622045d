//! Per-endpoint extraction loop
//!
//! An [`Extractor`] drives one endpoint through a full harvesting run:
//! fetch a page, map its records, hand them to the writer, advance the
//! cursor, repeat. A run moves through `INIT -> FETCHING` and terminates as
//! either `COMPLETED` or `FAILED`; whatever happens, the caller gets back a
//! finalized [`ExtractionRun`] ready for the metadata store.

use crate::client::ApiTransport;
use crate::completeness::{CompletenessDetector, RunStats};
use crate::endpoint::{EndpointDescriptor, PaginationMode, RecordMapper};
use crate::fetch::{FetchError, Page, PageFetcher, PageRequest};
use crate::metadata::{ExtractionRun, RunStatus};
use crate::writer::{BatchWriter, WriteError};
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;

/// Everything that can end a run as FAILED.
#[derive(Debug, Error)]
enum RunError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error("endpoint '{endpoint}' page {page}: record mapping failed: {detail}")]
    Map {
        endpoint: String,
        page: u64,
        detail: String,
    },
}

/// Running tallies for one FETCHING loop.
#[derive(Debug, Default)]
struct Progress {
    pages: u64,
    records: u64,
    final_page_requested: u32,
    final_page_count: u32,
    saw_last_page_signal: bool,
    hit_page_ceiling: bool,
}

/// Drives the fetch, map, write loop for one endpoint.
pub struct Extractor<T: ApiTransport> {
    descriptor: EndpointDescriptor,
    mapper: Arc<dyn RecordMapper>,
    fetcher: PageFetcher<T>,
    /// Defensive ceiling against runaway or cyclic pagination
    max_pages: u64,
}

impl<T: ApiTransport> Extractor<T> {
    pub fn new(
        descriptor: EndpointDescriptor,
        mapper: Arc<dyn RecordMapper>,
        fetcher: PageFetcher<T>,
        max_pages: u64,
    ) -> Self {
        Self {
            descriptor,
            mapper,
            fetcher,
            max_pages: max_pages.max(1),
        }
    }

    pub fn descriptor(&self) -> &EndpointDescriptor {
        &self.descriptor
    }

    /// Run one full extraction, consuming the writer.
    ///
    /// Always returns a finalized run. A permanent fetch failure, a mapping
    /// failure, or an exhausted write retry ends the run as FAILED with
    /// partial counts and the error text preserved; segments already flushed
    /// stay on disk. Hitting the page ceiling ends the run as COMPLETED but
    /// flagged incomplete, since the data landed so far is valid.
    pub async fn run(&self, mut writer: BatchWriter) -> ExtractionRun {
        let timestamp = Utc::now();
        let clock = std::time::Instant::now();
        let mut progress = Progress {
            final_page_requested: self.descriptor.mode.request_size(),
            ..Progress::default()
        };

        log::info!("Endpoint '{}': extraction started", self.descriptor.id);

        let outcome = self.fetch_pages(&mut writer, &mut progress).await;

        // Close the file on both paths so flushed segments stay readable.
        let finalize = match (outcome, writer.finalize()) {
            (Ok(()), Ok(stats)) => {
                log::debug!(
                    "Endpoint '{}': {} segment(s) on disk",
                    self.descriptor.id,
                    stats.segments
                );
                Ok(())
            }
            (Ok(()), Err(error)) => Err(RunError::from(error)),
            (Err(error), finalized) => {
                if let Err(close_error) = finalized {
                    log::warn!(
                        "Endpoint '{}': finalize after failure also failed: {}",
                        self.descriptor.id,
                        close_error
                    );
                }
                Err(error)
            }
        };

        let duration_seconds = clock.elapsed().as_secs_f64();

        match finalize {
            Ok(()) => {
                let (is_complete, notes) = CompletenessDetector::evaluate(&RunStats {
                    mode: self.descriptor.mode,
                    total_pages: progress.pages,
                    total_records: progress.records,
                    final_page_requested: progress.final_page_requested,
                    final_page_count: progress.final_page_count,
                    saw_last_page_signal: progress.saw_last_page_signal,
                    hit_page_ceiling: progress.hit_page_ceiling,
                    assume_complete_on_full_final_page: self
                        .descriptor
                        .assume_complete_on_full_final_page,
                });

                log::info!(
                    "✓ Endpoint '{}': {} record(s) over {} page(s) in {:.1}s{}",
                    self.descriptor.id,
                    progress.records,
                    progress.pages,
                    duration_seconds,
                    match is_complete {
                        true => "",
                        false => " (possibly incomplete)",
                    }
                );
                for note in &notes {
                    log::warn!("Endpoint '{}': {}", self.descriptor.id, note);
                }

                ExtractionRun {
                    timestamp,
                    total_records: progress.records,
                    total_pages: progress.pages,
                    is_complete,
                    completeness_notes: notes,
                    duration_seconds,
                    status: RunStatus::Completed,
                    error: None,
                }
            }
            Err(error) => {
                log::error!("Endpoint '{}': extraction failed: {}", self.descriptor.id, error);

                ExtractionRun {
                    timestamp,
                    total_records: progress.records,
                    total_pages: progress.pages,
                    is_complete: false,
                    completeness_notes: Vec::new(),
                    duration_seconds,
                    status: RunStatus::Failed,
                    error: Some(error.to_string()),
                }
            }
        }
    }

    /// The FETCHING loop. Stops on an empty page, an explicit last-page
    /// signal, or the page ceiling; single-shot endpoints stop after one
    /// fetch regardless.
    async fn fetch_pages(
        &self,
        writer: &mut BatchWriter,
        progress: &mut Progress,
    ) -> Result<(), RunError> {
        let single_shot = matches!(self.descriptor.mode, PaginationMode::SingleShot { .. });
        let mut request = PageRequest::first(self.descriptor.mode.request_size());

        loop {
            if progress.pages >= self.max_pages {
                log::warn!(
                    "Endpoint '{}': page ceiling of {} reached, stopping",
                    self.descriptor.id,
                    self.max_pages
                );
                progress.hit_page_ceiling = true;
                return Ok(());
            }

            let page = self
                .fetcher
                .fetch(&self.descriptor, self.mapper.as_ref(), &request)
                .await?;

            progress.pages += 1;
            progress.final_page_requested = page.requested;
            progress.final_page_count = page.count() as u32;
            if page.last_page {
                progress.saw_last_page_signal = true;
            }

            self.append_page(writer, &page, request.index)?;
            progress.records += page.count() as u64;

            log::debug!(
                "Endpoint '{}': page {} returned {} record(s)",
                self.descriptor.id,
                request.index,
                page.count()
            );

            if single_shot || page.last_page || page.records.is_empty() {
                return Ok(());
            }

            request = request.next(page.next_cursor.clone());
        }
    }

    fn append_page(
        &self,
        writer: &mut BatchWriter,
        page: &Page,
        page_index: u64,
    ) -> Result<(), RunError> {
        for raw in &page.records {
            let record = self.mapper.map_raw(raw).map_err(|e| RunError::Map {
                endpoint: self.descriptor.id.clone(),
                page: page_index,
                detail: e.to_string(),
            })?;
            writer.append(record)?;
        }
        Ok(())
    }
}
