//! CLI helper functions

use crate::{
    client::{Auth, HttpTransport},
    endpoint::HarvestManifest,
    metadata::MetadataStore,
    orchestrator::{HarvestSummary, Orchestrator, OutcomeStatus, Selection},
};
use chrono::Duration;
use eyre::{Context, Result};
use owo_colors::OwoColorize;
use std::path::Path;
use std::sync::Arc;
use url::Url;

/// Load the API transport from environment variables
///
/// Expected environment variables:
/// - HARVEST_API_URL: API base URL (required)
/// - HARVEST_APIKEY: API key for bearer auth (optional)
/// - HARVEST_USERNAME: Username for basic auth (optional)
/// - HARVEST_PASSWORD: Password for basic auth (optional)
pub fn load_transport() -> Result<HttpTransport> {
    let url_str =
        std::env::var("HARVEST_API_URL").context("HARVEST_API_URL environment variable not set")?;
    let url =
        Url::parse(&url_str).with_context(|| format!("Invalid HARVEST_API_URL: {}", url_str))?;

    let auth = Auth::from_env();
    log::debug!("Using {} authentication against {}", auth, url);

    HttpTransport::try_new(url, auth).context("Failed to create API transport")
}

/// Run a harvest over the manifest's endpoints and print the summary
///
/// Wiring: manifest -> registry + config, env -> transport, metadata file ->
/// store, then one orchestrator run over the selection.
pub async fn run_harvest(
    manifest_path: impl AsRef<Path>,
    output_root: impl AsRef<Path>,
    metadata_path: impl AsRef<Path>,
    selection: &Selection,
    max_age_hours: Option<i64>,
) -> Result<HarvestSummary> {
    let manifest_path = manifest_path.as_ref();

    log::info!("Loading manifest from {}", manifest_path.display());
    let manifest = HarvestManifest::read(manifest_path)?;
    let (config, registry) = manifest.into_registry()?;
    log::info!("Manifest loaded: {} endpoint(s)", registry.len());

    let transport = Arc::new(load_transport()?);
    let store = Arc::new(MetadataStore::load(metadata_path.as_ref()));

    let orchestrator = Orchestrator::new(
        Arc::new(registry),
        transport,
        store,
        output_root.as_ref(),
        config,
    );

    let summary = orchestrator
        .run(selection, max_age_hours.map(Duration::hours))
        .await?;

    print_summary(&summary);
    Ok(summary)
}

/// Print one line per endpoint outcome
pub fn print_summary(summary: &HarvestSummary) {
    for outcome in &summary.outcomes {
        match outcome.status {
            OutcomeStatus::Completed => {
                let completeness = match outcome.is_complete {
                    true => "complete".green().to_string(),
                    false => "possibly incomplete".yellow().to_string(),
                };
                println!(
                    "{} {}: {} record(s), {}",
                    "✓".green(),
                    outcome.endpoint,
                    outcome.total_records,
                    completeness
                );
            }
            OutcomeStatus::Failed => {
                println!(
                    "{} {}: {} record(s) before failure: {}",
                    "✗".red(),
                    outcome.endpoint,
                    outcome.total_records,
                    outcome.error.as_deref().unwrap_or("unknown error").red()
                );
            }
            OutcomeStatus::Skipped => {
                println!(
                    "{} {}: fresh and complete, skipped",
                    "-".bright_black(),
                    outcome.endpoint.bright_black()
                );
            }
        }
    }

    println!(
        "{} completed, {} failed, {} skipped",
        summary.completed(),
        summary.failed(),
        summary.skipped()
    );
}

/// Print the extraction history overview from the metadata store
pub async fn print_status(metadata_path: impl AsRef<Path>) -> Result<()> {
    let store = MetadataStore::load(metadata_path.as_ref());
    let snapshot = store.snapshot().await;

    if snapshot.is_empty() {
        println!("No extractions recorded yet");
        return Ok(());
    }

    for (id, entry) in snapshot {
        let last = entry
            .last_extraction
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "never".to_string());
        let completeness = match entry.last_is_complete {
            true => "complete".green().to_string(),
            false => "possibly incomplete".yellow().to_string(),
        };

        println!(
            "{} ({}): {} record(s) at {}, {} [{} run(s) on record]",
            id.bold(),
            entry.category,
            entry.last_total_records,
            last,
            completeness,
            entry.history.len()
        );

        if let Some(run) = entry.history.last() {
            for note in &run.completeness_notes {
                println!("    {}", note.yellow());
            }
            if let Some(error) = &run.error {
                println!("    {}", error.red());
            }
        }
    }

    Ok(())
}

/// List endpoints whose latest extraction may be missing data
pub async fn print_incomplete(metadata_path: impl AsRef<Path>) -> Result<()> {
    let store = MetadataStore::load(metadata_path.as_ref());
    let incomplete = store.incomplete_endpoints().await;

    if incomplete.is_empty() {
        println!("{} every recorded extraction is complete", "✓".green());
    } else {
        for id in incomplete {
            println!("{}", id);
        }
    }

    Ok(())
}

/// List endpoints not extracted within the given window
pub async fn print_stale(metadata_path: impl AsRef<Path>, max_age_hours: i64) -> Result<()> {
    let store = MetadataStore::load(metadata_path.as_ref());
    let stale = store.stale_endpoints(Duration::hours(max_age_hours)).await;

    if stale.is_empty() {
        println!(
            "{} every endpoint extracted within the last {}h",
            "✓".green(),
            max_age_hours
        );
    } else {
        for id in stale {
            println!("{}", id);
        }
    }

    Ok(())
}
