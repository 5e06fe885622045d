use clap::{Parser, Subcommand, builder::styling};
use eyre::Result;
use rest_harvester::cli;
use rest_harvester::orchestrator::Selection;

// CLI Styling
const STYLES: styling::Styles = styling::Styles::styled()
    .header(styling::AnsiColor::BrightWhite.on_default())
    .usage(styling::AnsiColor::BrightWhite.on_default())
    .literal(styling::AnsiColor::Green.on_default())
    .placeholder(styling::AnsiColor::Cyan.on_default());

/// REST Harvester: pull paginated API datasets into Parquet, politely and verifiably
#[derive(Parser)]
#[command(name = "harv", version, styles = STYLES)]
struct Cli {
    /// The dotenv file to source credentials from
    #[arg(short, long, global = true, default_value = ".env")]
    env: String,

    /// More verbose logging
    #[arg(long, global = true)]
    debug: bool,

    /// Command to execute
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Harvest endpoints from the manifest into Parquet files
    Run {
        /// Endpoint manifest file
        #[arg(short, long, default_value = "endpoints.yml")]
        manifest: String,

        /// Root directory for output files
        #[arg(short, long, default_value = "bronze")]
        output: String,

        /// Extraction history file
        #[arg(long, default_value = "extraction_metadata.json")]
        metadata: String,

        /// Only harvest endpoints in this category
        #[arg(short, long, conflicts_with = "endpoints")]
        category: Option<String>,

        /// Comma-separated list of endpoint ids to harvest
        #[arg(long, value_delimiter = ',')]
        endpoints: Option<Vec<String>>,

        /// Skip endpoints with a complete extraction newer than this many hours
        #[arg(long)]
        max_age_hours: Option<i64>,
    },

    /// Show the extraction history for every endpoint
    Status {
        /// Extraction history file
        #[arg(long, default_value = "extraction_metadata.json")]
        metadata: String,
    },

    /// List endpoints whose latest extraction may be missing data
    Incomplete {
        /// Extraction history file
        #[arg(long, default_value = "extraction_metadata.json")]
        metadata: String,
    },

    /// List endpoints not extracted within a time window
    Stale {
        /// Extraction history file
        #[arg(long, default_value = "extraction_metadata.json")]
        metadata: String,

        /// Window size in hours
        #[arg(long, default_value_t = 24)]
        max_age_hours: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if std::path::Path::new(&cli.env).exists() {
        dotenvy::from_filename(&cli.env)?;
    }

    let log_level = match cli.debug {
        true => "debug",
        false => "info",
    };
    let env = env_logger::Env::default().filter_or("LOG_LEVEL", log_level);
    env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .init();

    match cli.command {
        Commands::Run {
            manifest,
            output,
            metadata,
            category,
            endpoints,
            max_age_hours,
        } => {
            let selection = match (category, endpoints) {
                (Some(category), _) => Selection::Category(category),
                (_, Some(endpoints)) => Selection::Endpoints(endpoints),
                _ => Selection::All,
            };

            let summary =
                cli::run_harvest(&manifest, &output, &metadata, &selection, max_age_hours).await?;

            if summary.failed() > 0 {
                std::process::exit(1);
            }
        }
        Commands::Status { metadata } => {
            cli::print_status(&metadata).await?;
        }
        Commands::Incomplete { metadata } => {
            cli::print_incomplete(&metadata).await?;
        }
        Commands::Stale {
            metadata,
            max_age_hours,
        } => {
            cli::print_stale(&metadata, max_age_hours).await?;
        }
    }

    Ok(())
}
