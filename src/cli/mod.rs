pub mod commands;
pub mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use crate::utils::logging;
use config::AppConfig;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker pool until interrupted
    Run {
        /// Scraper type to serve (overrides configuration)
        #[arg(short, long)]
        scraper_type: Option<String>,

        /// Number of concurrent workers (overrides configuration)
        #[arg(short = 'n', long)]
        concurrency: Option<u32>,
    },

    /// Submit a scraping task to a queue
    Submit {
        /// Target scraper type
        #[arg(required = true)]
        scraper_type: String,

        /// Search keywords
        #[arg(required = true)]
        search_term: String,

        /// Location to search in
        #[arg(short, long, default_value = "Remote")]
        location: String,

        /// Number of job postings wanted
        #[arg(short, long, default_value_t = 20)]
        results_wanted: u32,
    },

    /// Show live worker health and queue depths
    Status {
        /// Limit to one scraper type
        #[arg(short, long)]
        scraper_type: Option<String>,
    },
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    let mut config = AppConfig::load(cli.config.as_deref())?;

    let level = if cli.verbose {
        "debug"
    } else {
        &config.monitoring.log_level
    };
    let log_file = config.monitoring.log_to_file.then(logging::default_log_file);
    logging::init_logging(level, log_file)?;

    match cli.command {
        Commands::Run { scraper_type, concurrency } => {
            if let Some(scraper_type) = scraper_type {
                config.worker.scraper_type = scraper_type;
            }
            if let Some(concurrency) = concurrency {
                config.worker.concurrency = concurrency;
            }
            info!(
                scraper_type = %config.worker.scraper_type,
                concurrency = config.worker.concurrency,
                "Starting worker pool"
            );
            commands::run(config).await
        }
        Commands::Submit { scraper_type, search_term, location, results_wanted } => {
            commands::submit(config, scraper_type, search_term, location, results_wanted).await
        }
        Commands::Status { scraper_type } => {
            commands::status(config, scraper_type).await
        }
    }
}
