use anyhow::Result;
use tracing::error;

mod broker;
mod cli;
mod protocol;
mod scraper;
mod utils;
mod worker;

#[tokio::main]
async fn main() -> Result<()> {
    // Logging is initialized after the configuration is loaded, inside
    // process_command, so the configured level applies.
    let args = cli::parse_args();

    match cli::process_command(args).await {
        Ok(()) => Ok(()),
        Err(e) => {
            error!("Command failed: {}", e);
            Err(e)
        }
    }
}
