use anyhow::Result;
use std::fs;
use std::path::PathBuf;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the logging system.
///
/// `level` applies to this crate only; everything else stays at warn
/// unless RUST_LOG overrides it. An optional file layer mirrors the
/// console output without ANSI codes.
pub fn init_logging(level: &str, log_file: Option<PathBuf>) -> Result<()> {
    let env_filter = EnvFilter::from_default_env()
        .add_directive(format!("scraper_fleet={}", level).parse()?)
        .add_directive("warn".parse()?);

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE);

    let file_layer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = fs::File::create(path)?;
            Some(fmt::layer().with_target(true).with_ansi(false).with_writer(file))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(file_layer)
        .init();

    Ok(())
}

/// Default log file location under the platform data directory
pub fn default_log_file() -> PathBuf {
    let mut path = if let Some(proj_dirs) =
        directories::ProjectDirs::from("com", "scraper-fleet", "scraper-fleet")
    {
        proj_dirs.data_dir().to_path_buf()
    } else {
        PathBuf::from("./logs")
    };

    path.push("fleet.log");
    path
}
