pub mod jobspy;

pub use jobspy::JobSpyScraper;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::protocol::{HealthStatus, ScrapeParams, ScrapeResult, ScraperType, ValidationError};

/// Failure classes for a single scrape attempt. `retryable()` is the
/// only thing the worker's retry machine consults.
#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("rate limited by scraping backend")]
    RateLimited,

    #[error("scraping backend server error (status {status})")]
    Server { status: u16 },

    #[error("scraping backend rejected request (status {status})")]
    Client { status: u16 },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("scrape attempt timed out")]
    Timeout,

    #[error("scrape attempt cancelled")]
    Cancelled,

    #[error("network error: {0}")]
    Network(String),

    #[error("malformed backend response: {0}")]
    Response(String),
}

impl ScrapeError {
    /// Whether the worker should retry after this failure.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            ScrapeError::RateLimited
                | ScrapeError::Server { .. }
                | ScrapeError::Timeout
                | ScrapeError::Network(_)
        )
    }
}

impl From<reqwest::Error> for ScrapeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ScrapeError::Timeout
        } else if err.is_decode() {
            ScrapeError::Response(err.to_string())
        } else {
            ScrapeError::Network(err.to_string())
        }
    }
}

/// Connection settings shared by every scraper backend.
#[derive(Debug, Clone)]
pub struct ScraperSettings {
    /// Identifier stamped into result metadata and health snapshots
    pub worker_id: String,

    /// Base URL of the scraping backend service
    pub base_url: String,

    pub api_key: Option<String>,

    /// HTTP client timeout, independent of the per-task attempt timeout
    pub response_timeout: Duration,
}

impl Default for ScraperSettings {
    fn default() -> Self {
        Self {
            worker_id: String::new(),
            base_url: "http://localhost:8000".to_string(),
            api_key: None,
            response_timeout: Duration::from_secs(60),
        }
    }
}

/// One job-board scraping strategy.
///
/// `scrape_jobs` makes exactly one attempt; retries, per-attempt timeouts
/// and cancellation all live in the worker that owns the scraper.
#[async_trait]
pub trait Scraper: Send + Sync {
    fn name(&self) -> &'static str;

    fn scraper_type(&self) -> ScraperType;

    /// Cheap local parameter check, run before any network traffic.
    fn validate_params(&self, params: &ScrapeParams) -> Result<(), ValidationError>;

    /// One scrape attempt. The returned result carries an empty task_id;
    /// the worker fills it in.
    async fn scrape_jobs(&self, params: &ScrapeParams) -> Result<ScrapeResult, ScrapeError>;

    /// Advisory health snapshot from the backend's own counters. The
    /// health monitor owns the authoritative classification.
    async fn health_status(&self) -> HealthStatus;

    async fn close(&self) -> Result<(), ScrapeError>;
}

/// Builds scrapers by type so the orchestrator never names a backend.
pub trait ScraperFactory: Send + Sync {
    fn create(
        &self,
        scraper_type: ScraperType,
        settings: ScraperSettings,
    ) -> Result<Box<dyn Scraper>, ScrapeError>;

    fn supported_types(&self) -> Vec<ScraperType>;
}

/// Factory for the JobSpy HTTP backend, which serves every board type.
#[derive(Debug, Default)]
pub struct JobSpyFactory;

impl ScraperFactory for JobSpyFactory {
    fn create(
        &self,
        scraper_type: ScraperType,
        settings: ScraperSettings,
    ) -> Result<Box<dyn Scraper>, ScrapeError> {
        Ok(Box::new(JobSpyScraper::new(scraper_type, settings)))
    }

    fn supported_types(&self) -> Vec<ScraperType> {
        ScraperType::ALL.to_vec()
    }
}
