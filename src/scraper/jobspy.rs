use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{ScrapeError, Scraper, ScraperSettings};
use crate::protocol::{
    HealthState, HealthStatus, Job, ScrapeParams, ScrapeResult, ScraperType, TaskStatus,
    ValidationError,
};

const SEARCH_PATH: &str = "/api/v1/search_jobs";
const DEFAULT_DISTANCE: u32 = 50;

#[derive(Debug, Default)]
struct RequestCounters {
    requests_made: u32,
    rate_limit_hits: u32,
    blocked_requests: u32,
    total_response_time: f64,
}

/// Adapter for the JobSpy HTTP search service. One instance serves one
/// board type; every board goes through the same endpoint.
pub struct JobSpyScraper {
    scraper_type: ScraperType,
    settings: ScraperSettings,
    client: reqwest::Client,
    counters: Mutex<RequestCounters>,
}

#[derive(Debug, Serialize)]
struct JobSpyRequest<'a> {
    site_name: Vec<&'static str>,
    search_term: &'a str,
    location: &'a str,
    distance: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    job_type: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    is_remote: Option<bool>,
    results_wanted: u32,
    description_format: &'static str,
    country_indeed: &'static str,
    enforce_annual_salary: bool,
}

#[derive(Debug, Deserialize)]
struct JobSpyResponse {
    #[allow(dead_code)]
    count: u32,
    jobs: Vec<JobSpyJob>,
    #[serde(default)]
    cached: bool,
}

// The backend emits upper-case column names straight from its dataframe.
#[derive(Debug, Deserialize)]
struct JobSpyJob {
    #[serde(rename = "TITLE", default)]
    title: String,
    #[serde(rename = "COMPANY", default)]
    company: String,
    #[serde(rename = "LOCATION", default)]
    location: String,
    #[serde(rename = "JOB_URL", default)]
    job_url: String,
    #[serde(rename = "DESCRIPTION", default)]
    description: String,
    #[serde(rename = "DATE_POSTED", default)]
    date_posted: Option<String>,
    #[serde(rename = "MIN_AMOUNT", default)]
    min_amount: Option<f64>,
    #[serde(rename = "MAX_AMOUNT", default)]
    max_amount: Option<f64>,
    #[serde(rename = "CURRENCY", default)]
    currency: Option<String>,
    #[serde(rename = "JOB_TYPE", default)]
    job_type: Option<String>,
    #[serde(rename = "IS_REMOTE", default)]
    is_remote: Option<bool>,
    #[serde(rename = "JOB_URL_DIRECT", default)]
    job_url_direct: Option<String>,
    #[serde(rename = "EASY_APPLY", default)]
    easy_apply: Option<bool>,
    #[serde(rename = "COMPANY_LOGO", default)]
    company_logo: Option<String>,
    #[serde(rename = "ID", default)]
    id: Option<String>,
}

impl JobSpyJob {
    fn to_job(self) -> Job {
        Job {
            title: self.title,
            company: self.company,
            location: self.location,
            job_url: self.job_url,
            description: self.description,
            posted_date: self.date_posted,
            salary_min: self.min_amount,
            salary_max: self.max_amount,
            salary_currency: self.currency.unwrap_or_default(),
            job_type: self.job_type,
            experience_level: None,
            is_remote: self.is_remote.unwrap_or(false),
            apply_url: self.job_url_direct,
            easy_apply: self.easy_apply.unwrap_or(false),
            company_logo: self.company_logo,
            external_job_id: self.id,
            skills: Vec::new(),
            benefits: Vec::new(),
        }
    }
}

impl JobSpyScraper {
    pub fn new(scraper_type: ScraperType, settings: ScraperSettings) -> Self {
        let client = reqwest::Client::builder()
            .timeout(settings.response_timeout)
            .build()
            .unwrap_or_default();

        Self {
            scraper_type,
            settings,
            client,
            counters: Mutex::new(RequestCounters::default()),
        }
    }

    async fn call_backend(&self, params: &ScrapeParams) -> Result<JobSpyResponse, ScrapeError> {
        let url = format!("{}{}", self.settings.base_url.trim_end_matches('/'), SEARCH_PATH);
        let body = JobSpyRequest {
            site_name: vec![self.scraper_type.as_str()],
            search_term: &params.search_term,
            location: &params.location,
            distance: DEFAULT_DISTANCE,
            job_type: params.job_type.as_deref(),
            is_remote: params.is_remote,
            results_wanted: params.results_wanted,
            description_format: "markdown",
            country_indeed: "USA",
            enforce_annual_salary: false,
        };

        let started = Instant::now();
        let mut request = self.client.post(&url).json(&body);
        if let Some(api_key) = &self.settings.api_key {
            request = request.header("x-api-key", api_key);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                let mut counters = self.counters.lock().await;
                counters.requests_made += 1;
                counters.blocked_requests += 1;
                return Err(err.into());
            }
        };

        let elapsed = started.elapsed().as_secs_f64();
        let status = response.status();
        {
            let mut counters = self.counters.lock().await;
            counters.requests_made += 1;
            counters.total_response_time += elapsed;
            if status.as_u16() == 429 {
                counters.rate_limit_hits += 1;
            } else if status.is_client_error() {
                counters.blocked_requests += 1;
            }
        }

        if status.as_u16() == 429 {
            warn!(scraper = %self.scraper_type, "backend rate limited the request");
            return Err(ScrapeError::RateLimited);
        }
        if status.is_server_error() {
            return Err(ScrapeError::Server { status: status.as_u16() });
        }
        if status.is_client_error() {
            return Err(ScrapeError::Client { status: status.as_u16() });
        }

        let parsed: JobSpyResponse = response.json().await?;
        debug!(
            scraper = %self.scraper_type,
            jobs = parsed.jobs.len(),
            cached = parsed.cached,
            elapsed_secs = elapsed,
            "backend search completed"
        );
        Ok(parsed)
    }
}

#[async_trait]
impl Scraper for JobSpyScraper {
    fn name(&self) -> &'static str {
        "jobspy"
    }

    fn scraper_type(&self) -> ScraperType {
        self.scraper_type
    }

    fn validate_params(&self, params: &ScrapeParams) -> Result<(), ValidationError> {
        if params.search_term.is_empty() {
            return Err(ValidationError::new("search_term", "search_term is required"));
        }
        if params.location.is_empty() {
            return Err(ValidationError::new("location", "location is required"));
        }
        if params.results_wanted == 0 || params.results_wanted > 1000 {
            return Err(ValidationError::new(
                "results_wanted",
                "results_wanted must be between 1 and 1000",
            ));
        }
        Ok(())
    }

    async fn scrape_jobs(&self, params: &ScrapeParams) -> Result<ScrapeResult, ScrapeError> {
        self.validate_params(params)?;

        let started = Instant::now();
        let response = self.call_backend(params).await?;
        let execution_time = started.elapsed().as_secs_f64();

        let mut result = ScrapeResult::new(String::new(), self.scraper_type);
        result.status = TaskStatus::Success;
        result.execution_time = execution_time;
        result.jobs_data = response.jobs.into_iter().map(JobSpyJob::to_job).collect();
        result.jobs_found = result.jobs_data.len() as u32;
        result.completed_at = Utc::now();
        result.metadata.requests_made = 1;
        result.metadata.pages_scraped = 1;
        result.metadata.average_response_time = execution_time;
        result.metadata.worker_id = Some(self.settings.worker_id.clone());
        Ok(result)
    }

    async fn health_status(&self) -> HealthStatus {
        let counters = self.counters.lock().await;
        let mut health = HealthStatus::new(&self.settings.worker_id, self.scraper_type);
        health.status = if counters.requests_made > 0
            && counters.blocked_requests > counters.requests_made / 2
        {
            HealthState::Unhealthy
        } else if counters.rate_limit_hits > 0 {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        };
        if counters.requests_made > 0 {
            health.error_rate_last_hour =
                counters.blocked_requests as f64 / counters.requests_made as f64;
        }
        health
    }

    async fn close(&self) -> Result<(), ScrapeError> {
        Ok(())
    }
}
