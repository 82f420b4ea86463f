use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Fixed queue name for published task results
pub const RESULTS_QUEUE: &str = "scraping:results";

/// Fixed queue name for published error reports
pub const ERRORS_QUEUE: &str = "scrapers:errors";

const TASKS_PREFIX: &str = "scraping:tasks";
const HEALTH_PREFIX: &str = "scrapers:health";

/// Lifecycle status of a scraping task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
    Partial,
    Timeout,
    Retry,
}

/// The job board a task targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScraperType {
    Indeed,
    LinkedIn,
    Glassdoor,
    ZipRecruiter,
    Google,
}

impl ScraperType {
    /// All scraper types the fleet can be configured to serve
    pub const ALL: [ScraperType; 5] = [
        ScraperType::Indeed,
        ScraperType::LinkedIn,
        ScraperType::Glassdoor,
        ScraperType::ZipRecruiter,
        ScraperType::Google,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScraperType::Indeed => "indeed",
            ScraperType::LinkedIn => "linkedin",
            ScraperType::Glassdoor => "glassdoor",
            ScraperType::ZipRecruiter => "ziprecruiter",
            ScraperType::Google => "google",
        }
    }
}

impl fmt::Display for ScraperType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScraperType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "indeed" => Ok(ScraperType::Indeed),
            "linkedin" => Ok(ScraperType::LinkedIn),
            "glassdoor" => Ok(ScraperType::Glassdoor),
            "ziprecruiter" => Ok(ScraperType::ZipRecruiter),
            "google" => Ok(ScraperType::Google),
            other => Err(ValidationError::new(
                "scraper_type",
                format!("unknown scraper type '{}'", other),
            )),
        }
    }
}

/// A malformed task or parameter set. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("validation error for field '{field}': {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Search parameters carried by a scraping task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeParams {
    /// Search keywords, e.g. "rust engineer"
    pub search_term: String,

    /// Location string, e.g. "Remote" or "Berlin, Germany"
    pub location: String,

    /// Number of job postings the producer wants back
    pub results_wanted: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub experience_level: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_remote: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub salary_min: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub salary_max: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,

    /// Hint for min/max inter-request delay in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_range: Option<(u64, u64)>,

    /// Maximum number of result pages to walk
    #[serde(default)]
    pub page_limit: u32,
}

impl ScrapeParams {
    /// Minimal parameter set with everything optional left unset
    pub fn new(search_term: impl Into<String>, location: impl Into<String>, results_wanted: u32) -> Self {
        Self {
            search_term: search_term.into(),
            location: location.into(),
            results_wanted,
            job_type: None,
            experience_level: None,
            is_remote: None,
            salary_min: None,
            salary_max: None,
            proxy: None,
            user_agent: None,
            delay_range: None,
            page_limit: 0,
        }
    }
}

/// One unit of scraping work, created by an external producer and
/// consumed exactly once. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeTask {
    pub task_id: String,

    pub scraper_type: ScraperType,

    pub params: ScrapeParams,

    pub created_at: DateTime<Utc>,

    /// Per-attempt timeout in seconds
    #[serde(rename = "timeout")]
    pub timeout_secs: u64,

    /// Retry budget: the worker makes at most max_retries + 1 attempts
    pub max_retries: u32,

    /// Informational only; queues are FIFO regardless
    #[serde(default)]
    pub priority: i32,
}

impl ScrapeTask {
    pub fn new(task_id: impl Into<String>, scraper_type: ScraperType, params: ScrapeParams) -> Self {
        Self {
            task_id: task_id.into(),
            scraper_type,
            params,
            created_at: Utc::now(),
            timeout_secs: 300,
            max_retries: 3,
            priority: 0,
        }
    }

    /// Check required fields and ranges. A task failing this check is
    /// terminally failed without any scrape attempt.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.task_id.is_empty() {
            return Err(ValidationError::new("task_id", "task_id is required"));
        }
        if self.params.search_term.is_empty() {
            return Err(ValidationError::new("search_term", "search_term is required"));
        }
        if self.params.location.is_empty() {
            return Err(ValidationError::new("location", "location is required"));
        }
        if self.params.results_wanted == 0 || self.params.results_wanted > 1000 {
            return Err(ValidationError::new(
                "results_wanted",
                "results_wanted must be between 1 and 1000",
            ));
        }
        if self.timeout_secs == 0 {
            return Err(ValidationError::new("timeout", "timeout must be greater than 0"));
        }
        Ok(())
    }
}

/// One scraped job posting. Immutable once parsed from the adapter response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub title: String,

    pub company: String,

    pub location: String,

    pub job_url: String,

    pub description: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub posted_date: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub salary_min: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub salary_max: Option<f64>,

    #[serde(default)]
    pub salary_currency: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub experience_level: Option<String>,

    #[serde(default)]
    pub is_remote: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub apply_url: Option<String>,

    #[serde(default)]
    pub easy_apply: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub company_logo: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_job_id: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skills: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub benefits: Vec<String>,
}

/// Execution metadata attached to every result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScrapeMetadata {
    pub requests_made: u32,

    pub pages_scraped: u32,

    pub rate_limited: bool,

    pub captcha_encountered: bool,

    pub blocked_requests: u32,

    /// Mean backend response time in seconds
    pub average_response_time: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
}

/// Terminal outcome record for a task. Published once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeResult {
    pub task_id: String,

    pub status: TaskStatus,

    pub scraper_type: ScraperType,

    /// Wall-clock execution time in seconds
    pub execution_time: f64,

    pub jobs_found: u32,

    pub jobs_data: Vec<Job>,

    pub metadata: ScrapeMetadata,

    pub completed_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ScrapeResult {
    /// Empty pending result for a task; the adapter or orchestrator
    /// fills in the terminal fields.
    pub fn new(task_id: impl Into<String>, scraper_type: ScraperType) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Pending,
            scraper_type,
            execution_time: 0.0,
            jobs_found: 0,
            jobs_data: Vec::new(),
            metadata: ScrapeMetadata::default(),
            completed_at: Utc::now(),
            error: None,
        }
    }
}

/// Health classification derived from rolling metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthState::Healthy => f.write_str("healthy"),
            HealthState::Degraded => f.write_str("degraded"),
            HealthState::Unhealthy => f.write_str("unhealthy"),
        }
    }
}

/// Point-in-time health snapshot for one worker or orchestrator.
/// Persisted to the broker with a TTL so stale entries expire on their own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub worker_id: String,

    pub scraper_type: ScraperType,

    pub status: HealthState,

    pub active_tasks: u32,

    pub completed_tasks_last_hour: u32,

    /// In [0.0, 1.0]
    pub error_rate_last_hour: f64,

    pub memory_usage_mb: f64,

    pub cpu_usage_percent: f64,

    pub proxy_pool_size: u32,

    pub proxy_success_rate: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_successful_scrape: Option<DateTime<Utc>>,

    pub timestamp: DateTime<Utc>,
}

impl HealthStatus {
    pub fn new(worker_id: impl Into<String>, scraper_type: ScraperType) -> Self {
        Self {
            worker_id: worker_id.into(),
            scraper_type,
            status: HealthState::Healthy,
            active_tasks: 0,
            completed_tasks_last_hour: 0,
            error_rate_last_hour: 0.0,
            memory_usage_mb: 0.0,
            cpu_usage_percent: 0.0,
            proxy_pool_size: 0,
            proxy_success_rate: 100.0,
            last_successful_scrape: None,
            timestamp: Utc::now(),
        }
    }
}

/// Error report published to the errors queue alongside the failed result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,

    pub scraper_type: ScraperType,

    pub error: String,

    #[serde(default)]
    pub metadata: Value,

    pub timestamp: DateTime<Utc>,
}

/// Task queue key for a scraper type
pub fn task_queue(scraper_type: ScraperType) -> String {
    format!("{}:{}", TASKS_PREFIX, scraper_type)
}

/// Health record key for one worker
pub fn health_key(scraper_type: ScraperType, worker_id: &str) -> String {
    format!("{}:{}:{}", HEALTH_PREFIX, scraper_type, worker_id)
}

/// Discovery pattern matching every health key of a scraper type
pub fn health_pattern(scraper_type: ScraperType) -> String {
    format!("{}:{}:*", HEALTH_PREFIX, scraper_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_task() -> ScrapeTask {
        ScrapeTask::new(
            "t1",
            ScraperType::Indeed,
            ScrapeParams::new("engineer", "Remote", 10),
        )
    }

    #[test]
    fn test_valid_task_passes_validation() {
        assert!(valid_task().validate().is_ok());
    }

    #[test]
    fn test_missing_required_fields_rejected() {
        let mut task = valid_task();
        task.task_id = String::new();
        assert_eq!(task.validate().unwrap_err().field, "task_id");

        let mut task = valid_task();
        task.params.search_term = String::new();
        assert_eq!(task.validate().unwrap_err().field, "search_term");

        let mut task = valid_task();
        task.params.location = String::new();
        assert_eq!(task.validate().unwrap_err().field, "location");
    }

    #[test]
    fn test_results_wanted_bounds() {
        let mut task = valid_task();
        task.params.results_wanted = 0;
        assert_eq!(task.validate().unwrap_err().field, "results_wanted");

        task.params.results_wanted = 1001;
        assert_eq!(task.validate().unwrap_err().field, "results_wanted");

        task.params.results_wanted = 1000;
        assert!(task.validate().is_ok());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut task = valid_task();
        task.timeout_secs = 0;
        assert_eq!(task.validate().unwrap_err().field, "timeout");
    }

    #[test]
    fn test_queue_and_key_naming() {
        assert_eq!(task_queue(ScraperType::Indeed), "scraping:tasks:indeed");
        assert_eq!(
            health_key(ScraperType::LinkedIn, "w-1"),
            "scrapers:health:linkedin:w-1"
        );
        assert_eq!(
            health_pattern(ScraperType::Glassdoor),
            "scrapers:health:glassdoor:*"
        );
    }

    #[test]
    fn test_scraper_type_round_trip() {
        for ty in ScraperType::ALL {
            assert_eq!(ty.as_str().parse::<ScraperType>().unwrap(), ty);
        }
        assert!("monster".parse::<ScraperType>().is_err());
    }

    #[test]
    fn test_task_wire_format_uses_snake_case_keys() {
        let task = valid_task();
        let value: Value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["task_id"], "t1");
        assert_eq!(value["scraper_type"], "indeed");
        assert_eq!(value["params"]["search_term"], "engineer");
        assert_eq!(value["params"]["results_wanted"], 10);
        assert_eq!(value["timeout"], 300);
        // Unset optionals are omitted entirely, not serialized as null
        assert!(value["params"].get("job_type").is_none());
        assert!(value["params"].get("proxy").is_none());
    }

    #[test]
    fn test_result_round_trip_preserves_absent_optionals() {
        let mut result = ScrapeResult::new("t1", ScraperType::Indeed);
        result.status = TaskStatus::Success;
        result.jobs_found = 1;
        result.jobs_data.push(Job {
            title: "Engineer".into(),
            company: "Acme".into(),
            location: "Remote".into(),
            job_url: "https://example.com/j/1".into(),
            description: "desc".into(),
            salary_currency: "USD".into(),
            is_remote: true,
            ..Default::default()
        });
        result.metadata.worker_id = Some("w-0".into());

        let json = serde_json::to_string(&result).unwrap();
        assert!(!json.contains("posted_date"));
        assert!(!json.contains("null"));
        assert!(json.contains("\"job_url\""));
        assert!(json.contains("\"is_remote\""));

        let parsed: ScrapeResult = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, result);
        assert!(parsed.jobs_data[0].apply_url.is_none());
        assert!(parsed.jobs_data[0].skills.is_empty());
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&TaskStatus::Success).unwrap(), "\"success\"");
        assert_eq!(serde_json::to_string(&TaskStatus::Failed).unwrap(), "\"failed\"");
        assert_eq!(serde_json::to_string(&HealthState::Degraded).unwrap(), "\"degraded\"");
    }

    #[test]
    fn test_health_status_round_trip() {
        let mut health = HealthStatus::new("w-1", ScraperType::Google);
        health.status = HealthState::Degraded;
        health.error_rate_last_hour = 0.6;
        health.last_successful_scrape = Some(Utc::now());

        let json = serde_json::to_string(&health).unwrap();
        let parsed: HealthStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, health);
    }
}
