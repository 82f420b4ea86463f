use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use tracing::debug;

use crate::protocol::ScraperType;

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub redis: RedisSettings,
    pub worker: WorkerSettings,
    pub scraper: ScraperBackendSettings,
    pub monitoring: MonitoringSettings,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RedisSettings {
    pub url: String,

    /// Blocking-pop window per poll, in seconds
    pub queue_timeout_secs: u64,
}

/// Worker pool settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WorkerSettings {
    /// Base worker identifier; generated when empty
    pub worker_id: String,

    pub scraper_type: String,

    pub concurrency: u32,

    /// Per-attempt task timeout in seconds, in [30, 3600]
    pub task_timeout_secs: u64,

    pub max_retries: u32,

    /// Base retry backoff in seconds
    pub retry_delay_secs: u64,
}

/// Scraping backend connection settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ScraperBackendSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub response_timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MonitoringSettings {
    /// Interval for the periodic metrics log line; 0 disables it
    pub metrics_interval_secs: u64,
    pub log_level: String,
    pub log_to_file: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            redis: RedisSettings {
                url: "redis://localhost:6379".to_string(),
                queue_timeout_secs: 30,
            },
            worker: WorkerSettings {
                worker_id: String::new(),
                scraper_type: "indeed".to_string(),
                concurrency: 5,
                task_timeout_secs: 300,
                max_retries: 3,
                retry_delay_secs: 5,
            },
            scraper: ScraperBackendSettings {
                base_url: "http://localhost:8000".to_string(),
                api_key: None,
                response_timeout_secs: 60,
            },
            monitoring: MonitoringSettings {
                metrics_interval_secs: 60,
                log_level: "info".to_string(),
                log_to_file: false,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration: defaults, then the YAML file if given, then
    /// environment overrides on top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };
        config.apply_env();
        if config.worker.worker_id.is_empty() {
            config.worker.worker_id = format!("scraper-{}", uuid::Uuid::new_v4());
        }
        Ok(config)
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read configuration file: {}", path.display()))?;

        let config: Self = serde_yaml::from_str(&contents)
            .context(format!("Failed to parse configuration file: {}", path.display()))?;

        Ok(config)
    }

    /// Environment variables win over both defaults and file contents.
    fn apply_env(&mut self) {
        if let Ok(url) = env::var("REDIS_URL") {
            self.redis.url = url;
        }
        if let Ok(scraper_type) = env::var("SCRAPER_TYPE") {
            self.worker.scraper_type = scraper_type;
        }
        if let Ok(worker_id) = env::var("WORKER_ID") {
            self.worker.worker_id = worker_id;
        }
        if let Ok(concurrency) = env::var("CONCURRENCY") {
            if let Ok(parsed) = concurrency.parse() {
                self.worker.concurrency = parsed;
            }
        }
        if let Ok(base_url) = env::var("JOBSPY_BASE_URL") {
            self.scraper.base_url = base_url;
        }
        if let Ok(api_key) = env::var("JOBSPY_API_KEY") {
            self.scraper.api_key = Some(api_key);
        }
        if let Ok(level) = env::var("LOG_LEVEL") {
            self.monitoring.log_level = level;
        }
    }

    /// Parsed scraper type, failing on unknown names.
    pub fn scraper_type(&self) -> Result<ScraperType> {
        self.worker
            .scraper_type
            .parse()
            .context("invalid scraper_type in configuration")
    }

    /// Enforce the ranges the worker pool relies on.
    pub fn validate(&self) -> Result<()> {
        self.scraper_type()?;
        if self.worker.concurrency == 0 || self.worker.concurrency > 100 {
            anyhow::bail!(
                "worker.concurrency must be between 1 and 100, got {}",
                self.worker.concurrency
            );
        }
        if self.worker.task_timeout_secs < 30 || self.worker.task_timeout_secs > 3600 {
            anyhow::bail!(
                "worker.task_timeout_secs must be between 30 and 3600, got {}",
                self.worker.task_timeout_secs
            );
        }
        Ok(())
    }
}
