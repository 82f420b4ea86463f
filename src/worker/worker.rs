use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::{HealthStatus, ScrapeResult, ScrapeTask, ScraperType, ValidationError};
use crate::scraper::{ScrapeError, Scraper};
use crate::utils::metrics::{WorkerMetrics, WorkerMetricsSnapshot};

/// Delay growth is capped at 16x the base
const MAX_BACKOFF_FACTOR: u32 = 16;

const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,

    pub scraper_type: ScraperType,

    /// Base backoff delay; zero falls back to the 5s default
    pub retry_delay: Duration,
}

/// Terminal failure of a single task from the worker's point of view
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("task cancelled by shutdown")]
    Cancelled,

    #[error("task failed after {attempts} attempt(s): {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: ScrapeError,
    },
}

/// Executes one task at a time against its scraper, retrying transient
/// failures with exponential backoff and jitter.
///
/// Attempt n (1-based) waits `base × min(2^(n−1), 16)` scaled by a
/// uniform ±25% jitter before running. The RNG is injected so tests can
/// pin the jitter.
pub struct Worker {
    config: WorkerConfig,
    scraper: Box<dyn Scraper>,
    metrics: WorkerMetrics,
    rng: StdRng,
}

impl Worker {
    pub fn new(config: WorkerConfig, scraper: Box<dyn Scraper>) -> Self {
        Self::with_rng(config, scraper, StdRng::from_entropy())
    }

    pub fn with_rng(config: WorkerConfig, scraper: Box<dyn Scraper>, rng: StdRng) -> Self {
        Self {
            config,
            scraper,
            metrics: WorkerMetrics::new(),
            rng,
        }
    }

    /// Run one task to a terminal outcome.
    ///
    /// Makes at most `max_retries + 1` attempts, each bounded by the
    /// task's per-attempt timeout. An in-flight attempt is allowed to
    /// finish; cancellation is observed before each attempt and during
    /// backoff waits, and a cancelled task is not recorded as a failure.
    pub async fn process_task(
        &mut self,
        task: &ScrapeTask,
        cancel: &CancellationToken,
    ) -> Result<ScrapeResult, WorkerError> {
        let started = Instant::now();

        if cancel.is_cancelled() {
            return Err(WorkerError::Cancelled);
        }

        if let Err(err) = task.validate().and_then(|_| self.scraper.validate_params(&task.params)) {
            warn!(
                task_id = %task.task_id,
                worker_id = %self.config.worker_id,
                scraper = self.scraper.name(),
                error = %err,
                "rejecting invalid task"
            );
            self.metrics.record_outcome(false, started.elapsed()).await;
            return Err(WorkerError::Validation(err));
        }

        let attempt_timeout = Duration::from_secs(task.timeout_secs);
        let mut attempts_made = 0u32;
        let mut last_err: Option<ScrapeError> = None;

        for attempt in 0..=task.max_retries {
            if attempt > 0 {
                self.metrics.record_retry().await;
                let delay = self.backoff_delay(attempt);
                debug!(
                    task_id = %task.task_id,
                    worker_id = %self.config.worker_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "backing off before retry"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(WorkerError::Cancelled),
                }
            }

            attempts_made += 1;
            let outcome =
                match tokio::time::timeout(attempt_timeout, self.scraper.scrape_jobs(&task.params))
                    .await
                {
                    Ok(inner) => inner,
                    Err(_) => Err(ScrapeError::Timeout),
                };

            match outcome {
                Ok(mut result) => {
                    result.task_id = task.task_id.clone();
                    result.metadata.worker_id = Some(self.config.worker_id.clone());
                    self.metrics.record_outcome(true, started.elapsed()).await;
                    debug!(
                        task_id = %task.task_id,
                        worker_id = %self.config.worker_id,
                        jobs_found = result.jobs_found,
                        attempts = attempts_made,
                        "task completed"
                    );
                    return Ok(result);
                }
                Err(ScrapeError::Cancelled) => return Err(WorkerError::Cancelled),
                Err(err) => {
                    let retryable = err.retryable();
                    warn!(
                        task_id = %task.task_id,
                        worker_id = %self.config.worker_id,
                        scraper = self.scraper.name(),
                        attempt = attempts_made,
                        error = %err,
                        retryable,
                        "scrape attempt failed"
                    );
                    last_err = Some(err);
                    if !retryable {
                        break;
                    }
                }
            }
        }

        self.metrics.record_outcome(false, started.elapsed()).await;
        Err(WorkerError::Exhausted {
            attempts: attempts_made,
            source: last_err.unwrap_or(ScrapeError::Timeout),
        })
    }

    /// Jittered exponential backoff before retry attempt `attempt` (1-based).
    fn backoff_delay(&mut self, attempt: u32) -> Duration {
        let base = if self.config.retry_delay.is_zero() {
            DEFAULT_RETRY_DELAY
        } else {
            self.config.retry_delay
        };
        let factor = (1u32 << (attempt - 1).min(4)).min(MAX_BACKOFF_FACTOR);
        let jitter = self.rng.gen_range(0.75..=1.25);
        base.mul_f64(factor as f64 * jitter)
    }

    /// Advisory health snapshot combining the scraper's own counters with
    /// this worker's identity.
    pub async fn health_status(&self) -> HealthStatus {
        let mut health = self.scraper.health_status().await;
        health.worker_id = self.config.worker_id.clone();
        let snapshot = self.metrics.snapshot().await;
        health.completed_tasks_last_hour = snapshot.tasks_successful as u32;
        health.last_successful_scrape = snapshot.last_task_at;
        health
    }

    pub async fn metrics_snapshot(&self) -> WorkerMetricsSnapshot {
        self.metrics.snapshot().await
    }

    pub async fn close(&self) -> Result<(), ScrapeError> {
        self.scraper.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::sync::Mutex;

    use crate::protocol::{ScrapeParams, TaskStatus};

    /// Replays a fixed script of attempt outcomes. `None` entries hang
    /// forever so per-attempt timeouts can be exercised; an exhausted
    /// script also hangs.
    struct ScriptedScraper {
        script: Mutex<VecDeque<Option<Result<ScrapeResult, ScrapeError>>>>,
        calls: Arc<AtomicU32>,
        cancel_after_first: Option<CancellationToken>,
    }

    impl ScriptedScraper {
        fn new(script: Vec<Option<Result<ScrapeResult, ScrapeError>>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: Arc::new(AtomicU32::new(0)),
                cancel_after_first: None,
            }
        }
    }

    #[async_trait]
    impl Scraper for ScriptedScraper {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn scraper_type(&self) -> ScraperType {
            ScraperType::Indeed
        }

        fn validate_params(&self, _params: &ScrapeParams) -> Result<(), ValidationError> {
            Ok(())
        }

        async fn scrape_jobs(&self, _params: &ScrapeParams) -> Result<ScrapeResult, ScrapeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(token) = &self.cancel_after_first {
                token.cancel();
            }
            let next = self.script.lock().await.pop_front();
            match next {
                Some(Some(outcome)) => outcome,
                _ => {
                    futures::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }

        async fn health_status(&self) -> HealthStatus {
            HealthStatus::new("scripted", ScraperType::Indeed)
        }

        async fn close(&self) -> Result<(), ScrapeError> {
            Ok(())
        }
    }

    fn config() -> WorkerConfig {
        WorkerConfig {
            worker_id: "w-0".into(),
            scraper_type: ScraperType::Indeed,
            retry_delay: Duration::from_secs(5),
        }
    }

    fn task(max_retries: u32) -> ScrapeTask {
        let mut task = ScrapeTask::new(
            "t1",
            ScraperType::Indeed,
            ScrapeParams::new("rust", "Remote", 10),
        );
        task.max_retries = max_retries;
        task
    }

    fn success_result(jobs: u32) -> ScrapeResult {
        let mut result = ScrapeResult::new(String::new(), ScraperType::Indeed);
        result.status = TaskStatus::Success;
        result.jobs_found = jobs;
        result
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_failure_uses_whole_budget() {
        let scraper = ScriptedScraper::new(vec![
            Some(Err(ScrapeError::RateLimited)),
            Some(Err(ScrapeError::Server { status: 502 })),
            Some(Err(ScrapeError::RateLimited)),
        ]);
        let mut worker = Worker::with_rng(config(), Box::new(scraper), StdRng::seed_from_u64(1));

        let err = worker
            .process_task(&task(2), &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            WorkerError::Exhausted { attempts, source } => {
                assert_eq!(attempts, 3);
                assert!(matches!(source, ScrapeError::RateLimited));
            }
            other => panic!("unexpected error: {other}"),
        }

        let snapshot = worker.metrics_snapshot().await;
        assert_eq!(snapshot.tasks_retried, 2);
        assert_eq!(snapshot.tasks_failed, 1);
        assert_eq!(snapshot.tasks_successful, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_failure_stops_immediately() {
        let scraper = ScriptedScraper::new(vec![Some(Err(ScrapeError::Client { status: 403 }))]);
        let mut worker = Worker::with_rng(config(), Box::new(scraper), StdRng::seed_from_u64(1));

        let err = worker
            .process_task(&task(3), &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            WorkerError::Exhausted { attempts, source } => {
                assert_eq!(attempts, 1);
                assert!(matches!(source, ScrapeError::Client { status: 403 }));
            }
            other => panic!("unexpected error: {other}"),
        }

        let snapshot = worker.metrics_snapshot().await;
        assert_eq!(snapshot.tasks_retried, 0);
        assert_eq!(snapshot.tasks_failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_rate_limit_retries() {
        let scraper = ScriptedScraper::new(vec![
            Some(Err(ScrapeError::RateLimited)),
            Some(Err(ScrapeError::RateLimited)),
            Some(Ok(success_result(7))),
        ]);
        let mut worker = Worker::with_rng(config(), Box::new(scraper), StdRng::seed_from_u64(1));

        let result = worker
            .process_task(&task(2), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.task_id, "t1");
        assert_eq!(result.jobs_found, 7);
        assert_eq!(result.metadata.worker_id.as_deref(), Some("w-0"));

        let snapshot = worker.metrics_snapshot().await;
        assert_eq!(snapshot.tasks_retried, 2);
        assert_eq!(snapshot.tasks_successful, 1);
        assert_eq!(snapshot.tasks_failed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_is_retried() {
        // First attempt hangs past the per-attempt timeout, second succeeds.
        let scraper = ScriptedScraper::new(vec![None, Some(Ok(success_result(1)))]);
        let mut worker = Worker::with_rng(config(), Box::new(scraper), StdRng::seed_from_u64(1));

        let mut task = task(1);
        task.timeout_secs = 2;
        let result = worker
            .process_task(&task, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.jobs_found, 1);
        assert_eq!(worker.metrics_snapshot().await.tasks_retried, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_backoff() {
        let token = CancellationToken::new();
        // The scraper cancels the token itself, so the worker hits the
        // backoff select with cancellation already pending.
        let mut scraper = ScriptedScraper::new(vec![Some(Err(ScrapeError::RateLimited))]);
        scraper.cancel_after_first = Some(token.clone());
        let calls = scraper.calls.clone();

        let mut worker = Worker::with_rng(config(), Box::new(scraper), StdRng::seed_from_u64(1));
        let err = worker.process_task(&task(3), &token).await.unwrap_err();

        assert!(matches!(err, WorkerError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // Cancellation never counts as a processed task.
        let snapshot = worker.metrics_snapshot().await;
        assert_eq!(snapshot.tasks_processed, 0);
    }

    #[test]
    fn test_backoff_is_deterministic_for_equal_seeds() {
        let mut a = Worker::with_rng(
            config(),
            Box::new(ScriptedScraper::new(vec![])),
            StdRng::seed_from_u64(42),
        );
        let mut b = Worker::with_rng(
            config(),
            Box::new(ScriptedScraper::new(vec![])),
            StdRng::seed_from_u64(42),
        );

        for attempt in 1..=8 {
            assert_eq!(a.backoff_delay(attempt), b.backoff_delay(attempt));
        }
    }

    #[test]
    fn test_backoff_doubles_within_jitter_bounds() {
        let mut worker = Worker::with_rng(
            config(),
            Box::new(ScriptedScraper::new(vec![])),
            StdRng::seed_from_u64(7),
        );

        let base = Duration::from_secs(5);
        for attempt in 1..=10u32 {
            let factor = 2u32.pow((attempt - 1).min(4));
            let delay = worker.backoff_delay(attempt);
            assert!(delay >= base.mul_f64(factor as f64 * 0.75), "attempt {attempt}");
            assert!(delay <= base.mul_f64(factor as f64 * 1.25), "attempt {attempt}");
        }
    }

    #[test]
    fn test_backoff_defaults_when_base_is_zero() {
        let mut cfg = config();
        cfg.retry_delay = Duration::ZERO;
        let mut worker = Worker::with_rng(
            cfg,
            Box::new(ScriptedScraper::new(vec![])),
            StdRng::seed_from_u64(7),
        );

        let delay = worker.backoff_delay(1);
        assert!(delay >= Duration::from_secs(5).mul_f64(0.75));
        assert!(delay <= Duration::from_secs(5).mul_f64(1.25));
    }

    #[tokio::test]
    async fn test_invalid_task_fails_without_attempts() {
        let scraper = ScriptedScraper::new(vec![Some(Ok(success_result(1)))]);
        let calls = scraper.calls.clone();
        let mut worker = Worker::with_rng(config(), Box::new(scraper), StdRng::seed_from_u64(1));

        let mut bad = task(3);
        bad.params.results_wanted = 0;
        let err = worker
            .process_task(&bad, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, WorkerError::Validation(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(worker.metrics_snapshot().await.tasks_failed, 1);
    }
}
