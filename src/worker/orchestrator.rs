use anyhow::{bail, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::health::{HealthConfig, HealthMonitor};
use super::worker::{Worker, WorkerConfig, WorkerError};
use crate::broker::Broker;
use crate::protocol::{task_queue, ScrapeResult, ScrapeTask, ScraperType, TaskStatus, RESULTS_QUEUE};
use crate::scraper::{ScraperFactory, ScraperSettings};
use crate::utils::metrics::{OrchestratorMetrics, OrchestratorMetricsSnapshot};

/// Pause after an unexpected broker error before polling again
const ERROR_COOLDOWN: Duration = Duration::from_secs(5);

/// How long `stop` waits for in-flight work before giving up on the join
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Base identifier; individual workers get `<id>-worker-<n>`
    pub worker_id: String,

    pub scraper_type: ScraperType,

    /// Number of concurrent polling loops, in [1, 100]
    pub concurrency: u32,

    /// Blocking-pop window per poll
    pub queue_timeout: Duration,

    /// Base retry backoff handed to every worker
    pub retry_delay: Duration,

    /// Scraping backend connection settings
    pub scraper: ScraperSettings,

    /// Interval for the periodic metrics log line; None disables it
    pub metrics_interval: Option<Duration>,
}

/// Owns the worker pool for one scraper type.
///
/// Spawns one polling loop per worker, a health monitor, and an optional
/// metrics logger, all children of a single cancellation token. Every
/// popped task produces exactly one published result.
pub struct Orchestrator {
    config: OrchestratorConfig,
    broker: Arc<dyn Broker>,
    factory: Arc<dyn ScraperFactory>,
    health: Arc<HealthMonitor>,
    metrics: OrchestratorMetrics,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        broker: Arc<dyn Broker>,
        factory: Arc<dyn ScraperFactory>,
    ) -> Self {
        let health = Arc::new(HealthMonitor::new(
            HealthConfig::new(&config.worker_id, config.scraper_type),
            broker.clone(),
        ));
        let metrics = OrchestratorMetrics::new(config.concurrency);
        Self {
            config,
            broker,
            factory,
            health,
            metrics,
            cancel: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    fn validate_config(&self) -> Result<()> {
        if self.config.concurrency == 0 || self.config.concurrency > 100 {
            bail!(
                "concurrency must be between 1 and 100, got {}",
                self.config.concurrency
            );
        }
        if !self
            .factory
            .supported_types()
            .contains(&self.config.scraper_type)
        {
            bail!(
                "scraper type '{}' is not supported by this backend",
                self.config.scraper_type
            );
        }
        Ok(())
    }

    /// Spawn the worker pool and background loops.
    pub async fn start(&self) -> Result<()> {
        self.validate_config()?;

        let queue = task_queue(self.config.scraper_type);
        info!(
            scraper_type = %self.config.scraper_type,
            concurrency = self.config.concurrency,
            queue = %queue,
            "starting worker pool"
        );

        self.health.start(self.cancel.child_token()).await;

        let mut handles = self.handles.lock().await;
        for n in 0..self.config.concurrency {
            let worker_id = format!("{}-worker-{}", self.config.worker_id, n);
            let mut settings = self.config.scraper.clone();
            settings.worker_id = worker_id.clone();

            let scraper = self
                .factory
                .create(self.config.scraper_type, settings)
                .map_err(|err| anyhow::anyhow!("cannot create scraper for {}: {}", worker_id, err))?;
            let worker = Worker::new(
                WorkerConfig {
                    worker_id,
                    scraper_type: self.config.scraper_type,
                    retry_delay: self.config.retry_delay,
                },
                scraper,
            );

            let broker = self.broker.clone();
            let health = self.health.clone();
            let metrics = self.metrics.clone();
            let cancel = self.cancel.child_token();
            let queue = queue.clone();
            let queue_timeout = self.config.queue_timeout;
            handles.push(tokio::spawn(async move {
                polling_loop(worker, broker, health, metrics, cancel, queue, queue_timeout).await;
            }));
        }

        if let Some(interval) = self.config.metrics_interval {
            let metrics = self.metrics.clone();
            let cancel = self.cancel.child_token();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {}
                        _ = cancel.cancelled() => return,
                    }
                    let snapshot = metrics.snapshot().await;
                    info!(
                        processed = snapshot.tasks_processed,
                        successful = snapshot.tasks_successful,
                        failed = snapshot.tasks_failed,
                        error_rate = snapshot.error_rate,
                        active_workers = snapshot.active_workers,
                        "worker pool metrics"
                    );
                }
            }));
        }

        self.metrics.set_active_workers(self.config.concurrency).await;
        Ok(())
    }

    /// Cancel everything and wait up to the shutdown grace period. Always
    /// returns; loops that outlive the grace period are abandoned with a
    /// warning.
    pub async fn stop(&self) -> Result<()> {
        info!(scraper_type = %self.config.scraper_type, "stopping worker pool");
        self.cancel.cancel();

        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        let join_all = futures::future::join_all(handles);
        if tokio::time::timeout(SHUTDOWN_GRACE, join_all).await.is_err() {
            warn!("worker loops did not stop within the shutdown grace period");
        }

        self.health.stop().await;
        if let Err(err) = self.broker.close().await {
            warn!(error = %err, "error closing broker");
        }
        self.metrics.set_active_workers(0).await;
        info!("worker pool stopped");
        Ok(())
    }

    pub async fn get_metrics(&self) -> OrchestratorMetricsSnapshot {
        self.metrics.snapshot().await
    }

    pub async fn get_health_status(&self) -> crate::protocol::HealthStatus {
        self.health.current_health().await
    }
}

/// One worker's poll/execute/publish loop.
async fn polling_loop(
    mut worker: Worker,
    broker: Arc<dyn Broker>,
    health: Arc<HealthMonitor>,
    metrics: OrchestratorMetrics,
    cancel: CancellationToken,
    queue: String,
    queue_timeout: Duration,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }

        let popped = tokio::select! {
            popped = broker.pop_task(&queue, queue_timeout) => popped,
            _ = cancel.cancelled() => break,
        };

        let task = match popped {
            Ok(Some(task)) => task,
            Ok(None) => continue,
            Err(err) => {
                warn!(queue = %queue, error = %err, "task poll failed, cooling down");
                tokio::select! {
                    _ = tokio::time::sleep(ERROR_COOLDOWN) => continue,
                    _ = cancel.cancelled() => break,
                }
            }
        };

        health.task_started();
        execute_task(&mut worker, &broker, &health, &metrics, &cancel, task).await;
        health.task_finished();
    }

    let advisory = worker.health_status().await;
    info!(
        worker_id = %advisory.worker_id,
        completed_tasks = advisory.completed_tasks_last_hour,
        "worker loop exiting"
    );
    if let Err(err) = worker.close().await {
        warn!(worker_id = %advisory.worker_id, error = %err, "error closing scraper");
    }
}

/// Run one popped task to a terminal outcome and publish exactly one
/// result for it.
async fn execute_task(
    worker: &mut Worker,
    broker: &Arc<dyn Broker>,
    health: &Arc<HealthMonitor>,
    metrics: &OrchestratorMetrics,
    cancel: &CancellationToken,
    task: ScrapeTask,
) {
    let started = Instant::now();

    match worker.process_task(&task, cancel).await {
        Ok(result) => {
            publish(broker, &result).await;
            health
                .report_task_success(result.jobs_found, started.elapsed())
                .await;
            metrics.record_task(true, started.elapsed()).await;
        }
        Err(WorkerError::Cancelled) => {
            // The queue must not leak popped work, so the task still gets
            // a terminal result. Cancellation is not a failure metric.
            let result = failed_result(&task, started, "task cancelled during shutdown");
            publish(broker, &result).await;
            info!(task_id = %task.task_id, "task cancelled during shutdown");
        }
        Err(err) => {
            let message = err.to_string();
            let result = failed_result(&task, started, &message);
            publish(broker, &result).await;
            health.report_task_error(Some(&task.task_id), &message).await;
            metrics.record_task(false, started.elapsed()).await;
            error!(task_id = %task.task_id, error = %message, "task failed");
        }
    }
}

fn failed_result(task: &ScrapeTask, started: Instant, message: &str) -> ScrapeResult {
    let mut result = ScrapeResult::new(&task.task_id, task.scraper_type);
    result.status = TaskStatus::Failed;
    result.execution_time = started.elapsed().as_secs_f64();
    result.error = Some(message.to_string());
    result
}

async fn publish(broker: &Arc<dyn Broker>, result: &ScrapeResult) {
    if let Err(err) = broker.publish_result(RESULTS_QUEUE, result).await {
        error!(task_id = %result.task_id, error = %err, "failed to publish result");
    }
}
