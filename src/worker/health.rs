use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::broker::Broker;
use crate::protocol::{
    health_key, ErrorReport, HealthState, HealthStatus, ScraperType, ERRORS_QUEUE,
};

/// Window length for the rolling error-rate and throughput figures
fn window() -> ChronoDuration {
    ChronoDuration::hours(1)
}

/// No successful scrape for this long (after at least one ever) marks
/// the worker unhealthy
fn stale_success() -> ChronoDuration {
    ChronoDuration::minutes(30)
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub worker_id: String,

    pub scraper_type: ScraperType,

    /// How often a health record is persisted to the broker
    pub report_interval: Duration,

    /// How often process memory/CPU figures are refreshed
    pub system_interval: Duration,
}

impl HealthConfig {
    pub fn new(worker_id: impl Into<String>, scraper_type: ScraperType) -> Self {
        Self {
            worker_id: worker_id.into(),
            scraper_type,
            report_interval: Duration::from_secs(60),
            system_interval: Duration::from_secs(30),
        }
    }
}

/// Rolling one-hour outcome windows. Response times are recorded in
/// lockstep with successes so both prune together.
#[derive(Default)]
struct TaskWindows {
    success: VecDeque<DateTime<Utc>>,
    error: VecDeque<DateTime<Utc>>,
    response: VecDeque<Duration>,
    last_success: Option<DateTime<Utc>>,
}

impl TaskWindows {
    fn prune(&mut self, cutoff: DateTime<Utc>) {
        while self.success.front().is_some_and(|at| *at < cutoff) {
            self.success.pop_front();
            self.response.pop_front();
        }
        while self.error.front().is_some_and(|at| *at < cutoff) {
            self.error.pop_front();
        }
    }

    fn error_rate(&self) -> f64 {
        let total = self.success.len() + self.error.len();
        if total == 0 {
            return 0.0;
        }
        self.error.len() as f64 / total as f64
    }

    fn average_response(&self) -> Duration {
        if self.response.is_empty() {
            return Duration::ZERO;
        }
        self.response.iter().sum::<Duration>() / self.response.len() as u32
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct SystemFigures {
    memory_mb: f64,
    cpu_percent: f64,
}

/// Sole owner of a worker pool's health picture.
///
/// Workers report raw outcomes through `report_task_success` and
/// `report_task_error`; this monitor maintains the rolling windows,
/// samples process memory/CPU, classifies the combined state, and
/// persists a `HealthStatus` record with a TTL of twice the report
/// interval so dead workers disappear from discovery on their own.
pub struct HealthMonitor {
    config: HealthConfig,
    broker: Arc<dyn Broker>,
    windows: Mutex<TaskWindows>,
    system: Mutex<SystemFigures>,
    active_tasks: AtomicU32,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, broker: Arc<dyn Broker>) -> Self {
        Self {
            config,
            broker,
            windows: Mutex::new(TaskWindows::default()),
            system: Mutex::new(SystemFigures::default()),
            active_tasks: AtomicU32::new(0),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Record one successful task.
    pub async fn report_task_success(&self, jobs_found: u32, duration: Duration) {
        let now = Utc::now();
        let mut windows = self.windows.lock().await;
        windows.success.push_back(now);
        windows.response.push_back(duration);
        windows.last_success = Some(now);
        drop(windows);
        debug!(
            worker_id = %self.config.worker_id,
            jobs_found,
            duration_ms = duration.as_millis() as u64,
            "recorded successful task"
        );
    }

    /// Record one failed task and publish an error report. A broker
    /// failure here is logged, never propagated; health reporting must
    /// not take a worker down.
    pub async fn report_task_error(&self, task_id: Option<&str>, error: &str) {
        {
            let mut windows = self.windows.lock().await;
            windows.error.push_back(Utc::now());
        }

        let report = ErrorReport {
            task_id: task_id.map(str::to_string),
            scraper_type: self.config.scraper_type,
            error: error.to_string(),
            metadata: json!({ "worker_id": self.config.worker_id }),
            timestamp: Utc::now(),
        };
        if let Err(err) = self.broker.publish_error(ERRORS_QUEUE, &report).await {
            warn!(
                worker_id = %self.config.worker_id,
                error = %err,
                "failed to publish error report"
            );
        }
    }

    /// Mark one task as in flight. Paired with `task_finished`; the
    /// polling loop calls these around every task execution so persisted
    /// health records carry the real in-flight count.
    pub fn task_started(&self) {
        self.active_tasks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_finished(&self) {
        self.active_tasks.fetch_sub(1, Ordering::Relaxed);
    }

    /// Classify a health picture. Pure so the thresholds are directly
    /// testable.
    fn classify(
        error_rate: f64,
        last_success_age: Option<ChronoDuration>,
        memory_mb: f64,
        cpu_percent: f64,
    ) -> HealthState {
        if last_success_age.is_some_and(|age| age > stale_success()) || error_rate > 0.8 {
            return HealthState::Unhealthy;
        }
        if error_rate > 0.5 || memory_mb > 1024.0 || cpu_percent > 90.0 {
            return HealthState::Degraded;
        }
        HealthState::Healthy
    }

    /// Build the current health snapshot from the pruned windows and the
    /// latest system figures.
    pub async fn current_health(&self) -> HealthStatus {
        let now = Utc::now();
        let mut windows = self.windows.lock().await;
        windows.prune(now - window());

        let error_rate = windows.error_rate();
        let completed = windows.success.len() as u32;
        let average_response = windows.average_response();
        let last_success = windows.last_success;
        drop(windows);

        let figures = *self.system.lock().await;
        let age = last_success.map(|at| now - at);

        let mut health = HealthStatus::new(&self.config.worker_id, self.config.scraper_type);
        health.status = Self::classify(error_rate, age, figures.memory_mb, figures.cpu_percent);
        health.active_tasks = self.active_tasks.load(Ordering::Relaxed);
        health.completed_tasks_last_hour = completed;
        health.error_rate_last_hour = error_rate;
        health.memory_usage_mb = figures.memory_mb;
        health.cpu_usage_percent = figures.cpu_percent;
        health.last_successful_scrape = last_success;
        health.timestamp = now;
        debug!(
            worker_id = %self.config.worker_id,
            completed_last_hour = completed,
            error_rate,
            avg_response_ms = average_response.as_millis() as u64,
            "computed health snapshot"
        );
        health
    }

    /// Start the report and system-sampling loops. Both stop when
    /// `cancel` fires.
    pub async fn start(self: &Arc<Self>, cancel: CancellationToken) {
        let mut handles = self.handles.lock().await;

        let monitor = Arc::clone(self);
        let report_cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            monitor.report_loop(report_cancel).await;
        }));

        let monitor = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            monitor.system_loop(cancel).await;
        }));
    }

    async fn report_loop(&self, cancel: CancellationToken) {
        let key = health_key(self.config.scraper_type, &self.config.worker_id);
        let ttl = self.config.report_interval * 2;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.report_interval) => {}
                _ = cancel.cancelled() => return,
            }

            let health = self.current_health().await;
            if let Err(err) = self.broker.set_health(&key, &health, ttl).await {
                warn!(
                    worker_id = %self.config.worker_id,
                    error = %err,
                    "failed to persist health record"
                );
            } else {
                debug!(
                    worker_id = %self.config.worker_id,
                    status = %health.status,
                    error_rate = health.error_rate_last_hour,
                    "persisted health record"
                );
            }
        }
    }

    async fn system_loop(&self, cancel: CancellationToken) {
        let mut system = System::new_all();
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => pid,
            Err(err) => {
                warn!(error = err, "cannot resolve own pid; system figures disabled");
                return;
            }
        };

        loop {
            system.refresh_all();
            if let Some(process) = system.process(pid) {
                let mut figures = self.system.lock().await;
                figures.memory_mb = process.memory() as f64 / (1024.0 * 1024.0);
                figures.cpu_percent = process.cpu_usage() as f64;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.system_interval) => {}
                _ = cancel.cancelled() => return,
            }
        }
    }

    /// Wait for the background loops to finish. `start`'s cancellation
    /// token must already be cancelled.
    pub async fn stop(&self) {
        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            if tokio::time::timeout(Duration::from_secs(10), handle).await.is_err() {
                warn!(worker_id = %self.config.worker_id, "health loop did not stop in time");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;

    fn minutes(n: i64) -> ChronoDuration {
        ChronoDuration::minutes(n)
    }

    #[test]
    fn test_classify_unhealthy_on_high_error_rate() {
        assert_eq!(
            HealthMonitor::classify(0.9, Some(minutes(5)), 200.0, 10.0),
            HealthState::Unhealthy
        );
    }

    #[test]
    fn test_classify_unhealthy_on_stale_success() {
        assert_eq!(
            HealthMonitor::classify(0.0, Some(minutes(31)), 200.0, 10.0),
            HealthState::Unhealthy
        );
    }

    #[test]
    fn test_classify_degraded() {
        assert_eq!(
            HealthMonitor::classify(0.6, Some(minutes(1)), 200.0, 10.0),
            HealthState::Degraded
        );
        assert_eq!(
            HealthMonitor::classify(0.1, Some(minutes(1)), 2048.0, 10.0),
            HealthState::Degraded
        );
        assert_eq!(
            HealthMonitor::classify(0.1, Some(minutes(1)), 200.0, 95.0),
            HealthState::Degraded
        );
    }

    #[test]
    fn test_classify_healthy() {
        assert_eq!(
            HealthMonitor::classify(0.1, Some(minutes(1)), 200.0, 10.0),
            HealthState::Healthy
        );
        // No success ever recorded is not by itself unhealthy.
        assert_eq!(
            HealthMonitor::classify(0.0, None, 200.0, 10.0),
            HealthState::Healthy
        );
    }

    #[test]
    fn test_window_pruning_keeps_entries_in_lockstep() {
        let now = Utc::now();
        let mut windows = TaskWindows::default();
        for age in [90, 70, 30, 10] {
            windows.success.push_back(now - minutes(age));
            windows.response.push_back(Duration::from_secs(age as u64));
        }
        for age in [80, 20] {
            windows.error.push_back(now - minutes(age));
        }

        windows.prune(now - window());

        assert_eq!(windows.success.len(), 2);
        assert_eq!(windows.response.len(), 2);
        assert_eq!(windows.error.len(), 1);
        // 1 error out of 3 windowed outcomes
        assert!((windows.error_rate() - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(windows.average_response(), Duration::from_secs(20));
    }

    #[tokio::test]
    async fn test_error_report_published_to_errors_queue() {
        let broker = Arc::new(MemoryBroker::new());
        let monitor = HealthMonitor::new(
            HealthConfig::new("w-1", ScraperType::Indeed),
            broker.clone(),
        );

        monitor.report_task_error(Some("t1"), "backend down").await;

        let raw = broker.drain(ERRORS_QUEUE).await;
        assert_eq!(raw.len(), 1);
        let report: ErrorReport = serde_json::from_str(&raw[0]).unwrap();
        assert_eq!(report.task_id.as_deref(), Some("t1"));
        assert_eq!(report.error, "backend down");
        assert_eq!(report.metadata["worker_id"], "w-1");
    }

    #[tokio::test]
    async fn test_current_health_reflects_reports() {
        let broker = Arc::new(MemoryBroker::new());
        let monitor = HealthMonitor::new(
            HealthConfig::new("w-1", ScraperType::Indeed),
            broker,
        );

        monitor.report_task_success(5, Duration::from_secs(2)).await;
        monitor.report_task_error(Some("t2"), "rate limited").await;
        monitor.task_started();
        monitor.task_started();
        monitor.task_started();

        let health = monitor.current_health().await;
        assert_eq!(health.completed_tasks_last_hour, 1);
        assert_eq!(health.active_tasks, 3);
        assert!((health.error_rate_last_hour - 0.5).abs() < 1e-9);
        assert!(health.last_successful_scrape.is_some());
        // 0.5 is the degraded boundary, exclusive
        assert_eq!(health.status, HealthState::Healthy);
    }

    #[tokio::test]
    async fn test_active_tasks_track_start_and_finish() {
        let broker = Arc::new(MemoryBroker::new());
        let monitor = HealthMonitor::new(
            HealthConfig::new("w-1", ScraperType::Indeed),
            broker,
        );

        monitor.task_started();
        monitor.task_started();
        assert_eq!(monitor.current_health().await.active_tasks, 2);

        monitor.task_finished();
        assert_eq!(monitor.current_health().await.active_tasks, 1);

        monitor.task_finished();
        assert_eq!(monitor.current_health().await.active_tasks, 0);
    }
}
