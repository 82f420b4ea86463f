use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Per-worker task counters. The lock never leaves this module; callers
/// record outcomes and read snapshot copies.
#[derive(Clone, Default)]
pub struct WorkerMetrics {
    inner: Arc<Mutex<WorkerMetricsSnapshot>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerMetricsSnapshot {
    pub tasks_processed: u64,
    pub tasks_successful: u64,
    pub tasks_failed: u64,
    pub tasks_retried: u64,
    pub last_task_at: Option<DateTime<Utc>>,
    pub total_task_time: Duration,
    pub average_task_time: Duration,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one terminal task outcome and fold its duration into the
    /// rolling average.
    pub async fn record_outcome(&self, success: bool, duration: Duration) {
        let mut metrics = self.inner.lock().await;
        metrics.tasks_processed += 1;
        metrics.last_task_at = Some(Utc::now());
        metrics.total_task_time += duration;
        metrics.average_task_time = metrics.total_task_time / metrics.tasks_processed as u32;
        if success {
            metrics.tasks_successful += 1;
        } else {
            metrics.tasks_failed += 1;
        }
    }

    /// Record one retry attempt. Retries are counted separately from
    /// terminal failures.
    pub async fn record_retry(&self) {
        let mut metrics = self.inner.lock().await;
        metrics.tasks_retried += 1;
    }

    pub async fn snapshot(&self) -> WorkerMetricsSnapshot {
        self.inner.lock().await.clone()
    }
}

/// Fleet-wide counters aggregated by the orchestrator.
#[derive(Clone)]
pub struct OrchestratorMetrics {
    inner: Arc<Mutex<OrchestratorMetricsSnapshot>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorMetricsSnapshot {
    pub start_time: DateTime<Utc>,
    pub tasks_processed: u64,
    pub tasks_successful: u64,
    pub tasks_failed: u64,
    pub active_workers: u32,
    pub total_workers: u32,
    pub last_task_at: Option<DateTime<Utc>>,
    pub total_task_time: Duration,
    pub average_task_duration: Duration,
    pub error_rate: f64,
}

impl OrchestratorMetrics {
    pub fn new(total_workers: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(OrchestratorMetricsSnapshot {
                start_time: Utc::now(),
                tasks_processed: 0,
                tasks_successful: 0,
                tasks_failed: 0,
                active_workers: 0,
                total_workers,
                last_task_at: None,
                total_task_time: Duration::ZERO,
                average_task_duration: Duration::ZERO,
                error_rate: 0.0,
            })),
        }
    }

    pub async fn record_task(&self, success: bool, duration: Duration) {
        let mut metrics = self.inner.lock().await;
        metrics.tasks_processed += 1;
        metrics.last_task_at = Some(Utc::now());
        metrics.total_task_time += duration;
        metrics.average_task_duration = metrics.total_task_time / metrics.tasks_processed as u32;
        if success {
            metrics.tasks_successful += 1;
        } else {
            metrics.tasks_failed += 1;
        }
        metrics.error_rate = metrics.tasks_failed as f64 / metrics.tasks_processed as f64;
    }

    pub async fn set_active_workers(&self, count: u32) {
        let mut metrics = self.inner.lock().await;
        metrics.active_workers = count;
    }

    pub async fn snapshot(&self) -> OrchestratorMetricsSnapshot {
        self.inner.lock().await.clone()
    }
}
