pub mod memory;
pub mod redis;

pub use memory::MemoryBroker;
pub use redis::RedisBroker;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::protocol::{ErrorReport, HealthStatus, ScrapeResult, ScrapeTask};

/// Broker operation failures. A queue being empty is not an error;
/// `pop_task` reports that as `Ok(None)`.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(#[from] ::redis::RedisError),

    #[error("broker payload error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Message transport between producers, workers and monitors.
///
/// The orchestrator, workers and health monitor only ever see this trait;
/// `RedisBroker` backs production deployments and `MemoryBroker` backs
/// tests and dry runs.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Enqueue a task at the tail of a FIFO queue.
    async fn push_task(&self, queue: &str, task: &ScrapeTask) -> Result<(), BrokerError>;

    /// Block up to `timeout` waiting for the next task. `Ok(None)` means
    /// the queue stayed empty for the whole window.
    async fn pop_task(&self, queue: &str, timeout: Duration) -> Result<Option<ScrapeTask>, BrokerError>;

    /// Publish a terminal task result to the results queue.
    async fn publish_result(&self, queue: &str, result: &ScrapeResult) -> Result<(), BrokerError>;

    /// Publish an error report to the errors queue.
    async fn publish_error(&self, queue: &str, report: &ErrorReport) -> Result<(), BrokerError>;

    /// Store a health record under `key`, expiring after `ttl`.
    async fn set_health(&self, key: &str, status: &HealthStatus, ttl: Duration) -> Result<(), BrokerError>;

    /// Fetch a health record; `Ok(None)` if absent or expired.
    async fn get_health(&self, key: &str) -> Result<Option<HealthStatus>, BrokerError>;

    /// List health keys matching a discovery pattern.
    async fn health_keys(&self, pattern: &str) -> Result<Vec<String>, BrokerError>;

    /// Number of pending entries in a queue.
    async fn queue_length(&self, queue: &str) -> Result<u64, BrokerError>;

    /// Release broker resources. Safe to call more than once.
    async fn close(&self) -> Result<(), BrokerError>;
}
