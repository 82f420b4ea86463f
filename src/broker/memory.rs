use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};

use super::{Broker, BrokerError};
use crate::protocol::{ErrorReport, HealthStatus, ScrapeResult, ScrapeTask};

/// In-process broker with the same contract as `RedisBroker`.
///
/// Backs tests and local dry runs. Queues are plain FIFO deques; pushes
/// wake any blocked `pop_task` through a `Notify`.
#[derive(Default)]
pub struct MemoryBroker {
    queues: Mutex<HashMap<String, VecDeque<String>>>,
    health: Mutex<HashMap<String, (String, Instant)>>,
    notify: Notify,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    async fn push_raw(&self, queue: &str, payload: String) {
        let mut queues = self.queues.lock().await;
        queues.entry(queue.to_string()).or_default().push_back(payload);
        drop(queues);
        self.notify.notify_waiters();
    }

    /// Drain every raw payload from a queue. Test helper.
    pub async fn drain(&self, queue: &str) -> Vec<String> {
        let mut queues = self.queues.lock().await;
        queues
            .get_mut(queue)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn push_task(&self, queue: &str, task: &ScrapeTask) -> Result<(), BrokerError> {
        self.push_raw(queue, serde_json::to_string(task)?).await;
        Ok(())
    }

    async fn pop_task(&self, queue: &str, timeout: Duration) -> Result<Option<ScrapeTask>, BrokerError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register the waiter before checking the queue; a push
            // landing in between would otherwise be a lost wakeup.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut queues = self.queues.lock().await;
                if let Some(payload) = queues.get_mut(queue).and_then(|q| q.pop_front()) {
                    return Ok(Some(serde_json::from_str(&payload)?));
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn publish_result(&self, queue: &str, result: &ScrapeResult) -> Result<(), BrokerError> {
        self.push_raw(queue, serde_json::to_string(result)?).await;
        Ok(())
    }

    async fn publish_error(&self, queue: &str, report: &ErrorReport) -> Result<(), BrokerError> {
        self.push_raw(queue, serde_json::to_string(report)?).await;
        Ok(())
    }

    async fn set_health(&self, key: &str, status: &HealthStatus, ttl: Duration) -> Result<(), BrokerError> {
        let payload = serde_json::to_string(status)?;
        let mut health = self.health.lock().await;
        health.insert(key.to_string(), (payload, Instant::now() + ttl));
        Ok(())
    }

    async fn get_health(&self, key: &str) -> Result<Option<HealthStatus>, BrokerError> {
        let health = self.health.lock().await;
        match health.get(key) {
            Some((payload, expires)) if *expires > Instant::now() => {
                Ok(Some(serde_json::from_str(payload)?))
            }
            _ => Ok(None),
        }
    }

    async fn health_keys(&self, pattern: &str) -> Result<Vec<String>, BrokerError> {
        let prefix = pattern.trim_end_matches('*');
        let now = Instant::now();
        let health = self.health.lock().await;
        Ok(health
            .iter()
            .filter(|(key, (_, expires))| key.starts_with(prefix) && *expires > now)
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn queue_length(&self, queue: &str) -> Result<u64, BrokerError> {
        let queues = self.queues.lock().await;
        Ok(queues.get(queue).map(|q| q.len() as u64).unwrap_or(0))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{health_key, health_pattern, ScrapeParams, ScraperType};

    fn task(id: &str) -> ScrapeTask {
        ScrapeTask::new(id, ScraperType::Indeed, ScrapeParams::new("rust", "Remote", 5))
    }

    #[tokio::test]
    async fn test_push_pop_is_fifo() {
        let broker = MemoryBroker::new();
        broker.push_task("q", &task("a")).await.unwrap();
        broker.push_task("q", &task("b")).await.unwrap();

        assert_eq!(broker.queue_length("q").await.unwrap(), 2);
        let first = broker.pop_task("q", Duration::from_millis(10)).await.unwrap().unwrap();
        let second = broker.pop_task("q", Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(first.task_id, "a");
        assert_eq!(second.task_id, "b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_wakes_blocked_pop() {
        let broker = std::sync::Arc::new(MemoryBroker::new());
        let popper = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.pop_task("q", Duration::from_secs(60)).await })
        };

        // Let the pop block first, then push and expect it to wake well
        // before its timeout.
        tokio::time::sleep(Duration::from_secs(1)).await;
        let pushed_at = tokio::time::Instant::now();
        broker.push_task("q", &task("a")).await.unwrap();

        let popped = popper.await.unwrap().unwrap().unwrap();
        assert_eq!(popped.task_id, "a");
        assert!(pushed_at.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_pop_timeout_is_none_not_error() {
        let broker = MemoryBroker::new();
        let popped = broker.pop_task("empty", Duration::from_millis(20)).await.unwrap();
        assert!(popped.is_none());
    }

    #[tokio::test]
    async fn test_health_records_expire() {
        let broker = MemoryBroker::new();
        let key = health_key(ScraperType::Indeed, "w-1");
        let status = HealthStatus::new("w-1", ScraperType::Indeed);

        broker.set_health(&key, &status, Duration::from_millis(30)).await.unwrap();
        assert!(broker.get_health(&key).await.unwrap().is_some());
        assert_eq!(
            broker.health_keys(&health_pattern(ScraperType::Indeed)).await.unwrap(),
            vec![key.clone()]
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(broker.get_health(&key).await.unwrap().is_none());
        assert!(broker
            .health_keys(&health_pattern(ScraperType::Indeed))
            .await
            .unwrap()
            .is_empty());
    }
}
