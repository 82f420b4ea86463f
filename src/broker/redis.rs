use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use std::time::Duration;
use tracing::debug;

use super::{Broker, BrokerError};
use crate::protocol::{ErrorReport, HealthStatus, ScrapeResult, ScrapeTask};

/// Redis-backed broker.
///
/// Non-blocking operations share a cloneable multiplexed connection.
/// The blocking pop opens a dedicated connection per call so a long
/// BRPOP never stalls the shared pipeline.
pub struct RedisBroker {
    client: Client,
    conn: MultiplexedConnection,
}

impl RedisBroker {
    /// Connect to Redis and verify the connection with a PING.
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let client = Client::open(url)?;
        let mut conn = client.get_multiplexed_tokio_connection().await?;

        redis::cmd("PING").query_async::<_, ()>(&mut conn).await?;
        debug!(url, "connected to redis broker");

        Ok(Self { client, conn })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn push_task(&self, queue: &str, task: &ScrapeTask) -> Result<(), BrokerError> {
        let payload = serde_json::to_string(task)?;
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(queue, payload).await?;
        Ok(())
    }

    async fn pop_task(&self, queue: &str, timeout: Duration) -> Result<Option<ScrapeTask>, BrokerError> {
        // BRPOP blocks the whole connection, so take a fresh one.
        let mut conn = self.client.get_async_connection().await?;
        let reply: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(queue)
            .arg(timeout.as_secs().max(1) as usize)
            .query_async(&mut conn)
            .await?;

        match reply {
            Some((_queue, payload)) => {
                let task: ScrapeTask = serde_json::from_str(&payload)?;
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    async fn publish_result(&self, queue: &str, result: &ScrapeResult) -> Result<(), BrokerError> {
        let payload = serde_json::to_string(result)?;
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(queue, payload).await?;
        Ok(())
    }

    async fn publish_error(&self, queue: &str, report: &ErrorReport) -> Result<(), BrokerError> {
        let payload = serde_json::to_string(report)?;
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(queue, payload).await?;
        Ok(())
    }

    async fn set_health(&self, key: &str, status: &HealthStatus, ttl: Duration) -> Result<(), BrokerError> {
        let payload = serde_json::to_string(status)?;
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, payload, ttl.as_secs().max(1) as usize)
            .await?;
        Ok(())
    }

    async fn get_health(&self, key: &str) -> Result<Option<HealthStatus>, BrokerError> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn.get(key).await?;
        match payload {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn health_keys(&self, pattern: &str) -> Result<Vec<String>, BrokerError> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.keys(pattern).await?;
        Ok(keys)
    }

    async fn queue_length(&self, queue: &str) -> Result<u64, BrokerError> {
        let mut conn = self.conn.clone();
        let len: u64 = conn.llen(queue).await?;
        Ok(len)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        // Connections drop when the broker does; nothing to flush.
        Ok(())
    }
}
