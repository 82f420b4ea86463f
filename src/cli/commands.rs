use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use super::config::AppConfig;
use crate::broker::{Broker, RedisBroker};
use crate::protocol::{
    health_pattern, task_queue, ScrapeParams, ScrapeTask, ScraperType,
};
use crate::scraper::{JobSpyFactory, ScraperSettings};
use crate::worker::{Orchestrator, OrchestratorConfig};

fn orchestrator_config(config: &AppConfig, scraper_type: ScraperType) -> OrchestratorConfig {
    let metrics_interval = match config.monitoring.metrics_interval_secs {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };
    OrchestratorConfig {
        worker_id: config.worker.worker_id.clone(),
        scraper_type,
        concurrency: config.worker.concurrency,
        queue_timeout: Duration::from_secs(config.redis.queue_timeout_secs),
        retry_delay: Duration::from_secs(config.worker.retry_delay_secs),
        scraper: ScraperSettings {
            worker_id: config.worker.worker_id.clone(),
            base_url: config.scraper.base_url.clone(),
            api_key: config.scraper.api_key.clone(),
            response_timeout: Duration::from_secs(config.scraper.response_timeout_secs),
        },
        metrics_interval,
    }
}

/// Run the worker pool until a shutdown signal arrives.
pub async fn run(config: AppConfig) -> Result<()> {
    config.validate()?;
    let scraper_type = config.scraper_type()?;

    let broker = Arc::new(
        RedisBroker::connect(&config.redis.url)
            .await
            .context("Failed to connect to the broker")?,
    );
    let factory = Arc::new(JobSpyFactory);

    let orchestrator = Orchestrator::new(orchestrator_config(&config, scraper_type), broker, factory);
    orchestrator.start().await?;
    info!(
        worker_id = %config.worker.worker_id,
        scraper_type = %scraper_type,
        "worker pool running, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for the shutdown signal")?;
    info!("shutdown signal received");

    orchestrator.stop().await
}

/// Push one task onto a scraper queue. This is the producer role, mostly
/// useful for smoke testing a deployment.
pub async fn submit(
    config: AppConfig,
    scraper_type: String,
    search_term: String,
    location: String,
    results_wanted: u32,
) -> Result<()> {
    let scraper_type: ScraperType = scraper_type.parse()?;
    let task = ScrapeTask::new(
        Uuid::new_v4().to_string(),
        scraper_type,
        ScrapeParams::new(search_term, location, results_wanted),
    );
    task.validate()?;

    let broker = RedisBroker::connect(&config.redis.url)
        .await
        .context("Failed to connect to the broker")?;
    let queue = task_queue(scraper_type);
    broker.push_task(&queue, &task).await?;
    let pending = broker.queue_length(&queue).await?;

    println!("Submitted task {} to {} ({} pending)", task.task_id, queue, pending);
    Ok(())
}

/// Discover and print the health records of live workers.
pub async fn status(config: AppConfig, scraper_type: Option<String>) -> Result<()> {
    let broker = RedisBroker::connect(&config.redis.url)
        .await
        .context("Failed to connect to the broker")?;

    let types: Vec<ScraperType> = match scraper_type {
        Some(name) => vec![name.parse()?],
        None => ScraperType::ALL.to_vec(),
    };

    let mut found = 0usize;
    for ty in types {
        let queue = task_queue(ty);
        let pending = broker.queue_length(&queue).await?;
        let mut keys = broker.health_keys(&health_pattern(ty)).await?;
        keys.sort();

        if !keys.is_empty() || pending > 0 {
            println!("{} ({} task(s) pending)", ty, pending);
        }
        for key in keys {
            if let Some(health) = broker.get_health(&key).await? {
                found += 1;
                println!(
                    "  {} {} active={} completed_1h={} error_rate={:.2} mem={:.0}MB cpu={:.0}%",
                    health.worker_id,
                    health.status,
                    health.active_tasks,
                    health.completed_tasks_last_hour,
                    health.error_rate_last_hour,
                    health.memory_usage_mb,
                    health.cpu_usage_percent,
                );
            }
        }
    }

    if found == 0 {
        println!("No live workers found");
    }
    Ok(())
}
