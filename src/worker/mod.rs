pub mod health;
pub mod orchestrator;
pub mod worker;

pub use health::{HealthConfig, HealthMonitor};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use worker::{Worker, WorkerConfig, WorkerError};
