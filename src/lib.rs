// Core modules
pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod registry;
pub mod types;

// Execution engine
pub mod coordinator;
pub mod dag;
pub mod dispatch;
pub mod health;

pub mod api;

// Re-export key types and functions
pub use config::{CoordinatorConfig, HealthConfig};
pub use coordinator::{Coordinator, ExecutionHandle, ExecutionReport, WindowState};
pub use db::{DatabaseConfig, ResultSink, ResultStore, create_connection, ensure_schema};
pub use dispatch::{Dispatcher, HttpProcessorClient, ProcessorClient};
pub use error::{OrcaError, OrcaResult};
pub use health::HealthMonitor;
pub use registry::Registry;

use anyhow::Result;
use std::sync::Arc;
use tracing::info;

/// Everything a running coordinator is made of, wired together.
pub struct Orca {
    pub registry: Arc<Registry>,
    pub coordinator: Coordinator,
    pub store: Arc<ResultStore>,
    pub health: Arc<HealthMonitor>,
}

impl Orca {
    /// Coordinator talking to processors over HTTP.
    pub async fn new(config: CoordinatorConfig) -> Result<Self> {
        Self::with_client(config, Arc::new(HttpProcessorClient::new())).await
    }

    pub async fn with_client(
        config: CoordinatorConfig,
        client: Arc<dyn ProcessorClient>,
    ) -> Result<Self> {
        info!("Using database url: {}", config.database.url);
        let db = create_connection(config.database).await?;
        ensure_schema(&db).await?;
        let store = Arc::new(ResultStore::new(db));

        let registry = Arc::new(Registry::new(config.health.failure_threshold));
        let dispatcher = Dispatcher::new(registry.clone(), client.clone(), config.dispatch_timeout);
        let coordinator = Coordinator::new(registry.clone(), dispatcher, store.clone());
        let health = Arc::new(HealthMonitor::new(registry.clone(), client, config.health));

        Ok(Self {
            registry,
            coordinator,
            store,
            health,
        })
    }
}
