//! Processor health polling.
//!
//! Every `interval` each registered processor gets a timestamped health
//! check. Answers are written back into the registry, which is what decides
//! dispatch eligibility; a processor that stops answering drops to `UNKNOWN`
//! after `failure_threshold` consecutive misses.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tracing::{debug, info, warn};

use crate::config::HealthConfig;
use crate::dispatch::ProcessorClient;
use crate::error::OrcaError;
use crate::model::{HealthCheckRequest, ServingStatus};
use crate::registry::{HealthObservation, Registry};

pub struct HealthMonitor {
    registry: Arc<Registry>,
    client: Arc<dyn ProcessorClient>,
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(registry: Arc<Registry>, client: Arc<dyn ProcessorClient>, config: HealthConfig) -> Self {
        Self {
            registry,
            client,
            config,
        }
    }

    /// Run the polling loop on its own task until the runtime shuts down.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(&self) {
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            "Health monitor started (interval {:?}, timeout {:?})",
            self.config.interval, self.config.timeout
        );
        loop {
            ticker.tick().await;
            self.poll_all().await;
        }
    }

    /// Check every registered processor once, concurrently. Returns how many
    /// processors were polled.
    pub async fn poll_all(&self) -> usize {
        let snapshot = self.registry.snapshot().await;
        let checks = snapshot.entries().map(|entry| {
            let node = entry.node.clone();
            let generation = entry.generation;
            async move {
                let observation = probe(self.client.as_ref(), &node.address, self.config.timeout).await;
                (node, generation, observation)
            }
        });
        let outcomes = join_all(checks).await;
        let polled = outcomes.len();

        for (node, generation, observation) in outcomes {
            if let HealthObservation::Failed(reason) = &observation {
                debug!("Health check of `{}` failed: {}", node.name, reason);
            }
            let Some((previous, current)) = self
                .registry
                .record_health(&node.name, generation, observation)
                .await
            else {
                continue;
            };
            if previous != current {
                if current == ServingStatus::Serving {
                    info!("Processor `{}` is {:?} again (was {:?})", node.name, current, previous);
                } else {
                    warn!("Processor `{}` is now {:?} (was {:?})", node.name, current, previous);
                }
            }
        }

        polled
    }
}

/// One bounded health check.
pub async fn probe(client: &dyn ProcessorClient, address: &str, limit: Duration) -> HealthObservation {
    match timeout(limit, client.health_check(address, HealthCheckRequest::now())).await {
        Ok(Ok(response)) => HealthObservation::Responded(response),
        Ok(Err(e)) => HealthObservation::Failed(e.to_string()),
        Err(_) => HealthObservation::Failed(OrcaError::Timeout(limit).to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::ResultStream;
    use crate::dispatch::client::tests::FakeClient;
    use crate::model::{AlgorithmKey, ExecutionRequest, HealthCheckResponse, ProcessorMetrics};
    use crate::registry::tests::{algo, registration};
    use async_trait::async_trait;

    fn config(threshold: u32) -> HealthConfig {
        HealthConfig {
            interval: Duration::from_millis(10),
            timeout: Duration::from_millis(100),
            failure_threshold: threshold,
        }
    }

    async fn registry_with_two(threshold: u32) -> Arc<Registry> {
        let registry = Arc::new(Registry::new(threshold));
        let mut p1 = registration("p1", vec![algo("a", "t", &[])]);
        p1.connection_str = "http://p1:1".into();
        let mut p2 = registration("p2", vec![algo("a", "t", &[])]);
        p2.connection_str = "http://p2:1".into();
        registry.register(p1).await;
        registry.register(p2).await;
        registry
    }

    fn serving(active_tasks: i32) -> HealthCheckResponse {
        HealthCheckResponse {
            status: ServingStatus::Serving,
            message: "ok".into(),
            metrics: Some(ProcessorMetrics {
                active_tasks,
                ..Default::default()
            }),
        }
    }

    #[tokio::test]
    async fn test_poll_updates_metrics_and_status() {
        let registry = registry_with_two(3).await;
        let client = Arc::new(FakeClient::default());
        {
            let mut health = client.health.lock().unwrap();
            health.insert("http://p1:1".into(), Ok(serving(7)));
            health.insert(
                "http://p2:1".into(),
                Ok(HealthCheckResponse {
                    status: ServingStatus::Transitioning,
                    message: "warming up".into(),
                    metrics: None,
                }),
            );
        }
        let monitor = HealthMonitor::new(registry.clone(), client, config(3));

        assert_eq!(monitor.poll_all().await, 2);

        let snapshot = registry.snapshot().await;
        let p1 = snapshot.get("p1").unwrap();
        assert_eq!(p1.health.metrics.as_ref().unwrap().active_tasks, 7);
        assert!(p1.health.last_checked.is_some());
        assert_eq!(snapshot.get("p2").unwrap().health.status, ServingStatus::Transitioning);

        let eligible = snapshot.processors_for(&AlgorithmKey::new("a", "1.0.0"));
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].name.as_str(), "p1");
    }

    #[tokio::test]
    async fn test_unreachable_processor_goes_unknown_after_threshold() {
        let registry = registry_with_two(2).await;
        let client = Arc::new(FakeClient::default());
        client
            .health
            .lock()
            .unwrap()
            .insert("http://p2:1".into(), Err("connection refused".into()));
        let monitor = HealthMonitor::new(registry.clone(), client.clone(), config(2));

        monitor.poll_all().await;
        assert_eq!(
            registry.snapshot().await.get("p2").unwrap().health.status,
            ServingStatus::Serving
        );

        monitor.poll_all().await;
        let snapshot = registry.snapshot().await;
        let p2 = snapshot.get("p2").unwrap();
        assert_eq!(p2.health.status, ServingStatus::Unknown);
        assert!(p2.health.message.contains("connection refused"));
        assert_eq!(snapshot.get("p1").unwrap().health.status, ServingStatus::Serving);

        // recovery
        client
            .health
            .lock()
            .unwrap()
            .insert("http://p2:1".into(), Ok(serving(0)));
        monitor.poll_all().await;
        assert_eq!(
            registry.snapshot().await.get("p2").unwrap().health.status,
            ServingStatus::Serving
        );
    }

    struct SlowClient;

    #[async_trait]
    impl ProcessorClient for SlowClient {
        async fn execute_dag_part(
            &self,
            _address: &str,
            _request: ExecutionRequest,
        ) -> anyhow::Result<ResultStream> {
            anyhow::bail!("not used")
        }

        async fn health_check(
            &self,
            _address: &str,
            _request: HealthCheckRequest,
        ) -> anyhow::Result<HealthCheckResponse> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(serving(0))
        }
    }

    #[tokio::test]
    async fn test_probe_times_out() {
        let observation = probe(&SlowClient, "http://p1:1", Duration::from_millis(20)).await;
        match observation {
            HealthObservation::Failed(reason) => assert!(reason.contains("Timed out")),
            other => panic!("expected a failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_spawned_loop_polls() {
        let registry = registry_with_two(1).await;
        let client = Arc::new(FakeClient::default());
        client
            .health
            .lock()
            .unwrap()
            .insert("http://p1:1".into(), Err("down".into()));
        let monitor = Arc::new(HealthMonitor::new(registry.clone(), client, config(1)));

        let task = monitor.spawn();
        tokio::time::sleep(Duration::from_millis(100)).await;
        task.abort();

        assert_eq!(
            registry.snapshot().await.get("p1").unwrap().health.status,
            ServingStatus::Unknown
        );
    }
}
