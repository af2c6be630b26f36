use futures::stream::{BoxStream, StreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};

use async_stream::stream;

use crate::error::OrcaError;
use crate::model::{Algorithm, AlgorithmKey, AlgorithmOutput, AlgorithmResult, ExecutionRequest, Window};
use crate::registry::{ProcessorNode, Registry, RegistrySnapshot};
use crate::types::ExecutionId;

use super::ProcessorClient;

/// Sends execution requests to processors and normalizes what comes back.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
    client: Arc<dyn ProcessorClient>,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, client: Arc<dyn ProcessorClient>, timeout: Duration) -> Self {
        Self {
            registry,
            client,
            timeout,
        }
    }

    /// Run `algorithms` for `window` on one eligible processor.
    ///
    /// The returned stream is lazy and yields exactly one result per requested
    /// algorithm. Whatever the processor does not deliver (no eligible
    /// processor, transport error, timeout, early end of stream) comes out as
    /// `UNHANDLED_FAILED`. Results carrying a foreign execution id, or for
    /// algorithms that were not requested, are dropped.
    pub fn dispatch(
        &self,
        exec_id: ExecutionId,
        window: Window,
        algorithms: Vec<Algorithm>,
        dependency_results: Vec<AlgorithmResult>,
    ) -> BoxStream<'static, AlgorithmResult> {
        let registry = self.registry.clone();
        let client = self.client.clone();
        let limit = self.timeout;

        stream! {
            let mut pending: BTreeMap<AlgorithmKey, Algorithm> = algorithms
                .iter()
                .map(|a| (a.key(), a.identity()))
                .collect();
            let keys: Vec<AlgorithmKey> = pending.keys().cloned().collect();
            let snapshot = registry.snapshot().await;

            match select_processor(&snapshot, &keys) {
                None => {
                    warn!(
                        "No serving processor for {} (execution {})",
                        display_keys(&keys),
                        exec_id
                    );
                }
                Some(processor) => {
                    debug!(
                        "Dispatching {} to processor `{}` (execution {})",
                        display_keys(&keys),
                        processor.name,
                        exec_id
                    );
                    let request = ExecutionRequest {
                        exec_id: exec_id.clone(),
                        window,
                        algorithm_results: dependency_results,
                        algorithms: pending.values().cloned().collect(),
                    };
                    let deadline = Instant::now() + limit;

                    match timeout_at(deadline, client.execute_dag_part(&processor.address, request)).await {
                        Ok(Ok(mut results)) => loop {
                            match timeout_at(deadline, results.next()).await {
                                Ok(Some(Ok(item))) => {
                                    if item.exec_id != exec_id {
                                        warn!(
                                            "Processor `{}` sent a result for execution {} on stream {}",
                                            processor.name, item.exec_id, exec_id
                                        );
                                        continue;
                                    }
                                    let key = item.algorithm_result.key();
                                    if pending.remove(&key).is_some() {
                                        yield item.algorithm_result;
                                    } else {
                                        warn!(
                                            "Processor `{}` sent an unexpected result for {} (execution {})",
                                            processor.name, key, exec_id
                                        );
                                    }
                                    if pending.is_empty() {
                                        break;
                                    }
                                }
                                Ok(Some(Err(e))) => {
                                    warn!("Result stream from `{}` broke: {}", processor.name, e);
                                    break;
                                }
                                Ok(None) => break,
                                Err(_) => {
                                    warn!(
                                        "Execution {} on `{}`: {}",
                                        exec_id,
                                        processor.name,
                                        OrcaError::Timeout(limit)
                                    );
                                    break;
                                }
                            }
                        },
                        Ok(Err(e)) => {
                            warn!("ExecuteDagPart on `{}` failed: {}", processor.name, e);
                        }
                        Err(_) => {
                            warn!(
                                "ExecuteDagPart on `{}`: {}",
                                processor.name,
                                OrcaError::Timeout(limit)
                            );
                        }
                    }
                }
            }

            for (_, algorithm) in pending {
                yield AlgorithmResult {
                    algorithm,
                    result: AlgorithmOutput::unhandled_failure(),
                };
            }
        }
        .boxed()
    }
}

/// First serving processor, least loaded first, that declares every key.
fn select_processor(snapshot: &RegistrySnapshot, keys: &[AlgorithmKey]) -> Option<Arc<ProcessorNode>> {
    let (first, rest) = keys.split_first()?;
    snapshot
        .processors_for(first)
        .into_iter()
        .find(|p| rest.iter().all(|k| p.supports(k)))
}

fn display_keys(keys: &[AlgorithmKey]) -> String {
    keys.iter()
        .map(|k| k.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::client::tests::FakeClient;
    use crate::dispatch::ResultStream;
    use crate::model::{ExecutionResult, HealthCheckRequest, HealthCheckResponse, ResultData, ResultStatus};
    use crate::registry::tests::{algo, registration};
    use async_trait::async_trait;
    use futures::stream;

    fn window() -> Window {
        Window {
            time_from: 0,
            time_to: 10,
            window_type_name: "t".into(),
            window_type_version: "1.0.0".into(),
            origin: "test".into(),
        }
    }

    async fn registry_with(names: &[&str]) -> Arc<Registry> {
        let registry = Arc::new(Registry::default());
        let algorithms = names.iter().map(|n| algo(n, "t", &[])).collect();
        registry.register(registration("p1", algorithms)).await;
        registry
    }

    #[tokio::test]
    async fn test_missing_results_become_unhandled() {
        let registry = registry_with(&["a", "b"]).await;
        let client = Arc::new(FakeClient::with_outputs(&[(
            "a",
            AlgorithmOutput::succeeded(ResultData::SingleValue(1.0)),
        )]));
        let dispatcher = Dispatcher::new(registry, client.clone(), Duration::from_secs(5));

        let results: Vec<AlgorithmResult> = dispatcher
            .dispatch(
                ExecutionId::generate(),
                window(),
                vec![algo("a", "t", &[]), algo("b", "t", &[])],
                Vec::new(),
            )
            .collect()
            .await;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].algorithm.name, "a");
        assert_eq!(results[0].result.status, ResultStatus::Succeeded);
        assert_eq!(results[1].algorithm.name, "b");
        assert_eq!(results[1].result.status, ResultStatus::UnhandledFailed);

        // one request carrying both algorithms, sent to the registered address
        let requests = client.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0, "http://localhost:50051");
        assert_eq!(requests[0].1.algorithms.len(), 2);
    }

    #[tokio::test]
    async fn test_no_processor_means_unhandled_without_a_call() {
        let registry = registry_with(&["a"]).await;
        let client = Arc::new(FakeClient::default());
        let dispatcher = Dispatcher::new(registry, client.clone(), Duration::from_secs(5));

        let results: Vec<AlgorithmResult> = dispatcher
            .dispatch(ExecutionId::generate(), window(), vec![algo("zz", "t", &[])], Vec::new())
            .collect()
            .await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].result.status, ResultStatus::UnhandledFailed);
        assert!(client.requests.lock().unwrap().is_empty());
    }

    /// Streams one foreign result, one duplicate, then stalls forever.
    struct StallingClient;

    #[async_trait]
    impl ProcessorClient for StallingClient {
        async fn execute_dag_part(
            &self,
            _address: &str,
            request: ExecutionRequest,
        ) -> anyhow::Result<ResultStream> {
            let algorithm = request.algorithms[0].clone();
            let item = |exec_id: ExecutionId| ExecutionResult {
                exec_id,
                algorithm_result: AlgorithmResult {
                    algorithm: algorithm.clone(),
                    result: AlgorithmOutput::succeeded(ResultData::SingleValue(2.0)),
                },
            };
            let items = vec![
                Ok(item(ExecutionId::new("someone-else"))),
                Ok(item(request.exec_id.clone())),
                Ok(item(request.exec_id.clone())),
            ];
            Ok(stream::iter(items).chain(stream::pending()).boxed())
        }

        async fn health_check(
            &self,
            _address: &str,
            _request: HealthCheckRequest,
        ) -> anyhow::Result<HealthCheckResponse> {
            anyhow::bail!("not used")
        }
    }

    #[tokio::test]
    async fn test_stalled_stream_times_out() {
        let registry = registry_with(&["a", "b"]).await;
        let dispatcher =
            Dispatcher::new(registry, Arc::new(StallingClient), Duration::from_millis(200));

        let results: Vec<AlgorithmResult> = dispatcher
            .dispatch(
                ExecutionId::generate(),
                window(),
                vec![algo("a", "t", &[]), algo("b", "t", &[])],
                Vec::new(),
            )
            .collect()
            .await;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].algorithm.name, "a");
        assert_eq!(results[0].result.status, ResultStatus::Succeeded);
        assert_eq!(results[1].algorithm.name, "b");
        assert_eq!(results[1].result.status, ResultStatus::UnhandledFailed);
    }
}
