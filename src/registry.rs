//! Processor registry.
//!
//! Tracks every processor that registered with the coordinator, the
//! algorithms each one declares and its last observed health. The table is
//! held as an immutable snapshot behind an `Arc`; every update builds a new
//! snapshot and swaps it in, so readers always see whole entries.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{OrcaError, OrcaResult};
use crate::model::{
    Algorithm, AlgorithmKey, HealthCheckResponse, ProcessorMetrics, ProcessorRegistration,
    ServingStatus, Status, WindowType, WindowTypes,
};
use crate::types::{ProcessorName, ProcessorRuntime};

/// A registered worker and the algorithms it can execute.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessorNode {
    pub name: ProcessorName,
    pub runtime: ProcessorRuntime,
    /// Normalized base URL, without a trailing slash.
    pub address: String,
    pub algorithms: Vec<Algorithm>,
    pub registered_at: DateTime<Utc>,
}

impl ProcessorNode {
    pub fn algorithm(&self, key: &AlgorithmKey) -> Option<&Algorithm> {
        self.algorithms
            .iter()
            .find(|a| a.name == key.name && a.version == key.version)
    }

    pub fn supports(&self, key: &AlgorithmKey) -> bool {
        self.algorithm(key).is_some()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessorHealth {
    pub status: ServingStatus,
    pub message: String,
    pub metrics: Option<ProcessorMetrics>,
    pub consecutive_failures: u32,
    pub last_checked: Option<DateTime<Utc>>,
}

impl ProcessorHealth {
    /// A processor that just registered has proven it can reach us.
    fn registered() -> Self {
        Self {
            status: ServingStatus::Serving,
            message: "registered".to_string(),
            metrics: None,
            consecutive_failures: 0,
            last_checked: None,
        }
    }

    fn active_tasks(&self) -> i32 {
        self.metrics.as_ref().map(|m| m.active_tasks).unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
pub struct ProcessorEntry {
    pub node: Arc<ProcessorNode>,
    pub health: ProcessorHealth,
    /// Bumped on every re-registration; stale health reports are dropped.
    pub generation: u64,
}

/// Outcome of one health poll.
#[derive(Debug, Clone)]
pub enum HealthObservation {
    Responded(HealthCheckResponse),
    Failed(String),
}

/// An immutable view of the processor table.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    version: u64,
    processors: BTreeMap<ProcessorName, ProcessorEntry>,
}

impl RegistrySnapshot {
    pub fn get(&self, name: &str) -> Option<&ProcessorEntry> {
        self.processors.get(name)
    }

    pub fn entries(&self) -> impl Iterator<Item = &ProcessorEntry> {
        self.processors.values()
    }

    /// Serving processors declaring `key`, least loaded first.
    pub fn processors_for(&self, key: &AlgorithmKey) -> Vec<Arc<ProcessorNode>> {
        let mut eligible: Vec<&ProcessorEntry> = self
            .processors
            .values()
            .filter(|e| e.health.status == ServingStatus::Serving && e.node.supports(key))
            .collect();

        eligible.sort_by(|a, b| {
            a.health
                .active_tasks()
                .cmp(&b.health.active_tasks())
                .then_with(|| a.node.name.cmp(&b.node.name))
        });

        eligible.into_iter().map(|e| e.node.clone()).collect()
    }

    /// Every declaration of `key`, regardless of health.
    pub fn declarations_of<'a>(
        &'a self,
        key: &'a AlgorithmKey,
    ) -> impl Iterator<Item = (&'a ProcessorName, &'a Algorithm)> + 'a {
        self.processors
            .values()
            .filter_map(move |e| e.node.algorithm(key).map(|a| (&e.node.name, a)))
    }

    pub fn declares(&self, key: &AlgorithmKey) -> bool {
        self.declarations_of(key).next().is_some()
    }

    /// Distinct algorithms registered against `window_type`.
    pub fn algorithms_for_window_type(
        &self,
        window_type: &WindowType,
    ) -> BTreeMap<AlgorithmKey, Algorithm> {
        let mut algorithms = BTreeMap::new();
        for entry in self.processors.values() {
            for algo in &entry.node.algorithms {
                if &algo.window_type == window_type {
                    algorithms
                        .entry(algo.key())
                        .or_insert_with(|| algo.clone());
                }
            }
        }
        algorithms
    }

    pub fn window_types(&self) -> BTreeSet<WindowType> {
        self.processors
            .values()
            .flat_map(|e| e.node.algorithms.iter().map(|a| a.window_type.clone()))
            .collect()
    }
}

/// Read-model row for `ReadAlgorithms`.
#[derive(Debug, Clone, Serialize)]
pub struct RegisteredAlgorithm {
    pub processor_name: ProcessorName,
    pub processor_runtime: ProcessorRuntime,
    pub algorithm: Algorithm,
}

/// Read-model row for `ReadProcessors`.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessorSummary {
    pub name: ProcessorName,
    pub runtime: ProcessorRuntime,
    pub address: String,
    pub algorithm_count: usize,
    pub registered_at: DateTime<Utc>,
    pub health: ProcessorHealth,
}

pub struct Registry {
    table: RwLock<Arc<RegistrySnapshot>>,
    failure_threshold: u32,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(3)
    }
}

impl Registry {
    /// `failure_threshold` consecutive failed health checks mark a processor `UNKNOWN`.
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            table: RwLock::new(Arc::new(RegistrySnapshot::default())),
            failure_threshold: failure_threshold.max(1),
        }
    }

    /// The current table. Cheap: clones an `Arc`.
    pub async fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.table.read().await.clone()
    }

    /// Register (or re-register) a processor, replacing its capability list.
    ///
    /// Malformed or conflicting declarations are rejected with
    /// `received = false`; the table is left untouched in that case.
    pub async fn register(&self, registration: ProcessorRegistration) -> Status {
        let mut table = self.table.write().await;

        let node = match validate_registration(&table, &registration) {
            Ok(node) => node,
            Err(e) => {
                warn!("Rejected registration of processor `{}`: {}", registration.name, e);
                return Status {
                    received: false,
                    message: e.to_string(),
                };
            }
        };

        let mut next = (**table).clone();
        next.version += 1;
        let replaced = next.processors.contains_key(&node.name);
        let name = node.name.clone();
        let algorithm_count = node.algorithms.len();
        next.processors.insert(
            name.clone(),
            ProcessorEntry {
                node: Arc::new(node),
                health: ProcessorHealth::registered(),
                generation: next.version,
            },
        );
        *table = Arc::new(next);

        info!(
            "Registered processor `{}` with {} algorithm(s){}",
            name,
            algorithm_count,
            if replaced { " (replaced previous registration)" } else { "" }
        );

        Status {
            received: true,
            message: "Successfully registered processor".to_string(),
        }
    }

    /// Serving processors able to run `key`; empty when none is eligible.
    pub async fn find_processors_for(&self, key: &AlgorithmKey) -> Vec<Arc<ProcessorNode>> {
        self.snapshot().await.processors_for(key)
    }

    pub async fn list_window_types(&self) -> WindowTypes {
        WindowTypes {
            windows: self.snapshot().await.window_types().into_iter().collect(),
        }
    }

    pub async fn list_algorithms(&self) -> Vec<RegisteredAlgorithm> {
        let snapshot = self.snapshot().await;
        snapshot
            .entries()
            .flat_map(|e| {
                e.node.algorithms.iter().map(|a| RegisteredAlgorithm {
                    processor_name: e.node.name.clone(),
                    processor_runtime: e.node.runtime.clone(),
                    algorithm: a.clone(),
                })
            })
            .collect()
    }

    pub async fn list_processors(&self) -> Vec<ProcessorSummary> {
        let snapshot = self.snapshot().await;
        snapshot
            .entries()
            .map(|e| ProcessorSummary {
                name: e.node.name.clone(),
                runtime: e.node.runtime.clone(),
                address: e.node.address.clone(),
                algorithm_count: e.node.algorithms.len(),
                registered_at: e.node.registered_at,
                health: e.health.clone(),
            })
            .collect()
    }

    /// Apply one health poll result to a processor entry.
    ///
    /// Returns the `(previous, current)` status, or `None` when the processor
    /// is gone or has re-registered since the poll started.
    pub async fn record_health(
        &self,
        name: &ProcessorName,
        generation: u64,
        observation: HealthObservation,
    ) -> Option<(ServingStatus, ServingStatus)> {
        let mut table = self.table.write().await;

        let current = table.processors.get(name)?;
        if current.generation != generation {
            debug!("Dropping stale health report for processor `{}`", name);
            return None;
        }

        let mut entry = current.clone();
        let previous = entry.health.status;
        match observation {
            HealthObservation::Responded(response) => {
                entry.health.status = response.status;
                entry.health.message = response.message;
                if response.metrics.is_some() {
                    entry.health.metrics = response.metrics;
                }
                entry.health.consecutive_failures = 0;
            }
            HealthObservation::Failed(reason) => {
                entry.health.consecutive_failures += 1;
                entry.health.message = reason;
                if entry.health.consecutive_failures >= self.failure_threshold {
                    entry.health.status = ServingStatus::Unknown;
                }
            }
        }
        entry.health.last_checked = Some(Utc::now());
        let status = entry.health.status;

        let mut next = (**table).clone();
        next.version += 1;
        next.processors.insert(name.clone(), entry);
        *table = Arc::new(next);

        Some((previous, status))
    }
}

/// Accepts `scheme://host[:port]` or a bare `host:port`, which is read as http.
pub fn normalize_address(raw: &str) -> OrcaResult<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(OrcaError::InvalidRegistration(
            "connection string is empty".to_string(),
        ));
    }

    let candidate = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("http://{raw}")
    };

    let url = Url::parse(&candidate).map_err(|e| {
        OrcaError::InvalidRegistration(format!("connection string `{raw}` is not valid: {e}"))
    })?;
    if url.host_str().is_none() {
        return Err(OrcaError::InvalidRegistration(format!(
            "connection string `{raw}` has no host"
        )));
    }

    Ok(candidate.trim_end_matches('/').to_string())
}

fn require(value: &str, what: &str) -> OrcaResult<()> {
    if value.trim().is_empty() {
        return Err(OrcaError::InvalidRegistration(format!("{what} is empty")));
    }
    Ok(())
}

/// Check a registration against the table it would replace an entry in.
fn validate_registration(
    table: &RegistrySnapshot,
    registration: &ProcessorRegistration,
) -> OrcaResult<ProcessorNode> {
    require(&registration.name, "processor name")?;
    require(&registration.runtime, "processor runtime")?;
    let address = normalize_address(&registration.connection_str)?;

    let own_name = registration.name.as_str();
    let mut declared: BTreeMap<AlgorithmKey, &Algorithm> = BTreeMap::new();

    for algo in &registration.supported_algorithms {
        require(&algo.name, "algorithm name")?;
        require(&algo.version, "algorithm version")?;
        require(&algo.window_type.name, &format!("window type name of {}", algo.key()))?;
        require(
            &algo.window_type.version,
            &format!("window type version of {}", algo.key()),
        )?;

        if declared.insert(algo.key(), algo).is_some() {
            return Err(OrcaError::InvalidRegistration(format!(
                "algorithm {} is declared more than once",
                algo.key()
            )));
        }
    }

    for algo in &registration.supported_algorithms {
        let key = algo.key();

        // The same identity must mean the same thing on every processor.
        for entry in table.entries().filter(|e| e.node.name.as_str() != own_name) {
            if let Some(existing) = entry.node.algorithm(&key) {
                if existing.window_type != algo.window_type
                    || existing.dependency_keys() != algo.dependency_keys()
                {
                    return Err(OrcaError::ConflictingAlgorithm {
                        algorithm: key,
                        existing: entry.node.name.clone(),
                    });
                }
            }
        }

        for dep in &algo.dependencies {
            require(&dep.name, &format!("dependency name of {key}"))?;
            require(&dep.version, &format!("dependency version of {key}"))?;

            let dep_key = dep.key();
            if dep_key == key {
                return Err(OrcaError::InvalidRegistration(format!(
                    "algorithm {key} depends on itself"
                )));
            }

            let resolvable = if dep.processor_name.is_empty() {
                declared.contains_key(&dep_key)
                    || table
                        .declarations_of(&dep_key)
                        .any(|(name, _)| name.as_str() != own_name)
            } else if dep.processor_name == own_name {
                declared.contains_key(&dep_key)
            } else {
                table
                    .get(&dep.processor_name)
                    .is_some_and(|e| e.node.supports(&dep_key))
            };

            if !resolvable {
                return Err(OrcaError::UnknownDependency {
                    algorithm: key,
                    dependency: dep_key,
                });
            }
        }
    }

    Ok(ProcessorNode {
        name: ProcessorName::new(own_name),
        runtime: ProcessorRuntime::new(&registration.runtime),
        address,
        algorithms: registration.supported_algorithms.clone(),
        registered_at: Utc::now(),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::AlgorithmDependency;

    pub(crate) fn algo(name: &str, window: &str, deps: &[&str]) -> Algorithm {
        Algorithm {
            name: name.to_string(),
            version: "1.0.0".to_string(),
            window_type: WindowType::new(window, "1.0.0"),
            dependencies: deps
                .iter()
                .map(|d| AlgorithmDependency {
                    name: d.to_string(),
                    version: "1.0.0".to_string(),
                    processor_name: String::new(),
                    processor_runtime: String::new(),
                })
                .collect(),
        }
    }

    pub(crate) fn registration(name: &str, algorithms: Vec<Algorithm>) -> ProcessorRegistration {
        ProcessorRegistration {
            name: name.to_string(),
            runtime: "python3.12".to_string(),
            connection_str: "localhost:50051".to_string(),
            supported_algorithms: algorithms,
        }
    }

    fn key(name: &str) -> AlgorithmKey {
        AlgorithmKey::new(name, "1.0.0")
    }

    #[tokio::test]
    async fn test_register_and_find() {
        let registry = Registry::new(3);
        let status = registry
            .register(registration("p1", vec![algo("x", "t", &[]), algo("y", "t", &["x"])]))
            .await;
        assert!(status.received, "{}", status.message);

        let found = registry.find_processors_for(&key("y")).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name.as_str(), "p1");
        assert_eq!(found[0].address, "http://localhost:50051");
        assert!(registry.find_processors_for(&key("z")).await.is_empty());
    }

    #[tokio::test]
    async fn test_reregistration_replaces_capabilities() {
        let registry = Registry::new(3);
        assert!(registry.register(registration("p1", vec![algo("a", "t", &[])])).await.received);
        assert!(registry.register(registration("p1", vec![algo("b", "t", &[])])).await.received);

        assert!(registry.find_processors_for(&key("a")).await.is_empty());
        assert_eq!(registry.find_processors_for(&key("b")).await.len(), 1);
        assert_eq!(registry.list_processors().await.len(), 1);
    }

    #[tokio::test]
    async fn test_conflicting_declaration_is_rejected() {
        let registry = Registry::new(3);
        assert!(
            registry
                .register(registration("p1", vec![algo("a", "t", &[]), algo("b", "t", &[])]))
                .await
                .received
        );

        // same identity, different dependency set
        let status = registry
            .register(registration("p2", vec![algo("b", "t", &["a"])]))
            .await;
        assert!(!status.received);
        assert!(status.message.contains("already registered by processor p1"));

        // the table is untouched and p1 still serves b
        assert_eq!(registry.find_processors_for(&key("b")).await.len(), 1);
        assert!(registry.snapshot().await.get("p2").is_none());
    }

    #[tokio::test]
    async fn test_identical_declaration_on_two_processors() {
        let registry = Registry::new(3);
        assert!(registry.register(registration("p1", vec![algo("a", "t", &[])])).await.received);
        assert!(registry.register(registration("p2", vec![algo("a", "t", &[])])).await.received);
        assert_eq!(registry.find_processors_for(&key("a")).await.len(), 2);
    }

    #[tokio::test]
    async fn test_malformed_registrations() {
        let registry = Registry::new(3);

        let mut reg = registration("p1", vec![algo("a", "t", &[])]);
        reg.runtime = String::new();
        assert!(!registry.register(reg).await.received);

        let reg = registration("p1", vec![algo("a", "t", &[]), algo("a", "t", &[])]);
        let status = registry.register(reg).await;
        assert!(status.message.contains("more than once"));

        let reg = registration("p1", vec![algo("a", "t", &["a"])]);
        assert!(registry.register(reg).await.message.contains("depends on itself"));

        let reg = registration("p1", vec![algo("a", "t", &["missing"])]);
        let status = registry.register(reg).await;
        assert!(!status.received);
        assert!(status.message.contains("unknown algorithm missing@1.0.0"));

        let mut reg = registration("p1", vec![algo("a", "", &[])]);
        reg.connection_str = "localhost:1".into();
        assert!(!registry.register(reg).await.received);

        assert!(registry.list_processors().await.is_empty());
    }

    #[tokio::test]
    async fn test_dependency_on_named_processor() {
        let registry = Registry::new(3);
        assert!(registry.register(registration("p1", vec![algo("a", "t", &[])])).await.received);

        let mut dependent = algo("b", "t", &["a"]);
        dependent.dependencies[0].processor_name = "p1".into();
        assert!(registry.register(registration("p2", vec![dependent.clone()])).await.received);

        dependent.dependencies[0].processor_name = "p3".into();
        let status = registry.register(registration("p4", vec![dependent])).await;
        assert!(!status.received);
    }

    #[tokio::test]
    async fn test_list_window_types_is_distinct() {
        let registry = Registry::new(3);
        registry
            .register(registration("p1", vec![algo("a", "t1", &[]), algo("b", "t1", &[])]))
            .await;
        registry.register(registration("p2", vec![algo("c", "t2", &[])])).await;

        let types = registry.list_window_types().await;
        assert_eq!(
            types.windows,
            vec![WindowType::new("t1", "1.0.0"), WindowType::new("t2", "1.0.0")]
        );
        assert_eq!(registry.list_algorithms().await.len(), 3);
    }

    #[tokio::test]
    async fn test_health_failures_reach_threshold() {
        let registry = Registry::new(2);
        registry.register(registration("p1", vec![algo("a", "t", &[])])).await;
        let name = ProcessorName::new("p1");
        let generation = registry.snapshot().await.get("p1").unwrap().generation;

        let first = registry
            .record_health(&name, generation, HealthObservation::Failed("timeout".into()))
            .await;
        assert_eq!(first, Some((ServingStatus::Serving, ServingStatus::Serving)));
        assert_eq!(registry.find_processors_for(&key("a")).await.len(), 1);

        let second = registry
            .record_health(&name, generation, HealthObservation::Failed("timeout".into()))
            .await;
        assert_eq!(second, Some((ServingStatus::Serving, ServingStatus::Unknown)));
        assert!(registry.find_processors_for(&key("a")).await.is_empty());

        // a good answer restores eligibility immediately
        registry
            .record_health(
                &name,
                generation,
                HealthObservation::Responded(HealthCheckResponse {
                    status: ServingStatus::Serving,
                    message: String::new(),
                    metrics: Some(ProcessorMetrics {
                        active_tasks: 4,
                        ..Default::default()
                    }),
                }),
            )
            .await;
        let snapshot = registry.snapshot().await;
        let entry = snapshot.get("p1").unwrap();
        assert_eq!(entry.health.consecutive_failures, 0);
        assert_eq!(entry.health.metrics.as_ref().unwrap().active_tasks, 4);
    }

    #[tokio::test]
    async fn test_stale_health_report_is_dropped() {
        let registry = Registry::new(1);
        registry.register(registration("p1", vec![algo("a", "t", &[])])).await;
        let old = registry.snapshot().await.get("p1").unwrap().generation;
        registry.register(registration("p1", vec![algo("a", "t", &[])])).await;

        let outcome = registry
            .record_health(&ProcessorName::new("p1"), old, HealthObservation::Failed("x".into()))
            .await;
        assert!(outcome.is_none());
        assert_eq!(registry.find_processors_for(&key("a")).await.len(), 1);
    }

    #[tokio::test]
    async fn test_least_loaded_processor_first() {
        let registry = Registry::new(3);
        registry.register(registration("p1", vec![algo("a", "t", &[])])).await;
        registry.register(registration("p2", vec![algo("a", "t", &[])])).await;

        let generation = registry.snapshot().await.get("p1").unwrap().generation;
        registry
            .record_health(
                &ProcessorName::new("p1"),
                generation,
                HealthObservation::Responded(HealthCheckResponse {
                    status: ServingStatus::Serving,
                    message: String::new(),
                    metrics: Some(ProcessorMetrics {
                        active_tasks: 9,
                        ..Default::default()
                    }),
                }),
            )
            .await;

        let found = registry.find_processors_for(&key("a")).await;
        assert_eq!(found[0].name.as_str(), "p2");
        assert_eq!(found[1].name.as_str(), "p1");
    }

    #[test]
    fn test_normalize_address() {
        assert_eq!(normalize_address("localhost:5000").unwrap(), "http://localhost:5000");
        assert_eq!(
            normalize_address("https://worker.internal/").unwrap(),
            "https://worker.internal"
        );
        assert!(normalize_address("").is_err());
        assert!(normalize_address("http://").is_err());
    }
}
