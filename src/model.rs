//! Protocol messages exchanged with callers and processors.
//!
//! Field names and enum value sets mirror the Orca service contract so that
//! existing workers can be spoken to without translation. Enum discriminants
//! keep their protocol numbering.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::types::ExecutionId;

/// A class of incoming windows, identified by name and version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WindowType {
    pub name: String,
    pub version: String,
}

impl WindowType {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for WindowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// A bounded interval `[time_from, time_to)` of input data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub time_from: u64,
    pub time_to: u64,
    pub window_type_name: String,
    pub window_type_version: String,
    #[serde(default)]
    pub origin: String,
}

impl Window {
    pub fn window_type(&self) -> WindowType {
        WindowType::new(&self.window_type_name, &self.window_type_version)
    }
}

/// Identity of an algorithm: `(name, version)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AlgorithmKey {
    pub name: String,
    pub version: String,
}

impl AlgorithmKey {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for AlgorithmKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// Edge from an algorithm to another algorithm whose result it consumes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AlgorithmDependency {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub processor_name: String,
    #[serde(default)]
    pub processor_runtime: String,
}

impl AlgorithmDependency {
    pub fn key(&self) -> AlgorithmKey {
        AlgorithmKey::new(&self.name, &self.version)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Algorithm {
    pub name: String,
    pub version: String,
    /// Processors echo algorithms back by name and version only, so the
    /// window type may be absent on results.
    #[serde(default)]
    pub window_type: WindowType,
    #[serde(default)]
    pub dependencies: Vec<AlgorithmDependency>,
}

impl Algorithm {
    pub fn key(&self) -> AlgorithmKey {
        AlgorithmKey::new(&self.name, &self.version)
    }

    /// Dependency identities as a set; two declarations of the same
    /// algorithm are equivalent iff these sets match.
    pub fn dependency_keys(&self) -> BTreeSet<AlgorithmKey> {
        self.dependencies.iter().map(|d| d.key()).collect()
    }

    /// The name/version-only form sent to processors.
    pub fn identity(&self) -> Algorithm {
        Algorithm {
            name: self.name.clone(),
            version: self.version.clone(),
            window_type: WindowType::default(),
            dependencies: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorRegistration {
    pub name: String,
    pub runtime: String,
    pub connection_str: String,
    #[serde(default)]
    pub supported_algorithms: Vec<Algorithm>,
}

/// Acknowledgement returned by `RegisterProcessor`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub received: bool,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i32)]
pub enum EmitStatus {
    NoTriggeredAlgorithms = 0,
    ProcessingTriggered = 1,
    TriggeringFailed = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowEmitStatus {
    pub status: EmitStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowTypes {
    pub windows: Vec<WindowType>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i32)]
pub enum ResultStatus {
    HandledFailed = 0,
    UnhandledFailed = 1,
    Succeeded = 2,
}

impl ResultStatus {
    pub fn is_success(self) -> bool {
        matches!(self, ResultStatus::Succeeded)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResultStatus::HandledFailed => "HANDLED_FAILED",
            ResultStatus::UnhandledFailed => "UNHANDLED_FAILED",
            ResultStatus::Succeeded => "SUCCEEDED",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FloatArray {
    pub values: Vec<f32>,
}

/// Payload of a result: exactly one of the three shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultData {
    SingleValue(f32),
    FloatValues(FloatArray),
    StructValue(serde_json::Map<String, serde_json::Value>),
}

/// The `Result` message: status, optional payload and a unix timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlgorithmOutput {
    pub status: ResultStatus,
    #[serde(default)]
    pub result_data: Option<ResultData>,
    #[serde(default)]
    pub timestamp: i64,
}

impl AlgorithmOutput {
    pub fn succeeded(data: ResultData) -> Self {
        Self {
            status: ResultStatus::Succeeded,
            result_data: Some(data),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn handled_failure() -> Self {
        Self {
            status: ResultStatus::HandledFailed,
            result_data: None,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    /// Outcome for an algorithm that produced nothing.
    pub fn unhandled_failure() -> Self {
        Self {
            status: ResultStatus::UnhandledFailed,
            result_data: None,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlgorithmResult {
    pub algorithm: Algorithm,
    pub result: AlgorithmOutput,
}

impl AlgorithmResult {
    pub fn key(&self) -> AlgorithmKey {
        self.algorithm.key()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub exec_id: ExecutionId,
    pub window: Window,
    /// Already-known results the requested algorithms depend on.
    #[serde(default)]
    pub algorithm_results: Vec<AlgorithmResult>,
    pub algorithms: Vec<Algorithm>,
}

/// One item of the `ExecuteDagPart` stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub exec_id: ExecutionId,
    pub algorithm_result: AlgorithmResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckRequest {
    pub timestamp: i64,
}

impl HealthCheckRequest {
    pub fn now() -> Self {
        Self {
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum ServingStatus {
    #[default]
    #[serde(rename = "STATUS_UNKNOWN", alias = "UNKNOWN")]
    Unknown = 0,
    #[serde(rename = "STATUS_SERVING", alias = "SERVING")]
    Serving = 1,
    #[serde(rename = "STATUS_TRANSITIONING", alias = "TRANSITIONING")]
    Transitioning = 2,
    #[serde(rename = "STATUS_NOT_SERVING", alias = "NOT_SERVING")]
    NotServing = 3,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessorMetrics {
    pub active_tasks: i32,
    pub memory_bytes: i64,
    pub cpu_percent: f64,
    pub uptime_seconds: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    pub status: ServingStatus,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub metrics: Option<ProcessorMetrics>,
}
