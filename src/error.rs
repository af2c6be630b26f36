//! Domain errors the coordinator branches on.
//!
//! Application seams (HTTP client, store, binary) use `anyhow::Result`;
//! these variants are the failures callers need to tell apart.

use thiserror::Error;

use crate::model::AlgorithmKey;
use crate::types::ProcessorName;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OrcaError {
    /// The emitted window is malformed and was not triggered.
    #[error("Invalid window: {0}")]
    InvalidWindow(String),

    /// The registration is malformed.
    #[error("Invalid registration: {0}")]
    InvalidRegistration(String),

    /// Another processor already declares this algorithm differently.
    #[error(
        "Algorithm {algorithm} is already registered by processor {existing} with a different declaration"
    )]
    ConflictingAlgorithm {
        algorithm: AlgorithmKey,
        existing: ProcessorName,
    },

    /// A dependency points at an algorithm nobody declares.
    #[error("Algorithm {algorithm} depends on unknown algorithm {dependency}")]
    UnknownDependency {
        algorithm: AlgorithmKey,
        dependency: AlgorithmKey,
    },

    /// The dependency graph for a window contains a cycle.
    #[error("Circular dependency detected involving algorithm {0}")]
    CircularDependency(AlgorithmKey),

    /// A dependency cannot be satisfied for the window being triggered.
    #[error("Algorithm {algorithm} depends on {dependency}, which is not registered for window type {window_type}")]
    UnsatisfiableDependency {
        algorithm: AlgorithmKey,
        dependency: AlgorithmKey,
        window_type: String,
    },

    /// An algorithm in the graph has no processor declaring it.
    #[error("No processor declares algorithm {0}")]
    MissingCapability(AlgorithmKey),

    /// A remote call did not finish within its bound.
    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),
}

pub type OrcaResult<T> = std::result::Result<T, OrcaError>;

impl OrcaError {
    /// True for errors that mean the window can never be executed.
    pub fn is_triggering_failure(&self) -> bool {
        matches!(
            self,
            OrcaError::CircularDependency(_)
                | OrcaError::UnsatisfiableDependency { .. }
                | OrcaError::MissingCapability(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = OrcaError::CircularDependency(AlgorithmKey::new("x", "1"));
        assert_eq!(
            err.to_string(),
            "Circular dependency detected involving algorithm x@1"
        );

        let err = OrcaError::ConflictingAlgorithm {
            algorithm: AlgorithmKey::new("x", "1"),
            existing: ProcessorName::new("p1"),
        };
        assert!(err.to_string().contains("processor p1"));
    }

    #[test]
    fn test_triggering_classification() {
        assert!(OrcaError::MissingCapability(AlgorithmKey::new("x", "1")).is_triggering_failure());
        assert!(!OrcaError::InvalidWindow("empty".into()).is_triggering_failure());
    }
}
