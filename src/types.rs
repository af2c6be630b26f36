//! NewType wrappers for strong typing throughout the coordinator.
//!
//! These types prevent accidental mixing of semantically different strings
//! (e.g., passing a processor runtime where a processor name is expected).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Macro to generate a NewType wrapper with standard trait implementations.
macro_rules! newtype_string {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Get the inner value as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume and return the inner String.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

newtype_string!(
    /// Unique name a processor registers under.
    ///
    /// Re-registering with the same name replaces the processor's previous
    /// capability list.
    ProcessorName
);

newtype_string!(
    /// Runtime tag reported by a processor (e.g., "python3.12").
    ProcessorRuntime
);

newtype_string!(
    /// Correlation id for one `ExecuteDagPart` call.
    ///
    /// Every streamed `ExecutionResult` carries the id of the request that
    /// produced it.
    ExecutionId
);

newtype_string!(
    /// Identifier the coordinator assigns to every accepted window.
    WindowId
);

impl ExecutionId {
    /// Generate a fresh execution id (dash-less UUID v4).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }
}

impl WindowId {
    /// Generate a fresh window id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}
