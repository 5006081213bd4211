//! Fatal errors for plan and apply operations
//!
//! Anything that stops an operation before a graph walk can start (or that
//! makes a document unreadable) is an [`Error`]. Failures of individual
//! nodes during a walk are reported as [`Diagnostics`](crate::Diagnostics)
//! instead.

use thiserror::Error;

/// Errors that abort a whole operation
#[derive(Debug, Error)]
pub enum Error {
    /// The dependency graph contains a cycle
    #[error("Cycle: {}", .cycle.join(", "))]
    GraphCycle {
        /// Nodes taking part in the cycle, in graph order
        cycle: Vec<String>,
    },

    /// Configuration references something that cannot be satisfied
    #[error("Invalid configuration: {message}")]
    Configuration { message: String },

    /// An address string could not be parsed
    #[error("Invalid address {input:?}: {message}")]
    Address { input: String, message: String },

    /// A configuration or plan document is malformed
    #[error("Invalid document: {message}")]
    Document { message: String },

    /// The plan cannot be applied
    #[error("Plan cannot be applied: {reason}")]
    PlanNotApplyable { reason: String },

    /// Worker pool could not be started
    #[error("Failed to start graph walk: {message}")]
    Walk { message: String },

    /// Value or path error
    #[error(transparent)]
    Value(#[from] valuekit::Error),

    /// JSON (de)serialization error
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn address(input: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Address {
            input: input.into(),
            message: message.into(),
        }
    }

    pub fn document(message: impl Into<String>) -> Self {
        Self::Document {
            message: message.into(),
        }
    }

    /// True for errors caused by the dependency graph shape
    pub const fn is_cycle(&self) -> bool {
        matches!(self, Self::GraphCycle { .. })
    }
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_nodes() {
        let err = Error::GraphCycle {
            cycle: vec!["test_object.a".into(), "test_object.b".into()],
        };
        assert_eq!(err.to_string(), "Cycle: test_object.a, test_object.b");
        assert!(err.is_cycle());
        assert!(!Error::configuration("x").is_cycle());
    }
}
