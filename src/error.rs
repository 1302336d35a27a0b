//! Error taxonomy for the explorer core
//!
//! Functions return `anyhow::Result`; domain failures are raised as
//! [`ExplorerError`] so callers can recover the kind with
//! `err.downcast_ref::<ExplorerError>()`.
//!
//! Expected negative outcomes are not errors: an empty topology is a valid
//! [`TopologyGraph`](crate::topology::TopologyGraph) and an unreachable goal is
//! [`PathOutcome::Unreachable`](crate::pathfind::PathOutcome::Unreachable).

use thiserror::Error;

/// Domain errors raised by the explorer core
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExplorerError {
    /// Checkpoint missing, unreadable, or inconsistent with its config
    #[error("failed to load model parameters: {0}")]
    ParameterLoad(String),

    /// Tensor shapes disagree where they must match
    #[error("shape mismatch in {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: String,
        expected: String,
        actual: String,
    },

    /// Caller-supplied parameter outside its valid domain
    #[error("invalid argument `{name}`: {reason}")]
    InvalidArgument { name: &'static str, reason: String },

    /// Malformed grid description
    #[error("invalid grid: {0}")]
    InvalidGrid(String),
}

impl ExplorerError {
    pub fn shape_mismatch(
        context: impl Into<String>,
        expected: impl std::fmt::Display,
        actual: impl std::fmt::Display,
    ) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    pub fn invalid_argument(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            name,
            reason: reason.into(),
        }
    }
}
