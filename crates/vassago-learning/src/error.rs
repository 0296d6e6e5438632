//! Error types for online continual learning

use thiserror::Error;

/// Learning errors
#[derive(Debug, Error)]
pub enum LearningError {
    /// A structural invariant was violated by the caller
    #[error("precondition violated: {invariant} (got {value})")]
    PreconditionViolation {
        invariant: &'static str,
        value: String,
    },

    /// Shape mismatch
    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// Replay memory cannot satisfy a batch request
    #[error("memory holds {available} exemplars, {requested} requested")]
    EmptyMemory { requested: usize, available: usize },

    /// Class accuracy with a zero denominator
    #[error("class index {class_index} has no evaluation samples")]
    DegenerateMetric { class_index: usize },

    /// A worker dropped out of a collective
    #[error("distributed desync on rank {rank}: {reason}")]
    DistributedDesync { rank: usize, reason: String },

    /// Backbone name missing from the registry
    #[error("unknown backbone '{0}'")]
    UnknownBackbone(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl LearningError {
    /// Create a precondition violation.
    pub fn precondition(invariant: &'static str, value: impl ToString) -> Self {
        LearningError::PreconditionViolation {
            invariant,
            value: value.to_string(),
        }
    }

    /// Create a shape mismatch from two shapes.
    pub fn shape(expected: &[usize], got: &[usize]) -> Self {
        LearningError::ShapeMismatch {
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
    }

    /// Whether the run can continue with a substituted default.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            LearningError::EmptyMemory { .. } | LearningError::DegenerateMetric { .. }
        )
    }

    /// Error category for logs.
    pub fn category(&self) -> &'static str {
        match self {
            LearningError::PreconditionViolation { .. } => "precondition_violation",
            LearningError::ShapeMismatch { .. } => "shape_mismatch",
            LearningError::EmptyMemory { .. } => "empty_memory",
            LearningError::DegenerateMetric { .. } => "degenerate_metric",
            LearningError::DistributedDesync { .. } => "distributed_desync",
            LearningError::UnknownBackbone(_) => "unknown_backbone",
            LearningError::ConfigError(_) => "config_error",
            LearningError::IoError(_) => "io_error",
        }
    }
}

/// Result type for learning operations
pub type Result<T> = std::result::Result<T, LearningError>;
