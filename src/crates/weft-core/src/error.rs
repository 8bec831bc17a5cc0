//! Error types for graph construction and execution.

use crate::interrupt::GraphInterrupt;
use thiserror::Error;
use weft_checkpoint::CheckpointError;

/// Result type for graph operations
pub type Result<T> = std::result::Result<T, GraphError>;

/// Errors that can occur while building or running a graph
#[derive(Error, Debug)]
pub enum GraphError {
    /// The graph definition is malformed (unknown node, reserved name, ...)
    #[error("graph validation failed: {0}")]
    Validation(String),

    /// A node task failed after exhausting its retry policy
    #[error("task '{task_id}' on node '{node}' failed: {error}")]
    NodeExecution {
        task_id: String,
        node: String,
        error: String,
    },

    /// A write targeted a channel the graph does not declare, or a value a
    /// channel's reducer cannot accept
    #[error("invalid update: {0}")]
    InvalidUpdate(String),

    /// The run exceeded its superstep budget without quiescing
    #[error("recursion limit of {limit} supersteps reached without hitting a stop condition")]
    RecursionLimit { limit: usize },

    /// The run was cancelled before reaching a barrier
    #[error("run cancelled")]
    Cancelled,

    /// Execution paused at an interrupt; resume with a value to continue.
    /// This is a control signal, not a failure.
    #[error("graph execution interrupted")]
    Interrupted(GraphInterrupt),

    /// Checkpoint persistence failed
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Long-term store operation failed
    #[error("store error: {0}")]
    Store(String),

    /// JSON (de)serialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic execution failure
    #[error("execution error: {0}")]
    Execution(String),
}

impl GraphError {
    /// Whether a retry policy may re-attempt after this error.
    ///
    /// Control signals (interrupt, cancel) and definitional errors are never
    /// retried; transient execution and storage failures are.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GraphError::Execution(_)
                | GraphError::NodeExecution { .. }
                | GraphError::Store(_)
                | GraphError::Checkpoint(_)
        )
    }
}
