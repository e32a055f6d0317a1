use crate::types::{DagId, DagOperator, DagStatus};
use thiserror::Error;

/// Errors produced by the DAG engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// The capability flag for the requested command is not set on a task
    #[error("operation not permitted: {command} is not allowed on task '{task}'")]
    OperationNotPermitted { command: DagOperator, task: String },

    /// No operation registered under the persisted type name
    #[error("unknown operation type: {0}")]
    UnknownOperationType(String),

    #[error("operation type registered twice: {0}")]
    DuplicateOperationType(String),

    /// Domain error raised by an operation, recorded verbatim in the task log
    #[error("task execution failed: {0}")]
    TaskExecutionFailed(String),

    #[error("dag not found: {0}")]
    DagNotFound(DagId),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("cannot {command} dag {dag} while it is {status}")]
    InvalidDagState {
        dag: DagId,
        status: DagStatus,
        command: DagOperator,
    },

    #[error("invalid dag: {0}")]
    InvalidDag(String),

    #[error("invalid agent address: {0}")]
    InvalidAgentAddress(String),

    /// A concurrent writer committed first
    #[error("dag {dag} was modified concurrently (expected version {expected})")]
    VersionConflict { dag: DagId, expected: u64 },

    #[error("dispatch to agent {agent} failed: {message}")]
    Dispatch { agent: String, message: String },

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl EngineError {
    /// Logic and version errors that must reach the operator unchanged
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            EngineError::OperationNotPermitted { .. }
                | EngineError::UnknownOperationType(_)
                | EngineError::DuplicateOperationType(_)
                | EngineError::DagNotFound(_)
        )
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
