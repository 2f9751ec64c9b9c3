use thiserror::Error;

/// Errors from the coordination layer.
#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("task {task_id} is not leased to {agent}")]
    NotAssignee { task_id: String, agent: String },

    #[error("task {task_id} cannot change from {status}")]
    InvalidTransition { task_id: String, status: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0} is already running")]
    AlreadyRunning(&'static str),
}

pub type CoordinationResult<T> = Result<T, CoordinationError>;
