use crate::TaskStatus;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Invalid parameter {field}: {reason}")]
    InvalidParams { field: &'static str, reason: String },

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("Unknown task status: {0}")]
    UnknownStatus(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Task already exists: {0}")]
    TaskAlreadyExists(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl TaskError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        TaskError::InvalidParams {
            field,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TaskError>;
