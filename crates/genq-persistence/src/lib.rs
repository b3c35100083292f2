mod memory;
mod repository;
mod rocks;
mod store;

pub use memory::MemoryRepository;
pub use repository::TaskRepository;
pub use rocks::{RocksConfig, RocksRepository};
pub use store::{Adoption, TaskListener, TaskStore};

use genq_core::TaskError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("RocksDB error: {0}")]
    RocksDbError(#[from] rocksdb::Error),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl PersistenceError {
    pub fn as_task_error(&self) -> Option<&TaskError> {
        match self {
            PersistenceError::Task(err) => Some(err),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, PersistenceError>;
