use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("Invalid task identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Task directory for {0} exists without a valid status record")]
    CreationRace(String),

    #[error(transparent)]
    Domain(#[from] bindsight_core::CoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
