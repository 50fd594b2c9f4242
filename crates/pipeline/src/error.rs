use thiserror::Error;

/// Pipeline failures, grouped by the taxonomy the caller needs: how the
/// failure is reported and whether a retry could ever help.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Conflicting or missing configuration, detected before any
    /// external process runs.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An external tool exited with a nonzero status; its output is in
    /// the task log.
    #[error("External tool failed: {command} (exit {status})")]
    ExternalTool { command: String, status: i32 },

    /// A remote endpoint could not be reached or answered badly. Fatal
    /// for this run; resubmission is the retry path.
    #[error("Transient error: {0}")]
    Transient(String),

    /// An intermediate file a later stage depends on is missing or
    /// malformed.
    #[error("Data integrity error: {0}")]
    DataIntegrity(String),

    #[error("Store error: {0}")]
    Store(#[from] store::StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PipelineError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn data_integrity(message: impl Into<String>) -> Self {
        Self::DataIntegrity(message.into())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
