use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// A remote endpoint could not be reached. The affected record is
    /// left unchanged and retried on the next pass.
    #[error("Transient error: {0}")]
    Transient(String),

    /// The remote service answered with an error status.
    #[error("Remote request for {code} failed with status {status}")]
    Remote { code: String, status: u16 },

    /// The prediction contains zero binding sites. Not a failure, but
    /// there is nothing to export.
    #[error("Prediction contains no binding sites")]
    EmptyPrediction,

    /// Converting a prediction to the export schema failed.
    #[error("Conversion error: {0}")]
    Conversion(String),

    #[error("Store error: {0}")]
    Store(#[from] store::StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SyncError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn conversion(message: impl Into<String>) -> Self {
        Self::Conversion(message.into())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
