use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid task status transition from {from} to {to}")]
    InvalidStatusTransition { from: String, to: String },

    #[error("Validation error: {0}")]
    Validation(String),
}
