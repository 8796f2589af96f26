//! Error types shared across the model crate

use thiserror::Error;

/// Errors produced by model construction, forward/backward passes, and
/// parameter persistence.
#[derive(Debug, Error)]
pub enum TissError {
    /// Configuration failed validation
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Input tensor or token sequence has the wrong shape or content
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A numeric operation produced an unusable result
    #[error("numeric failure: {0}")]
    NumericFailure(String),

    /// Saving or loading model state failed
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),
}

/// Convenience alias used throughout the crate
pub type Result<T> = std::result::Result<T, TissError>;
