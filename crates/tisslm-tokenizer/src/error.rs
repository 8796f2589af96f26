//! Tokenizer error type

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TokenizerError {
    /// Requested vocabulary cannot hold the 256 base byte tokens
    #[error("vocab size {0} is below the 256 base byte tokens")]
    InvalidVocabSize(usize),

    /// Token id with no vocabulary entry
    #[error("unknown token id {0}")]
    UnknownTokenId(u32),

    /// Malformed merges file
    #[error("invalid merge rule at line {line}: {reason}")]
    InvalidMergeRule { line: usize, reason: String },

    #[error("tokenizer io: {0}")]
    Io(#[from] std::io::Error),

    #[error("tokenizer vocab encoding: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TokenizerError>;
