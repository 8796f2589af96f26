//! Byte-level BPE tokenizer: training, encoding, decoding, persistence.
//!
//! [`Tokenizer`] is the user-facing handle; a process-wide default instance
//! can be loaded once and shared through the free [`tokenize`] and
//! [`detokenize`] functions.

pub mod bpe;
pub mod error;
pub mod pretoken;

pub use bpe::Bpe;
pub use error::{Result, TokenizerError};
pub use pretoken::pretokenize;

use std::path::Path;
use std::sync::OnceLock;

/// Environment variable overriding the default tokenizer file prefix
pub const TOKENIZER_PREFIX_ENV: &str = "TISSLM_TOKENIZER_PREFIX";
const DEFAULT_PREFIX: &str = "models/tokenizer";

/// High-level tokenizer handle
#[derive(Debug, Clone, Default)]
pub struct Tokenizer {
    bpe: Bpe,
}

impl Tokenizer {
    /// A byte-level tokenizer with no learned merges
    pub fn new() -> Self {
        Self::default()
    }

    /// Train on `text`, growing the vocabulary to `vocab_size`
    ///
    /// # Errors
    /// Returns `InvalidVocabSize` when `vocab_size` is below 256.
    pub fn train(&mut self, text: &str, vocab_size: usize) -> Result<()> {
        self.bpe.train(text, vocab_size)
    }

    pub fn encode(&self, text: &str) -> Vec<u32> {
        self.bpe.encode(text)
    }

    /// # Errors
    /// Returns `UnknownTokenId` for ids outside the vocabulary.
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        self.bpe.decode(ids)
    }

    pub fn vocab_size(&self) -> usize {
        self.bpe.vocab_size()
    }

    /// # Errors
    /// Propagates filesystem and serialization errors.
    pub fn save(&self, prefix: impl AsRef<Path>) -> Result<()> {
        self.bpe.save(prefix.as_ref())
    }

    /// # Errors
    /// Propagates filesystem errors and malformed merge files.
    pub fn load(prefix: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            bpe: Bpe::load(prefix.as_ref())?,
        })
    }
}

static GLOBAL: OnceLock<Tokenizer> = OnceLock::new();

/// The process-wide tokenizer, loaded on first use from the prefix in
/// `TISSLM_TOKENIZER_PREFIX` (default `models/tokenizer`).
///
/// # Errors
/// Propagates the load failure; a failed load is retried on the next call.
pub fn global() -> Result<&'static Tokenizer> {
    if let Some(tok) = GLOBAL.get() {
        return Ok(tok);
    }
    let prefix = std::env::var(TOKENIZER_PREFIX_ENV).unwrap_or_else(|_| DEFAULT_PREFIX.to_string());
    let loaded = Tokenizer::load(Path::new(&prefix))?;
    Ok(GLOBAL.get_or_init(|| loaded))
}

/// Encode with the process-wide tokenizer
///
/// # Errors
/// Propagates a failed default-tokenizer load.
pub fn tokenize(text: &str) -> Result<Vec<u32>> {
    Ok(global()?.encode(text))
}

/// Decode with the process-wide tokenizer
///
/// # Errors
/// Propagates a failed load or an unknown token id.
pub fn detokenize(ids: &[u32]) -> Result<String> {
    global()?.decode(ids)
}
