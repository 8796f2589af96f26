//! Model configuration

use crate::error::{Result, TissError};
use serde::{Deserialize, Serialize};

/// Transformer model configuration
///
/// Immutable once validated. `n_kv_head` smaller than `n_head` enables
/// grouped-query attention by head replication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Embedding dimension
    pub n_embd: usize,
    /// Number of transformer layers
    pub n_layer: usize,
    /// Number of query heads
    pub n_head: usize,
    /// Number of key/value heads (defaults to `n_head`)
    pub n_kv_head: usize,
    /// Feed-forward inner dimension
    pub d_ff: usize,
    /// Vocabulary size
    pub vocab_size: usize,
    /// Maximum sequence length the positional encoding supports
    pub block_size: usize,
    /// Layer-norm variance epsilon
    #[serde(default = "default_eps")]
    pub layer_norm_eps: f32,
    /// Dropout probability (0.0 disables)
    #[serde(default)]
    pub dropout: f32,
    /// Tie the output projection to the embedding matrix
    #[serde(default)]
    pub tie_weights: bool,
    /// Include the shift (beta) term in layer norms
    #[serde(default = "default_true")]
    pub ln_bias: bool,
    /// Mixture-of-experts feed-forward (unsupported; fails validation)
    #[serde(default)]
    pub moe: bool,
    /// Depthwise-separable convolutional attention (unsupported; fails validation)
    #[serde(default)]
    pub conv_attention: bool,
    /// Seed for parameter init and dropout masks; entropy-seeded when absent
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_eps() -> f32 {
    1e-6
}

fn default_true() -> bool {
    true
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            n_embd: 128,
            n_layer: 4,
            n_head: 4,
            n_kv_head: 4,
            d_ff: 512,
            vocab_size: 1000,
            block_size: 512,
            layer_norm_eps: 1e-6,
            dropout: 0.0,
            tie_weights: false,
            ln_bias: true,
            moe: false,
            conv_attention: false,
            seed: None,
        }
    }
}

impl ModelConfig {
    /// Validate internal consistency
    ///
    /// # Errors
    /// Returns `InvalidConfig` when dimensions are inconsistent or an
    /// unsupported variant is requested.
    pub fn validate(&self) -> Result<()> {
        if self.n_embd == 0 || self.n_layer == 0 || self.n_head == 0 || self.n_kv_head == 0 {
            return Err(TissError::InvalidConfig(
                "n_embd, n_layer, n_head, and n_kv_head must be non-zero".to_string(),
            ));
        }
        if self.n_embd % self.n_head != 0 {
            return Err(TissError::InvalidConfig(format!(
                "n_embd {} is not divisible by n_head {}",
                self.n_embd, self.n_head
            )));
        }
        if self.n_head % self.n_kv_head != 0 {
            return Err(TissError::InvalidConfig(format!(
                "n_head {} is not divisible by n_kv_head {}",
                self.n_head, self.n_kv_head
            )));
        }
        if self.vocab_size == 0 {
            return Err(TissError::InvalidConfig("vocab_size must be non-zero".to_string()));
        }
        if self.block_size == 0 {
            return Err(TissError::InvalidConfig("block_size must be non-zero".to_string()));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(TissError::InvalidConfig(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        if self.layer_norm_eps <= 0.0 {
            return Err(TissError::InvalidConfig(format!(
                "layer_norm_eps must be positive, got {}",
                self.layer_norm_eps
            )));
        }
        if self.moe {
            return Err(TissError::InvalidConfig(
                "mixture-of-experts feed-forward is unsupported".to_string(),
            ));
        }
        if self.conv_attention {
            return Err(TissError::InvalidConfig(
                "convolutional attention is unsupported".to_string(),
            ));
        }
        Ok(())
    }

    /// Per-head dimension
    pub fn head_dim(&self) -> usize {
        self.n_embd / self.n_head
    }
}
