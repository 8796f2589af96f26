//! Transformer block: attention and feed-forward with post-norm residuals

use crate::attention::{AttentionCache, KVCache, MultiHeadAttention};
use crate::config::ModelConfig;
use crate::dropout::{Dropout, DropoutCache};
use crate::error::Result;
use crate::mlp::{FeedForward, FeedForwardCache};
use crate::norm::{LayerNorm, LayerNormCache};
use crate::param::Parameter;
use crate::tensor::Tensor;
use rand::rngs::StdRng;

/// Per-block forward activations
#[derive(Debug, Clone)]
pub struct BlockCache {
    pub attn: AttentionCache,
    drop1: DropoutCache,
    ln1: LayerNormCache,
    ffn: FeedForwardCache,
    drop2: DropoutCache,
    ln2: LayerNormCache,
}

/// Post-norm transformer block:
/// `x1 = LN1(x + drop(attn(x)))`, `x2 = LN2(x1 + drop(ffn(x1)))`.
#[derive(Debug, Clone)]
pub struct TransformerBlock {
    pub mha: MultiHeadAttention,
    pub ffn: FeedForward,
    pub ln1: LayerNorm,
    pub ln2: LayerNorm,
    dropout: Dropout,
}

impl TransformerBlock {
    pub fn new(config: &ModelConfig, index: usize, rng: &mut StdRng) -> Self {
        let prefix = format!("transformer_blocks.{}", index);
        Self {
            mha: MultiHeadAttention::new(
                config.n_embd,
                config.n_head,
                config.n_kv_head,
                &format!("{}.mha", prefix),
                rng,
            ),
            ffn: FeedForward::new(config.n_embd, config.d_ff, &format!("{}.ffn", prefix), rng),
            ln1: LayerNorm::new(
                config.n_embd,
                config.layer_norm_eps,
                config.ln_bias,
                &format!("{}.ln1", prefix),
            ),
            ln2: LayerNorm::new(
                config.n_embd,
                config.layer_norm_eps,
                config.ln_bias,
                &format!("{}.ln2", prefix),
            ),
            dropout: Dropout::new(config.dropout),
        }
    }

    /// # Errors
    /// Propagates shape errors from the sublayers.
    pub fn forward(
        &self,
        x: &Tensor,
        kv: Option<&mut KVCache>,
        rng: &mut StdRng,
        training: bool,
    ) -> Result<(Tensor, BlockCache)> {
        let (attn_out, attn_cache) = self.mha.forward(x, kv)?;
        let (attn_dropped, drop1) = self.dropout.forward(&attn_out, rng, training);
        let res1 = x.add(&attn_dropped)?;
        let (x1, ln1_cache) = self.ln1.forward(&res1)?;

        let (ffn_out, ffn_cache) = self.ffn.forward(&x1)?;
        let (ffn_dropped, drop2) = self.dropout.forward(&ffn_out, rng, training);
        let res2 = x1.add(&ffn_dropped)?;
        let (x2, ln2_cache) = self.ln2.forward(&res2)?;

        Ok((
            x2,
            BlockCache {
                attn: attn_cache,
                drop1,
                ln1: ln1_cache,
                ffn: ffn_cache,
                drop2,
                ln2: ln2_cache,
            },
        ))
    }

    /// # Errors
    /// Propagates shape errors from the sublayers.
    pub fn backward(&mut self, dout: &Tensor, cache: &BlockCache) -> Result<Tensor> {
        let d_res2 = self.ln2.backward(dout, &cache.ln2)?;

        let d_ffn_out = self.dropout.backward(&d_res2, &cache.drop2);
        let d_x1_ffn = self.ffn.backward(&d_ffn_out, &cache.ffn)?;
        let d_x1 = d_res2.add(&d_x1_ffn)?;

        let d_res1 = self.ln1.backward(&d_x1, &cache.ln1)?;

        let d_attn_out = self.dropout.backward(&d_res1, &cache.drop1);
        let d_x_attn = self.mha.backward(&d_attn_out, &cache.attn)?;
        d_res1.add(&d_x_attn)
    }

    pub fn parameters(&self) -> Vec<&Parameter> {
        let mut params = self.mha.parameters();
        params.extend(self.ffn.parameters());
        params.extend(self.ln1.parameters());
        params.extend(self.ln2.parameters());
        params
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        let mut params = self.mha.parameters_mut();
        params.extend(self.ffn.parameters_mut());
        params.extend(self.ln1.parameters_mut());
        params.extend(self.ln2.parameters_mut());
        params
    }
}
