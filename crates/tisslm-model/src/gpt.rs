//! Decoder-only transformer language model

use crate::attention::KVCache;
use crate::block::{BlockCache, TransformerBlock};
use crate::config::ModelConfig;
use crate::dropout::{Dropout, DropoutCache};
use crate::error::{Result, TissError};
use crate::param::Parameter;
use crate::pos::PositionalEncoding;
use crate::tensor::{matmul, matmul_at_b, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;

/// One [`KVCache`] per layer, advanced in lockstep during decoding
#[derive(Debug, Clone, Default)]
pub struct ModelKVCache {
    layers: Vec<KVCache>,
}

impl ModelKVCache {
    /// Number of positions already decoded
    pub fn len(&self) -> usize {
        self.layers.first().map(KVCache::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Forward activations for one training step
#[derive(Debug, Clone)]
pub struct ModelCache {
    tokens: Vec<usize>,
    embed_drop: DropoutCache,
    blocks: Vec<BlockCache>,
    /// Final hidden state, shape `[seq_len, n_embd]`
    hidden: Tensor,
}

impl ModelCache {
    /// Attention weights of layer `layer`, shape `[n_head, seq_len, kv_len]`
    pub fn attention_weights(&self, layer: usize) -> Option<&Tensor> {
        self.blocks.get(layer).map(|b| b.attn.weights())
    }
}

/// Decoder-only transformer: embedding lookup, sinusoidal positions, a stack
/// of post-norm blocks, and a vocabulary projection (optionally tied to the
/// embedding matrix).
#[derive(Debug, Clone)]
pub struct Model {
    config: ModelConfig,
    pub embeddings: Parameter,
    pub output_proj: Option<Parameter>,
    pub blocks: Vec<TransformerBlock>,
    pos: PositionalEncoding,
    dropout: Dropout,
    rng: StdRng,
}

impl Model {
    /// # Errors
    /// Returns `InvalidConfig` if the configuration fails validation.
    pub fn new(config: ModelConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let bound = (1.0 / config.n_embd as f32).sqrt();
        let embeddings = Parameter::uniform(
            vec![config.vocab_size, config.n_embd],
            bound,
            "embeddings",
            &mut rng,
        );
        let output_proj = if config.tie_weights {
            None
        } else {
            Some(Parameter::uniform(
                vec![config.n_embd, config.vocab_size],
                bound,
                "output_proj",
                &mut rng,
            ))
        };
        let blocks = (0..config.n_layer)
            .map(|i| TransformerBlock::new(&config, i, &mut rng))
            .collect();
        Ok(Self {
            pos: PositionalEncoding::new(config.block_size, config.n_embd),
            dropout: Dropout::new(config.dropout),
            embeddings,
            output_proj,
            blocks,
            config,
            rng,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Fresh per-layer KV caches for a decoding session
    pub fn new_kv_cache(&self) -> ModelKVCache {
        ModelKVCache {
            layers: vec![KVCache::new(); self.config.n_layer],
        }
    }

    /// Run the model over `tokens`, returning logits of shape
    /// `[seq_len, vocab_size]` and the activations needed for backward.
    ///
    /// With a KV cache, `tokens` is the new window and positions continue
    /// from the cache length. Training mode enables dropout.
    ///
    /// # Errors
    /// Returns `InvalidInput` for empty input, out-of-vocabulary ids, or a
    /// window extending past `block_size`.
    pub fn forward(
        &mut self,
        tokens: &[usize],
        mut kv: Option<&mut ModelKVCache>,
        training: bool,
    ) -> Result<(Tensor, ModelCache)> {
        if tokens.is_empty() {
            return Err(TissError::InvalidInput("empty token sequence".to_string()));
        }
        if let Some(&bad) = tokens.iter().find(|&&t| t >= self.config.vocab_size) {
            return Err(TissError::InvalidInput(format!(
                "token id {} out of vocabulary range {}",
                bad, self.config.vocab_size
            )));
        }
        let seq_len = tokens.len();
        let n_embd = self.config.n_embd;
        let start_pos = kv.as_ref().map(|c| c.len()).unwrap_or(0);

        let mut embedded = Tensor::new(vec![seq_len, n_embd]);
        for (t, &tok) in tokens.iter().enumerate() {
            let src = &self.embeddings.value.data()[tok * n_embd..(tok + 1) * n_embd];
            embedded.data_mut()[t * n_embd..(t + 1) * n_embd].copy_from_slice(src);
        }
        let positioned = self.pos.forward(&embedded, start_pos)?;
        let (mut x, embed_drop) = self.dropout.forward(&positioned, &mut self.rng, training);

        let mut block_caches = Vec::with_capacity(self.blocks.len());
        for (i, block) in self.blocks.iter().enumerate() {
            let layer_kv = kv.as_mut().map(|c| &mut c.layers[i]);
            let (y, cache) = block.forward(&x, layer_kv, &mut self.rng, training)?;
            block_caches.push(cache);
            x = y;
        }

        let logits = match &self.output_proj {
            Some(w) => matmul(x.data(), w.value.data(), seq_len, n_embd, self.config.vocab_size),
            // Tied head: logits = hidden @ E^T.
            None => {
                let mut out = vec![0.0; seq_len * self.config.vocab_size];
                for t in 0..seq_len {
                    let h = &x.data()[t * n_embd..(t + 1) * n_embd];
                    for v in 0..self.config.vocab_size {
                        let e = &self.embeddings.value.data()[v * n_embd..(v + 1) * n_embd];
                        let mut dot = 0.0;
                        for d in 0..n_embd {
                            dot += h[d] * e[d];
                        }
                        out[t * self.config.vocab_size + v] = dot;
                    }
                }
                out
            }
        };

        Ok((
            Tensor::from_vec(logits, vec![seq_len, self.config.vocab_size])?,
            ModelCache {
                tokens: tokens.to_vec(),
                embed_drop,
                blocks: block_caches,
                hidden: x,
            },
        ))
    }

    /// Backpropagate a logit gradient through the whole model, accumulating
    /// into every parameter's `grad`.
    ///
    /// # Errors
    /// Returns `InvalidInput` if `dlogits` does not match the cached shapes
    /// or the cache came from an incremental decode.
    pub fn backward(&mut self, dlogits: &Tensor, cache: &ModelCache) -> Result<()> {
        let seq_len = cache.tokens.len();
        let n_embd = self.config.n_embd;
        let vocab = self.config.vocab_size;
        if dlogits.shape() != [seq_len, vocab] {
            return Err(TissError::InvalidInput(format!(
                "expected logit gradient of shape [{}, {}], got {:?}",
                seq_len,
                vocab,
                dlogits.shape()
            )));
        }

        let mut dx = match &mut self.output_proj {
            Some(w) => {
                let dw = matmul_at_b(cache.hidden.data(), dlogits.data(), seq_len, n_embd, vocab);
                for (g, d) in w.grad.data_mut().iter_mut().zip(dw.iter()) {
                    *g += d;
                }
                let dh = crate::tensor::matmul_a_bt(
                    dlogits.data(),
                    w.value.data(),
                    seq_len,
                    vocab,
                    n_embd,
                );
                Tensor::from_vec(dh, vec![seq_len, n_embd])?
            }
            None => {
                // Tied head: dE += dlogits^T @ hidden, dh = dlogits @ E.
                let de = matmul_at_b(dlogits.data(), cache.hidden.data(), seq_len, vocab, n_embd);
                for (g, d) in self.embeddings.grad.data_mut().iter_mut().zip(de.iter()) {
                    *g += d;
                }
                let dh = matmul(
                    dlogits.data(),
                    self.embeddings.value.data(),
                    seq_len,
                    vocab,
                    n_embd,
                );
                Tensor::from_vec(dh, vec![seq_len, n_embd])?
            }
        };

        for (block, block_cache) in self.blocks.iter_mut().zip(cache.blocks.iter()).rev() {
            dx = block.backward(&dx, block_cache)?;
        }

        // Positional encoding is additive, so the gradient passes through the
        // embedding dropout straight to the lookup rows.
        let d_embedded = self.dropout.backward(&dx, &cache.embed_drop);
        for (t, &tok) in cache.tokens.iter().enumerate() {
            let d_row = &d_embedded.data()[t * n_embd..(t + 1) * n_embd];
            let g_row = &mut self.embeddings.grad.data_mut()[tok * n_embd..(tok + 1) * n_embd];
            for d in 0..n_embd {
                g_row[d] += d_row[d];
            }
        }
        Ok(())
    }

    /// All trainable parameters in a fixed traversal order: embeddings, the
    /// untied output projection, then each block in layer order.
    pub fn parameters(&self) -> Vec<&Parameter> {
        let mut params = vec![&self.embeddings];
        if let Some(w) = &self.output_proj {
            params.push(w);
        }
        for block in &self.blocks {
            params.extend(block.parameters());
        }
        params
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        let mut params = vec![&mut self.embeddings];
        if let Some(w) = &mut self.output_proj {
            params.push(w);
        }
        for block in &mut self.blocks {
            params.extend(block.parameters_mut());
        }
        params
    }

    /// Reset every accumulated gradient to zero
    pub fn zero_grad(&mut self) {
        for p in self.parameters_mut() {
            p.zero_grad();
        }
    }

    /// Total number of trainable scalars
    pub fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|p| p.value.numel()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config() -> ModelConfig {
        ModelConfig {
            n_embd: 8,
            n_layer: 2,
            n_head: 2,
            n_kv_head: 2,
            d_ff: 16,
            vocab_size: 16,
            block_size: 32,
            seed: Some(42),
            ..ModelConfig::default()
        }
    }

    #[test]
    fn test_forward_logit_shape() {
        let mut model = Model::new(tiny_config()).unwrap();
        let (logits, _) = model.forward(&[1, 2, 3], None, false).unwrap();
        assert_eq!(logits.shape(), &[3, 16]);
    }

    #[test]
    fn test_rejects_out_of_vocab_token() {
        let mut model = Model::new(tiny_config()).unwrap();
        assert!(model.forward(&[1, 16], None, false).is_err());
        assert!(model.forward(&[], None, false).is_err());
    }

    #[test]
    fn test_cached_decode_matches_full_forward() {
        let mut model = Model::new(tiny_config()).unwrap();
        let tokens = [3usize, 7, 1, 9, 4];

        let (full, _) = model.forward(&tokens, None, false).unwrap();

        let mut kv = model.new_kv_cache();
        let mut stepwise = Vec::new();
        for &tok in &tokens {
            let (logits, _) = model.forward(&[tok], Some(&mut kv), false).unwrap();
            stepwise.extend_from_slice(logits.data());
        }

        assert_eq!(kv.len(), 5);
        for (a, b) in full.data().iter().zip(stepwise.iter()) {
            assert!((a - b).abs() < 1e-3, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_causal_mask_isolates_later_positions() {
        let mut model = Model::new(tiny_config()).unwrap();
        let (before, _) = model.forward(&[3, 7, 1, 9, 4, 2, 8, 6], None, false).unwrap();
        // Perturb position 5; logits at positions 0..=4 must be bit-identical.
        let (after, _) = model.forward(&[3, 7, 1, 9, 4, 13, 8, 6], None, false).unwrap();
        let vocab = 16;
        assert_eq!(&before.data()[..5 * vocab], &after.data()[..5 * vocab]);
        assert_ne!(&before.data()[6 * vocab..], &after.data()[6 * vocab..]);
    }

    #[test]
    fn test_tied_weights_drop_output_projection() {
        let config = ModelConfig {
            tie_weights: true,
            ..tiny_config()
        };
        let untied = Model::new(tiny_config()).unwrap();
        let tied = Model::new(config).unwrap();
        assert_eq!(
            tied.num_parameters() + 8 * 16,
            untied.num_parameters()
        );
        assert!(tied.output_proj.is_none());
    }

    #[test]
    fn test_backward_populates_all_grads() {
        let mut model = Model::new(tiny_config()).unwrap();
        let tokens = [2usize, 5, 11];
        let (logits, cache) = model.forward(&tokens, None, true).unwrap();
        let mut dlogits = Tensor::zeros_like(&logits);
        for (i, g) in dlogits.data_mut().iter_mut().enumerate() {
            *g = ((i % 7) as f32 - 3.0) * 0.01;
        }
        model.backward(&dlogits, &cache).unwrap();
        let touched = model
            .parameters()
            .iter()
            .filter(|p| p.grad.data().iter().any(|&g| g != 0.0))
            .count();
        // Every parameter except unused embedding rows receives gradient.
        assert!(touched >= model.parameters().len() - 1);
    }
}
