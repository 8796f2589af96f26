//! Multi-head causal self-attention with grouped-query support and a KV cache

use crate::error::{Result, TissError};
use crate::param::Parameter;
use crate::tensor::{matmul, matmul_a_bt, matmul_at_b, Tensor};
use rand::rngs::StdRng;

const MASK_VALUE: f32 = -1e9;

/// Per-layer key/value cache for incremental decoding.
///
/// Keys and values are stored projected, shape `[len, n_kv_head * head_dim]`.
#[derive(Debug, Clone, Default)]
pub struct KVCache {
    keys: Vec<f32>,
    values: Vec<f32>,
    len: usize,
}

impl KVCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached positions
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn append(&mut self, k: &[f32], v: &[f32], rows: usize) {
        self.keys.extend_from_slice(k);
        self.values.extend_from_slice(v);
        self.len += rows;
    }
}

/// Intermediate activations for the attention backward pass.
///
/// Only populated meaningfully by the uncached (training) forward; the
/// cached decode path discards it.
#[derive(Debug, Clone)]
pub struct AttentionCache {
    x: Tensor,
    q: Tensor,
    k: Tensor,
    v: Tensor,
    /// Softmax weights, shape `[n_head, seq_len, kv_len]`
    weights: Tensor,
    /// Concatenated head outputs before the output projection
    combined: Tensor,
    /// First absolute position of the query window
    offset: usize,
}

impl AttentionCache {
    /// Attention weights of shape `[n_head, seq_len, kv_len]`, used for
    /// token attribution.
    pub fn weights(&self) -> &Tensor {
        &self.weights
    }
}

/// Scaled dot-product multi-head attention.
///
/// With `n_kv_head < n_head`, key/value projections are shared across head
/// groups (grouped-query attention). The causal mask is applied only when
/// the query window covers more than one position; single-token decode steps
/// may attend to the entire cache.
#[derive(Debug, Clone)]
pub struct MultiHeadAttention {
    pub wq: Parameter,
    pub wk: Parameter,
    pub wv: Parameter,
    pub wo: Parameter,
    n_embd: usize,
    n_head: usize,
    n_kv_head: usize,
    head_dim: usize,
}

impl MultiHeadAttention {
    pub fn new(
        n_embd: usize,
        n_head: usize,
        n_kv_head: usize,
        name_prefix: &str,
        rng: &mut StdRng,
    ) -> Self {
        let head_dim = n_embd / n_head;
        let kv_dim = n_kv_head * head_dim;
        let bound = (1.0 / n_embd as f32).sqrt();
        Self {
            wq: Parameter::uniform(vec![n_embd, n_embd], bound, format!("{}.Wq", name_prefix), rng),
            wk: Parameter::uniform(vec![n_embd, kv_dim], bound, format!("{}.Wk", name_prefix), rng),
            wv: Parameter::uniform(vec![n_embd, kv_dim], bound, format!("{}.Wv", name_prefix), rng),
            wo: Parameter::uniform(vec![n_embd, n_embd], bound, format!("{}.Wo", name_prefix), rng),
            n_embd,
            n_head,
            n_kv_head,
            head_dim,
        }
    }

    /// Attend over `x` of shape `[seq_len, n_embd]`.
    ///
    /// When `cache` is provided, the projected keys and values for this
    /// window are appended to it and queries attend over the whole cache.
    ///
    /// # Errors
    /// Returns `InvalidInput` on a shape mismatch.
    pub fn forward(
        &self,
        x: &Tensor,
        mut cache: Option<&mut KVCache>,
    ) -> Result<(Tensor, AttentionCache)> {
        let shape = x.shape();
        if shape.len() != 2 || shape[1] != self.n_embd {
            return Err(TissError::InvalidInput(format!(
                "attention expects [seq_len, {}], got {:?}",
                self.n_embd, shape
            )));
        }
        let seq_len = shape[0];
        let kv_dim = self.n_kv_head * self.head_dim;
        let hd = self.head_dim;
        let group = self.n_head / self.n_kv_head;

        let q = matmul(x.data(), self.wq.value.data(), seq_len, self.n_embd, self.n_embd);
        let k_new = matmul(x.data(), self.wk.value.data(), seq_len, self.n_embd, kv_dim);
        let v_new = matmul(x.data(), self.wv.value.data(), seq_len, self.n_embd, kv_dim);

        let offset = cache.as_ref().map(|c| c.len()).unwrap_or(0);
        let (k_all, v_all, kv_len) = match cache.as_mut() {
            Some(c) => {
                c.append(&k_new, &v_new, seq_len);
                (c.keys.clone(), c.values.clone(), c.len)
            }
            None => (k_new, v_new, seq_len),
        };

        let scale = 1.0 / (hd as f32).sqrt();
        let mut weights = vec![0.0; self.n_head * seq_len * kv_len];
        let mut combined = vec![0.0; seq_len * self.n_embd];

        for h in 0..self.n_head {
            let kvh = h / group;
            for t in 0..seq_len {
                let q_row = &q[t * self.n_embd + h * hd..t * self.n_embd + (h + 1) * hd];
                let w_row = &mut weights[(h * seq_len + t) * kv_len..(h * seq_len + t + 1) * kv_len];

                let mut max = f32::NEG_INFINITY;
                for s in 0..kv_len {
                    let k_row = &k_all[s * kv_dim + kvh * hd..s * kv_dim + (kvh + 1) * hd];
                    let mut dot = 0.0;
                    for d in 0..hd {
                        dot += q_row[d] * k_row[d];
                    }
                    let mut score = dot * scale;
                    if seq_len > 1 && s > t + offset {
                        score += MASK_VALUE;
                    }
                    w_row[s] = score;
                    max = max.max(score);
                }
                let mut sum = 0.0;
                for w in w_row.iter_mut() {
                    *w = (*w - max).exp();
                    sum += *w;
                }
                for w in w_row.iter_mut() {
                    *w /= sum;
                }

                let out_row = &mut combined[t * self.n_embd + h * hd..t * self.n_embd + (h + 1) * hd];
                for s in 0..kv_len {
                    let w = w_row[s];
                    if w == 0.0 {
                        continue;
                    }
                    let v_row = &v_all[s * kv_dim + kvh * hd..s * kv_dim + (kvh + 1) * hd];
                    for d in 0..hd {
                        out_row[d] += w * v_row[d];
                    }
                }
            }
        }

        let out = matmul(&combined, self.wo.value.data(), seq_len, self.n_embd, self.n_embd);

        Ok((
            Tensor::from_vec(out, vec![seq_len, self.n_embd])?,
            AttentionCache {
                x: x.clone(),
                q: Tensor::from_vec(q, vec![seq_len, self.n_embd])?,
                k: Tensor::from_vec(k_all, vec![kv_len, kv_dim])?,
                v: Tensor::from_vec(v_all, vec![kv_len, kv_dim])?,
                weights: Tensor::from_vec(weights, vec![self.n_head, seq_len, kv_len])?,
                combined: Tensor::from_vec(combined, vec![seq_len, self.n_embd])?,
                offset,
            },
        ))
    }

    /// Backpropagate through an uncached forward pass.
    ///
    /// # Errors
    /// Returns `InvalidInput` if the cache came from an incremental decode
    /// step, which the training path never produces.
    pub fn backward(&mut self, dout: &Tensor, cache: &AttentionCache) -> Result<Tensor> {
        let seq_len = cache.x.shape()[0];
        let kv_len = cache.k.shape()[0];
        if cache.offset != 0 || kv_len != seq_len {
            return Err(TissError::InvalidInput(
                "attention backward requires an uncached forward pass".to_string(),
            ));
        }
        if dout.shape() != cache.x.shape() {
            return Err(TissError::InvalidInput(format!(
                "attention backward shape mismatch: {:?} vs cached {:?}",
                dout.shape(),
                cache.x.shape()
            )));
        }
        let kv_dim = self.n_kv_head * self.head_dim;
        let hd = self.head_dim;
        let group = self.n_head / self.n_kv_head;
        let scale = 1.0 / (hd as f32).sqrt();

        // Output projection.
        let dwo = matmul_at_b(cache.combined.data(), dout.data(), seq_len, self.n_embd, self.n_embd);
        for (g, d) in self.wo.grad.data_mut().iter_mut().zip(dwo.iter()) {
            *g += d;
        }
        let d_combined = matmul_a_bt(dout.data(), self.wo.value.data(), seq_len, self.n_embd, self.n_embd);

        let mut dq = vec![0.0; seq_len * self.n_embd];
        let mut dk = vec![0.0; seq_len * kv_dim];
        let mut dv = vec![0.0; seq_len * kv_dim];

        for h in 0..self.n_head {
            let kvh = h / group;
            for t in 0..seq_len {
                let d_att = &d_combined[t * self.n_embd + h * hd..t * self.n_embd + (h + 1) * hd];
                let w_row = &cache.weights.data()
                    [(h * seq_len + t) * kv_len..(h * seq_len + t + 1) * kv_len];

                // dV and the raw weight gradient.
                let mut dw = vec![0.0; kv_len];
                for s in 0..kv_len {
                    let v_row = &cache.v.data()[s * kv_dim + kvh * hd..s * kv_dim + (kvh + 1) * hd];
                    let mut dot = 0.0;
                    for d in 0..hd {
                        dot += d_att[d] * v_row[d];
                    }
                    dw[s] = dot;
                    let w = w_row[s];
                    if w != 0.0 {
                        let dv_row =
                            &mut dv[s * kv_dim + kvh * hd..s * kv_dim + (kvh + 1) * hd];
                        for d in 0..hd {
                            dv_row[d] += w * d_att[d];
                        }
                    }
                }

                // Softmax Jacobian: ds = w * (dw - sum(dw * w)).
                let inner: f32 = dw.iter().zip(w_row.iter()).map(|(a, b)| a * b).sum();
                for s in 0..kv_len {
                    let ds = w_row[s] * (dw[s] - inner) * scale;
                    if ds == 0.0 {
                        continue;
                    }
                    let k_row = &cache.k.data()[s * kv_dim + kvh * hd..s * kv_dim + (kvh + 1) * hd];
                    let q_row =
                        &cache.q.data()[t * self.n_embd + h * hd..t * self.n_embd + (h + 1) * hd];
                    let dq_row = &mut dq[t * self.n_embd + h * hd..t * self.n_embd + (h + 1) * hd];
                    for d in 0..hd {
                        dq_row[d] += ds * k_row[d];
                    }
                    let dk_row = &mut dk[s * kv_dim + kvh * hd..s * kv_dim + (kvh + 1) * hd];
                    for d in 0..hd {
                        dk_row[d] += ds * q_row[d];
                    }
                }
            }
        }

        // Projection gradients and the input gradient.
        let dwq = matmul_at_b(cache.x.data(), &dq, seq_len, self.n_embd, self.n_embd);
        for (g, d) in self.wq.grad.data_mut().iter_mut().zip(dwq.iter()) {
            *g += d;
        }
        let dwk = matmul_at_b(cache.x.data(), &dk, seq_len, self.n_embd, kv_dim);
        for (g, d) in self.wk.grad.data_mut().iter_mut().zip(dwk.iter()) {
            *g += d;
        }
        let dwv = matmul_at_b(cache.x.data(), &dv, seq_len, self.n_embd, kv_dim);
        for (g, d) in self.wv.grad.data_mut().iter_mut().zip(dwv.iter()) {
            *g += d;
        }

        let mut dx = matmul_a_bt(&dq, self.wq.value.data(), seq_len, self.n_embd, self.n_embd);
        let dx_k = matmul_a_bt(&dk, self.wk.value.data(), seq_len, kv_dim, self.n_embd);
        let dx_v = matmul_a_bt(&dv, self.wv.value.data(), seq_len, kv_dim, self.n_embd);
        for i in 0..dx.len() {
            dx[i] += dx_k[i] + dx_v[i];
        }

        Tensor::from_vec(dx, vec![seq_len, self.n_embd])
    }

    pub fn parameters(&self) -> Vec<&Parameter> {
        vec![&self.wq, &self.wk, &self.wv, &self.wo]
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        vec![&mut self.wq, &mut self.wk, &mut self.wv, &mut self.wo]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn make_input(seq_len: usize, dim: usize, seed: u64) -> Tensor {
        use rand::Rng;
        let mut rng = StdRng::seed_from_u64(seed);
        let data = (0..seq_len * dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
        Tensor::from_vec(data, vec![seq_len, dim]).unwrap()
    }

    #[test]
    fn test_causal_mask_zeroes_future_weights() {
        let mut rng = StdRng::seed_from_u64(5);
        let mha = MultiHeadAttention::new(8, 2, 2, "mha", &mut rng);
        let x = make_input(4, 8, 1);
        let (_, cache) = mha.forward(&x, None).unwrap();
        let w = cache.weights();
        for h in 0..2 {
            for t in 0..4 {
                for s in (t + 1)..4 {
                    assert!(w.data()[(h * 4 + t) * 4 + s] < 1e-6);
                }
            }
        }
    }

    #[test]
    fn test_weights_rows_sum_to_one() {
        let mut rng = StdRng::seed_from_u64(5);
        let mha = MultiHeadAttention::new(8, 2, 1, "mha", &mut rng);
        let x = make_input(3, 8, 2);
        let (_, cache) = mha.forward(&x, None).unwrap();
        let w = cache.weights();
        for row in 0..2 * 3 {
            let sum: f32 = w.data()[row * 3..(row + 1) * 3].iter().sum();
            assert!((sum - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_cached_decode_matches_full_forward() {
        let mut rng = StdRng::seed_from_u64(5);
        let mha = MultiHeadAttention::new(8, 4, 2, "mha", &mut rng);
        let x = make_input(5, 8, 3);

        let (full, _) = mha.forward(&x, None).unwrap();

        let mut kv = KVCache::new();
        let mut last_rows = Vec::new();
        for t in 0..5 {
            let step = Tensor::from_vec(x.data()[t * 8..(t + 1) * 8].to_vec(), vec![1, 8]).unwrap();
            let (y, _) = mha.forward(&step, Some(&mut kv)).unwrap();
            last_rows.extend_from_slice(y.data());
        }

        for (a, b) in full.data().iter().zip(last_rows.iter()) {
            assert!((a - b).abs() < 1e-4, "{} vs {}", a, b);
        }
        assert_eq!(kv.len(), 5);
    }

    #[test]
    fn test_backward_rejects_cached_forward() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut mha = MultiHeadAttention::new(8, 2, 2, "mha", &mut rng);
        let x = make_input(1, 8, 4);
        let mut kv = KVCache::new();
        mha.forward(&x, Some(&mut kv)).unwrap();
        let (_, cache) = mha.forward(&x, Some(&mut kv)).unwrap();
        let dout = Tensor::new(vec![1, 8]);
        assert!(mha.backward(&dout, &cache).is_err());
    }
}
