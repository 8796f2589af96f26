//! Position-wise feed-forward network

use crate::error::{Result, TissError};
use crate::param::Parameter;
use crate::tensor::{matmul, matmul_a_bt, matmul_at_b, Tensor};
use rand::rngs::StdRng;

/// Activations saved by [`FeedForward::forward`] for the backward pass
#[derive(Debug, Clone)]
pub struct FeedForwardCache {
    /// Layer input, shape `[seq_len, n_embd]`
    x: Tensor,
    /// Hidden pre-activation, shape `[seq_len, d_ff]`
    pre_act: Tensor,
}

/// Two-layer MLP with ReLU: `y = relu(x W1 + b1) W2 + b2`
#[derive(Debug, Clone)]
pub struct FeedForward {
    pub w1: Parameter,
    pub b1: Parameter,
    pub w2: Parameter,
    pub b2: Parameter,
    n_embd: usize,
    d_ff: usize,
}

impl FeedForward {
    pub fn new(n_embd: usize, d_ff: usize, name_prefix: &str, rng: &mut StdRng) -> Self {
        let bound1 = (1.0 / n_embd as f32).sqrt();
        let bound2 = (1.0 / d_ff as f32).sqrt();
        Self {
            w1: Parameter::uniform(vec![n_embd, d_ff], bound1, format!("{}.W1", name_prefix), rng),
            b1: Parameter::zeros(vec![d_ff], format!("{}.b1", name_prefix)),
            w2: Parameter::uniform(vec![d_ff, n_embd], bound2, format!("{}.W2", name_prefix), rng),
            b2: Parameter::zeros(vec![n_embd], format!("{}.b2", name_prefix)),
            n_embd,
            d_ff,
        }
    }

    /// # Errors
    /// Returns `InvalidInput` if `x` is not `[seq_len, n_embd]`.
    pub fn forward(&self, x: &Tensor) -> Result<(Tensor, FeedForwardCache)> {
        let shape = x.shape();
        if shape.len() != 2 || shape[1] != self.n_embd {
            return Err(TissError::InvalidInput(format!(
                "feed-forward expects [seq_len, {}], got {:?}",
                self.n_embd, shape
            )));
        }
        let seq_len = shape[0];

        let mut hidden = matmul(x.data(), self.w1.value.data(), seq_len, self.n_embd, self.d_ff);
        for t in 0..seq_len {
            for j in 0..self.d_ff {
                hidden[t * self.d_ff + j] += self.b1.value.data()[j];
            }
        }
        let pre_act = Tensor::from_vec(hidden.clone(), vec![seq_len, self.d_ff])?;

        for h in &mut hidden {
            if *h < 0.0 {
                *h = 0.0;
            }
        }

        let mut out = matmul(&hidden, self.w2.value.data(), seq_len, self.d_ff, self.n_embd);
        for t in 0..seq_len {
            for j in 0..self.n_embd {
                out[t * self.n_embd + j] += self.b2.value.data()[j];
            }
        }

        Ok((
            Tensor::from_vec(out, vec![seq_len, self.n_embd])?,
            FeedForwardCache {
                x: x.clone(),
                pre_act,
            },
        ))
    }

    /// Accumulate parameter gradients and return the gradient w.r.t. the input.
    ///
    /// # Errors
    /// Returns `InvalidInput` if `dout` does not match the cached input shape.
    pub fn backward(&mut self, dout: &Tensor, cache: &FeedForwardCache) -> Result<Tensor> {
        if dout.shape() != cache.x.shape() {
            return Err(TissError::InvalidInput(format!(
                "feed-forward backward shape mismatch: {:?} vs cached {:?}",
                dout.shape(),
                cache.x.shape()
            )));
        }
        let seq_len = cache.x.shape()[0];

        // Recompute the ReLU output from the cached pre-activation.
        let activated: Vec<f32> = cache.pre_act.data().iter().map(|&h| h.max(0.0)).collect();

        let dw2 = matmul_at_b(&activated, dout.data(), seq_len, self.d_ff, self.n_embd);
        for (g, d) in self.w2.grad.data_mut().iter_mut().zip(dw2.iter()) {
            *g += d;
        }
        for t in 0..seq_len {
            for j in 0..self.n_embd {
                self.b2.grad.data_mut()[j] += dout.data()[t * self.n_embd + j];
            }
        }

        let mut d_hidden = matmul_a_bt(dout.data(), self.w2.value.data(), seq_len, self.n_embd, self.d_ff);
        for (dh, &h) in d_hidden.iter_mut().zip(cache.pre_act.data().iter()) {
            if h <= 0.0 {
                *dh = 0.0;
            }
        }

        let dw1 = matmul_at_b(cache.x.data(), &d_hidden, seq_len, self.n_embd, self.d_ff);
        for (g, d) in self.w1.grad.data_mut().iter_mut().zip(dw1.iter()) {
            *g += d;
        }
        for t in 0..seq_len {
            for j in 0..self.d_ff {
                self.b1.grad.data_mut()[j] += d_hidden[t * self.d_ff + j];
            }
        }

        let dx = matmul_a_bt(&d_hidden, self.w1.value.data(), seq_len, self.d_ff, self.n_embd);
        Tensor::from_vec(dx, vec![seq_len, self.n_embd])
    }

    pub fn parameters(&self) -> Vec<&Parameter> {
        vec![&self.w1, &self.b1, &self.w2, &self.b2]
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        vec![&mut self.w1, &mut self.b1, &mut self.w2, &mut self.b2]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_forward_output_shape() {
        let mut rng = StdRng::seed_from_u64(3);
        let ffn = FeedForward::new(8, 32, "ffn", &mut rng);
        let x = Tensor::new(vec![5, 8]);
        let (y, _) = ffn.forward(&x).unwrap();
        assert_eq!(y.shape(), &[5, 8]);
    }

    #[test]
    fn test_zero_input_yields_biases() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut ffn = FeedForward::new(4, 8, "ffn", &mut rng);
        ffn.b2.value.fill(0.25);
        let x = Tensor::new(vec![2, 4]);
        let (y, _) = ffn.forward(&x).unwrap();
        assert!(y.data().iter().all(|&v| (v - 0.25).abs() < 1e-6));
    }

    #[test]
    fn test_backward_relu_gates_gradient() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut ffn = FeedForward::new(4, 8, "ffn", &mut rng);
        // Force all pre-activations negative so no gradient reaches W1.
        ffn.b1.value.fill(-100.0);
        let x = Tensor::from_vec(vec![0.1; 8], vec![2, 4]).unwrap();
        let (_, cache) = ffn.forward(&x).unwrap();
        let dout = Tensor::from_vec(vec![1.0; 8], vec![2, 4]).unwrap();
        let dx = ffn.backward(&dout, &cache).unwrap();
        assert!(ffn.w1.grad.data().iter().all(|&g| g == 0.0));
        assert!(dx.data().iter().all(|&g| g == 0.0));
        // b2 still receives the upstream gradient directly.
        assert!(ffn.b2.grad.data().iter().all(|&g| (g - 2.0).abs() < 1e-6));
    }
}
