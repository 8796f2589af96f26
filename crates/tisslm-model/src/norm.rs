//! Layer normalization with hand-written backward

use crate::error::{Result, TissError};
use crate::param::Parameter;
use crate::tensor::Tensor;

/// Intermediate values saved by [`LayerNorm::forward`] for the backward pass
#[derive(Debug, Clone)]
pub struct LayerNormCache {
    /// Normalized input, same shape as the input
    x_hat: Tensor,
    /// Per-row reciprocal standard deviation
    inv_std: Vec<f32>,
}

/// Layer normalization over the last dimension.
///
/// `y = gamma * (x - mean) / sqrt(var + eps) + beta`, with `beta` omitted
/// when constructed without a bias term.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    pub gamma: Parameter,
    pub beta: Option<Parameter>,
    dim: usize,
    eps: f32,
}

impl LayerNorm {
    pub fn new(dim: usize, eps: f32, bias: bool, name_prefix: &str) -> Self {
        let beta = if bias {
            Some(Parameter::zeros(vec![dim], format!("{}.beta", name_prefix)))
        } else {
            None
        };
        Self {
            gamma: Parameter::ones(vec![dim], format!("{}.gamma", name_prefix)),
            beta,
            dim,
            eps,
        }
    }

    /// Normalize each row of `x` over the last dimension.
    ///
    /// # Errors
    /// Returns `InvalidInput` if the last dimension of `x` differs from the
    /// layer dimension.
    pub fn forward(&self, x: &Tensor) -> Result<(Tensor, LayerNormCache)> {
        let last = *x.shape().last().unwrap_or(&0);
        if last != self.dim {
            return Err(TissError::InvalidInput(format!(
                "layer norm expects last dimension {}, got shape {:?}",
                self.dim,
                x.shape()
            )));
        }
        let rows = x.numel() / self.dim;
        let mut out = Tensor::zeros_like(x);
        let mut x_hat = Tensor::zeros_like(x);
        let mut inv_std = vec![0.0; rows];
        let gamma = self.gamma.value.data();
        let beta = self.beta.as_ref().map(|b| b.value.data());

        for r in 0..rows {
            let row = &x.data()[r * self.dim..(r + 1) * self.dim];
            let mean = row.iter().sum::<f32>() / self.dim as f32;
            let var = row.iter().map(|&v| (v - mean) * (v - mean)).sum::<f32>() / self.dim as f32;
            let rstd = 1.0 / (var + self.eps).sqrt();
            inv_std[r] = rstd;
            for j in 0..self.dim {
                let xh = (row[j] - mean) * rstd;
                x_hat.data_mut()[r * self.dim + j] = xh;
                let mut y = gamma[j] * xh;
                if let Some(b) = beta {
                    y += b[j];
                }
                out.data_mut()[r * self.dim + j] = y;
            }
        }

        Ok((out, LayerNormCache { x_hat, inv_std }))
    }

    /// Backpropagate through the normalization, accumulating parameter
    /// gradients and returning the gradient with respect to the input.
    ///
    /// # Errors
    /// Returns `InvalidInput` if `dout` does not match the cached shape.
    pub fn backward(&mut self, dout: &Tensor, cache: &LayerNormCache) -> Result<Tensor> {
        if dout.shape() != cache.x_hat.shape() {
            return Err(TissError::InvalidInput(format!(
                "layer norm backward shape mismatch: {:?} vs cached {:?}",
                dout.shape(),
                cache.x_hat.shape()
            )));
        }
        let rows = dout.numel() / self.dim;
        let n = self.dim as f32;
        let mut dx = Tensor::zeros_like(dout);
        let gamma = self.gamma.value.data();

        for r in 0..rows {
            let base = r * self.dim;
            let dy = &dout.data()[base..base + self.dim];
            let xh = &cache.x_hat.data()[base..base + self.dim];
            let rstd = cache.inv_std[r];

            let mut sum_dxhat = 0.0;
            let mut sum_dxhat_xhat = 0.0;
            for j in 0..self.dim {
                let dxhat = dy[j] * gamma[j];
                sum_dxhat += dxhat;
                sum_dxhat_xhat += dxhat * xh[j];
            }
            for j in 0..self.dim {
                let dxhat = dy[j] * gamma[j];
                dx.data_mut()[base + j] =
                    rstd / n * (n * dxhat - sum_dxhat - xh[j] * sum_dxhat_xhat);
            }
            for j in 0..self.dim {
                self.gamma.grad.data_mut()[j] += dy[j] * xh[j];
            }
            if let Some(beta) = self.beta.as_mut() {
                for j in 0..self.dim {
                    beta.grad.data_mut()[j] += dy[j];
                }
            }
        }

        Ok(dx)
    }

    pub fn parameters(&self) -> Vec<&Parameter> {
        let mut params = vec![&self.gamma];
        if let Some(beta) = &self.beta {
            params.push(beta);
        }
        params
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        let mut params = vec![&mut self.gamma];
        if let Some(beta) = &mut self.beta {
            params.push(beta);
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_zero_mean_unit_var() {
        let ln = LayerNorm::new(4, 1e-6, true, "ln");
        let x = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], vec![1, 4]).unwrap();
        let (y, _) = ln.forward(&x).unwrap();
        let mean: f32 = y.data().iter().sum::<f32>() / 4.0;
        let var: f32 = y.data().iter().map(|&v| (v - mean) * (v - mean)).sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-5);
        assert!((var - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_forward_rejects_wrong_dim() {
        let ln = LayerNorm::new(4, 1e-6, true, "ln");
        let x = Tensor::from_vec(vec![1.0, 2.0, 3.0], vec![1, 3]).unwrap();
        assert!(ln.forward(&x).is_err());
    }

    #[test]
    fn test_backward_uniform_input_grad_sums_to_zero() {
        // dx must be orthogonal to the all-ones direction: normalization is
        // invariant to adding a constant to the input row.
        let mut ln = LayerNorm::new(4, 1e-6, true, "ln");
        let x = Tensor::from_vec(vec![0.5, -1.0, 2.0, 0.0], vec![1, 4]).unwrap();
        let (_, cache) = ln.forward(&x).unwrap();
        let dout = Tensor::from_vec(vec![1.0, -0.5, 0.25, 2.0], vec![1, 4]).unwrap();
        let dx = ln.backward(&dout, &cache).unwrap();
        let sum: f32 = dx.data().iter().sum();
        assert!(sum.abs() < 1e-4);
    }

    #[test]
    fn test_no_bias_has_single_parameter() {
        let ln = LayerNorm::new(8, 1e-6, false, "ln");
        assert_eq!(ln.parameters().len(), 1);
    }
}
