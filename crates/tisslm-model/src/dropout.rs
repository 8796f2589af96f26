//! Inverted dropout

use crate::tensor::Tensor;
use rand::rngs::StdRng;
use rand::Rng;

/// Mask saved by [`Dropout::forward`]; already includes the `1/(1-p)` scale.
#[derive(Debug, Clone)]
pub struct DropoutCache {
    mask: Option<Tensor>,
}

/// Inverted dropout: surviving activations are scaled by `1/(1-p)` so the
/// expected activation is unchanged and inference needs no rescaling.
#[derive(Debug, Clone)]
pub struct Dropout {
    p: f32,
}

impl Dropout {
    pub fn new(p: f32) -> Self {
        Self { p }
    }

    /// Apply the mask in training mode; identity in eval mode or when `p` is 0.
    pub fn forward(&self, x: &Tensor, rng: &mut StdRng, training: bool) -> (Tensor, DropoutCache) {
        if !training || self.p == 0.0 {
            return (x.clone(), DropoutCache { mask: None });
        }
        let keep = 1.0 - self.p;
        let scale = 1.0 / keep;
        let mut mask = Tensor::zeros_like(x);
        let mut out = Tensor::zeros_like(x);
        for i in 0..x.numel() {
            if rng.gen::<f32>() < keep {
                mask.data_mut()[i] = scale;
                out.data_mut()[i] = x.data()[i] * scale;
            }
        }
        (out, DropoutCache { mask: Some(mask) })
    }

    /// Route gradients through the same mask used in the forward pass.
    pub fn backward(&self, dout: &Tensor, cache: &DropoutCache) -> Tensor {
        match &cache.mask {
            None => dout.clone(),
            Some(mask) => {
                let mut dx = dout.clone();
                for (d, &m) in dx.data_mut().iter_mut().zip(mask.data().iter()) {
                    *d *= m;
                }
                dx
            }
        }
    }
}
