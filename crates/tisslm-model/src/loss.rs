//! Cross-entropy loss with optional label smoothing

use crate::error::{Result, TissError};
use crate::tensor::{softmax_last_dim, Tensor};

/// Mean token-level cross-entropy over a sequence of logit rows.
///
/// With label smoothing `eps`, the target distribution places `1 - eps` on
/// the gold token and spreads `eps` uniformly over the whole vocabulary.
#[derive(Debug, Clone)]
pub struct CrossEntropyLoss {
    label_smoothing: f32,
}

impl CrossEntropyLoss {
    /// # Errors
    /// Returns `InvalidConfig` when `label_smoothing` is outside `[0, 1)`.
    pub fn new(label_smoothing: f32) -> Result<Self> {
        if !(0.0..1.0).contains(&label_smoothing) {
            return Err(TissError::InvalidConfig(format!(
                "label_smoothing must be in [0, 1), got {}",
                label_smoothing
            )));
        }
        Ok(Self { label_smoothing })
    }

    /// Compute the mean loss and the gradient with respect to the logits.
    ///
    /// `logits` has shape `[seq_len, vocab_size]`; `targets` holds one token
    /// id per row. The returned gradient is already divided by `seq_len`.
    ///
    /// # Errors
    /// Returns `InvalidInput` on empty input, a row-count mismatch, or a
    /// target id outside the vocabulary.
    pub fn forward(&self, logits: &Tensor, targets: &[usize]) -> Result<(f32, Tensor)> {
        let shape = logits.shape();
        if shape.len() != 2 || shape[0] == 0 {
            return Err(TissError::InvalidInput(format!(
                "loss expects non-empty [seq_len, vocab_size] logits, got {:?}",
                shape
            )));
        }
        let (seq_len, vocab) = (shape[0], shape[1]);
        if targets.len() != seq_len {
            return Err(TissError::InvalidInput(format!(
                "{} targets for {} logit rows",
                targets.len(),
                seq_len
            )));
        }
        if let Some(&bad) = targets.iter().find(|&&t| t >= vocab) {
            return Err(TissError::InvalidInput(format!(
                "target id {} out of vocabulary range {}",
                bad, vocab
            )));
        }

        let probs = softmax_last_dim(logits);
        let eps = self.label_smoothing;
        let uniform = eps / vocab as f32;
        let inv_n = 1.0 / seq_len as f32;
        let floor = f32::MIN_POSITIVE;

        let mut loss = 0.0;
        let mut grad = Tensor::zeros_like(logits);
        for (t, &target) in targets.iter().enumerate() {
            let p_row = &probs.data()[t * vocab..(t + 1) * vocab];
            if eps == 0.0 {
                loss -= p_row[target].max(floor).ln();
            } else {
                loss -= (1.0 - eps) * p_row[target].max(floor).ln();
                for &p in p_row {
                    loss -= uniform * p.max(floor).ln();
                }
            }
            let g_row = &mut grad.data_mut()[t * vocab..(t + 1) * vocab];
            for j in 0..vocab {
                let mut target_mass = uniform;
                if j == target {
                    target_mass += 1.0 - eps;
                }
                g_row[j] = (p_row[j] - target_mass) * inv_n;
            }
        }

        loss *= inv_n;
        if !loss.is_finite() {
            return Err(TissError::NumericFailure(
                "cross-entropy loss is not finite".to_string(),
            ));
        }
        Ok((loss, grad))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_logits_give_log_vocab() {
        let loss = CrossEntropyLoss::new(0.0).unwrap();
        let logits = Tensor::new(vec![2, 4]);
        let (value, _) = loss.forward(&logits, &[0, 3]).unwrap();
        assert!((value - (4.0f32).ln()).abs() < 1e-5);
    }

    #[test]
    fn test_grad_rows_sum_to_zero() {
        let loss = CrossEntropyLoss::new(0.1).unwrap();
        let logits = Tensor::from_vec(vec![1.0, -2.0, 0.5, 3.0, 0.0, 0.0, 1.0, -1.0], vec![2, 4])
            .unwrap();
        let (_, grad) = loss.forward(&logits, &[2, 0]).unwrap();
        for t in 0..2 {
            let sum: f32 = grad.data()[t * 4..(t + 1) * 4].iter().sum();
            assert!(sum.abs() < 1e-6);
        }
    }

    #[test]
    fn test_smoothing_increases_loss_on_confident_prediction() {
        let plain = CrossEntropyLoss::new(0.0).unwrap();
        let smooth = CrossEntropyLoss::new(0.2).unwrap();
        let logits = Tensor::from_vec(vec![10.0, 0.0, 0.0, 0.0], vec![1, 4]).unwrap();
        let (l0, _) = plain.forward(&logits, &[0]).unwrap();
        let (l1, _) = smooth.forward(&logits, &[0]).unwrap();
        assert!(l1 > l0);
    }

    #[test]
    fn test_rejects_out_of_range_target() {
        let loss = CrossEntropyLoss::new(0.0).unwrap();
        let logits = Tensor::new(vec![1, 4]);
        assert!(loss.forward(&logits, &[4]).is_err());
    }

    #[test]
    fn test_rejects_bad_smoothing() {
        assert!(CrossEntropyLoss::new(1.0).is_err());
        assert!(CrossEntropyLoss::new(-0.1).is_err());
    }
}
