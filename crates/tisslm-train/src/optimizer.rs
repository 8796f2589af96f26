//! AdamW with decoupled weight decay, gradient clipping, and the
//! cosine-with-warmup learning-rate schedule.

use anyhow::{bail, Result};
use tisslm_model::{Parameter, Tensor, TissError};

/// AdamW optimizer.
///
/// Weight decay is decoupled: it shrinks the parameter directly instead of
/// entering the moment estimates. First and second moments are allocated
/// lazily on the first step and addressed positionally, so the parameter
/// slice must keep a stable order across steps.
pub struct AdamW {
    pub lr: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    weight_decay: f32,
    m: Vec<Tensor>,
    v: Vec<Tensor>,
    t: u64,
}

impl AdamW {
    pub fn new(lr: f32, beta1: f32, beta2: f32, eps: f32, weight_decay: f32) -> Self {
        Self {
            lr,
            beta1,
            beta2,
            eps,
            weight_decay,
            m: Vec::new(),
            v: Vec::new(),
            t: 0,
        }
    }

    /// AdamW with the usual betas and epsilon
    pub fn with_defaults(lr: f32, weight_decay: f32) -> Self {
        Self::new(lr, 0.9, 0.999, 1e-8, weight_decay)
    }

    /// Apply one update from the accumulated gradients.
    ///
    /// # Errors
    /// Fails if the parameter count changes between steps.
    pub fn step(&mut self, params: &mut [&mut Parameter]) -> Result<()> {
        if self.m.is_empty() {
            self.m = params.iter().map(|p| Tensor::zeros_like(&p.value)).collect();
            self.v = params.iter().map(|p| Tensor::zeros_like(&p.value)).collect();
        }
        if self.m.len() != params.len() {
            bail!(
                "optimizer state holds {} parameters but step received {}",
                self.m.len(),
                params.len()
            );
        }
        self.t += 1;
        let bias1 = 1.0 - self.beta1.powi(self.t as i32);
        let bias2 = 1.0 - self.beta2.powi(self.t as i32);

        for (i, param) in params.iter_mut().enumerate() {
            let m = self.m[i].data_mut();
            let v = self.v[i].data_mut();
            let grads = param.grad.data().to_vec();
            let values = param.value.data_mut();
            for j in 0..values.len() {
                let g = grads[j];
                m[j] = self.beta1 * m[j] + (1.0 - self.beta1) * g;
                v[j] = self.beta2 * v[j] + (1.0 - self.beta2) * g * g;
                let m_hat = m[j] / bias1;
                let v_hat = v[j] / bias2;
                values[j] -= self.lr * m_hat / (v_hat.sqrt() + self.eps);
                values[j] -= self.lr * self.weight_decay * values[j];
            }
        }
        Ok(())
    }

    /// Step count since the last state reset
    pub fn timestep(&self) -> u64 {
        self.t
    }

    /// Moment tensors in parameter order: `(m, v)`
    pub fn state(&self) -> (&[Tensor], &[Tensor]) {
        (&self.m, &self.v)
    }

    /// Restore moments and the step counter from a checkpoint.
    ///
    /// # Errors
    /// Fails when the two moment lists disagree in length.
    pub fn restore(&mut self, m: Vec<Tensor>, v: Vec<Tensor>, t: u64) -> Result<()> {
        if m.len() != v.len() {
            bail!("moment lists disagree: {} vs {}", m.len(), v.len());
        }
        self.m = m;
        self.v = v;
        self.t = t;
        Ok(())
    }
}

/// Scale all gradients so their global L2 norm is at most `max_norm`.
/// Returns the norm before clipping.
///
/// # Errors
/// Fails when the gradients contain NaN or infinity; stepping on them
/// would poison the optimizer moments.
pub fn clip_gradients(params: &mut [&mut Parameter], max_norm: f32) -> Result<f32> {
    let mut sum_sq = 0.0f32;
    for param in params.iter() {
        for &g in param.grad.data() {
            sum_sq += g * g;
        }
    }
    let norm = sum_sq.sqrt();
    if !norm.is_finite() {
        return Err(TissError::NumericFailure(format!("gradient norm is {}", norm)).into());
    }
    if max_norm > 0.0 && norm > max_norm {
        let scale = max_norm / (norm + 1e-6);
        for param in params.iter_mut() {
            param.grad.scale(scale);
        }
    }
    Ok(norm)
}

/// Linear warmup followed by cosine decay to `min_lr`.
#[derive(Debug, Clone)]
pub struct CosineWithWarmup {
    base_lr: f32,
    min_lr: f32,
    warmup_steps: u64,
    total_steps: u64,
}

impl CosineWithWarmup {
    pub fn new(base_lr: f32, min_lr: f32, warmup_steps: u64, total_steps: u64) -> Self {
        Self {
            base_lr,
            min_lr,
            warmup_steps,
            total_steps,
        }
    }

    /// Learning rate for 1-based step `step`
    pub fn lr(&self, step: u64) -> f32 {
        if self.warmup_steps > 0 && step <= self.warmup_steps {
            return self.base_lr * step as f32 / self.warmup_steps as f32;
        }
        if step >= self.total_steps {
            return self.min_lr;
        }
        let progress = (step - self.warmup_steps) as f32
            / (self.total_steps - self.warmup_steps).max(1) as f32;
        let cosine = 0.5 * (1.0 + (std::f32::consts::PI * progress).cos());
        self.min_lr + (self.base_lr - self.min_lr) * cosine
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quadratic_param(value: f32) -> Parameter {
        let t = Tensor::from_vec(vec![value], vec![1]).unwrap();
        Parameter::new(t, "w")
    }

    #[test]
    fn test_adamw_descends_quadratic() {
        // Minimize f(w) = w^2 starting at w = 1.
        let mut p = quadratic_param(1.0);
        let mut opt = AdamW::with_defaults(0.1, 0.0);
        for _ in 0..100 {
            let w = p.value.data()[0];
            p.grad.data_mut()[0] = 2.0 * w;
            opt.step(&mut [&mut p]).unwrap();
        }
        assert!(p.value.data()[0].abs() < 0.1);
    }

    #[test]
    fn test_zero_gradient_leaves_value_untouched() {
        let mut p = quadratic_param(0.75);
        let mut opt = AdamW::with_defaults(0.1, 0.0);
        opt.step(&mut [&mut p]).unwrap();
        assert_eq!(p.value.data()[0], 0.75);
    }

    #[test]
    fn test_weight_decay_shrinks_without_gradient() {
        let mut p = quadratic_param(1.0);
        let mut opt = AdamW::with_defaults(0.1, 0.5);
        // Zero gradient: only decay acts.
        opt.step(&mut [&mut p]).unwrap();
        let w = p.value.data()[0];
        assert!(w < 1.0 && w > 0.9);
    }

    #[test]
    fn test_clip_scales_to_max_norm() {
        let mut p = quadratic_param(0.0);
        p.grad = Tensor::from_vec(vec![3.0], vec![1]).unwrap();
        let mut q = quadratic_param(0.0);
        q.grad = Tensor::from_vec(vec![4.0], vec![1]).unwrap();
        let norm = clip_gradients(&mut [&mut p, &mut q], 1.0).unwrap();
        assert!((norm - 5.0).abs() < 1e-5);
        let clipped = (p.grad.data()[0].powi(2) + q.grad.data()[0].powi(2)).sqrt();
        assert!(clipped <= 1.0 + 1e-4);
    }

    #[test]
    fn test_clip_leaves_small_gradients_alone() {
        let mut p = quadratic_param(0.0);
        p.grad = Tensor::from_vec(vec![0.5], vec![1]).unwrap();
        clip_gradients(&mut [&mut p], 1.0).unwrap();
        assert_eq!(p.grad.data()[0], 0.5);
    }

    #[test]
    fn test_clip_rejects_non_finite_gradients() {
        let mut p = quadratic_param(0.0);
        p.grad = Tensor::from_vec(vec![f32::NAN], vec![1]).unwrap();
        assert!(clip_gradients(&mut [&mut p], 1.0).is_err());

        let mut q = quadratic_param(0.0);
        q.grad = Tensor::from_vec(vec![f32::INFINITY], vec![1]).unwrap();
        assert!(clip_gradients(&mut [&mut q], 1.0).is_err());
    }

    #[test]
    fn test_schedule_warmup_then_decay() {
        let sched = CosineWithWarmup::new(1.0, 0.1, 10, 110);
        assert!((sched.lr(5) - 0.5).abs() < 1e-6);
        assert!((sched.lr(10) - 1.0).abs() < 1e-6);
        let mid = sched.lr(60);
        assert!(mid < 1.0 && mid > 0.1);
        assert!((sched.lr(110) - 0.1).abs() < 1e-6);
        assert!((sched.lr(500) - 0.1).abs() < 1e-6);
    }
}
