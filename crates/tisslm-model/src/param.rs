//! Trainable parameter: a value tensor paired with its gradient accumulator

use crate::tensor::Tensor;
use rand::rngs::StdRng;
use rand::Rng;

/// A named trainable tensor with an accumulated gradient of the same shape.
///
/// Gradients accumulate across backward calls until [`Parameter::zero_grad`]
/// is invoked; the optimizer addresses parameters by `name`.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub value: Tensor,
    pub grad: Tensor,
    name: String,
}

impl Parameter {
    /// Wrap an existing tensor as a parameter with a zeroed gradient
    pub fn new(value: Tensor, name: impl Into<String>) -> Self {
        let grad = Tensor::zeros_like(&value);
        Self {
            value,
            grad,
            name: name.into(),
        }
    }

    /// Parameter initialized uniformly in `[-bound, bound]`
    pub fn uniform(shape: Vec<usize>, bound: f32, name: impl Into<String>, rng: &mut StdRng) -> Self {
        let mut value = Tensor::new(shape);
        for x in value.data_mut() {
            *x = rng.gen_range(-bound..=bound);
        }
        Self::new(value, name)
    }

    /// Zero-initialized parameter
    pub fn zeros(shape: Vec<usize>, name: impl Into<String>) -> Self {
        Self::new(Tensor::new(shape), name)
    }

    /// One-initialized parameter (layer-norm gains)
    pub fn ones(shape: Vec<usize>, name: impl Into<String>) -> Self {
        let mut value = Tensor::new(shape);
        value.fill(1.0);
        Self::new(value, name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reset the accumulated gradient to zero
    pub fn zero_grad(&mut self) {
        self.grad.fill(0.0);
    }
}
