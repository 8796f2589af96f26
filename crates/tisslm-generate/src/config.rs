//! Generation configuration

use anyhow::{bail, Result};
use std::collections::HashMap;

/// Token selection strategy for each decode step
#[derive(Debug, Clone, PartialEq)]
pub enum SamplingMethod {
    /// Always take the highest-probability token
    Greedy,
    /// Sample from the full temperature-scaled distribution
    Random,
    /// Sample from the `k` most probable tokens
    TopK(usize),
    /// Nucleus sampling: smallest prefix with cumulative probability >= p
    TopP(f32),
    /// Keep tokens with probability >= alpha * p_max^2
    TopA(f32),
    /// Beam search over summed log-probabilities
    Beam { width: usize },
    /// Degeneration-penalized search over the top-k candidates
    Contrastive { k: usize, alpha: f32 },
    /// Mirostat v2: adaptive truncation targeting constant surprise
    Mirostat { tau: f32, eta: f32 },
}

/// Knobs shared by every sampling method
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub method: SamplingMethod,
    pub max_new_tokens: usize,
    pub temperature: f32,
    /// Penalty >= 1 applied to logits of already-generated tokens
    pub repetition_penalty: f32,
    /// Block n-grams of this size from repeating; 0 disables
    pub no_repeat_ngram: usize,
    /// Additive per-token logit offsets
    pub logit_bias: HashMap<usize, f32>,
    /// Tokens that end generation
    pub eos_tokens: Vec<usize>,
    /// Halt on an EOS token without emitting it
    pub suppress_eos: bool,
    pub seed: Option<u64>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            method: SamplingMethod::Greedy,
            max_new_tokens: 64,
            temperature: 1.0,
            repetition_penalty: 1.0,
            no_repeat_ngram: 0,
            logit_bias: HashMap::new(),
            eos_tokens: Vec::new(),
            suppress_eos: false,
            seed: None,
        }
    }
}

impl GenerationConfig {
    /// # Errors
    /// Fails on out-of-range sampling parameters.
    pub fn validate(&self) -> Result<()> {
        if self.max_new_tokens == 0 {
            bail!("max_new_tokens must be non-zero");
        }
        if self.temperature <= 0.0 {
            bail!("temperature must be positive, got {}", self.temperature);
        }
        if self.repetition_penalty < 1.0 {
            bail!(
                "repetition_penalty must be >= 1, got {}",
                self.repetition_penalty
            );
        }
        match &self.method {
            SamplingMethod::TopK(k) => {
                if *k == 0 {
                    bail!("top-k requires k >= 1");
                }
            }
            SamplingMethod::TopP(p) => {
                if !(*p > 0.0 && *p <= 1.0) {
                    bail!("top-p requires p in (0, 1], got {}", p);
                }
            }
            SamplingMethod::TopA(a) => {
                if !(*a > 0.0 && *a <= 1.0) {
                    bail!("top-a requires alpha in (0, 1], got {}", a);
                }
            }
            SamplingMethod::Beam { width } => {
                if *width == 0 {
                    bail!("beam search requires width >= 1");
                }
            }
            SamplingMethod::Contrastive { k, alpha } => {
                if *k == 0 {
                    bail!("contrastive search requires k >= 1");
                }
                if !(0.0..=1.0).contains(alpha) {
                    bail!("contrastive alpha must be in [0, 1], got {}", alpha);
                }
            }
            SamplingMethod::Mirostat { tau, eta } => {
                if *tau <= 0.0 || *eta <= 0.0 {
                    bail!("mirostat requires positive tau and eta");
                }
            }
            SamplingMethod::Greedy | SamplingMethod::Random => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_validates() {
        assert!(GenerationConfig::default().validate().is_ok());
    }

    #[test]
    fn test_bad_parameters_rejected() {
        let mut cfg = GenerationConfig::default();
        cfg.temperature = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = GenerationConfig::default();
        cfg.repetition_penalty = 0.5;
        assert!(cfg.validate().is_err());

        let mut cfg = GenerationConfig::default();
        cfg.method = SamplingMethod::TopP(1.5);
        assert!(cfg.validate().is_err());

        let mut cfg = GenerationConfig::default();
        cfg.method = SamplingMethod::Beam { width: 0 };
        assert!(cfg.validate().is_err());
    }
}
