//! Decode loops: incremental sampling, beam search, and contrastive search

use anyhow::{bail, Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tisslm_model::{Model, Tensor};

use crate::config::{GenerationConfig, SamplingMethod};
use crate::sampler;

/// Wraps a model with the decoding strategies. Sampling and contrastive
/// search decode incrementally through the KV cache; beam search re-runs
/// the full context because it tracks alternative continuations.
pub struct Generator {
    model: Model,
}

impl Generator {
    pub fn new(model: Model) -> Self {
        Self { model }
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Generate up to `max_new_tokens` continuation tokens for `prompt`.
    /// Producing an EOS token halts generation; the EOS token is included
    /// in the output unless `suppress_eos` is set.
    ///
    /// # Errors
    /// Fails on an invalid configuration, an empty prompt, a model error, or
    /// when the prompt plus the requested tokens exceeds the block size.
    pub fn generate(&mut self, prompt: &[usize], config: &GenerationConfig) -> Result<Vec<usize>> {
        config.validate()?;
        if prompt.is_empty() {
            bail!("prompt must contain at least one token");
        }
        let capacity = self.model.config().block_size;
        if prompt.len() + config.max_new_tokens > capacity {
            bail!(
                "prompt of {} tokens plus {} new tokens exceeds the block size {}",
                prompt.len(),
                config.max_new_tokens,
                capacity
            );
        }
        match config.method {
            SamplingMethod::Beam { width } => self.beam_search(prompt, width, config),
            SamplingMethod::Contrastive { k, alpha } => {
                self.contrastive_search(prompt, k, alpha, config)
            }
            _ => self.sample_loop(prompt, config),
        }
    }

    fn sample_loop(&mut self, prompt: &[usize], config: &GenerationConfig) -> Result<Vec<usize>> {
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut kv = self.model.new_kv_cache();
        let (logits, _) = self
            .model
            .forward(prompt, Some(&mut kv), false)
            .context("prefilling the prompt")?;

        let vocab = self.model.config().vocab_size;
        let mut last = last_row(&logits, vocab);
        let mut history = prompt.to_vec();
        let mut generated = Vec::new();
        // Mirostat v2 state: the truncation threshold starts at 2 * tau.
        let mut mu = match config.method {
            SamplingMethod::Mirostat { tau, .. } => 2.0 * tau,
            _ => 0.0,
        };

        for _ in 0..config.max_new_tokens {
            sampler::adjust_logits(&mut last, &history, config);
            // A degenerate distribution falls back to the top-1 token.
            let picked = match config.method {
                SamplingMethod::Greedy => sampler::greedy(&last),
                SamplingMethod::Random => sampler::random(&last, config.temperature, &mut rng),
                SamplingMethod::TopK(k) => sampler::top_k(&last, k, config.temperature, &mut rng),
                SamplingMethod::TopP(p) => sampler::top_p(&last, p, config.temperature, &mut rng),
                SamplingMethod::TopA(a) => sampler::top_a(&last, a, config.temperature, &mut rng),
                SamplingMethod::Mirostat { tau, eta } => {
                    sampler::mirostat(&last, mu, config.temperature, &mut rng).map(
                        |(token, surprise)| {
                            mu += eta * (tau - surprise);
                            token
                        },
                    )
                }
                SamplingMethod::Beam { .. } | SamplingMethod::Contrastive { .. } => unreachable!(),
            };
            let token = match picked.or_else(|_| sampler::greedy(&last)) {
                Ok(token) => token,
                // Nothing left to sample; return what we have.
                Err(_) => break,
            };

            if config.eos_tokens.contains(&token) {
                if !config.suppress_eos {
                    generated.push(token);
                }
                break;
            }
            generated.push(token);
            history.push(token);

            let (logits, _) = self.model.forward(&[token], Some(&mut kv), false)?;
            last = last_row(&logits, vocab);
        }
        Ok(generated)
    }

    fn beam_search(
        &mut self,
        prompt: &[usize],
        width: usize,
        config: &GenerationConfig,
    ) -> Result<Vec<usize>> {
        struct Beam {
            generated: Vec<usize>,
            log_prob: f32,
            done: bool,
        }
        let vocab = self.model.config().vocab_size;
        let mut beams = vec![Beam {
            generated: Vec::new(),
            log_prob: 0.0,
            done: false,
        }];

        for _ in 0..config.max_new_tokens {
            if beams.iter().all(|b| b.done) {
                break;
            }
            let mut candidates: Vec<Beam> = Vec::new();
            for beam in &beams {
                if beam.done {
                    candidates.push(Beam {
                        generated: beam.generated.clone(),
                        log_prob: beam.log_prob,
                        done: true,
                    });
                    continue;
                }
                let mut context = prompt.to_vec();
                context.extend_from_slice(&beam.generated);
                let (logits, _) = self.model.forward(&context, None, false)?;
                let mut last = last_row(&logits, vocab);
                sampler::adjust_logits(&mut last, &context, config);
                let probs = tisslm_model::softmax_1d(&last, config.temperature)?;

                let mut order: Vec<usize> = (0..vocab).collect();
                order.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]));
                for &token in order.iter().take(width) {
                    if probs[token] <= 0.0 {
                        continue;
                    }
                    let mut generated = beam.generated.clone();
                    let done = config.eos_tokens.contains(&token);
                    if !done || !config.suppress_eos {
                        generated.push(token);
                    }
                    candidates.push(Beam {
                        generated,
                        log_prob: beam.log_prob + probs[token].ln(),
                        done,
                    });
                }
            }
            candidates.sort_by(|a, b| b.log_prob.total_cmp(&a.log_prob));
            candidates.truncate(width);
            beams = candidates;
        }

        beams
            .into_iter()
            .max_by(|a, b| a.log_prob.total_cmp(&b.log_prob))
            .map(|b| b.generated)
            .context("beam search produced no candidates")
    }

    fn contrastive_search(
        &mut self,
        prompt: &[usize],
        k: usize,
        alpha: f32,
        config: &GenerationConfig,
    ) -> Result<Vec<usize>> {
        let vocab = self.model.config().vocab_size;
        let n_embd = self.model.config().n_embd;
        let mut kv = self.model.new_kv_cache();
        let (logits, _) = self.model.forward(prompt, Some(&mut kv), false)?;
        let mut last = last_row(&logits, vocab);
        let mut history = prompt.to_vec();
        let mut generated = Vec::new();

        for _ in 0..config.max_new_tokens {
            sampler::adjust_logits(&mut last, &history, config);
            let probs = tisslm_model::softmax_1d(&last, config.temperature)?;

            let mut order: Vec<usize> = (0..vocab).collect();
            order.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]));
            let candidates: Vec<usize> = order
                .into_iter()
                .take(k)
                .filter(|&t| probs[t] > 0.0)
                .collect();
            if candidates.is_empty() {
                break;
            }

            // Degeneration penalty: cosine similarity between the candidate's
            // embedding and the closest embedding in the history.
            let embedding = |token: usize| {
                &self.model.embeddings.value.data()[token * n_embd..(token + 1) * n_embd]
            };
            let mut best: Option<(usize, f32)> = None;
            for &token in &candidates {
                let sim = history
                    .iter()
                    .map(|&prev| cosine(embedding(token), embedding(prev)))
                    .fold(f32::NEG_INFINITY, f32::max);
                let score = (1.0 - alpha) * probs[token] - alpha * sim;
                match best {
                    Some((_, s)) if score <= s => {}
                    _ => best = Some((token, score)),
                }
            }

            let token = match best {
                Some((token, _)) => token,
                None => break,
            };
            if config.eos_tokens.contains(&token) {
                if !config.suppress_eos {
                    generated.push(token);
                }
                break;
            }
            generated.push(token);
            history.push(token);

            let (logits, _) = self.model.forward(&[token], Some(&mut kv), false)?;
            last = last_row(&logits, vocab);
        }
        Ok(generated)
    }

    /// Mean attention mass each position directs at each half-open token
    /// span, averaged over layers and heads. `result[t][s]` is how much
    /// position `t` attends into span `s`.
    ///
    /// # Errors
    /// Fails on an empty or out-of-range span.
    pub fn span_attribution(
        &mut self,
        tokens: &[usize],
        spans: &[(usize, usize)],
    ) -> Result<Vec<Vec<f32>>> {
        for &(start, end) in spans {
            if start >= end || end > tokens.len() {
                bail!(
                    "span {}..{} is invalid for a {}-token sequence",
                    start,
                    end,
                    tokens.len()
                );
            }
        }
        let layers = self.attribution(tokens)?;
        let len = tokens.len();
        let mut out = vec![vec![0.0f32; spans.len()]; len];
        let mut head_count = 0.0f32;
        for layer in &layers {
            let n_head = layer.shape()[0];
            head_count += n_head as f32;
            for h in 0..n_head {
                for t in 0..len {
                    let row = &layer.data()[(h * len + t) * len..(h * len + t + 1) * len];
                    for (si, &(start, end)) in spans.iter().enumerate() {
                        out[t][si] += row[start..end].iter().sum::<f32>();
                    }
                }
            }
        }
        for row in &mut out {
            for mass in row {
                *mass /= head_count;
            }
        }
        Ok(out)
    }

    /// Per-layer attention weights for `tokens`, each `[n_head, len, len]`.
    /// Weight `[h, t, s]` is how much position `t` attends to position `s`.
    ///
    /// # Errors
    /// Propagates model input errors.
    pub fn attribution(&mut self, tokens: &[usize]) -> Result<Vec<Tensor>> {
        let (_, cache) = self.model.forward(tokens, None, false)?;
        let layers = self.model.config().n_layer;
        let mut out = Vec::with_capacity(layers);
        for layer in 0..layers {
            let weights = cache
                .attention_weights(layer)
                .context("attention weights missing for layer")?;
            out.push(weights.clone());
        }
        Ok(out)
    }
}

fn last_row(logits: &Tensor, vocab: usize) -> Vec<f32> {
    let rows = logits.numel() / vocab;
    logits.data()[(rows - 1) * vocab..].to_vec()
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}
