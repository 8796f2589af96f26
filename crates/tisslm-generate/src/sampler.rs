//! Logit adjustment and token sampling.
//!
//! Every decode step first runs the shared adjustment pipeline (n-gram
//! blocking, then repetition penalty, then logit bias) and then one of the
//! sampling strategies over the adjusted logits.

use anyhow::{bail, Result};
use rand::rngs::StdRng;
use rand::Rng;
use tisslm_model::softmax_1d;

use crate::config::GenerationConfig;

/// Apply the shared logit adjustments in place.
///
/// `history` is the full token sequence so far (prompt plus generated).
pub fn adjust_logits(logits: &mut [f32], history: &[usize], config: &GenerationConfig) {
    if config.no_repeat_ngram > 0 {
        for token in blocked_tokens(history, config.no_repeat_ngram) {
            if token < logits.len() {
                logits[token] = f32::NEG_INFINITY;
            }
        }
    }

    if config.repetition_penalty > 1.0 {
        for &token in history {
            if token >= logits.len() {
                continue;
            }
            let l = logits[token];
            logits[token] = if l > 0.0 {
                l / config.repetition_penalty
            } else {
                l * config.repetition_penalty
            };
        }
    }

    for (&token, &bias) in &config.logit_bias {
        if token < logits.len() {
            logits[token] += bias;
        }
    }
}

/// Tokens that would complete an n-gram already present in `history`
fn blocked_tokens(history: &[usize], n: usize) -> Vec<usize> {
    if n == 0 || history.len() + 1 < n {
        return Vec::new();
    }
    let prefix = &history[history.len() - (n - 1)..];
    let mut blocked = Vec::new();
    for window in history.windows(n) {
        if &window[..n - 1] == prefix {
            blocked.push(window[n - 1]);
        }
    }
    blocked
}

/// Highest-logit token; ties break toward the lower id.
///
/// # Errors
/// Fails when every logit is -inf.
pub fn greedy(logits: &[f32]) -> Result<usize> {
    let mut best = None;
    for (i, &l) in logits.iter().enumerate() {
        if l == f32::NEG_INFINITY {
            continue;
        }
        match best {
            Some((_, bl)) if l <= bl => {}
            _ => best = Some((i, l)),
        }
    }
    match best {
        Some((i, _)) => Ok(i),
        None => bail!("all tokens are blocked"),
    }
}

/// Sample from the full temperature-scaled distribution.
///
/// # Errors
/// Propagates a degenerate softmax.
pub fn random(logits: &[f32], temperature: f32, rng: &mut StdRng) -> Result<usize> {
    let probs = softmax_1d(logits, temperature)?;
    Ok(sample_index(&probs, rng))
}

/// Sample from the `k` most probable tokens.
///
/// # Errors
/// Propagates a degenerate softmax.
pub fn top_k(logits: &[f32], k: usize, temperature: f32, rng: &mut StdRng) -> Result<usize> {
    let probs = softmax_1d(logits, temperature)?;
    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]));
    order.truncate(k.max(1));
    sample_from_subset(&probs, &order, rng)
}

/// Nucleus sampling: the smallest probability-sorted prefix whose mass
/// reaches `p`. Falls back to the single most probable token if the
/// threshold admits nothing.
///
/// # Errors
/// Propagates a degenerate softmax.
pub fn top_p(logits: &[f32], p: f32, temperature: f32, rng: &mut StdRng) -> Result<usize> {
    let probs = softmax_1d(logits, temperature)?;
    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]));

    let mut kept = Vec::new();
    let mut mass = 0.0;
    for &i in &order {
        kept.push(i);
        mass += probs[i];
        if mass >= p {
            break;
        }
    }
    if kept.is_empty() {
        kept.push(order[0]);
    }
    sample_from_subset(&probs, &kept, rng)
}

/// Top-a sampling: keep tokens with probability at least `alpha * p_max^2`.
///
/// # Errors
/// Propagates a degenerate softmax.
pub fn top_a(logits: &[f32], alpha: f32, temperature: f32, rng: &mut StdRng) -> Result<usize> {
    let probs = softmax_1d(logits, temperature)?;
    let p_max = probs.iter().fold(0.0f32, |m, &p| m.max(p));
    let threshold = alpha * p_max * p_max;
    let kept: Vec<usize> = (0..probs.len()).filter(|&i| probs[i] >= threshold).collect();
    if kept.is_empty() {
        return greedy(logits);
    }
    sample_from_subset(&probs, &kept, rng)
}

/// Mirostat v2 step: truncate tokens whose surprise exceeds `mu`, sample,
/// then return the token and its observed surprise in bits.
///
/// # Errors
/// Propagates a degenerate softmax.
pub fn mirostat(
    logits: &[f32],
    mu: f32,
    temperature: f32,
    rng: &mut StdRng,
) -> Result<(usize, f32)> {
    let probs = softmax_1d(logits, temperature)?;
    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]));

    let mut kept: Vec<usize> = order
        .iter()
        .copied()
        .filter(|&i| probs[i] > 0.0 && -probs[i].log2() <= mu)
        .collect();
    if kept.is_empty() {
        kept.push(order[0]);
    }
    let token = sample_from_subset(&probs, &kept, rng)?;
    let surprise = -probs[token].max(f32::MIN_POSITIVE).log2();
    Ok((token, surprise))
}

fn sample_from_subset(probs: &[f32], kept: &[usize], rng: &mut StdRng) -> Result<usize> {
    let total: f32 = kept.iter().map(|&i| probs[i]).sum();
    if total <= 0.0 {
        bail!("no probability mass among candidate tokens");
    }
    let mut target = rng.gen::<f32>() * total;
    for &i in kept {
        target -= probs[i];
        if target <= 0.0 {
            return Ok(i);
        }
    }
    Ok(kept[kept.len() - 1])
}

fn sample_index(probs: &[f32], rng: &mut StdRng) -> usize {
    let mut target = rng.gen::<f32>();
    for (i, &p) in probs.iter().enumerate() {
        target -= p;
        if target <= 0.0 {
            return i;
        }
    }
    probs.len() - 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SamplingMethod;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(0)
    }

    #[test]
    fn test_greedy_picks_argmax() {
        assert_eq!(greedy(&[0.1, 2.0, -1.0]).unwrap(), 1);
        assert!(greedy(&[f32::NEG_INFINITY, f32::NEG_INFINITY]).is_err());
    }

    #[test]
    fn test_top_k_one_is_greedy() {
        let logits = [0.1, 2.0, -1.0, 1.5];
        for _ in 0..20 {
            assert_eq!(top_k(&logits, 1, 1.0, &mut rng()).unwrap(), 1);
        }
    }

    #[test]
    fn test_top_p_tight_threshold_falls_back_to_best() {
        // A dominant token exceeds any p on its own.
        let logits = [10.0, 0.0, 0.0];
        assert_eq!(top_p(&logits, 1e-6, 1.0, &mut rng()).unwrap(), 0);
    }

    #[test]
    fn test_top_a_excludes_unlikely_tokens() {
        let logits = [5.0, 5.0, -10.0];
        let mut r = rng();
        for _ in 0..50 {
            let tok = top_a(&logits, 0.5, 1.0, &mut r).unwrap();
            assert!(tok < 2);
        }
    }

    #[test]
    fn test_repetition_penalty_discourages_history() {
        let config = GenerationConfig {
            repetition_penalty: 2.0,
            ..GenerationConfig::default()
        };
        let mut logits = vec![4.0, 4.0, -2.0];
        adjust_logits(&mut logits, &[0], &config);
        assert_eq!(logits, vec![2.0, 4.0, -2.0]);

        let mut logits = vec![-2.0, 0.0, 0.0];
        adjust_logits(&mut logits, &[0], &config);
        assert_eq!(logits[0], -4.0);
    }

    #[test]
    fn test_ngram_blocking_bans_completion() {
        // History ends with [1, 2]; the bigram rule n=3 has seen [1, 2, 3].
        let config = GenerationConfig {
            no_repeat_ngram: 3,
            ..GenerationConfig::default()
        };
        let mut logits = vec![0.0; 5];
        adjust_logits(&mut logits, &[1, 2, 3, 4, 1, 2], &config);
        assert_eq!(logits[3], f32::NEG_INFINITY);
        assert!(logits[4].is_finite());
    }

    #[test]
    fn test_logit_bias_added() {
        let mut config = GenerationConfig::default();
        config.logit_bias.insert(1, 3.0);
        config.logit_bias.insert(2, -5.0);
        let mut logits = vec![0.0, 0.0, 10.0];
        adjust_logits(&mut logits, &[], &config);
        assert_eq!(logits, vec![0.0, 3.0, 5.0]);
    }

    #[test]
    fn test_mirostat_truncates_high_surprise() {
        let logits = [5.0, 0.0, -5.0];
        let mut r = rng();
        // Tight mu keeps only the dominant token.
        for _ in 0..20 {
            let (tok, _) = mirostat(&logits, 0.5, 1.0, &mut r).unwrap();
            assert_eq!(tok, 0);
        }
    }

    #[test]
    fn test_methods_validate_through_config() {
        let cfg = GenerationConfig {
            method: SamplingMethod::Mirostat { tau: 5.0, eta: 0.1 },
            ..GenerationConfig::default()
        };
        assert!(cfg.validate().is_ok());
    }
}
