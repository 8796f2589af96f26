//! End-to-end decoding behavior on a small untrained model.

use std::collections::HashMap;
use tisslm_generate::{GenerationConfig, Generator, SamplingMethod};
use tisslm_model::{Model, ModelConfig};

fn tiny_generator() -> Generator {
    let model = Model::new(ModelConfig {
        n_embd: 16,
        n_layer: 2,
        n_head: 2,
        n_kv_head: 2,
        d_ff: 32,
        vocab_size: 20,
        block_size: 64,
        seed: Some(7),
        ..ModelConfig::default()
    })
    .unwrap();
    Generator::new(model)
}

#[test]
fn greedy_generation_is_deterministic() {
    let config = GenerationConfig {
        max_new_tokens: 10,
        ..GenerationConfig::default()
    };
    let a = tiny_generator().generate(&[1, 2, 3], &config).unwrap();
    let b = tiny_generator().generate(&[1, 2, 3], &config).unwrap();
    assert_eq!(a, b);
    assert_eq!(a.len(), 10);
}

#[test]
fn seeded_sampling_is_reproducible() {
    let config = GenerationConfig {
        method: SamplingMethod::TopK(5),
        max_new_tokens: 12,
        seed: Some(99),
        ..GenerationConfig::default()
    };
    let a = tiny_generator().generate(&[4, 5], &config).unwrap();
    let b = tiny_generator().generate(&[4, 5], &config).unwrap();
    assert_eq!(a, b);
}

#[test]
fn forced_eos_halts_and_is_emitted() {
    // A huge bias makes the EOS token win the first step.
    let mut logit_bias = HashMap::new();
    logit_bias.insert(9usize, 1e4f32);
    let config = GenerationConfig {
        max_new_tokens: 10,
        eos_tokens: vec![9],
        logit_bias,
        ..GenerationConfig::default()
    };
    let out = tiny_generator().generate(&[1], &config).unwrap();
    assert_eq!(out, vec![9]);
}

#[test]
fn suppressed_eos_halts_without_emission() {
    let mut logit_bias = HashMap::new();
    logit_bias.insert(9usize, 1e4f32);
    let config = GenerationConfig {
        max_new_tokens: 10,
        eos_tokens: vec![9],
        suppress_eos: true,
        logit_bias,
        ..GenerationConfig::default()
    };
    let out = tiny_generator().generate(&[1], &config).unwrap();
    assert!(out.is_empty());
}

#[test]
fn capacity_overflow_rejected() {
    // block_size is 64; the request would need 70 positions.
    let config = GenerationConfig {
        max_new_tokens: 67,
        ..GenerationConfig::default()
    };
    assert!(tiny_generator().generate(&[1, 2, 3], &config).is_err());
}

#[test]
fn ngram_blocking_prevents_repeated_bigrams() {
    // Force a strong preference for one token; blocking must still prevent
    // any bigram from occurring twice.
    let mut logit_bias = HashMap::new();
    logit_bias.insert(3usize, 50.0f32);
    let config = GenerationConfig {
        max_new_tokens: 15,
        no_repeat_ngram: 2,
        logit_bias,
        ..GenerationConfig::default()
    };
    let out = tiny_generator().generate(&[1], &config).unwrap();
    let mut history = vec![1usize];
    history.extend(&out);
    let mut seen = std::collections::HashSet::new();
    for pair in history.windows(2) {
        assert!(seen.insert((pair[0], pair[1])), "bigram {:?} repeated", pair);
    }
}

#[test]
fn beam_search_returns_tokens() {
    let config = GenerationConfig {
        method: SamplingMethod::Beam { width: 3 },
        max_new_tokens: 6,
        ..GenerationConfig::default()
    };
    let out = tiny_generator().generate(&[2, 4], &config).unwrap();
    assert_eq!(out.len(), 6);
    assert!(out.iter().all(|&t| t < 20));
}

#[test]
fn contrastive_search_returns_tokens() {
    let config = GenerationConfig {
        method: SamplingMethod::Contrastive { k: 4, alpha: 0.6 },
        max_new_tokens: 5,
        ..GenerationConfig::default()
    };
    let out = tiny_generator().generate(&[2], &config).unwrap();
    assert_eq!(out.len(), 5);
}

#[test]
fn mirostat_returns_tokens() {
    let config = GenerationConfig {
        method: SamplingMethod::Mirostat { tau: 5.0, eta: 0.1 },
        max_new_tokens: 8,
        seed: Some(1),
        ..GenerationConfig::default()
    };
    let out = tiny_generator().generate(&[3], &config).unwrap();
    assert_eq!(out.len(), 8);
}

#[test]
fn attribution_exposes_per_layer_weights() {
    let mut generator = tiny_generator();
    let weights = generator.attribution(&[1, 2, 3, 4]).unwrap();
    assert_eq!(weights.len(), 2);
    for layer in &weights {
        assert_eq!(layer.shape(), &[2, 4, 4]);
        // Each attention row is a distribution.
        for row in 0..2 * 4 {
            let sum: f32 = layer.data()[row * 4..(row + 1) * 4].iter().sum();
            assert!((sum - 1.0).abs() < 1e-4);
        }
    }
}

#[test]
fn span_attribution_partitions_attention_mass() {
    let mut generator = tiny_generator();
    // The two spans cover the whole sequence, so each position's masses
    // must sum to one.
    let masses = generator
        .span_attribution(&[1, 2, 3, 4], &[(0, 2), (2, 4)])
        .unwrap();
    assert_eq!(masses.len(), 4);
    for row in &masses {
        assert_eq!(row.len(), 2);
        assert!((row[0] + row[1] - 1.0).abs() < 1e-4);
    }
    assert!(generator.span_attribution(&[1, 2], &[(1, 1)]).is_err());
    assert!(generator.span_attribution(&[1, 2], &[(0, 3)]).is_err());
}

#[test]
fn invalid_config_and_empty_prompt_rejected() {
    let config = GenerationConfig {
        temperature: -1.0,
        ..GenerationConfig::default()
    };
    assert!(tiny_generator().generate(&[1], &config).is_err());
    assert!(tiny_generator()
        .generate(&[], &GenerationConfig::default())
        .is_err());
}
