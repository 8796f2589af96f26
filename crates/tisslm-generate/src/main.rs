//! Command-line generation from a trained checkpoint.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tisslm_generate::{GenerationConfig, Generator, SamplingMethod};
use tisslm_model::{Model, ModelConfig};
use tisslm_tokenizer::Tokenizer;
use tisslm_train::{latest_checkpoint, load_checkpoint, AdamW};

#[derive(Parser, Debug)]
#[command(name = "tisslm-generate", about = "Generate text from a trained tisslm checkpoint")]
struct Args {
    /// Checkpoint file; defaults to the newest in --checkpoint-dir
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    #[arg(long, default_value = "checkpoints")]
    checkpoint_dir: PathBuf,

    #[arg(long, default_value = "models/tokenizer")]
    tokenizer_prefix: PathBuf,

    #[arg(long)]
    prompt: String,

    /// greedy, random, top_k, top_p, top_a, beam, contrastive, or mirostat
    #[arg(long, default_value = "greedy")]
    method: String,

    #[arg(long, default_value_t = 64)]
    max_new_tokens: usize,

    #[arg(long, default_value_t = 1.0)]
    temperature: f32,

    #[arg(long, default_value_t = 40)]
    top_k: usize,

    #[arg(long, default_value_t = 0.9)]
    top_p: f32,

    #[arg(long, default_value_t = 0.2)]
    top_a: f32,

    #[arg(long, default_value_t = 4)]
    beam_width: usize,

    /// Candidate pool for contrastive search
    #[arg(long, default_value_t = 5)]
    contrastive_k: usize,

    /// Degeneration-penalty weight for contrastive search
    #[arg(long, default_value_t = 0.6)]
    contrastive_alpha: f32,

    /// Mirostat target surprise in bits
    #[arg(long, default_value_t = 5.0)]
    tau: f32,

    /// Mirostat learning rate
    #[arg(long, default_value_t = 0.1)]
    eta: f32,

    #[arg(long, default_value_t = 1.0)]
    repetition_penalty: f32,

    #[arg(long, default_value_t = 0)]
    no_repeat_ngram: usize,

    /// Token ids that end generation (repeatable)
    #[arg(long)]
    eos_token: Vec<usize>,

    /// Halt on an EOS token without printing it
    #[arg(long, default_value_t = false)]
    suppress_eos: bool,

    #[arg(long)]
    seed: Option<u64>,

    // Model shape; must match the checkpoint.
    #[arg(long, default_value_t = 128)]
    n_embd: usize,

    #[arg(long, default_value_t = 4)]
    n_layer: usize,

    #[arg(long, default_value_t = 4)]
    n_head: usize,

    #[arg(long)]
    n_kv_head: Option<usize>,

    #[arg(long, default_value_t = 512)]
    d_ff: usize,

    #[arg(long, default_value_t = 512)]
    block_size: usize,

    #[arg(long, default_value_t = false)]
    tie_weights: bool,
}

fn parse_method(args: &Args) -> Result<SamplingMethod> {
    Ok(match args.method.as_str() {
        "greedy" => SamplingMethod::Greedy,
        "random" => SamplingMethod::Random,
        "top_k" => SamplingMethod::TopK(args.top_k),
        "top_p" => SamplingMethod::TopP(args.top_p),
        "top_a" => SamplingMethod::TopA(args.top_a),
        "beam" => SamplingMethod::Beam {
            width: args.beam_width,
        },
        "contrastive" => SamplingMethod::Contrastive {
            k: args.contrastive_k,
            alpha: args.contrastive_alpha,
        },
        "mirostat" => SamplingMethod::Mirostat {
            tau: args.tau,
            eta: args.eta,
        },
        other => bail!("unknown sampling method '{}'", other),
    })
}

fn main() -> Result<()> {
    let args = Args::parse();

    let tokenizer = Tokenizer::load(&args.tokenizer_prefix).with_context(|| {
        format!("loading tokenizer '{}'", args.tokenizer_prefix.display())
    })?;

    let checkpoint = match &args.checkpoint {
        Some(path) => path.clone(),
        None => latest_checkpoint(&args.checkpoint_dir)?
            .with_context(|| format!("no checkpoint in {}", args.checkpoint_dir.display()))?,
    };

    let model_config = ModelConfig {
        n_embd: args.n_embd,
        n_layer: args.n_layer,
        n_head: args.n_head,
        n_kv_head: args.n_kv_head.unwrap_or(args.n_head),
        d_ff: args.d_ff,
        vocab_size: tokenizer.vocab_size(),
        block_size: args.block_size,
        tie_weights: args.tie_weights,
        seed: Some(0),
        ..ModelConfig::default()
    };
    let mut model = Model::new(model_config).context("building the model")?;
    let mut optimizer = AdamW::with_defaults(0.0, 0.0);
    load_checkpoint(&checkpoint, &mut model, &mut optimizer)
        .with_context(|| format!("loading checkpoint {}", checkpoint.display()))?;

    let generation_config = GenerationConfig {
        method: parse_method(&args)?,
        max_new_tokens: args.max_new_tokens,
        temperature: args.temperature,
        repetition_penalty: args.repetition_penalty,
        no_repeat_ngram: args.no_repeat_ngram,
        eos_tokens: args.eos_token.clone(),
        suppress_eos: args.suppress_eos,
        seed: args.seed,
        ..GenerationConfig::default()
    };

    let prompt_ids: Vec<usize> = tokenizer
        .encode(&args.prompt)
        .into_iter()
        .map(|t| t as usize)
        .collect();
    if prompt_ids.is_empty() {
        bail!("prompt tokenized to nothing");
    }

    let mut generator = Generator::new(model);
    let generated = generator.generate(&prompt_ids, &generation_config)?;
    let ids: Vec<u32> = generated.iter().map(|&t| t as u32).collect();
    let text = tokenizer.decode(&ids).context("decoding generated tokens")?;

    println!("{}{}", args.prompt, text);
    Ok(())
}
