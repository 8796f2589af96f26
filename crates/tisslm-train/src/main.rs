//! Command-line trainer: tokenizes a text corpus and trains the model.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tisslm_model::{Model, ModelConfig};
use tisslm_tokenizer::Tokenizer;
use tisslm_train::{latest_checkpoint, Dataset, TrainConfig, Trainer};

#[derive(Parser, Debug)]
#[command(name = "tisslm-train", about = "Train the tisslm language model on a text corpus")]
struct Args {
    /// Path to the plain-text training corpus
    #[arg(long)]
    corpus: PathBuf,

    /// Tokenizer file prefix; trained from the corpus when missing
    #[arg(long, default_value = "models/tokenizer")]
    tokenizer_prefix: PathBuf,

    /// Vocabulary size when training a fresh tokenizer
    #[arg(long, default_value_t = 4096)]
    vocab_size: usize,

    /// Directory for checkpoint files
    #[arg(long, default_value = "checkpoints")]
    checkpoint_dir: PathBuf,

    /// Resume from this checkpoint file
    #[arg(long)]
    resume_from: Option<PathBuf>,

    /// Resume from the newest checkpoint in the checkpoint directory
    #[arg(long, default_value_t = false)]
    resume: bool,

    /// JSON model configuration file; overrides the dimension flags
    #[arg(long)]
    model_config: Option<PathBuf>,

    #[arg(long, default_value_t = 1)]
    epochs: u64,

    #[arg(long, default_value_t = 8)]
    batch_size: usize,

    /// Training sequence length
    #[arg(long, default_value_t = 128)]
    seq_len: usize,

    #[arg(long, default_value_t = 3e-4)]
    lr: f32,

    /// Learning-rate floor for the cosine decay
    #[arg(long, default_value_t = 0.0)]
    min_lr: f32,

    #[arg(long, default_value_t = 0.01)]
    weight_decay: f32,

    #[arg(long, default_value_t = 100)]
    warmup_steps: u64,

    #[arg(long, default_value_t = 1.0)]
    max_grad_norm: f32,

    #[arg(long, default_value_t = 0.0)]
    label_smoothing: f32,

    /// Save a checkpoint every N steps (0 saves only at the end)
    #[arg(long, default_value_t = 500)]
    save_every: u64,

    /// Checkpoints kept on disk; -1 keeps all
    #[arg(long, default_value_t = 3)]
    keep_last: i64,

    #[arg(long, default_value_t = 10)]
    log_every: u64,

    #[arg(long, default_value_t = 128)]
    n_embd: usize,

    #[arg(long, default_value_t = 4)]
    n_layer: usize,

    #[arg(long, default_value_t = 4)]
    n_head: usize,

    /// Key/value heads for grouped-query attention (defaults to n_head)
    #[arg(long)]
    n_kv_head: Option<usize>,

    #[arg(long, default_value_t = 512)]
    d_ff: usize,

    #[arg(long, default_value_t = 512)]
    block_size: usize,

    #[arg(long, default_value_t = 0.1)]
    dropout: f32,

    /// Share the output projection with the embedding matrix
    #[arg(long, default_value_t = false)]
    tie_weights: bool,

    #[arg(long, default_value_t = 0)]
    seed: u64,
}

fn load_or_train_tokenizer(args: &Args, corpus: &str) -> Result<Tokenizer> {
    if let Ok(tok) = Tokenizer::load(&args.tokenizer_prefix) {
        println!(
            "loaded tokenizer {} ({} tokens)",
            args.tokenizer_prefix.display(),
            tok.vocab_size()
        );
        return Ok(tok);
    }
    println!(
        "training tokenizer with vocab size {} from the corpus",
        args.vocab_size
    );
    let mut tok = Tokenizer::new();
    tok.train(corpus, args.vocab_size)
        .context("training the tokenizer")?;
    if let Some(parent) = args.tokenizer_prefix.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }
    tok.save(&args.tokenizer_prefix)
        .context("saving the tokenizer")?;
    Ok(tok)
}

fn main() -> Result<()> {
    let args = Args::parse();

    let corpus = std::fs::read_to_string(&args.corpus)
        .with_context(|| format!("reading corpus {}", args.corpus.display()))?;
    let tokenizer = load_or_train_tokenizer(&args, &corpus)?;
    let tokens = tokenizer.encode(&corpus);
    println!("corpus: {} chars, {} tokens", corpus.len(), tokens.len());

    let dataset = Dataset::new(&tokens, args.seq_len).context("building the dataset")?;
    println!("{} training windows of {} tokens", dataset.len(), args.seq_len);

    let model_config = match &args.model_config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading model config {}", path.display()))?;
            let mut config: ModelConfig = serde_json::from_str(&raw)
                .with_context(|| format!("parsing model config {}", path.display()))?;
            // The vocabulary always follows the tokenizer actually in use.
            config.vocab_size = tokenizer.vocab_size();
            config
        }
        None => ModelConfig {
            n_embd: args.n_embd,
            n_layer: args.n_layer,
            n_head: args.n_head,
            n_kv_head: args.n_kv_head.unwrap_or(args.n_head),
            d_ff: args.d_ff,
            vocab_size: tokenizer.vocab_size(),
            block_size: args.block_size,
            dropout: args.dropout,
            tie_weights: args.tie_weights,
            seed: Some(args.seed),
            ..ModelConfig::default()
        },
    };
    let model = Model::new(model_config).context("building the model")?;
    println!("model has {} parameters", model.num_parameters());

    let train_config = TrainConfig {
        epochs: args.epochs,
        batch_size: args.batch_size,
        lr: args.lr,
        min_lr: args.min_lr,
        weight_decay: args.weight_decay,
        warmup_steps: args.warmup_steps,
        max_grad_norm: args.max_grad_norm,
        label_smoothing: args.label_smoothing,
        log_every: args.log_every,
        save_every: args.save_every,
        keep_last: args.keep_last,
        checkpoint_dir: Some(args.checkpoint_dir.clone()),
        seed: args.seed,
    };
    let mut trainer = Trainer::new(model, train_config)?;

    if let Some(path) = &args.resume_from {
        trainer.resume(path)?;
    } else if args.resume && args.checkpoint_dir.is_dir() {
        if let Some(path) = latest_checkpoint(&args.checkpoint_dir)? {
            trainer.resume(&path)?;
        } else {
            println!("no checkpoint found in {}, starting fresh", args.checkpoint_dir.display());
        }
    }

    trainer.train(&dataset)?;
    println!("training finished after {} steps", trainer.step_count());
    Ok(())
}
