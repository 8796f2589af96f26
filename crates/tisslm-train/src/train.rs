//! Training loop

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::PathBuf;
use tisslm_model::{CrossEntropyLoss, Model};

use crate::checkpoint::{checkpoint_path, load_checkpoint, prune_checkpoints, save_checkpoint};
use crate::dataloader::Dataset;
use crate::metrics::MetricsLogger;
use crate::optimizer::{clip_gradients, AdamW, CosineWithWarmup};

/// Hyperparameters for one training run
#[derive(Debug, Clone)]
pub struct TrainConfig {
    pub epochs: u64,
    pub batch_size: usize,
    pub lr: f32,
    pub min_lr: f32,
    pub weight_decay: f32,
    pub warmup_steps: u64,
    pub max_grad_norm: f32,
    pub label_smoothing: f32,
    pub log_every: u64,
    pub save_every: u64,
    /// Checkpoints kept on disk; negative keeps all
    pub keep_last: i64,
    pub checkpoint_dir: Option<PathBuf>,
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 1,
            batch_size: 8,
            lr: 3e-4,
            min_lr: 0.0,
            weight_decay: 0.01,
            warmup_steps: 100,
            max_grad_norm: 1.0,
            label_smoothing: 0.0,
            log_every: 10,
            save_every: 500,
            keep_last: 3,
            checkpoint_dir: None,
            seed: 0,
        }
    }
}

/// Drives epochs of AdamW updates over a [`Dataset`], with periodic logging
/// and checkpointing. Gradients from every sequence in a batch accumulate
/// before a single optimizer step.
pub struct Trainer {
    model: Model,
    optimizer: AdamW,
    loss: CrossEntropyLoss,
    config: TrainConfig,
    epoch: u64,
    step: u64,
}

impl Trainer {
    /// # Errors
    /// Fails on an invalid label smoothing value.
    pub fn new(model: Model, config: TrainConfig) -> Result<Self> {
        let optimizer = AdamW::with_defaults(config.lr, config.weight_decay);
        let loss = CrossEntropyLoss::new(config.label_smoothing)
            .context("building the training loss")?;
        Ok(Self {
            model,
            optimizer,
            loss,
            config,
            epoch: 0,
            step: 0,
        })
    }

    /// Restore model and optimizer state from a checkpoint file.
    ///
    /// Resume granularity is the epoch: [`Trainer::train`] restarts the
    /// resumed epoch from its first batch, so a mid-epoch checkpoint
    /// replays that epoch's earlier batches, and the step counter can run
    /// past the schedule horizon (the learning rate clamps at `min_lr`).
    ///
    /// # Errors
    /// Propagates checkpoint read failures.
    pub fn resume(&mut self, path: &std::path::Path) -> Result<()> {
        let (epoch, step) = load_checkpoint(path, &mut self.model, &mut self.optimizer)
            .with_context(|| format!("resuming from {}", path.display()))?;
        self.epoch = epoch;
        self.step = step;
        println!("resumed from {} at epoch {}, step {}", path.display(), epoch, step);
        Ok(())
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn into_model(self) -> Model {
        self.model
    }

    pub fn step_count(&self) -> u64 {
        self.step
    }

    /// Run the configured number of epochs.
    ///
    /// # Errors
    /// Propagates model, optimizer, and checkpoint errors.
    pub fn train(&mut self, dataset: &Dataset) -> Result<()> {
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut metrics = MetricsLogger::new();
        let batches_per_epoch =
            (dataset.len() + self.config.batch_size - 1) / self.config.batch_size;
        let total_steps = self.config.epochs * batches_per_epoch as u64;
        let schedule = CosineWithWarmup::new(
            self.config.lr,
            self.config.min_lr,
            self.config.warmup_steps,
            total_steps.max(1),
        );

        if let Some(dir) = &self.config.checkpoint_dir {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating checkpoint dir {}", dir.display()))?;
        }

        let start_epoch = self.epoch;
        for epoch in start_epoch..self.config.epochs {
            self.epoch = epoch;
            let mut epoch_loss = 0.0f32;
            let mut epoch_batches = 0u64;

            for batch in dataset.batches(self.config.batch_size, &mut rng) {
                let scale = 1.0 / batch.len() as f32;
                self.model.zero_grad();
                let mut batch_loss = 0.0f32;
                for index in batch {
                    let (input, target) = dataset.example(index);
                    let (logits, cache) = self.model.forward(input, None, true)?;
                    let (loss_value, mut dlogits) = self.loss.forward(&logits, target)?;
                    dlogits.scale(scale);
                    self.model.backward(&dlogits, &cache)?;
                    batch_loss += loss_value * scale;
                    metrics.record_tokens(input.len() as u64);
                }

                let mut params = self.model.parameters_mut();
                let grad_norm = clip_gradients(&mut params, self.config.max_grad_norm)
                    .with_context(|| format!("clipping gradients at step {}", self.step + 1))?;
                self.optimizer.lr = schedule.lr(self.step + 1);
                self.optimizer.step(&mut params)?;
                self.step += 1;
                epoch_loss += batch_loss;
                epoch_batches += 1;

                if self.config.log_every > 0 && self.step % self.config.log_every == 0 {
                    metrics.log_step(epoch, self.step, batch_loss, self.optimizer.lr, grad_norm);
                }
                if self.config.save_every > 0 && self.step % self.config.save_every == 0 {
                    self.save(epoch)?;
                }
            }

            metrics.log_epoch(epoch, epoch_loss / epoch_batches.max(1) as f32);
        }

        if self.config.checkpoint_dir.is_some() {
            self.save(self.config.epochs)?;
        }
        Ok(())
    }

    fn save(&self, epoch: u64) -> Result<()> {
        let dir = match &self.config.checkpoint_dir {
            Some(dir) => dir,
            None => return Ok(()),
        };
        let path = checkpoint_path(dir, self.step);
        save_checkpoint(&path, &self.model, &self.optimizer, epoch, self.step)?;
        prune_checkpoints(dir, self.config.keep_last)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tisslm_model::ModelConfig;

    fn tiny_model() -> Model {
        Model::new(ModelConfig {
            n_embd: 8,
            n_layer: 1,
            n_head: 2,
            n_kv_head: 2,
            d_ff: 16,
            vocab_size: 8,
            block_size: 8,
            seed: Some(5),
            ..ModelConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_training_reduces_loss_on_repetitive_data() {
        // A strictly cyclic stream is learnable by even a tiny model.
        let tokens: Vec<u32> = (0..320).map(|i| (i % 4) as u32).collect();
        let dataset = Dataset::new(&tokens, 4).unwrap();

        let mut model = tiny_model();
        let loss = CrossEntropyLoss::new(0.0).unwrap();
        let initial = {
            let (input, target) = dataset.example(0);
            let (logits, _) = model.forward(input, None, false).unwrap();
            loss.forward(&logits, target).unwrap().0
        };

        let config = TrainConfig {
            epochs: 3,
            batch_size: 4,
            lr: 1e-2,
            warmup_steps: 5,
            log_every: 0,
            save_every: 0,
            ..TrainConfig::default()
        };
        let mut trainer = Trainer::new(model, config).unwrap();
        trainer.train(&dataset).unwrap();

        let mut trained = trainer.into_model();
        let (input, target) = dataset.example(0);
        let (logits, _) = trained.forward(input, None, false).unwrap();
        let (after, _) = loss.forward(&logits, target).unwrap();
        assert!(after < initial, "loss went from {} to {}", initial, after);
    }

    #[test]
    fn test_checkpoints_written_and_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let tokens: Vec<u32> = (0..200).map(|i| (i % 4) as u32).collect();
        let dataset = Dataset::new(&tokens, 4).unwrap();
        let config = TrainConfig {
            epochs: 2,
            batch_size: 4,
            save_every: 2,
            keep_last: 1,
            log_every: 0,
            checkpoint_dir: Some(dir.path().to_path_buf()),
            ..TrainConfig::default()
        };
        let mut trainer = Trainer::new(tiny_model(), config).unwrap();
        trainer.train(&dataset).unwrap();

        let kept: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".ckpt"))
            .collect();
        assert_eq!(kept.len(), 1);
    }
}
