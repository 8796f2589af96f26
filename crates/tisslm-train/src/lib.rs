//! Training for the tisslm language model: AdamW with cosine-warmup
//! scheduling, gradient clipping, next-token datasets, and checkpointing.

pub mod checkpoint;
pub mod dataloader;
pub mod metrics;
pub mod optimizer;
pub mod train;

pub use checkpoint::{latest_checkpoint, load_checkpoint, save_checkpoint};
pub use dataloader::Dataset;
pub use optimizer::{clip_gradients, AdamW, CosineWithWarmup};
pub use train::{TrainConfig, Trainer};
