//! Decoder-only transformer language model with hand-written gradients.
//!
//! Every layer exposes an explicit `forward` returning the activations the
//! matching `backward` needs, so the training loop owns the tape instead of
//! an autograd engine. Inference reuses the same forwards with per-layer
//! KV caches for incremental decoding.

pub mod attention;
pub mod block;
pub mod config;
pub mod dropout;
pub mod error;
pub mod gpt;
pub mod loss;
pub mod mlp;
pub mod norm;
pub mod param;
pub mod pos;
pub mod tensor;

pub use attention::{KVCache, MultiHeadAttention};
pub use config::ModelConfig;
pub use error::{Result, TissError};
pub use gpt::{Model, ModelCache, ModelKVCache};
pub use loss::CrossEntropyLoss;
pub use param::Parameter;
pub use tensor::{softmax_1d, softmax_last_dim, Tensor};
