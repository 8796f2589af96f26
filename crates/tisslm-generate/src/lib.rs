//! Text generation for the tisslm language model: incremental KV-cache
//! decoding with a family of samplers, plus beam search, contrastive
//! search, and Mirostat.

pub mod config;
pub mod generator;
pub mod sampler;

pub use config::{GenerationConfig, SamplingMethod};
pub use generator::Generator;
