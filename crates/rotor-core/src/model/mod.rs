//! Model components and the decoder stack.
//!
//! Provides the building blocks of a LLaMA-style decoder:
//! - Model configuration
//! - Rotary position embeddings
//! - RMS normalization and the gated feed-forward network
//! - Decoder blocks and the full [`Transformer`]
//! - Weight providers

mod config;
mod layer;
mod loader;
mod mlp;
mod rmsnorm;
mod rope;
mod transformer;

pub use config::ModelConfig;
pub use layer::DecoderBlock;
pub use loader::{random_weights, WeightLoader, WeightSource};
pub use mlp::FeedForward;
pub use rmsnorm::RmsNorm;
pub use rope::{apply_rotary, RotarySlice, RotaryTable, ROPE_THETA};
pub use transformer::Transformer;

pub(crate) use loader::{check_shape, ComputeWeights};
