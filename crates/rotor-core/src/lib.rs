//! # Rotor Core
//!
//! Forward-inference core of a LLaMA-style decoder, built for incremental
//! decoding one token at a time.
//!
//! This crate provides:
//! - **Rotary position embeddings** precomputed once and sliced per step
//! - **Grouped-query attention** with KV heads broadcast across query heads
//! - **Fixed-capacity KV cache** per layer, indexed by batch slot and position
//! - **Decoder stack** with RMSNorm, SwiGLU feed-forward and residuals
//!
//! ```rust
//! use candle_core::Device;
//! use rotor_core::model::{ModelConfig, Transformer};
//!
//! let config = ModelConfig {
//!     dim: 32,
//!     n_layers: 2,
//!     n_heads: 4,
//!     n_kv_heads: Some(2),
//!     vocab_size: 100,
//!     multiple_of: 16,
//!     max_batch_size: 1,
//!     max_seq_len: 16,
//!     ..ModelConfig::default()
//! };
//! let mut model = Transformer::random(config, &Device::Cpu).unwrap();
//!
//! let logits = model.forward_tokens(&[5], 0).unwrap();
//! assert_eq!(logits.dims(), &[1, 100]);
//! let logits = model.forward_tokens(&[9], 1).unwrap();
//! assert_eq!(logits.dims(), &[1, 100]);
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod attention;
pub mod cache;
pub mod error;
pub mod model;

pub use error::{Result, RotorError};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::attention::SelfAttention;
    pub use crate::cache::{KvCache, KvCacheConfig};
    pub use crate::error::{Result, RotorError};
    pub use crate::model::{ModelConfig, Transformer, WeightLoader, WeightSource};
}
