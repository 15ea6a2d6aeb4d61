//! # Rotor
//!
//! Incremental decoding for LLaMA-style models.
//!
//! This crate wraps [`rotor_core`] with a [`Session`] that owns a model,
//! serializes decode steps and keeps track of the current position:
//! - **One token per step**: each call consumes one token per batch slot
//! - **Per-layer KV cache**: earlier positions are never recomputed
//! - **SafeTensors weights** in Meta's checkpoint naming
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rotor::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let session = Session::builder()
//!         .config_path("llama-2-7b/params.json")
//!         .weights_path("llama-2-7b")
//!         .build()?;
//!
//!     let logits = session.feed(&[1, 15043, 29892])?;
//!     let next = logits.argmax(1)?.to_vec1::<u32>()?[0];
//!     session.step(&[next])?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Re-export core crate
pub use rotor_core::*;

mod session;

pub use session::{Session, SessionBuilder};

/// Commonly used types.
pub mod prelude {
    pub use crate::session::{Session, SessionBuilder};
    pub use crate::{
        cache::{KvCache, KvCacheConfig},
        error::{Result, RotorError},
        model::{ModelConfig, Transformer, WeightLoader, WeightSource},
    };

    // Re-export useful external types
    pub use anyhow;
    pub use candle_core::{Device, Tensor};
    pub use tracing;
}
