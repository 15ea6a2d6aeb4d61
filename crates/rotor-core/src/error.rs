//! Error types for Rotor Core.

use thiserror::Error;

/// Result type alias for Rotor operations.
pub type Result<T> = std::result::Result<T, RotorError>;

/// Errors that can occur in Rotor operations.
#[derive(Error, Debug)]
pub enum RotorError {
    /// Model configuration violates a shape invariant.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// A decode step was given more (or fewer) than one token per slot.
    #[error("expected exactly one token per batch slot, got sequence length {0}")]
    SeqLenNotOne(usize),

    /// A decode step was given no batch slots.
    #[error("batch must contain at least one slot")]
    EmptyBatch,

    /// More batch slots than the cache was sized for.
    #[error("batch of {batch} slots exceeds max_batch_size {max_batch_size}")]
    BatchTooLarge {
        /// Requested slot count (or end of the slot range).
        batch: usize,
        /// Configured capacity.
        max_batch_size: usize,
    },

    /// Position range runs past the end of the cache or rotary table.
    #[error("positions {start}..{end} exceed capacity {capacity}")]
    PositionOutOfRange {
        /// First requested position.
        start: usize,
        /// One past the last requested position.
        end: usize,
        /// Number of positions available.
        capacity: usize,
    },

    /// Token id outside the vocabulary.
    #[error("token id {token} out of range for vocabulary of {vocab_size}")]
    TokenOutOfRange {
        /// Offending token id.
        token: u32,
        /// Configured vocabulary size.
        vocab_size: usize,
    },

    /// Missing or unusable weights.
    #[error("model error: {0}")]
    ModelError(String),

    /// Shape mismatch error.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// I/O error.
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),

    /// SafeTensors decoding error.
    #[error("safetensors error: {0}")]
    SafeTensorsError(#[from] safetensors::SafeTensorError),

    /// Candle tensor error.
    #[error("tensor error: {0}")]
    TensorError(#[from] candle_core::Error),
}
