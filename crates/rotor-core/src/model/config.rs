//! Model configuration.

use crate::error::{Result, RotorError};
use serde::{Deserialize, Serialize};

/// Configuration for a LLaMA-style decoder.
///
/// Field names follow Meta's `params.json`, so a checkpoint's parameter file
/// deserializes directly. Keys other than the ones below are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model (embedding) dimension.
    pub dim: usize,
    /// Number of decoder blocks.
    pub n_layers: usize,
    /// Number of query heads.
    pub n_heads: usize,
    /// Number of key/value heads (for GQA). Defaults to `n_heads`.
    #[serde(default)]
    pub n_kv_heads: Option<usize>,
    /// Vocabulary size.
    pub vocab_size: usize,
    /// Feed-forward hidden width is rounded up to a multiple of this.
    #[serde(default = "default_multiple_of")]
    pub multiple_of: usize,
    /// Literal feed-forward hidden width override (before rounding).
    #[serde(default)]
    pub ffn_dim_multiplier: Option<f64>,
    /// RMS norm epsilon.
    #[serde(default = "default_norm_eps")]
    pub norm_eps: f64,
    /// Number of batch slots the KV cache holds.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Number of positions the KV cache holds.
    #[serde(default = "default_max_seq_len")]
    pub max_seq_len: usize,
}

fn default_multiple_of() -> usize {
    256
}

fn default_norm_eps() -> f64 {
    1e-4
}

fn default_max_batch_size() -> usize {
    32
}

fn default_max_seq_len() -> usize {
    2048
}

impl ModelConfig {
    /// Number of key/value heads.
    pub fn n_kv_heads(&self) -> usize {
        self.n_kv_heads.unwrap_or(self.n_heads)
    }

    /// Calculate head dimension.
    pub fn head_dim(&self) -> usize {
        self.dim / self.n_heads
    }

    /// Query heads served by each key/value head.
    pub fn n_rep(&self) -> usize {
        self.n_heads / self.n_kv_heads()
    }

    /// Number of rows in the rotary table.
    pub fn rotary_len(&self) -> usize {
        self.max_seq_len * 2
    }

    /// Hidden width of the gated feed-forward network.
    ///
    /// `floor(2 * 4 * dim / 3)`, replaced outright by `floor(ffn_dim_multiplier)`
    /// when that is set, then rounded up to a multiple of `multiple_of`.
    pub fn ffn_hidden_dim(&self) -> usize {
        let mut hidden = 4 * self.dim;
        hidden = 2 * hidden / 3;
        if let Some(multiplier) = self.ffn_dim_multiplier {
            hidden = multiplier as usize;
        }
        self.multiple_of * hidden.div_ceil(self.multiple_of)
    }

    /// Check every shape invariant the model relies on.
    pub fn validate(&self) -> Result<()> {
        let counts = [
            ("dim", self.dim),
            ("n_heads", self.n_heads),
            ("n_kv_heads", self.n_kv_heads()),
            ("vocab_size", self.vocab_size),
            ("multiple_of", self.multiple_of),
            ("max_batch_size", self.max_batch_size),
            ("max_seq_len", self.max_seq_len),
        ];
        if let Some((name, _)) = counts.iter().find(|(_, v)| *v == 0) {
            return Err(RotorError::InvalidConfig(format!("{name} must be non-zero")));
        }
        if self.dim % self.n_heads != 0 {
            return Err(RotorError::InvalidConfig(format!(
                "dim {} is not divisible by n_heads {}",
                self.dim, self.n_heads
            )));
        }
        if self.n_heads % self.n_kv_heads() != 0 {
            return Err(RotorError::InvalidConfig(format!(
                "n_heads {} is not a multiple of n_kv_heads {}",
                self.n_heads,
                self.n_kv_heads()
            )));
        }
        if self.head_dim() % 2 != 0 {
            return Err(RotorError::InvalidConfig(format!(
                "head_dim {} must be even for rotary embeddings",
                self.head_dim()
            )));
        }
        if !(self.norm_eps.is_finite() && self.norm_eps > 0.0) {
            return Err(RotorError::InvalidConfig(format!(
                "norm_eps must be positive, got {}",
                self.norm_eps
            )));
        }
        if let Some(m) = self.ffn_dim_multiplier {
            if !(m.is_finite() && m >= 1.0) {
                return Err(RotorError::InvalidConfig(format!(
                    "ffn_dim_multiplier must be at least 1, got {m}"
                )));
            }
        }
        Ok(())
    }

    /// Load from a JSON file (e.g. `params.json`).
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        Ok(config)
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        // Llama-2-7B as published, including its norm_eps
        Self {
            dim: 4096,
            n_layers: 32,
            n_heads: 32,
            n_kv_heads: None,
            vocab_size: 32000,
            multiple_of: 256,
            ffn_dim_multiplier: None,
            norm_eps: 1e-5,
            max_batch_size: default_max_batch_size(),
            max_seq_len: default_max_seq_len(),
        }
    }
}
