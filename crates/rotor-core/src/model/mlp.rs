//! SwiGLU feed-forward network.
//!
//! # Formula
//!
//! `FeedForward(x) = W2(silu(W1 x) * W3 x)`
//!
//! Where `silu(x) = x * sigmoid(x)`. None of the three projections carry a
//! bias.
//!
//! # Reference
//!
//! [GLU Variants Improve Transformer](https://arxiv.org/abs/2002.05202)

use super::{check_shape, ModelConfig};
use crate::error::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::{Linear, Module};

/// Gated feed-forward block.
#[derive(Debug, Clone)]
pub struct FeedForward {
    /// Gate projection: dim -> hidden
    w1: Linear,
    /// Down projection: hidden -> dim
    w2: Linear,
    /// Up projection: dim -> hidden
    w3: Linear,
    /// Model dimension.
    dim: usize,
    /// Hidden dimension.
    hidden_dim: usize,
}

impl FeedForward {
    /// Create with given weights.
    ///
    /// Weight shapes are `[out, in]`: `w1` and `w3` are
    /// `[hidden, dim]`, `w2` is `[dim, hidden]`, with `hidden` given by
    /// [`ModelConfig::ffn_hidden_dim`].
    pub fn new(w1: Tensor, w2: Tensor, w3: Tensor, config: &ModelConfig) -> Result<Self> {
        let dim = config.dim;
        let hidden_dim = config.ffn_hidden_dim();

        check_shape(&w1, &[hidden_dim, dim], "w1")?;
        check_shape(&w2, &[dim, hidden_dim], "w2")?;
        check_shape(&w3, &[hidden_dim, dim], "w3")?;

        Ok(Self {
            w1: Linear::new(w1, None),
            w2: Linear::new(w2, None),
            w3: Linear::new(w3, None),
            dim,
            hidden_dim,
        })
    }

    /// Create with random weights (for testing).
    pub fn random(config: &ModelConfig, device: &Device) -> Result<Self> {
        let dim = config.dim;
        let hidden_dim = config.ffn_hidden_dim();
        let w1 = Tensor::randn(0.0f32, 0.02, (hidden_dim, dim), device)?;
        let w2 = Tensor::randn(0.0f32, 0.02, (dim, hidden_dim), device)?;
        let w3 = Tensor::randn(0.0f32, 0.02, (hidden_dim, dim), device)?;
        Self::new(w1, w2, w3, config)
    }

    /// Create with zeros (for testing specific behaviors).
    pub fn zeros(config: &ModelConfig, device: &Device) -> Result<Self> {
        let dim = config.dim;
        let hidden_dim = config.ffn_hidden_dim();
        let w1 = Tensor::zeros((hidden_dim, dim), DType::F32, device)?;
        let w2 = Tensor::zeros((dim, hidden_dim), DType::F32, device)?;
        let w3 = Tensor::zeros((hidden_dim, dim), DType::F32, device)?;
        Self::new(w1, w2, w3, config)
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor [..., dim]
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = candle_nn::ops::silu(&self.w1.forward(x)?)?;
        let up = self.w3.forward(x)?;
        Ok(self.w2.forward(&(gate * up)?)?)
    }

    /// Get the model dimension.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Get the hidden dimension.
    pub fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }
}
