//! Decoder block.
//!
//! A single pre-norm decoder block combining:
//! - Pre-attention RMSNorm
//! - Rotary grouped-query self-attention
//! - Pre-feed-forward RMSNorm
//! - SwiGLU feed-forward
//!
//! ```text
//! h   = x + attention(attention_norm(x))
//! out = h + feed_forward(ffn_norm(h))
//! ```

use super::{FeedForward, ModelConfig, RmsNorm, RotarySlice, WeightSource};
use crate::attention::SelfAttention;
use crate::error::Result;
use candle_core::{Device, Tensor};

/// A single transformer decoder block.
#[derive(Debug)]
pub struct DecoderBlock {
    /// Norm gating the attention input.
    attention_norm: RmsNorm,
    /// Self-attention, owning this block's KV cache.
    attention: SelfAttention,
    /// Norm gating the feed-forward input.
    ffn_norm: RmsNorm,
    /// Feed-forward network.
    feed_forward: FeedForward,
    /// Layer index (for debugging).
    layer_idx: usize,
}

impl DecoderBlock {
    /// Create a new decoder block.
    pub fn new(
        attention_norm: RmsNorm,
        attention: SelfAttention,
        ffn_norm: RmsNorm,
        feed_forward: FeedForward,
        layer_idx: usize,
    ) -> Self {
        Self {
            attention_norm,
            attention,
            ffn_norm,
            feed_forward,
            layer_idx,
        }
    }

    /// Build block `layer_idx` from `layers.{layer_idx}.*` weights.
    pub fn from_weights(
        config: &ModelConfig,
        weights: &impl WeightSource,
        layer_idx: usize,
    ) -> Result<Self> {
        let name = |suffix: &str| format!("layers.{layer_idx}.{suffix}.weight");

        let attention = SelfAttention::new(
            weights.tensor(&name("attention.wq"))?,
            weights.tensor(&name("attention.wk"))?,
            weights.tensor(&name("attention.wv"))?,
            weights.tensor(&name("attention.wo"))?,
            config,
        )?;
        let feed_forward = FeedForward::new(
            weights.tensor(&name("feed_forward.w1"))?,
            weights.tensor(&name("feed_forward.w2"))?,
            weights.tensor(&name("feed_forward.w3"))?,
            config,
        )?;
        let attention_norm = RmsNorm::new(weights.tensor(&name("attention_norm"))?, config.norm_eps)?;
        let ffn_norm = RmsNorm::new(weights.tensor(&name("ffn_norm"))?, config.norm_eps)?;

        Ok(Self::new(
            attention_norm,
            attention,
            ffn_norm,
            feed_forward,
            layer_idx,
        ))
    }

    /// Create a decoder block with random weights (for testing).
    pub fn random(config: &ModelConfig, layer_idx: usize, device: &Device) -> Result<Self> {
        Ok(Self::new(
            RmsNorm::ones(config.dim, config.norm_eps, device)?,
            SelfAttention::random(config, device)?,
            RmsNorm::ones(config.dim, config.norm_eps, device)?,
            FeedForward::random(config, device)?,
            layer_idx,
        ))
    }

    /// One decode step.
    ///
    /// # Arguments
    ///
    /// * `x` - Hidden states [batch, 1, dim]
    /// * `start_pos` - Absolute position of the token
    /// * `rotary` - Rotations for `start_pos`
    pub fn forward(&mut self, x: &Tensor, start_pos: usize, rotary: &RotarySlice) -> Result<Tensor> {
        let normed = self.attention_norm.forward(x)?;
        let h = (x + self.attention.forward(&normed, start_pos, rotary)?)?;

        let normed = self.ffn_norm.forward(&h)?;
        let out = (&h + self.feed_forward.forward(&normed)?)?;
        Ok(out)
    }

    /// Get the layer index.
    pub fn layer_idx(&self) -> usize {
        self.layer_idx
    }

    /// Get the attention module.
    pub fn attention(&self) -> &SelfAttention {
        &self.attention
    }

    /// Get the feed-forward module.
    pub fn feed_forward(&self) -> &FeedForward {
        &self.feed_forward
    }

    /// Get the pre-attention norm.
    pub fn attention_norm(&self) -> &RmsNorm {
        &self.attention_norm
    }

    /// Get the pre-feed-forward norm.
    pub fn ffn_norm(&self) -> &RmsNorm {
        &self.ffn_norm
    }
}
