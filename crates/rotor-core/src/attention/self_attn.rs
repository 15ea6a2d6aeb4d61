//! Rotary self-attention with a per-layer KV cache.

use super::grouped_attention;
use crate::cache::{KvCache, KvCacheConfig};
use crate::error::{Result, RotorError};
use crate::model::{apply_rotary, check_shape, ModelConfig, RotarySlice};
use candle_core::{DType, Device, Tensor};
use candle_nn::{Linear, Module};

/// Self-attention module for decoder blocks.
#[derive(Debug)]
pub struct SelfAttention {
    /// Query projection: [num_heads * head_dim, dim]
    wq: Linear,
    /// Key projection: [num_kv_heads * head_dim, dim]
    wk: Linear,
    /// Value projection: [num_kv_heads * head_dim, dim]
    wv: Linear,
    /// Output projection: [dim, num_heads * head_dim]
    wo: Linear,
    /// Key/value history for this layer.
    cache: KvCache,
    /// Number of attention heads.
    num_heads: usize,
    /// Number of key-value heads (for GQA).
    num_kv_heads: usize,
    /// Head dimension.
    head_dim: usize,
    /// Model dimension.
    dim: usize,
}

impl SelfAttention {
    /// Create attention with provided weights.
    ///
    /// The KV cache is allocated here, in the dtype of `wk`.
    pub fn new(
        wq: Tensor,
        wk: Tensor,
        wv: Tensor,
        wo: Tensor,
        config: &ModelConfig,
    ) -> Result<Self> {
        config.validate()?;
        let dim = config.dim;
        let num_heads = config.n_heads;
        let num_kv_heads = config.n_kv_heads();
        let head_dim = config.head_dim();

        check_shape(&wq, &[num_heads * head_dim, dim], "wq")?;
        check_shape(&wk, &[num_kv_heads * head_dim, dim], "wk")?;
        check_shape(&wv, &[num_kv_heads * head_dim, dim], "wv")?;
        check_shape(&wo, &[dim, num_heads * head_dim], "wo")?;

        let cache = KvCache::new(KvCacheConfig::from(config), wk.dtype(), wk.device())?;

        Ok(Self {
            wq: Linear::new(wq, None),
            wk: Linear::new(wk, None),
            wv: Linear::new(wv, None),
            wo: Linear::new(wo, None),
            cache,
            num_heads,
            num_kv_heads,
            head_dim,
            dim,
        })
    }

    /// Create attention with random weights (for testing).
    pub fn random(config: &ModelConfig, device: &Device) -> Result<Self> {
        let dim = config.dim;
        let q_out = config.n_heads * config.head_dim();
        let kv_out = config.n_kv_heads() * config.head_dim();

        let wq = Tensor::randn(0.0f32, 0.02, (q_out, dim), device)?;
        let wk = Tensor::randn(0.0f32, 0.02, (kv_out, dim), device)?;
        let wv = Tensor::randn(0.0f32, 0.02, (kv_out, dim), device)?;
        let wo = Tensor::randn(0.0f32, 0.02, (dim, q_out), device)?;

        Self::new(wq, wk, wv, wo, config)
    }

    /// Project to un-rotated queries, keys and values.
    ///
    /// Input: [batch, seq_len, dim]
    /// Returns:
    /// - query: [batch, seq_len, num_heads, head_dim]
    /// - key: [batch, seq_len, num_kv_heads, head_dim]
    /// - value: [batch, seq_len, num_kv_heads, head_dim]
    pub fn project(&self, x: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        let (batch, seq_len, dim) = x.dims3()?;
        if dim != self.dim {
            return Err(RotorError::ShapeMismatch(format!(
                "attention expects hidden size {}, got {dim}",
                self.dim
            )));
        }

        let q = self
            .wq
            .forward(x)?
            .reshape((batch, seq_len, self.num_heads, self.head_dim))?;
        let k = self
            .wk
            .forward(x)?
            .reshape((batch, seq_len, self.num_kv_heads, self.head_dim))?;
        let v = self
            .wv
            .forward(x)?
            .reshape((batch, seq_len, self.num_kv_heads, self.head_dim))?;

        Ok((q, k, v))
    }

    /// Merge heads and apply the output projection.
    ///
    /// Input: [batch, seq_len, num_heads, head_dim]
    /// Output: [batch, seq_len, dim]
    pub fn output(&self, attn_output: &Tensor) -> Result<Tensor> {
        let (batch, seq_len, _, _) = attn_output.dims4()?;
        let merged = attn_output.reshape((batch, seq_len, self.num_heads * self.head_dim))?;
        Ok(self.wo.forward(&merged)?)
    }

    /// One decode step.
    ///
    /// `x` is [batch, 1, dim] holding the new token of each batch slot
    /// `0..batch`, at absolute position `start_pos`; `rotary` must cover that
    /// position. The new key/value is written to the cache and the query
    /// attends over positions `[0, start_pos]`. Every cached position precedes
    /// the single query, so no mask is needed.
    pub fn forward(
        &mut self,
        x: &Tensor,
        start_pos: usize,
        rotary: &RotarySlice,
    ) -> Result<Tensor> {
        let (batch, seq_len, _) = x.dims3()?;
        if seq_len != 1 {
            return Err(RotorError::SeqLenNotOne(seq_len));
        }

        let (q, k, v) = self.project(x)?;
        let q = apply_rotary(&q, rotary)?;
        let k = apply_rotary(&k, rotary)?;

        self.cache.write(0..batch, start_pos, &k, &v)?;
        let (keys, values) = self.cache.read(0..batch, start_pos + seq_len)?;

        let attn = grouped_attention(&q, &keys.to_dtype(q.dtype())?, &values.to_dtype(q.dtype())?)?;
        self.output(&attn)
    }

    /// Get the KV cache.
    pub fn cache(&self) -> &KvCache {
        &self.cache
    }

    /// Get the number of heads.
    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    /// Get the number of KV heads.
    pub fn num_kv_heads(&self) -> usize {
        self.num_kv_heads
    }

    /// Get the head dimension.
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Element type of the projections.
    pub fn dtype(&self) -> DType {
        self.wq.weight().dtype()
    }
}
