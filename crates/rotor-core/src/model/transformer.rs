//! Transformer model implementation.

use super::{check_shape, random_weights, ComputeWeights, DecoderBlock, ModelConfig, RmsNorm, RotaryTable, WeightSource};
use crate::error::{Result, RotorError};
use candle_core::{DType, Device, Tensor};
use candle_nn::{Embedding, Linear, Module};

/// A LLaMA-style decoder for incremental, one-token-per-step inference.
///
/// Each step consumes one token per batch slot at an absolute position and
/// returns that step's logits. Every block keeps its own KV cache, so a step
/// only computes projections for the new token.
pub struct Transformer {
    /// Model configuration.
    config: ModelConfig,
    /// Token embeddings: [vocab_size, dim]
    tok_embeddings: Embedding,
    /// Decoder blocks, applied in order.
    layers: Vec<DecoderBlock>,
    /// Final norm.
    norm: RmsNorm,
    /// Output projection: [vocab_size, dim]
    output: Linear,
    /// Rotations for `2 * max_seq_len` positions, shared by every block.
    rotary: RotaryTable,
    /// Device for computation.
    device: Device,
}

impl Transformer {
    /// Build the model from a weight provider.
    ///
    /// The configuration is validated first; any missing tensor or shape
    /// mismatch aborts construction. BF16 weights on the CPU are upcast to
    /// F32, since the CPU backend cannot multiply BF16 matrices.
    pub fn from_weights(config: ModelConfig, weights: &impl WeightSource) -> Result<Self> {
        config.validate()?;
        let weights = ComputeWeights::new(weights);

        let embeddings = weights.tensor("tok_embeddings.weight")?;
        check_shape(&embeddings, &[config.vocab_size, config.dim], "tok_embeddings")?;
        let device = embeddings.device().clone();

        let output = weights.tensor("output.weight")?;
        check_shape(&output, &[config.vocab_size, config.dim], "output")?;

        let norm = RmsNorm::new(weights.tensor("norm.weight")?, config.norm_eps)?;
        check_shape(norm.weight(), &[config.dim], "norm")?;

        let layers = (0..config.n_layers)
            .map(|i| DecoderBlock::from_weights(&config, &weights, i))
            .collect::<Result<Vec<_>>>()?;

        let rotary = RotaryTable::new(config.head_dim(), config.rotary_len(), &device)?;

        let cache_bytes: usize = layers.iter().map(|l| l.attention().cache().memory_bytes()).sum();
        tracing::info!(
            layers = config.n_layers,
            dim = config.dim,
            n_heads = config.n_heads,
            n_kv_heads = config.n_kv_heads(),
            vocab_size = config.vocab_size,
            cache_bytes,
            "transformer built"
        );

        Ok(Self {
            tok_embeddings: Embedding::new(embeddings, config.dim),
            layers,
            norm,
            output: Linear::new(output, None),
            rotary,
            device,
            config,
        })
    }

    /// Build the model with random weights (for testing and benchmarks).
    pub fn random(config: ModelConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let weights = random_weights(&config, device)?;
        Self::from_weights(config, &weights)
    }

    /// One decode step.
    ///
    /// # Arguments
    ///
    /// * `tokens` - Token ids [batch, 1], one per batch slot `0..batch`
    /// * `start_pos` - Absolute position of those tokens
    ///
    /// # Returns
    ///
    /// `F32` logits [batch, vocab_size]
    ///
    /// Fails without touching any cache if the sequence length is not 1, the
    /// batch is empty or larger than `max_batch_size`, `start_pos` is not
    /// below `max_seq_len`, or a token id is outside the vocabulary.
    pub fn forward(&mut self, tokens: &Tensor, start_pos: usize) -> Result<Tensor> {
        let (batch, seq_len) = tokens.dims2()?;
        self.check_step(tokens, batch, seq_len, start_pos)?;
        tracing::trace!(batch, start_pos, "decode step");

        let mut h = self.tok_embeddings.forward(tokens)?;
        let rotary = self.rotary.slice(start_pos, seq_len)?;
        for layer in &mut self.layers {
            h = layer.forward(&h, start_pos, &rotary)?;
        }
        let h = self.norm.forward(&h)?;

        let logits = self.output.forward(&h)?.to_dtype(DType::F32)?;
        Ok(logits.squeeze(1)?)
    }

    /// One decode step from a slice of token ids, one per batch slot.
    pub fn forward_tokens(&mut self, tokens: &[u32], start_pos: usize) -> Result<Tensor> {
        let tokens = Tensor::new(tokens, &self.device)?.unsqueeze(1)?;
        self.forward(&tokens, start_pos)
    }

    fn check_step(&self, tokens: &Tensor, batch: usize, seq_len: usize, start_pos: usize) -> Result<()> {
        if seq_len != 1 {
            return Err(RotorError::SeqLenNotOne(seq_len));
        }
        if batch == 0 {
            return Err(RotorError::EmptyBatch);
        }
        if batch > self.config.max_batch_size {
            return Err(RotorError::BatchTooLarge {
                batch,
                max_batch_size: self.config.max_batch_size,
            });
        }
        if start_pos >= self.config.max_seq_len {
            return Err(RotorError::PositionOutOfRange {
                start: start_pos,
                end: start_pos.saturating_add(seq_len),
                capacity: self.config.max_seq_len,
            });
        }
        let ids: Vec<u32> = tokens.to_dtype(DType::U32)?.flatten_all()?.to_vec1()?;
        if let Some(&token) = ids.iter().find(|&&t| t as usize >= self.config.vocab_size) {
            return Err(RotorError::TokenOutOfRange {
                token,
                vocab_size: self.config.vocab_size,
            });
        }
        Ok(())
    }

    /// Get model configuration.
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Get device.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Number of decoder blocks.
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Decoder blocks in application order.
    pub fn layers(&self) -> &[DecoderBlock] {
        &self.layers
    }

    /// The shared rotary table.
    pub fn rotary(&self) -> &RotaryTable {
        &self.rotary
    }
}

impl std::fmt::Debug for Transformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transformer")
            .field("config", &self.config)
            .field("device", &self.device)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attention::grouped_attention;
    use crate::model::apply_rotary;
    use std::collections::HashMap;

    fn config() -> ModelConfig {
        ModelConfig {
            dim: 32,
            n_layers: 2,
            n_heads: 4,
            n_kv_heads: Some(2),
            vocab_size: 50,
            multiple_of: 16,
            ffn_dim_multiplier: None,
            norm_eps: 1e-5,
            max_batch_size: 2,
            max_seq_len: 8,
        }
    }

    /// Larger-than-default weights so attention is far from uniform.
    fn weights(config: &ModelConfig) -> HashMap<String, Tensor> {
        random_weights(config, &Device::Cpu)
            .unwrap()
            .into_iter()
            .map(|(name, t)| {
                let t = if name.contains("norm") { t } else { (t * 25.0).unwrap() };
                (name, t)
            })
            .collect()
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar()
            .unwrap()
    }

    /// Logits for the last token, recomputed over the whole context with no
    /// cache: every block sees all positions, query `p` attends to `[0, p]`.
    fn full_context_logits(model: &Transformer, tokens: &[u32]) -> Tensor {
        let n = tokens.len();
        let ids = Tensor::new(tokens, &Device::Cpu).unwrap().unsqueeze(0).unwrap();
        let rotary = model.rotary.slice(0, n).unwrap();

        let mut h = model.tok_embeddings.forward(&ids).unwrap();
        for block in model.layers() {
            let attn = block.attention();
            let normed = block.attention_norm().forward(&h).unwrap();
            let (q, k, v) = attn.project(&normed).unwrap();
            let q = apply_rotary(&q, &rotary).unwrap();
            let k = apply_rotary(&k, &rotary).unwrap();

            let rows: Vec<Tensor> = (0..n)
                .map(|p| {
                    grouped_attention(
                        &q.narrow(1, p, 1).unwrap(),
                        &k.narrow(1, 0, p + 1).unwrap(),
                        &v.narrow(1, 0, p + 1).unwrap(),
                    )
                    .unwrap()
                })
                .collect();
            let attn_out = attn.output(&Tensor::cat(&rows, 1).unwrap()).unwrap();
            h = (&h + attn_out).unwrap();

            let normed = block.ffn_norm().forward(&h).unwrap();
            h = (&h + block.feed_forward().forward(&normed).unwrap()).unwrap();
        }

        let last = model.norm.forward(&h.narrow(1, n - 1, 1).unwrap()).unwrap();
        model.output.forward(&last).unwrap().squeeze(1).unwrap()
    }

    #[test]
    fn model_creation() {
        let model = Transformer::random(config(), &Device::Cpu).unwrap();
        assert_eq!(model.num_layers(), 2);
        assert_eq!(model.rotary().len(), 16);
        assert_eq!(model.rotary().head_dim(), 8);
        assert!(format!("{model:?}").contains("Transformer"));
    }

    #[test]
    fn invalid_config_refused() {
        let bad = ModelConfig {
            n_kv_heads: Some(3),
            ..config()
        };
        let result = Transformer::random(bad, &Device::Cpu);
        assert!(matches!(result, Err(RotorError::InvalidConfig(_))));
    }

    #[test]
    fn logits_shape_and_dtype() {
        let mut model = Transformer::random(config(), &Device::Cpu).unwrap();
        let logits = model.forward_tokens(&[3, 7], 0).unwrap();
        assert_eq!(logits.dims(), &[2, 50]);
        assert_eq!(logits.dtype(), DType::F32);
    }

    #[test]
    fn incremental_matches_full_context() {
        let c = config();
        let w = weights(&c);
        let mut model = Transformer::from_weights(c, &w).unwrap();

        let tokens = [4u32, 17, 9, 42, 0, 33];
        let mut last = None;
        for (pos, &token) in tokens.iter().enumerate() {
            last = Some(model.forward_tokens(&[token], pos).unwrap());
        }

        let expected = full_context_logits(&model, &tokens);
        let diff = max_abs_diff(&last.unwrap(), &expected);
        assert!(diff < 1e-3, "diff {diff}");
    }

    #[test]
    fn identical_weights_identical_logits() {
        let c = config();
        let w = weights(&c);
        let mut a = Transformer::from_weights(c.clone(), &w).unwrap();
        let mut b = Transformer::from_weights(c, &w).unwrap();

        for (pos, token) in [1u32, 2, 3].into_iter().enumerate() {
            let la = a.forward_tokens(&[token], pos).unwrap();
            let lb = b.forward_tokens(&[token], pos).unwrap();
            assert_eq!(max_abs_diff(&la, &lb), 0.0);
        }
    }

    #[test]
    fn batch_slots_decode_independently() {
        let c = config();
        let w = weights(&c);
        let mut batched = Transformer::from_weights(c.clone(), &w).unwrap();
        let mut single = Transformer::from_weights(c, &w).unwrap();

        let mut batched_last = None;
        let mut single_last = None;
        for (pos, (a, b)) in [(5u32, 11u32), (6, 12), (7, 13)].into_iter().enumerate() {
            batched_last = Some(batched.forward_tokens(&[a, b], pos).unwrap());
            single_last = Some(single.forward_tokens(&[b], pos).unwrap());
        }

        let slot1 = batched_last.unwrap().narrow(0, 1, 1).unwrap();
        assert!(max_abs_diff(&slot1, &single_last.unwrap()) < 1e-4);
    }

    #[test]
    fn rejects_two_tokens_per_slot() {
        let mut model = Transformer::random(config(), &Device::Cpu).unwrap();
        let tokens = Tensor::new(&[[3u32, 7]], &Device::Cpu).unwrap();
        assert!(matches!(
            model.forward(&tokens, 0),
            Err(RotorError::SeqLenNotOne(2))
        ));
    }

    #[test]
    fn rejects_bad_steps() {
        let mut model = Transformer::random(config(), &Device::Cpu).unwrap();

        assert!(matches!(
            model.forward_tokens(&[1, 2, 3], 0),
            Err(RotorError::BatchTooLarge { batch: 3, max_batch_size: 2 })
        ));
        assert!(matches!(
            model.forward_tokens(&[], 0),
            Err(RotorError::EmptyBatch)
        ));
        assert!(matches!(
            model.forward_tokens(&[1], 8),
            Err(RotorError::PositionOutOfRange { start: 8, capacity: 8, .. })
        ));
        assert!(matches!(
            model.forward_tokens(&[50], 0),
            Err(RotorError::TokenOutOfRange { token: 50, vocab_size: 50 })
        ));
        assert!(model.forward_tokens(&[1], 7).is_ok());
    }

    #[test]
    fn rejected_step_leaves_cache_untouched() {
        let c = config();
        let w = weights(&c);
        let mut rejected = Transformer::from_weights(c.clone(), &w).unwrap();
        let mut clean = Transformer::from_weights(c, &w).unwrap();

        rejected.forward_tokens(&[2], 0).unwrap();
        clean.forward_tokens(&[2], 0).unwrap();

        assert!(rejected.forward_tokens(&[99], 1).is_err());
        assert!(rejected.forward_tokens(&[1, 2, 3], 1).is_err());

        for (p, q) in rejected.layers().iter().zip(clean.layers()) {
            let (pk, pv) = p.attention().cache().read(0..2, 2).unwrap();
            let (qk, qv) = q.attention().cache().read(0..2, 2).unwrap();
            assert_eq!(max_abs_diff(&pk, &qk), 0.0);
            assert_eq!(max_abs_diff(&pv, &qv), 0.0);
        }

        let a = rejected.forward_tokens(&[8], 1).unwrap();
        let b = clean.forward_tokens(&[8], 1).unwrap();
        assert_eq!(max_abs_diff(&a, &b), 0.0);
    }

    #[test]
    fn bf16_weights_give_f32_logits() {
        let c = config();
        let full = weights(&c);
        let w: HashMap<String, Tensor> = full
            .iter()
            .map(|(name, t)| (name.clone(), t.to_dtype(DType::BF16).unwrap()))
            .collect();
        let mut model = Transformer::from_weights(c.clone(), &w).unwrap();

        // The CPU computes BF16 checkpoints in F32.
        assert_eq!(model.layers()[0].attention().cache().dtype(), DType::F32);
        assert_eq!(model.layers()[0].attention().dtype(), DType::F32);
        let logits = model.forward_tokens(&[1, 2], 0).unwrap();
        assert_eq!(logits.dtype(), DType::F32);
        assert_eq!(logits.dims(), &[2, 50]);

        // Same values as the F32 model fed the rounded weights.
        let rounded: HashMap<String, Tensor> = w
            .iter()
            .map(|(name, t)| (name.clone(), t.to_dtype(DType::F32).unwrap()))
            .collect();
        let mut reference = Transformer::from_weights(c, &rounded).unwrap();
        let expected = reference.forward_tokens(&[1, 2], 0).unwrap();
        assert_eq!(max_abs_diff(&logits, &expected), 0.0);
    }

    #[test]
    fn huge_position_rejected() {
        let mut model = Transformer::random(config(), &Device::Cpu).unwrap();
        assert!(matches!(
            model.forward_tokens(&[1], usize::MAX),
            Err(RotorError::PositionOutOfRange { start: usize::MAX, end: usize::MAX, capacity: 8 })
        ));
    }
}
