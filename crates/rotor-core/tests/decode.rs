//! End-to-end decode steps on a model small enough to check by hand.
//!
//! Weights are chosen so every intermediate value is known:
//! - token 3 embeds to all ones, token 7 to `[1, -1, 1, -1, ...]`, both with
//!   RMS 1, so the norms leave them unchanged
//! - `wq` and `wk` are zero, so attention weights are uniform over the cache
//! - `wv` keeps the first four coordinates (one KV head of dim 4), shared by
//!   both query heads; `wo` is the identity
//! - the feed-forward weights are zero, so only residuals pass through it
//! - `output` copies the eight hidden coordinates into logits 0..8

use candle_core::{DType, Device, Tensor};
use rotor_core::model::{ModelConfig, Transformer};
use rotor_core::RotorError;
use std::collections::HashMap;

fn config() -> ModelConfig {
    ModelConfig {
        dim: 8,
        n_layers: 1,
        n_heads: 2,
        n_kv_heads: Some(1),
        vocab_size: 10,
        multiple_of: 4,
        ffn_dim_multiplier: None,
        norm_eps: 1e-6,
        max_batch_size: 1,
        max_seq_len: 4,
    }
}

fn matrix(rows: usize, cols: usize, f: impl Fn(usize, usize) -> f32) -> Tensor {
    let data: Vec<f32> = (0..rows * cols).map(|i| f(i / cols, i % cols)).collect();
    Tensor::from_vec(data, (rows, cols), &Device::Cpu).unwrap()
}

fn hand_weights(config: &ModelConfig) -> HashMap<String, Tensor> {
    let dim = config.dim;
    let hidden = config.ffn_hidden_dim();
    let eye = |r: usize, c: usize| if r == c { 1.0 } else { 0.0 };
    let zeros = |rows: usize, cols: usize| Tensor::zeros((rows, cols), DType::F32, &Device::Cpu).unwrap();
    let ones = || Tensor::ones(dim, DType::F32, &Device::Cpu).unwrap();

    let embed = matrix(config.vocab_size, dim, |token, c| match token {
        3 => 1.0,
        7 if c % 2 == 0 => 1.0,
        7 => -1.0,
        _ => 0.0,
    });

    let mut w = HashMap::new();
    w.insert("tok_embeddings.weight".to_string(), embed);
    w.insert("layers.0.attention.wq.weight".to_string(), zeros(dim, dim));
    w.insert("layers.0.attention.wk.weight".to_string(), zeros(4, dim));
    w.insert("layers.0.attention.wv.weight".to_string(), matrix(4, dim, eye));
    w.insert("layers.0.attention.wo.weight".to_string(), matrix(dim, dim, eye));
    w.insert("layers.0.feed_forward.w1.weight".to_string(), zeros(hidden, dim));
    w.insert("layers.0.feed_forward.w2.weight".to_string(), zeros(dim, hidden));
    w.insert("layers.0.feed_forward.w3.weight".to_string(), zeros(hidden, dim));
    w.insert("layers.0.attention_norm.weight".to_string(), ones());
    w.insert("layers.0.ffn_norm.weight".to_string(), ones());
    w.insert("norm.weight".to_string(), ones());
    w.insert("output.weight".to_string(), matrix(config.vocab_size, dim, eye));
    w
}

fn assert_close(got: &[f32], want: &[f32]) {
    assert_eq!(got.len(), want.len());
    for (i, (g, w)) in got.iter().zip(want).enumerate() {
        assert!((g - w).abs() < 1e-4, "logit {i}: got {g}, want {w}");
    }
}

fn logits_row(logits: &Tensor) -> Vec<f32> {
    let rows: Vec<Vec<f32>> = logits.to_vec2().unwrap();
    assert_eq!(rows.len(), 1);
    rows.into_iter().next().unwrap()
}

#[test]
fn two_steps_attend_over_both_positions() {
    let config = config();
    assert_eq!(config.ffn_hidden_dim(), 24);
    let mut model = Transformer::from_weights(config.clone(), &hand_weights(&config)).unwrap();

    // Step 1: only position 0 is cached, so attention returns v0 = [1, 1, 1, 1]
    // for both heads; h = 2 * ones, which normalizes back to ones.
    let logits = model.forward_tokens(&[3], 0).unwrap();
    assert_eq!(logits.dims(), &[1, 10]);
    assert_close(
        &logits_row(&logits),
        &[1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 0.0, 0.0],
    );

    // Step 2: uniform weights over v0 and v1 = [1, -1, 1, -1] give [1, 0, 1, 0]
    // per head. h = x + [1, 0, 1, 0, ...] = [2, -1, 2, -1, ...] with RMS sqrt(2.5).
    let logits = model.forward_tokens(&[7], 1).unwrap();
    assert_eq!(logits.dims(), &[1, 10]);
    let a = 2.0 / 2.5f32.sqrt();
    let b = -1.0 / 2.5f32.sqrt();
    assert_close(&logits_row(&logits), &[a, b, a, b, a, b, a, b, 0.0, 0.0]);
}

#[test]
fn history_changes_the_second_step() {
    let config = config();
    let weights = hand_weights(&config);

    // Without position 0 in the cache, token 7 attends to itself (and the
    // zero-initialised slot 0), which yields a different result.
    let mut model = Transformer::from_weights(config.clone(), &weights).unwrap();
    model.forward_tokens(&[3], 0).unwrap();
    let with_history = logits_row(&model.forward_tokens(&[7], 1).unwrap());

    let mut fresh = Transformer::from_weights(config, &weights).unwrap();
    let without_history = logits_row(&fresh.forward_tokens(&[7], 1).unwrap());

    assert!((with_history[1] - without_history[1]).abs() > 0.1);
}

#[test]
fn two_token_step_rejected() {
    let config = config();
    let mut model = Transformer::from_weights(config.clone(), &hand_weights(&config)).unwrap();

    let tokens = Tensor::new(&[[3u32, 7]], &Device::Cpu).unwrap();
    let result = model.forward(&tokens, 0);
    assert!(matches!(result, Err(RotorError::SeqLenNotOne(2))));
}

#[test]
fn position_past_cache_rejected() {
    let config = config();
    let mut model = Transformer::from_weights(config.clone(), &hand_weights(&config)).unwrap();

    for pos in 0..4 {
        model.forward_tokens(&[3], pos).unwrap();
    }
    let result = model.forward_tokens(&[3], 4);
    assert!(matches!(result, Err(RotorError::PositionOutOfRange { .. })));
}
