//! Grouped-query attention kernels.

use crate::error::{Result, RotorError};
use candle_core::{DType, Tensor};

/// Repeat KV heads for GQA.
///
/// `[batch, seq, n_kv_heads, head_dim]` becomes
/// `[batch, seq, n_kv_heads * n_rep, head_dim]`, each KV head repeated
/// `n_rep` times contiguously, so query head `h` reads KV head `h / n_rep`.
pub fn repeat_kv(x: &Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x.clone());
    }
    let (batch, seq_len, n_kv_heads, head_dim) = x.dims4()?;

    // [b, s, kv, d] -> [b, s, kv, 1, d] -> [b, s, kv, rep, d] -> [b, s, kv * rep, d]
    let x = x
        .unsqueeze(3)?
        .broadcast_as((batch, seq_len, n_kv_heads, n_rep, head_dim))?
        .reshape((batch, seq_len, n_kv_heads * n_rep, head_dim))?;
    Ok(x)
}

/// Scaled dot-product attention of every query over every key.
///
/// * `query` - [batch, q_len, n_heads, head_dim]
/// * `keys`, `values` - [batch, kv_len, n_kv_heads, head_dim]
///
/// No mask is applied. Scores are soft-maxed in `F32`. Returns
/// [batch, q_len, n_heads, head_dim] in the query's dtype.
pub fn grouped_attention(query: &Tensor, keys: &Tensor, values: &Tensor) -> Result<Tensor> {
    let (_, _, n_heads, head_dim) = query.dims4()?;
    let (_, _, n_kv_heads, _) = keys.dims4()?;
    if n_kv_heads == 0 || n_heads % n_kv_heads != 0 {
        return Err(RotorError::ShapeMismatch(format!(
            "{n_heads} query heads cannot share {n_kv_heads} kv heads"
        )));
    }
    let n_rep = n_heads / n_kv_heads;

    let keys = repeat_kv(keys, n_rep)?;
    let values = repeat_kv(values, n_rep)?;

    // [b, s, h, d] -> [b, h, s, d]
    let query = query.transpose(1, 2)?.contiguous()?;
    let keys = keys.transpose(1, 2)?.contiguous()?;
    let values = values.transpose(1, 2)?.contiguous()?;

    // [b, h, q, d] @ [b, h, d, kv] -> [b, h, q, kv]
    let scale = 1.0 / (head_dim as f64).sqrt();
    let scores = (query.matmul(&keys.t()?)? * scale)?;
    let probs = candle_nn::ops::softmax_last_dim(&scores.to_dtype(DType::F32)?)?
        .to_dtype(query.dtype())?;

    // [b, h, q, kv] @ [b, h, kv, d] -> [b, h, q, d] -> [b, q, h, d]
    let output = probs.matmul(&values)?.transpose(1, 2)?;
    Ok(output)
}
