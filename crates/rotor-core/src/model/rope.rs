//! Rotary Position Embeddings (RoPE).
//!
//! RoPE encodes position by rotating each consecutive coordinate pair
//! `(x[2i], x[2i + 1])` of a query or key head by the angle `p * f_i`, where
//! `p` is the absolute position and `f_i = 10000^(-2i / head_dim)`. Because
//! a dot product of two rotated vectors only depends on the difference of
//! their angles, attention scores depend on relative position.
//!
//! The rotations are stored as real cosine and sine tables rather than
//! complex numbers.
//!
//! # Reference
//!
//! [RoFormer: Enhanced Transformer with Rotary Position Embedding](https://arxiv.org/abs/2104.09864)

use crate::error::{Result, RotorError};
use candle_core::{DType, Device, Tensor, D};

/// Base frequency of the rotation schedule.
pub const ROPE_THETA: f64 = 10000.0;

/// Precomputed rotations for every position up to the table length.
#[derive(Debug, Clone)]
pub struct RotaryTable {
    /// Cosine table: [len, head_dim / 2]
    cos: Tensor,
    /// Sine table: [len, head_dim / 2]
    sin: Tensor,
    /// Head dimension.
    head_dim: usize,
    /// Number of positions in the table.
    len: usize,
}

impl RotaryTable {
    /// Build the table for `len` positions.
    ///
    /// Angles are computed in `f64` on the host, so the table is identical
    /// whatever device or precision the model runs in.
    pub fn new(head_dim: usize, len: usize, device: &Device) -> Result<Self> {
        if head_dim == 0 || head_dim % 2 != 0 {
            return Err(RotorError::InvalidConfig(format!(
                "rotary head_dim must be even and non-zero, got {head_dim}"
            )));
        }
        let half_dim = head_dim / 2;
        let freqs: Vec<f64> = (0..half_dim)
            .map(|i| ROPE_THETA.powf(-2.0 * i as f64 / head_dim as f64))
            .collect();

        let mut cos = Vec::with_capacity(len * half_dim);
        let mut sin = Vec::with_capacity(len * half_dim);
        for p in 0..len {
            for f in &freqs {
                let angle = p as f64 * f;
                cos.push(angle.cos() as f32);
                sin.push(angle.sin() as f32);
            }
        }

        Ok(Self {
            cos: Tensor::from_vec(cos, (len, half_dim), device)?,
            sin: Tensor::from_vec(sin, (len, half_dim), device)?,
            head_dim,
            len,
        })
    }

    /// Rotations for positions `[start, start + len)`.
    pub fn slice(&self, start: usize, len: usize) -> Result<RotarySlice> {
        let end = start.saturating_add(len);
        if end > self.len {
            return Err(RotorError::PositionOutOfRange {
                start,
                end,
                capacity: self.len,
            });
        }
        Ok(RotarySlice {
            cos: self.cos.narrow(0, start, len)?,
            sin: self.sin.narrow(0, start, len)?,
        })
    }

    /// Number of positions in the table.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the table has no positions.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Get the head dimension.
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }
}

/// Rotations for a contiguous run of positions, borrowed per step.
#[derive(Debug, Clone)]
pub struct RotarySlice {
    /// [seq_len, head_dim / 2]
    cos: Tensor,
    /// [seq_len, head_dim / 2]
    sin: Tensor,
}

impl RotarySlice {
    /// Number of positions covered.
    pub fn seq_len(&self) -> usize {
        self.cos.dims()[0]
    }
}

/// Rotate `x` of shape [batch, seq_len, heads, head_dim] pair-wise.
///
/// Every head and batch row at sequence index `s` is rotated by the slice's
/// row `s`. Computed in `F32` and cast back to the input dtype.
pub fn apply_rotary(x: &Tensor, rotary: &RotarySlice) -> Result<Tensor> {
    let (batch, seq_len, heads, head_dim) = x.dims4()?;
    let half_dim = head_dim / 2;
    if head_dim % 2 != 0 || rotary.cos.dims() != [seq_len, half_dim] {
        return Err(RotorError::ShapeMismatch(format!(
            "rotary slice {:?} does not cover input {:?}",
            rotary.cos.dims(),
            x.dims()
        )));
    }

    // [b, s, h, d] -> [b, s, h, d/2, 2]
    let pairs = x
        .to_dtype(DType::F32)?
        .reshape((batch, seq_len, heads, half_dim, 2))?;
    let a = pairs.narrow(D::Minus1, 0, 1)?.squeeze(D::Minus1)?;
    let b = pairs.narrow(D::Minus1, 1, 1)?.squeeze(D::Minus1)?;

    // [s, d/2] -> [1, s, 1, d/2]
    let cos = rotary.cos.reshape((1, seq_len, 1, half_dim))?;
    let sin = rotary.sin.reshape((1, seq_len, 1, half_dim))?;

    // (a + ib)(cos + isin) = (a cos - b sin) + i(a sin + b cos)
    let real = (a.broadcast_mul(&cos)? - b.broadcast_mul(&sin)?)?;
    let imag = (a.broadcast_mul(&sin)? + b.broadcast_mul(&cos)?)?;

    let rotated = Tensor::stack(&[real, imag], D::Minus1)?
        .reshape((batch, seq_len, heads, head_dim))?
        .to_dtype(x.dtype())?;
    Ok(rotated)
}
