//! Root Mean Square Layer Normalization.
//!
//! RMSNorm is a simpler alternative to LayerNorm that only
//! normalizes by the root mean square, without centering.
//!
//! # Formula
//!
//! `RMSNorm(x) = x * weight / sqrt(mean(x^2) + eps)`
//!
//! # Reference
//!
//! [Root Mean Square Layer Normalization](https://arxiv.org/abs/1910.07467)

use crate::error::{Result, RotorError};
use candle_core::{DType, Device, Tensor, D};

/// RMS Layer Normalization.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    /// Learnable scale parameter.
    weight: Tensor,
    /// Small constant for numerical stability.
    eps: f64,
    /// Hidden dimension.
    hidden_size: usize,
}

impl RmsNorm {
    /// Create a new RMSNorm layer with given weight.
    pub fn new(weight: Tensor, eps: f64) -> Result<Self> {
        let hidden_size = match weight.dims() {
            [n] => *n,
            other => {
                return Err(RotorError::ShapeMismatch(format!(
                    "norm weight must be 1-D, got {other:?}"
                )))
            }
        };
        Ok(Self {
            weight,
            eps,
            hidden_size,
        })
    }

    /// Create a new RMSNorm layer with ones (for testing).
    pub fn ones(hidden_size: usize, eps: f64, device: &Device) -> Result<Self> {
        let weight = Tensor::ones(hidden_size, DType::F32, device)?;
        Self::new(weight, eps)
    }

    /// Forward pass.
    ///
    /// The statistics are accumulated in `F32` whatever the input dtype;
    /// the normalized value is cast back before the scale is applied.
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor [..., hidden_size]
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        let x32 = x.to_dtype(DType::F32)?;

        let mean_sq = x32.sqr()?.mean_keepdim(D::Minus1)?;
        let rsqrt = (mean_sq + self.eps)?.sqrt()?.recip()?;
        let normalized = x32.broadcast_mul(&rsqrt)?.to_dtype(dtype)?;

        Ok(normalized.broadcast_mul(&self.weight.to_dtype(dtype)?)?)
    }

    /// Get the hidden size.
    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Get epsilon value.
    pub fn eps(&self) -> f64 {
        self.eps
    }

    /// Get the weight tensor.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }
}
