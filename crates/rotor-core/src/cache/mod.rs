//! Fixed-capacity KV cache.
//!
//! Each attention layer owns one [`KvCache`]: a key buffer and a value buffer
//! shaped `[max_batch_size, max_seq_len, num_kv_heads, head_dim]`, allocated
//! up front and never resized. A decode step writes its new keys and values
//! at an absolute position and then reads the whole history up to and
//! including that position.
//!
//! The cache is never cleared. Starting a new sequence at position 0 simply
//! overwrites old entries, and reads never look past the position just
//! written.
//!
//! # Example
//!
//! ```rust
//! use candle_core::{DType, Device, Tensor};
//! use rotor_core::cache::{KvCache, KvCacheConfig};
//!
//! let config = KvCacheConfig {
//!     max_batch_size: 2,
//!     max_seq_len: 16,
//!     num_kv_heads: 4,
//!     head_dim: 8,
//! };
//! let mut cache = KvCache::new(config, DType::F32, &Device::Cpu).unwrap();
//!
//! let k = Tensor::ones((2, 1, 4, 8), DType::F32, &Device::Cpu).unwrap();
//! let v = Tensor::zeros((2, 1, 4, 8), DType::F32, &Device::Cpu).unwrap();
//! cache.write(0..2, 0, &k, &v).unwrap();
//!
//! let (keys, values) = cache.read(0..2, 1).unwrap();
//! assert_eq!(keys.dims(), &[2, 1, 4, 8]);
//! assert_eq!(values.dims(), &[2, 1, 4, 8]);
//! ```

use crate::error::{Result, RotorError};
use crate::model::ModelConfig;
use candle_core::{DType, Device, Tensor};
use std::ops::Range;

/// KV Cache configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvCacheConfig {
    /// Number of batch slots.
    pub max_batch_size: usize,
    /// Number of positions per slot.
    pub max_seq_len: usize,
    /// Number of KV heads.
    pub num_kv_heads: usize,
    /// Head dimension.
    pub head_dim: usize,
}

impl From<&ModelConfig> for KvCacheConfig {
    fn from(config: &ModelConfig) -> Self {
        Self {
            max_batch_size: config.max_batch_size,
            max_seq_len: config.max_seq_len,
            num_kv_heads: config.n_kv_heads(),
            head_dim: config.head_dim(),
        }
    }
}

/// Key/value history for one attention layer.
#[derive(Debug)]
pub struct KvCache {
    /// Cached keys: [max_batch_size, max_seq_len, num_kv_heads, head_dim]
    keys: Tensor,
    /// Cached values: [max_batch_size, max_seq_len, num_kv_heads, head_dim]
    values: Tensor,
    config: KvCacheConfig,
}

impl KvCache {
    /// Allocate zeroed key and value buffers.
    pub fn new(config: KvCacheConfig, dtype: DType, device: &Device) -> Result<Self> {
        let shape = (
            config.max_batch_size,
            config.max_seq_len,
            config.num_kv_heads,
            config.head_dim,
        );
        Ok(Self {
            keys: Tensor::zeros(shape, dtype, device)?,
            values: Tensor::zeros(shape, dtype, device)?,
            config,
        })
    }

    /// Overwrite `[slots, pos..pos + seq_len]` with `keys` and `values`.
    ///
    /// Both inputs must be shaped [slots.len(), seq_len, num_kv_heads, head_dim].
    /// The buffers are updated in place.
    pub fn write(
        &mut self,
        slots: Range<usize>,
        pos: usize,
        keys: &Tensor,
        values: &Tensor,
    ) -> Result<()> {
        self.check_slots(&slots)?;
        let (batch, seq_len, heads, head_dim) = keys.dims4()?;
        let expected = [slots.len(), seq_len, self.config.num_kv_heads, self.config.head_dim];
        if [batch, seq_len, heads, head_dim] != expected || values.dims() != expected {
            return Err(RotorError::ShapeMismatch(format!(
                "cache write expects {:?}, got keys {:?} values {:?}",
                expected,
                keys.dims(),
                values.dims()
            )));
        }
        let end = pos.saturating_add(seq_len);
        if end > self.config.max_seq_len {
            return Err(RotorError::PositionOutOfRange {
                start: pos,
                end,
                capacity: self.config.max_seq_len,
            });
        }

        let dtype = self.keys.dtype();
        let keys = keys.to_dtype(dtype)?.contiguous()?;
        let values = values.to_dtype(dtype)?.contiguous()?;

        // Narrowing the leading axis keeps the view contiguous and sharing
        // storage with the full buffer, so slice_set lands in place.
        self.keys
            .narrow(0, slots.start, slots.len())?
            .slice_set(&keys, 1, pos)?;
        self.values
            .narrow(0, slots.start, slots.len())?
            .slice_set(&values, 1, pos)?;

        tracing::trace!(
            slots = ?slots,
            pos,
            seq_len,
            "kv cache write"
        );
        Ok(())
    }

    /// Keys and values for positions `[0, upto)` of the given slots.
    ///
    /// Returns owned copies shaped [slots.len(), upto, num_kv_heads, head_dim];
    /// later writes do not alter them.
    pub fn read(&self, slots: Range<usize>, upto: usize) -> Result<(Tensor, Tensor)> {
        self.check_slots(&slots)?;
        if upto == 0 || upto > self.config.max_seq_len {
            return Err(RotorError::PositionOutOfRange {
                start: 0,
                end: upto,
                capacity: self.config.max_seq_len,
            });
        }
        let keys = self
            .keys
            .narrow(0, slots.start, slots.len())?
            .narrow(1, 0, upto)?
            .force_contiguous()?;
        let values = self
            .values
            .narrow(0, slots.start, slots.len())?
            .narrow(1, 0, upto)?
            .force_contiguous()?;
        Ok((keys, values))
    }

    fn check_slots(&self, slots: &Range<usize>) -> Result<()> {
        if slots.is_empty() {
            return Err(RotorError::EmptyBatch);
        }
        if slots.end > self.config.max_batch_size {
            return Err(RotorError::BatchTooLarge {
                batch: slots.end,
                max_batch_size: self.config.max_batch_size,
            });
        }
        Ok(())
    }

    /// Get the cache configuration.
    pub fn config(&self) -> &KvCacheConfig {
        &self.config
    }

    /// Number of batch slots.
    pub fn max_batch_size(&self) -> usize {
        self.config.max_batch_size
    }

    /// Number of positions per slot.
    pub fn max_seq_len(&self) -> usize {
        self.config.max_seq_len
    }

    /// Number of KV heads.
    pub fn num_kv_heads(&self) -> usize {
        self.config.num_kv_heads
    }

    /// Head dimension.
    pub fn head_dim(&self) -> usize {
        self.config.head_dim
    }

    /// Element type of the buffers.
    pub fn dtype(&self) -> DType {
        self.keys.dtype()
    }

    /// Bytes held by the key and value buffers together.
    pub fn memory_bytes(&self) -> usize {
        2 * self.keys.elem_count() * self.keys.dtype().size_in_bytes()
    }
}
