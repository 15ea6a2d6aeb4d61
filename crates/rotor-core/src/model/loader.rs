//! Weight providers.
//!
//! The model never reads checkpoints itself; it asks a [`WeightSource`] for
//! tensors by name. Names follow Meta's LLaMA checkpoint layout:
//!
//! - `tok_embeddings.weight` - [vocab_size, dim]
//! - `layers.{i}.attention.{wq,wk,wv,wo}.weight`
//! - `layers.{i}.feed_forward.{w1,w2,w3}.weight`
//! - `layers.{i}.attention_norm.weight`, `layers.{i}.ffn_norm.weight` - [dim]
//! - `norm.weight` - [dim]
//! - `output.weight` - [vocab_size, dim]
//!
//! [`WeightLoader`] serves these from SafeTensors files.
//!
//! # Example
//!
//! ```ignore
//! use rotor_core::model::{ModelConfig, Transformer, WeightLoader};
//!
//! let config = ModelConfig::from_file("/path/to/model/params.json".as_ref())?;
//! let loader = WeightLoader::from_dir("/path/to/model".as_ref(), &Device::Cpu)?;
//! let model = Transformer::from_weights(config, &loader)?;
//! ```

use super::ModelConfig;
use crate::error::{Result, RotorError};
use candle_core::{DType, Device, Tensor};
use safetensors::SafeTensors;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Supplies learned tensors by checkpoint name.
pub trait WeightSource {
    /// Fetch the tensor stored under `name`.
    fn tensor(&self, name: &str) -> Result<Tensor>;
}

impl WeightSource for HashMap<String, Tensor> {
    fn tensor(&self, name: &str) -> Result<Tensor> {
        self.get(name)
            .cloned()
            .ok_or_else(|| RotorError::ModelError(format!("Tensor not found: {}", name)))
    }
}

/// Weight loader for SafeTensors format.
pub struct WeightLoader {
    /// Loaded tensors indexed by name.
    tensors: HashMap<String, Tensor>,
}

impl WeightLoader {
    /// Create a new weight loader from a model directory.
    ///
    /// Loads all .safetensors files in the directory.
    pub fn from_dir(dir: &Path, device: &Device) -> Result<Self> {
        let mut safetensor_files: Vec<PathBuf> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "safetensors") {
                safetensor_files.push(path);
            }
        }

        // Sort for deterministic loading order
        safetensor_files.sort();

        if safetensor_files.is_empty() {
            return Err(RotorError::ModelError(format!(
                "No .safetensors files found in {}",
                dir.display()
            )));
        }

        let mut tensors = HashMap::new();
        for path in &safetensor_files {
            tensors.extend(Self::load_safetensors_file(path, device)?);
        }
        tracing::debug!(
            files = safetensor_files.len(),
            tensors = tensors.len(),
            dir = %dir.display(),
            "loaded weights"
        );

        Ok(Self { tensors })
    }

    /// Create a weight loader from a single file.
    pub fn from_file(path: &Path, device: &Device) -> Result<Self> {
        let tensors = Self::load_safetensors_file(path, device)?;
        tracing::debug!(tensors = tensors.len(), file = %path.display(), "loaded weights");
        Ok(Self { tensors })
    }

    /// Load tensors from a single safetensors file.
    fn load_safetensors_file(path: &Path, device: &Device) -> Result<HashMap<String, Tensor>> {
        let data = fs::read(path)?;
        let safetensors = SafeTensors::deserialize(&data)?;

        safetensors
            .tensors()
            .into_iter()
            .map(|(name, view)| Ok((name, Self::view_to_tensor(&view, device)?)))
            .collect()
    }

    /// Convert a SafeTensors view to a Candle tensor.
    fn view_to_tensor(view: &safetensors::tensor::TensorView, device: &Device) -> Result<Tensor> {
        let dtype = match view.dtype() {
            safetensors::Dtype::F32 => DType::F32,
            safetensors::Dtype::F16 => DType::F16,
            safetensors::Dtype::BF16 => DType::BF16,
            safetensors::Dtype::F64 => DType::F64,
            other => {
                return Err(RotorError::ModelError(format!(
                    "Unsupported weight dtype: {:?}",
                    other
                )));
            }
        };

        // Copies out of the file buffer, so alignment does not matter.
        Ok(Tensor::from_raw_buffer(view.data(), dtype, view.shape(), device)?)
    }

    /// Check if a tensor exists.
    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    /// Get the number of loaded tensors.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Check if no tensors are loaded.
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

impl WeightSource for WeightLoader {
    fn tensor(&self, name: &str) -> Result<Tensor> {
        self.tensors.tensor(name)
    }
}

/// Serves another source's tensors in a dtype their device can compute in.
///
/// candle's CPU backend has no BF16 matmul, so BF16 tensors on the CPU are
/// upcast to F32. Everything else passes through unchanged.
pub(crate) struct ComputeWeights<'a, W: ?Sized> {
    inner: &'a W,
}

impl<'a, W: WeightSource + ?Sized> ComputeWeights<'a, W> {
    pub(crate) fn new(inner: &'a W) -> Self {
        Self { inner }
    }
}

impl<W: WeightSource + ?Sized> WeightSource for ComputeWeights<'_, W> {
    fn tensor(&self, name: &str) -> Result<Tensor> {
        let tensor = self.inner.tensor(name)?;
        if tensor.device().is_cpu() && tensor.dtype() == DType::BF16 {
            return Ok(tensor.to_dtype(DType::F32)?);
        }
        Ok(tensor)
    }
}

/// A full set of randomly initialised weights for `config` (for testing and
/// benchmarking).
///
/// Projections and embeddings are drawn from N(0, 0.02); norm scales are ones.
pub fn random_weights(config: &ModelConfig, device: &Device) -> Result<HashMap<String, Tensor>> {
    let dim = config.dim;
    let q_out = config.n_heads * config.head_dim();
    let kv_out = config.n_kv_heads() * config.head_dim();
    let hidden = config.ffn_hidden_dim();

    let mut shapes = vec![
        ("tok_embeddings.weight".to_string(), (config.vocab_size, dim)),
        ("output.weight".to_string(), (config.vocab_size, dim)),
    ];
    for i in 0..config.n_layers {
        for (name, shape) in [
            ("attention.wq", (q_out, dim)),
            ("attention.wk", (kv_out, dim)),
            ("attention.wv", (kv_out, dim)),
            ("attention.wo", (dim, q_out)),
            ("feed_forward.w1", (hidden, dim)),
            ("feed_forward.w2", (dim, hidden)),
            ("feed_forward.w3", (hidden, dim)),
        ] {
            shapes.push((format!("layers.{i}.{name}.weight"), shape));
        }
    }

    let mut weights = HashMap::new();
    for (name, shape) in shapes {
        weights.insert(name, Tensor::randn(0.0f32, 0.02, shape, device)?);
    }

    let mut norms = vec!["norm.weight".to_string()];
    for i in 0..config.n_layers {
        norms.push(format!("layers.{i}.attention_norm.weight"));
        norms.push(format!("layers.{i}.ffn_norm.weight"));
    }
    for name in norms {
        weights.insert(name, Tensor::ones(dim, DType::F32, device)?);
    }

    Ok(weights)
}

/// Fail with [`RotorError::ShapeMismatch`] unless `tensor` has exactly `expected` dims.
pub(crate) fn check_shape(tensor: &Tensor, expected: &[usize], name: &str) -> Result<()> {
    if tensor.dims() != expected {
        return Err(RotorError::ShapeMismatch(format!(
            "{name}: expected {:?}, got {:?}",
            expected,
            tensor.dims()
        )));
    }
    Ok(())
}
