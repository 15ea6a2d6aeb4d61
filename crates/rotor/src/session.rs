//! Decode session over a single model.

use anyhow::{bail, Context, Result};
use candle_core::{Device, Tensor};
use parking_lot::Mutex;
use rotor_core::model::{ModelConfig, Transformer, WeightLoader};
use rotor_core::RotorError;
use std::path::PathBuf;

/// Where the session's weights come from.
#[derive(Debug, Clone)]
enum WeightsFrom {
    /// A `.safetensors` file or a directory of them.
    Path(PathBuf),
    /// Randomly initialised weights.
    Random,
}

/// Builder for creating a [`Session`].
pub struct SessionBuilder {
    config: Option<ModelConfig>,
    config_path: Option<PathBuf>,
    weights: Option<WeightsFrom>,
    device: Device,
}

impl SessionBuilder {
    /// Create a new session builder.
    pub fn new() -> Self {
        Self {
            config: None,
            config_path: None,
            weights: None,
            device: Device::Cpu,
        }
    }

    /// Set model configuration directly.
    pub fn config(mut self, config: ModelConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Read the model configuration from a `params.json` file.
    ///
    /// Ignored when [`config`](Self::config) is also set.
    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Load weights from a `.safetensors` file or a directory of them.
    pub fn weights_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.weights = Some(WeightsFrom::Path(path.into()));
        self
    }

    /// Use randomly initialised weights.
    pub fn random_weights(mut self) -> Self {
        self.weights = Some(WeightsFrom::Random);
        self
    }

    /// Set the device weights and caches live on.
    pub fn device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Build the session.
    pub fn build(self) -> Result<Session> {
        let config = match (self.config, &self.config_path) {
            (Some(config), _) => config,
            (None, Some(path)) => ModelConfig::from_file(path)
                .with_context(|| format!("reading model config {}", path.display()))?,
            (None, None) => ModelConfig::default(),
        };

        let model = match self.weights {
            Some(WeightsFrom::Path(path)) => {
                let loader = if path.is_dir() {
                    WeightLoader::from_dir(&path, &self.device)
                } else {
                    WeightLoader::from_file(&path, &self.device)
                }
                .with_context(|| format!("loading weights from {}", path.display()))?;
                Transformer::from_weights(config, &loader)?
            }
            Some(WeightsFrom::Random) => Transformer::random(config, &self.device)?,
            None => bail!("no weights given: call weights_path or random_weights"),
        };

        tracing::info!(
            max_seq_len = model.config().max_seq_len,
            max_batch_size = model.config().max_batch_size,
            "session ready"
        );

        Ok(Session {
            state: Mutex::new(State { model, position: 0 }),
        })
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct State {
    model: Transformer,
    position: usize,
}

impl State {
    fn step(&mut self, tokens: &[u32]) -> Result<Tensor> {
        let logits = self.model.forward_tokens(tokens, self.position)?;
        self.position += 1;
        Ok(logits)
    }

    fn remaining(&self) -> usize {
        self.model.config().max_seq_len - self.position
    }
}

/// A decoding session.
///
/// Steps are serialized through a lock, and the session tracks the absolute
/// position of the next step so callers never pass it by hand.
pub struct Session {
    state: Mutex<State>,
}

impl Session {
    /// Create a new session builder.
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    /// Run one decode step at the current position, one token per batch slot.
    ///
    /// Returns `F32` logits [batch, vocab_size]. The position only advances
    /// when the step succeeds.
    pub fn step(&self, tokens: &[u32]) -> Result<Tensor> {
        self.state.lock().step(tokens)
    }

    /// Feed a single-sequence prompt token by token, returning the logits
    /// after its last token.
    ///
    /// The whole prompt runs under one lock. A prompt that does not fit in the
    /// remaining positions, or holds a token outside the vocabulary, is
    /// rejected before any step runs.
    pub fn feed(&self, prompt: &[u32]) -> Result<Tensor> {
        let Some((&last, rest)) = prompt.split_last() else {
            bail!("empty prompt");
        };
        let mut state = self.state.lock();

        let remaining = state.remaining();
        if prompt.len() > remaining {
            return Err(RotorError::PositionOutOfRange {
                start: state.position,
                end: state.position + prompt.len(),
                capacity: state.model.config().max_seq_len,
            }
            .into());
        }
        let vocab_size = state.model.config().vocab_size;
        if let Some(&token) = prompt.iter().find(|&&t| t as usize >= vocab_size) {
            return Err(RotorError::TokenOutOfRange { token, vocab_size }.into());
        }

        tracing::debug!(tokens = prompt.len(), start = state.position, "feeding prompt");
        for &token in rest {
            state.step(&[token])?;
        }
        state.step(&[last])
    }

    /// Position the next step will be decoded at.
    pub fn position(&self) -> usize {
        self.state.lock().position
    }

    /// Number of steps left before the cache is full.
    pub fn remaining(&self) -> usize {
        self.state.lock().remaining()
    }

    /// Rewind to position 0.
    ///
    /// Cached entries are left in place; later steps overwrite them, and no
    /// step reads past its own position.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        tracing::debug!(from = state.position, "session reset");
        state.position = 0;
    }

    /// Model configuration.
    pub fn config(&self) -> ModelConfig {
        self.state.lock().model.config().clone()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Session")
            .field("model", &state.model)
            .field("position", &state.position)
            .finish()
    }
}
