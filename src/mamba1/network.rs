//! Token embedding, a stack of residual Mamba1 layers, and the tied output head.
//!
//! References:
//! - https://github.com/huggingface/candle/blob/fd7c8565646039e35925b8730d27ddad195d7e73/candle-examples/examples/mamba-minimal/
//! - https://github.com/johnma2006/mamba-minimal/blob/61f01953ca153f8c4a850d7111beecbf4be9cee1/

use crate::error::MambaError;
use crate::mamba1::{Mamba1Config, Mamba1Layer, Mamba1LayerConfig};
use crate::utils::rms_norm::{RmsNorm, RmsNormConfig};
use burn::nn::{Embedding, EmbeddingConfig, Initializer, Linear};
use burn::prelude::*;

#[derive(Module, Debug)]
pub struct Mamba1Network<B: Backend> {
    /// The output head re-utilizes the transposed `embedding` weight.
    pub embedding: Embedding<B>,
    pub layers: Vec<Mamba1Layer<B>>,
    pub norm_f: RmsNorm<B>,
    /// Unpadded vocabulary size, every input id must be below it.
    pub vocab_size: usize,
}

#[derive(Config, Debug)]
pub struct Mamba1NetworkConfig {
    pub n_layer: usize,

    /// Number of real tokens. Input ids must lie in `[0, vocab_size)`.
    pub vocab_size: usize,

    /// The embedding table (and so the logits) is rounded up to a multiple of this.
    ///
    /// `1` disables padding.
    #[config(default = 1)]
    pub pad_vocab_size_multiple: usize,

    pub mamba_block: Mamba1Config,

    #[config(default = 1e-5)]
    pub norm_epsilon: f64,
}

impl Mamba1NetworkConfig {
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.n_layer == 0 {
            return Err(MambaError::config("n_layer must be positive"));
        }
        if self.vocab_size == 0 {
            return Err(MambaError::config("vocab_size must be positive"));
        }
        if self.pad_vocab_size_multiple == 0 {
            return Err(MambaError::config("pad_vocab_size_multiple must be positive"));
        }
        if !(self.norm_epsilon >= 0.) {
            return Err(MambaError::config(format!(
                "norm_epsilon must be non-negative, got {}",
                self.norm_epsilon
            )));
        }
        self.mamba_block.validate()
    }

    /// Reads a json config file and validates it.
    ///
    /// Unknown enum variants and missing fields are reported as configuration errors.
    pub fn load_validated(path: impl AsRef<std::path::Path>) -> crate::error::Result<Self> {
        let path = path.as_ref();
        let config = Self::load(path)
            .map_err(|e| MambaError::config(format!("failed to load {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a json config and validates it.
    pub fn from_json(json: &str) -> crate::error::Result<Self> {
        let config = Self::load_binary(json.as_bytes())
            .map_err(|e| MambaError::config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn padded_vocab_size(&self) -> usize {
        self.vocab_size.div_ceil(self.pad_vocab_size_multiple) * self.pad_vocab_size_multiple
    }

    /// Validates the config and returns the initialized model.
    pub fn try_init<B: Backend>(&self, device: &B::Device) -> crate::error::Result<Mamba1Network<B>> {
        self.validate()?;
        Ok(self.init(device))
    }

    /// Returns the initialized model.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Mamba1Network<B> {
        let layer_config =
            Mamba1LayerConfig::new(self.mamba_block.clone()).with_norm_epsilon(self.norm_epsilon);
        let mut layers = Vec::with_capacity(self.n_layer);
        for _ in 0..self.n_layer {
            let layer = layer_config.init_rescaled(self.n_layer, device);
            layers.push(layer);
        }

        let padded_vocab_size = self.padded_vocab_size();
        let d_model = self.mamba_block.d_model;

        let network = Mamba1Network {
            embedding: EmbeddingConfig::new(padded_vocab_size, d_model)
                .with_initializer(Initializer::Normal {
                    mean: 0.,
                    std: 0.02,
                })
                .init(device),
            layers,
            norm_f: RmsNormConfig::new(d_model)
                .with_epsilon(self.norm_epsilon)
                .init(device),
            vocab_size: self.vocab_size,
        };
        tracing::debug!(
            n_layer = self.n_layer,
            d_model,
            padded_vocab_size,
            num_params = network.num_params(),
            "initialized mamba1 network"
        );
        network
    }
}

impl<B: Backend> Mamba1Network<B> {
    /// # Shapes
    ///   - Input [batch, sequence]
    ///   - Output [batch, sequence, padded_vocab]
    pub fn forward(&self, x: Tensor<B, 2, Int>) -> crate::error::Result<Tensor<B, 3>> {
        let [batch, sequence] = x.dims();
        let [padded_vocab, d_model] = self.embedding.weight.dims();

        if batch == 0 || sequence == 0 {
            return Ok(Tensor::zeros([batch, sequence, padded_vocab], &x.device()));
        }
        self.check_ids(&x)?;

        let mut x = self.embedding.forward(x);
        debug_assert_eq!([batch, sequence, d_model], x.dims());

        for (i, layer) in self.layers.iter().enumerate() {
            x = layer.forward(x).map_err(|e| e.in_layer(i))?;
        }

        let x = self.norm_f.forward(x);
        let x = self.lm_head().forward(x);
        debug_assert_eq!([batch, sequence, padded_vocab], x.dims());

        Ok(x)
    }

    /// The output projection, tied to the embedding.
    ///
    /// Both share the same parameter (and id), so gradients from both use sites
    /// accumulate into the embedding weight.
    pub fn lm_head(&self) -> Linear<B> {
        let [padded_vocab, d_model] = self.embedding.weight.dims();
        let weight = self.embedding.weight.clone().map(|w| w.swap_dims(0, 1));
        debug_assert_eq!([d_model, padded_vocab], weight.dims());
        Linear { weight, bias: None }
    }

    fn check_ids(&self, x: &Tensor<B, 2, Int>) -> crate::error::Result<()> {
        let min: i64 = x.clone().min().into_scalar().elem();
        let max: i64 = x.clone().max().into_scalar().elem();
        if min < 0 || max >= self.vocab_size as i64 {
            let bad = if min < 0 { min } else { max };
            return Err(MambaError::input(format!(
                "token id {bad} is outside the vocabulary [0, {})",
                self.vocab_size
            )));
        }
        Ok(())
    }
}
