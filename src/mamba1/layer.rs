
use crate::mamba1::{Mamba1, Mamba1Config};
use crate::utils::rms_norm::{RmsNorm, RmsNormConfig};
use burn::prelude::*;

/// Pre-norm residual wrapper around a [`Mamba1`] mixer.
#[derive(Module, Debug)]
pub struct Mamba1Layer<B: Backend> {
    pub norm: RmsNorm<B>,
    pub mamba_block: Mamba1<B>,
}

#[derive(Config, Debug)]
pub struct Mamba1LayerConfig {
    pub mamba_block: Mamba1Config,

    #[config(default = 1e-5)]
    pub norm_epsilon: f64,
}

impl Mamba1LayerConfig {
    /// Returns the initialized model.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Mamba1Layer<B> {
        self.init_rescaled(1, device)
    }

    /// Returns the initialized model, as a layer of a stack of `n_layer` layers.
    ///
    /// See [`Mamba1Config::init_rescaled`].
    pub fn init_rescaled<B: Backend>(&self, n_layer: usize, device: &B::Device) -> Mamba1Layer<B> {
        Mamba1Layer {
            norm: RmsNormConfig::new(self.mamba_block.d_model)
                .with_epsilon(self.norm_epsilon)
                .init(device),
            mamba_block: self.mamba_block.init_rescaled(n_layer, device),
        }
    }
}

impl<B: Backend> Mamba1Layer<B> {
    /// `output = mixer(norm(input)) + input`.
    ///
    /// # Shapes
    ///   - Input [batch, sequence, d_model]
    ///   - Output [batch, sequence, d_model]
    pub fn forward(&self, x: Tensor<B, 3>) -> crate::error::Result<Tensor<B, 3>> {
        let [batch, sequence, d_model] = x.dims();

        let res = x.clone();
        let x = self.norm.forward(x);

        let x = self.mamba_block.forward(x)?;
        debug_assert_eq!([batch, sequence, d_model], x.dims());

        Ok(x + res)
    }
}
