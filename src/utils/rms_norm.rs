use burn::module::Param;
use burn::nn::Initializer;
use burn::prelude::*;

#[derive(Config, Debug)]
pub struct RmsNormConfig {
    /// Width of each token.
    pub d_model: usize,
    /// Added to the mean square before the square root, keeps all-zero tokens finite.
    #[config(default = 1e-5)]
    pub epsilon: f64,
}

impl RmsNormConfig {
    /// Returns the initialized model, with a unit scale.
    pub fn init<B: Backend>(&self, device: &B::Device) -> RmsNorm<B> {
        RmsNorm {
            gamma: Initializer::Ones.init([self.d_model], device),
            epsilon: self.epsilon,
        }
    }
}

/// Per-token root mean square normalization with a learned scale.
///
/// `y = x / sqrt(mean(x²) + ε) · γ`
///
/// Unlike layer norm there is no centering and no learned shift.
#[derive(Module, Debug)]
pub struct RmsNorm<B: Backend> {
    /// Dims: [d_model].
    pub gamma: Param<Tensor<B, 1>>,
    pub epsilon: f64,
}

impl<B: Backend> RmsNorm<B> {
    /// Normalizes along the last axis; every other axis is treated as a token index.
    ///
    /// # Shapes
    ///   - Input [..., d_model]
    ///   - Output [..., d_model]
    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        let dims = x.dims();
        debug_assert_eq!([dims[D - 1]], self.gamma.dims());

        let mean_square = x.clone().powi_scalar(2).mean_dim(D - 1);
        let inv_rms = (mean_square + self.epsilon).sqrt().recip();

        x * inv_rms.expand(dims) * self.gamma.val().unsqueeze()
    }
}
