use crate::utils::softplus::{inverse_softplus, softplus};
use burn::module::Param;
use burn::nn::{Initializer, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::Distribution;

/// How the weight of the ∆ upscale projection is initialized.
#[derive(
    Module, Default, Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize,
)]
pub enum DtInit {
    /// Every weight is `dt_rank^-0.5 * dt_scale`, equivalent to broadcasting a scalar ∆.
    Constant,
    /// Weights are drawn from `U(-std, std)` with `std = dt_rank^-0.5 * dt_scale`.
    #[default]
    Random,
}

/// Produces the input-dependent ∆, B and C from the activated inner representation.
#[derive(Module, Debug)]
pub struct SelectionProjector<B: Backend> {
    /// Input channel: d_inner.
    /// Output channel: dt_rank + 2 * d_state.
    ///
    /// No bias: the selection vectors are purely data-dependent.
    pub x_proj: Linear<B>,

    /// Input channel: dt_rank.
    /// Output channel: d_inner.
    pub dt_proj: Linear<B>,
}

#[derive(Config, Debug)]
pub struct SelectionProjectorConfig {
    pub d_inner: usize,
    pub d_state: usize,
    pub dt_rank: usize,

    /// Minimum dt value.
    #[config(default = 1e-3)]
    pub dt_min: f64,

    /// Maximum dt value.
    #[config(default = 1e-1)]
    pub dt_max: f64,

    /// Scale for dt initialization.
    #[config(default = 1.)]
    pub dt_scale: f64,

    /// Floor for dt initialization.
    #[config(default = 1e-4)]
    pub dt_init_floor: f64,

    #[config(default = "DtInit::Random")]
    pub dt_init: DtInit,
}

/// The per-step selective parameters.
#[derive(Debug, Clone)]
pub struct Selection<B: Backend> {
    /// Strictly positive step size.
    ///
    /// # Shape
    /// [batch, sequence, d_inner]
    pub delta: Tensor<B, 3>,
    /// Input selection.
    ///
    /// # Shape
    /// [batch, sequence, d_state]
    pub b: Tensor<B, 3>,
    /// Output selection.
    ///
    /// # Shape
    /// [batch, sequence, d_state]
    pub c: Tensor<B, 3>,
}

impl SelectionProjectorConfig {
    /// Returns the initialized model.
    pub fn init<B: Backend>(&self, device: &B::Device) -> SelectionProjector<B> {
        let d_inner = self.d_inner;
        let dt_rank = self.dt_rank;

        let x_proj = {
            // follows PyTorch's default initializer
            let bound = 1.0 / (d_inner as f64).sqrt();
            LinearConfig::new(d_inner, dt_rank + 2 * self.d_state)
                .with_bias(false)
                .with_initializer(Initializer::Uniform {
                    min: -bound,
                    max: bound,
                })
                .init(device)
        };

        let dt_proj = {
            let dt_init_std = (dt_rank as f64).powf(-0.5) * self.dt_scale;
            let weight: Tensor<B, 2> = match self.dt_init {
                DtInit::Constant => Tensor::full([dt_rank, d_inner], dt_init_std, device),
                DtInit::Random => Tensor::random(
                    [dt_rank, d_inner],
                    Distribution::Uniform(-dt_init_std, dt_init_std),
                    device,
                ),
            };
            debug_assert_eq!([dt_rank, d_inner], weight.dims());

            // sample biases such that passing them through a softplus
            // lands them in [dt_min, dt_max], log-uniformly
            let bias: Tensor<B, 1> = {
                let dt = Tensor::random([d_inner], Distribution::Uniform(0.0, 1.0), device)
                    * (f64::ln(self.dt_max) - f64::ln(self.dt_min))
                    + f64::ln(self.dt_min);
                let dt = dt.exp().clamp_min(self.dt_init_floor);
                inverse_softplus(dt)
            };
            debug_assert_eq!([d_inner], bias.dims());

            Linear {
                weight: Param::from_tensor(weight),
                bias: Some(Param::from_tensor(bias)),
            }
        };

        SelectionProjector { x_proj, dt_proj }
    }
}

impl<B: Backend> SelectionProjector<B> {
    /// # Shapes
    ///   - Input u [batch, sequence, d_inner]
    ///   - Output delta [batch, sequence, d_inner]
    ///   - Output b, c [batch, sequence, d_state]
    pub fn forward(&self, u: Tensor<B, 3>) -> Selection<B> {
        let [batch, sequence, d_inner] = u.dims();
        let [dt_rank, _d_inner] = self.dt_proj.weight.dims();
        let [_d_inner, x_proj_out] = self.x_proj.weight.dims();
        let d_state = (x_proj_out - dt_rank) / 2;

        let x_dbl = self.x_proj.forward(u);
        debug_assert_eq!([batch, sequence, dt_rank + 2 * d_state], x_dbl.dims());

        let mut split = x_dbl
            .split_with_sizes(vec![dt_rank, d_state, d_state], 2)
            .into_iter();
        let (Some(delta), Some(b), Some(c)) = (split.next(), split.next(), split.next()) else {
            unreachable!("split_with_sizes returns one tensor per size")
        };
        debug_assert_eq!([batch, sequence, dt_rank], delta.dims());
        debug_assert_eq!([batch, sequence, d_state], b.dims());
        debug_assert_eq!([batch, sequence, d_state], c.dims());

        // ∆ is input-dependent, and projected from dt_rank up to d_inner
        let delta = self.dt_proj.forward(delta);
        debug_assert_eq!([batch, sequence, d_inner], delta.dims());
        let delta = softplus(delta);

        Selection { delta, b, c }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray;

    #[test]
    fn timestep_bias_maps_into_configured_range() {
        let device = Default::default();
        let projector = SelectionProjectorConfig::new(64, 4, 2).init::<B>(&device);

        let bias = projector.dt_proj.bias.as_ref().unwrap().val();
        let dt = softplus(bias).into_data().to_vec::<f32>().unwrap();
        assert!(dt.iter().all(|v| *v >= 1e-3 * 0.99 && *v <= 1e-1 * 1.01));
    }

    #[test]
    fn constant_init_broadcasts_one_weight() {
        let device = Default::default();
        let projector = SelectionProjectorConfig::new(8, 4, 4)
            .with_dt_init(DtInit::Constant)
            .with_dt_scale(2.)
            .init::<B>(&device);

        let w = projector.dt_proj.weight.val().into_data().to_vec::<f32>().unwrap();
        assert!(w.iter().all(|v| (*v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn timestep_is_strictly_positive() {
        let device = Default::default();
        let projector = SelectionProjectorConfig::new(6, 3, 2).init::<B>(&device);
        let u = Tensor::<B, 3>::random([2, 5, 6], Distribution::Normal(0., 10.), &device);

        let selection = projector.forward(u);
        assert_eq!([2, 5, 6], selection.delta.dims());
        assert_eq!([2, 5, 3], selection.b.dims());
        assert_eq!([2, 5, 3], selection.c.dims());
        let delta = selection.delta.into_data().to_vec::<f32>().unwrap();
        assert!(delta.iter().all(|v| *v > 0.0));
    }
}
