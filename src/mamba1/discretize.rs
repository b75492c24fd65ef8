//! Continuous-to-discrete conversion of the diagonal state space system.
//!
//! See Section 2 Equation 4 in the Mamba paper.

use burn::prelude::*;

/// Below this magnitude of `∆A` the exact zero-order hold input coupling
/// `(exp(∆A) - 1) / ∆A` is replaced by its Taylor series.
pub const ZOH_TAYLOR_THRESHOLD: f64 = 1e-1;

/// How the input coupling `B` is discretized.
///
/// `A` is always discretized with zero-order hold: `Ā = exp(∆A)`.
#[derive(
    Module, Default, Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize,
)]
pub enum Discretization {
    /// `B̄x = ∆ B x`.
    ///
    /// From a discussion with the Mamba authors:
    /// "A is the more important term and the performance doesn't change much with the simplification on B"
    #[default]
    Euler,
    /// `B̄x = (exp(∆A) - 1) / ∆A · ∆ B x`.
    ///
    /// The factor has a removable singularity at `∆A = 0` (where it equals 1). For
    /// `|∆A| < ZOH_TAYLOR_THRESHOLD` it is evaluated as `1 + z/2 + z²/6 + z³/24 + z⁴/120`,
    /// whose truncation error there is below `1.5e-8`.
    ZeroOrderHold,
}

/// Discretized transition and already input-multiplied coupling.
#[derive(Debug, Clone)]
pub struct Discretized<B: Backend> {
    /// `Ā = exp(∆A)`, every element in `(0, 1]`.
    ///
    /// # Shape
    /// [batch, sequence, d_inner, d_state]
    pub a_bar: Tensor<B, 4>,
    /// `B̄x`.
    ///
    /// # Shape
    /// [batch, sequence, d_inner, d_state]
    pub b_bar_x: Tensor<B, 4>,
}

impl Discretization {
    /// Discretizes the continuous parameters (A, B) for every step.
    ///
    /// `delta` must be strictly positive and `a` strictly negative.
    ///
    /// # Shapes
    ///   - Input delta [batch, sequence, d_inner]
    ///   - Input a [d_inner, d_state]
    ///   - Input b [batch, sequence, d_state]
    ///   - Input u [batch, sequence, d_inner]
    ///   - Output [batch, sequence, d_inner, d_state] (both tensors)
    pub fn discretize<B: Backend>(
        &self,
        delta: Tensor<B, 3>,
        a: Tensor<B, 2>,
        b: Tensor<B, 3>,
        u: Tensor<B, 3>,
    ) -> Discretized<B> {
        let [batch, sequence, d_inner] = delta.dims();
        let [_d_inner, d_state] = a.dims();
        debug_assert_eq!([d_inner, d_state], a.dims());
        debug_assert_eq!([batch, sequence, d_state], b.dims());
        debug_assert_eq!([batch, sequence, d_inner], u.dims());
        let outer_shape = [batch, sequence, d_inner, d_state];

        let delta = delta.unsqueeze_dim(3);
        debug_assert_eq!([batch, sequence, d_inner, 1], delta.dims());
        let delta = delta.expand(outer_shape);

        let a = a.unsqueeze_dims(&[0, 1]);
        debug_assert_eq!([1, 1, d_inner, d_state], a.dims());
        let a = a.expand(outer_shape);

        let delta_a = delta.clone() * a;
        debug_assert_eq!(outer_shape, delta_a.dims());
        let a_bar = delta_a.clone().exp();

        let b = b.unsqueeze_dim(2);
        debug_assert_eq!([batch, sequence, 1, d_state], b.dims());
        let b = b.expand(outer_shape);

        let u = u.unsqueeze_dim(3);
        debug_assert_eq!([batch, sequence, d_inner, 1], u.dims());
        let u = u.expand(outer_shape);

        let delta_bu = delta * b * u;
        debug_assert_eq!(outer_shape, delta_bu.dims());

        let b_bar_x = match self {
            Discretization::Euler => delta_bu,
            Discretization::ZeroOrderHold => zoh_factor(delta_a) * delta_bu,
        };

        Discretized { a_bar, b_bar_x }
    }
}

/// `(exp(z) - 1) / z`, continuous at `z = 0`.
pub fn zoh_factor<B: Backend, const D: usize>(z: Tensor<B, D>) -> Tensor<B, D> {
    let small = z.clone().abs().lower_elem(ZOH_TAYLOR_THRESHOLD);

    // keep the division away from zero so that no NaN reaches the gradient of the masked branch
    let z_safe = z.clone().mask_fill(small.clone(), 1.);
    let exact = (z_safe.clone().exp() - 1.) / z_safe;

    let taylor = (((z.clone() / 120. + 1. / 24.) * z.clone() + 1. / 6.) * z.clone() + 0.5)
        * z
        + 1.;

    exact.mask_where(small, taylor)
}
