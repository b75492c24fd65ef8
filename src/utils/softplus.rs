use burn::prelude::*;

/// Applies the SoftPlus function element-wise.
///
/// The SoftPlus function is a smooth approximation of the ReLU function.
/// The output is strictly positive for every finite input.
pub fn softplus<const D: usize, B: Backend>(x: Tensor<B, D>) -> Tensor<B, D> {
    // log(e^x + 1) overflows for large x, so rewrite it as
    // max(a,b) = (a + b + |a-b|)/2
    // softplus = max(x, 0) + log(e^-|x| + 1)
    //          = (x + |x|) / 2 + log(e^-|x| + 1)
    let xabs = x.clone().abs();
    (x + xabs.clone()) / 2. + xabs.neg().exp().log1p()
}

/// Below this, `1 - e^-y` is evaluated from its series.
const SERIES_BELOW: f64 = 1e-2;

/// Inverse of [`softplus`], defined for strictly positive inputs.
///
/// `softplus⁻¹(y) = y + log(-expm1(-y))`
pub fn inverse_softplus<const D: usize, B: Backend>(y: Tensor<B, D>) -> Tensor<B, D> {
    // -expm1(-y) = 1 - e^-y cancels catastrophically for small y, where
    // y - y²/2 + y³/6 is within y⁴/24 of it
    let direct = y.clone().neg().exp().neg() + 1.;
    let series = {
        let inner = y.clone() / -6. + 0.5;
        let inner = (y.clone() * inner).neg() + 1.;
        y.clone() * inner
    };
    let small = y.clone().lower_elem(SERIES_BELOW);
    let neg_expm1 = direct.mask_where(small, series);
    y + neg_expm1.log()
}
