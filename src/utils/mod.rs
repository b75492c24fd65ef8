use burn::prelude::*;

pub mod rms_norm;
pub mod softplus;

/// Returns `true` when every element of `t` is finite.
///
/// `x - x` is zero for finite values and NaN for infinities or NaNs, so the sum
/// is finite only when all elements are. Costs a single scalar read-back.
pub fn all_finite<B: Backend, const D: usize>(t: &Tensor<B, D>) -> bool {
    let probe: f32 = (t.clone() - t.clone()).sum().into_scalar().elem();
    probe.is_finite()
}

/// Index of the first non-finite element of `t`, in row-major order.
///
/// Reads the whole tensor back, so only call it after [`all_finite`] failed.
pub fn first_non_finite<B: Backend, const D: usize>(t: Tensor<B, D>) -> Option<[usize; D]> {
    let dims = t.dims();
    let data = t.into_data();
    let flat = data.iter::<f32>().position(|v| !v.is_finite())?;

    let mut idx = [0; D];
    let mut rem = flat;
    for axis in (0..D).rev() {
        idx[axis] = rem % dims[axis];
        rem /= dims[axis];
    }
    Some(idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray;

    #[test]
    fn finite_probe_detects_inf_and_nan() {
        let device = Default::default();
        let ok = Tensor::<B, 2>::from_floats([[1.0, -2.0], [3.5, 0.0]], &device);
        assert!(all_finite(&ok));

        let inf = Tensor::<B, 2>::from_floats([[1.0, f32::INFINITY], [3.5, 0.0]], &device);
        assert!(!all_finite(&inf));

        let nan = Tensor::<B, 2>::from_floats([[1.0, 2.0], [f32::NAN, 0.0]], &device);
        assert!(!all_finite(&nan));
    }

    #[test]
    fn locates_first_non_finite() {
        let device = Default::default();
        let t = Tensor::<B, 3>::from_floats(
            [[[0.0, 1.0], [2.0, 3.0]], [[4.0, f32::NEG_INFINITY], [f32::NAN, 7.0]]],
            &device,
        );
        assert_eq!(first_non_finite(t), Some([1, 0, 1]));

        let clean = Tensor::<B, 1>::from_floats([0.0, 1.0], &device);
        assert_eq!(first_non_finite(clean), None);
    }
}
