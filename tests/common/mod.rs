//! Shared helpers for integration tests.
#![allow(dead_code)]

use burn::backend::Autodiff;
use burn::backend::ndarray::{NdArray, NdArrayDevice};
use burn::prelude::*;
use burn_mamba_lm::mamba1::{Mamba1Config, Mamba1NetworkConfig};

pub type TestBackend = NdArray;
pub type TestAutodiffBackend = Autodiff<NdArray>;

pub fn test_device() -> NdArrayDevice {
    NdArrayDevice::Cpu
}

/// D=16, N=8, 2 layers, vocab 1024, D_inner=32, conv width 4.
pub fn test_model_config() -> Mamba1NetworkConfig {
    Mamba1NetworkConfig::new(
        2,
        1024,
        Mamba1Config::new(16)
            .with_d_state(8)
            .with_d_inner(Some(32))
            .with_d_conv(4),
    )
}

/// A smaller model for tests that run backward passes.
pub fn tiny_model_config() -> Mamba1NetworkConfig {
    Mamba1NetworkConfig::new(
        2,
        32,
        Mamba1Config::new(8).with_d_state(4).with_d_conv(3),
    )
}

pub fn ids<B: Backend>(rows: &[&[i32]], device: &B::Device) -> Tensor<B, 2, Int> {
    let batch = rows.len();
    let sequence = rows.first().map_or(0, |r| r.len());
    let flat: Vec<i32> = rows.iter().flat_map(|r| r.iter().copied()).collect();
    Tensor::from_data(TensorData::new(flat, [batch, sequence]), device)
}

pub fn to_vec<B: Backend, const D: usize>(t: Tensor<B, D>) -> Vec<f32> {
    t.into_data().convert::<f32>().to_vec::<f32>().unwrap()
}

pub fn assert_close(a: &[f32], b: &[f32], tol: f32) {
    assert_eq!(a.len(), b.len(), "length mismatch");
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        let scale = x.abs().max(y.abs()).max(1.0);
        assert!(
            (x - y).abs() <= tol * scale,
            "mismatch at {i}: {x} vs {y} (tolerance {tol})"
        );
    }
}
