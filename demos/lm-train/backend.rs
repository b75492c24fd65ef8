//! Backend selection from the `dev-*` features.

use burn::prelude::*;

#[cfg(feature = "dev-ndarray")]
pub type MainBackend = burn::backend::NdArray<f32, i32>;
#[cfg(all(feature = "dev-wgpu", not(feature = "dev-ndarray")))]
pub type MainBackend = burn::backend::wgpu::Wgpu<f32, i32>;

pub type MainAutoBackend = burn::backend::Autodiff<MainBackend>;

/// Both dev backends train on their default device.
pub fn main_device() -> <MainAutoBackend as Backend>::Device {
    Default::default()
}
