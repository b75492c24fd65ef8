//! Loading reference checkpoint weights (`state-spaces/mamba-*`) into a [`Mamba1Network`].
//!
//! Checkpoint keys are renamed into module paths as follows, where the `backbone.` prefix
//! is optional:
//!
//! | checkpoint key                          | module path                               | transposed |
//! |-----------------------------------------|-------------------------------------------|------------|
//! | `backbone.embedding.weight`             | `embedding.weight`                        |            |
//! | `backbone.layers.{i}.norm.weight`       | `layers.{i}.norm.gamma`                   |            |
//! | `backbone.layers.{i}.mixer.in_proj.*`   | `layers.{i}.mamba_block.in_proj.*`        | weight     |
//! | `backbone.layers.{i}.mixer.conv1d.*`    | `layers.{i}.mamba_block.conv1d.*`         |            |
//! | `backbone.layers.{i}.mixer.x_proj.*`    | `layers.{i}.mamba_block.projector.x_proj.*`  | weight  |
//! | `backbone.layers.{i}.mixer.dt_proj.*`   | `layers.{i}.mamba_block.projector.dt_proj.*` | weight  |
//! | `backbone.layers.{i}.mixer.A_log`       | `layers.{i}.mamba_block.a_log`            |            |
//! | `backbone.layers.{i}.mixer.D`           | `layers.{i}.mamba_block.d`                |            |
//! | `backbone.layers.{i}.mixer.out_proj.*`  | `layers.{i}.mamba_block.out_proj.*`       | weight     |
//! | `backbone.norm_f.weight`                | `norm_f.gamma`                            |            |
//! | `lm_head.weight`                        | (tied to `embedding.weight`)              |            |
//!
//! Linear weights are stored as (out, in) in the checkpoints and as (in, out) in burn.

use crate::error::{MambaError, Result};
use crate::mamba1::Mamba1Network;
use crate::mamba1::slots::{Slot, VisitSlots};
use burn::module::Param;
use burn::prelude::*;
use burn::tensor::{bf16, f16};
use safetensors::{Dtype, SafeTensors};
use std::collections::HashMap;

/// Checkpoint key of the (tied) output head.
pub const LM_HEAD_KEY: &str = "lm_head.weight";

/// Maps a checkpoint key into the module path it loads into.
///
/// Returns `None` for keys that have no counterpart, including [`LM_HEAD_KEY`].
pub fn hf_key_to_module_path(key: &str) -> Option<String> {
    let key = key.strip_prefix("backbone.").unwrap_or(key);
    match key {
        "embedding.weight" => return Some(key.to_string()),
        "norm_f.weight" => return Some("norm_f.gamma".to_string()),
        _ => {}
    }

    let rest = key.strip_prefix("layers.")?;
    let (idx, rest) = rest.split_once('.')?;
    let idx: usize = idx.parse().ok()?;

    let path = match rest {
        "norm.weight" => "norm.gamma".to_string(),
        "mixer.A_log" => "mamba_block.a_log".to_string(),
        "mixer.D" => "mamba_block.d".to_string(),
        _ => {
            let (module, tensor) = rest.strip_prefix("mixer.")?.split_once('.')?;
            if !matches!(tensor, "weight" | "bias") {
                return None;
            }
            match module {
                "in_proj" | "conv1d" | "out_proj" => format!("mamba_block.{module}.{tensor}"),
                "x_proj" | "dt_proj" => format!("mamba_block.projector.{module}.{tensor}"),
                _ => return None,
            }
        }
    };
    Some(format!("layers.{idx}.{path}"))
}

/// Decodes a safetensors blob into `f32` tensor data, by checkpoint key.
pub fn read_safetensors(bytes: &[u8]) -> Result<HashMap<String, TensorData>> {
    let tensors = SafeTensors::deserialize(bytes)
        .map_err(|e| MambaError::import("<safetensors>", e.to_string()))?;

    let mut weights = HashMap::new();
    for (key, view) in tensors.tensors() {
        let data = view.data();
        let values: Vec<f32> = match view.dtype() {
            Dtype::F32 => data
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
            Dtype::F16 => data
                .chunks_exact(2)
                .map(|b| f16::from_le_bytes([b[0], b[1]]).to_f32())
                .collect(),
            Dtype::BF16 => data
                .chunks_exact(2)
                .map(|b| bf16::from_le_bytes([b[0], b[1]]).to_f32())
                .collect(),
            other => {
                return Err(MambaError::import(
                    key,
                    format!("unsupported dtype {other:?}"),
                ));
            }
        };
        let shape = view.shape().to_vec();
        weights.insert(key, TensorData::new(values, shape));
    }
    Ok(weights)
}

/// Replaces the parameter value, keeping its id.
fn load_into<B: Backend, const D: usize>(
    key: &str,
    param: &mut Param<Tensor<B, D>>,
    data: TensorData,
    transposed: bool,
) -> Result<()> {
    let expected = {
        let mut dims = param.dims().to_vec();
        if transposed {
            dims.reverse();
        }
        dims
    };
    if data.shape != expected {
        return Err(MambaError::import(
            key,
            format!("expected shape {expected:?}, got {:?}", data.shape),
        ));
    }
    let device = param.device();
    let mut tensor = Tensor::<B, D>::from_data(data, &device);
    if transposed {
        tensor = tensor.swap_dims(0, 1);
    }
    *param = Param::initialized(param.id, tensor.require_grad());
    Ok(())
}

fn export_from<B: Backend, const D: usize>(
    param: &Param<Tensor<B, D>>,
    transposed: bool,
) -> TensorData {
    let tensor = param.val();
    let tensor = if transposed {
        tensor.swap_dims(0, 1)
    } else {
        tensor
    };
    tensor.into_data().convert::<f32>()
}

impl<B: Backend> Mamba1Network<B> {
    /// Loads every parameter from checkpoint tensors keyed as described in the [module docs](self).
    ///
    /// Fails on missing keys, on keys without a counterpart and on shape mismatches.
    pub fn import_weights(mut self, weights: HashMap<String, TensorData>) -> Result<Self> {
        let mut lm_head = None;
        let mut pending: HashMap<String, (String, TensorData)> = HashMap::new();
        for (key, data) in weights {
            if key == LM_HEAD_KEY {
                lm_head = Some(data);
                continue;
            }
            let Some(path) = hf_key_to_module_path(&key) else {
                return Err(MambaError::import(key, "no matching parameter"));
            };
            let stripped = key.strip_prefix("backbone.").unwrap_or(&key).to_string();
            if let Some((previous, _)) = pending.insert(stripped, (key.clone(), data)) {
                return Err(MambaError::import(
                    key,
                    format!("loads into `{path}`, which `{previous}` already does"),
                ));
            }
        }

        if let Some(lm_head) = lm_head {
            let expected = self.embedding.weight.dims().to_vec();
            if lm_head.shape != expected {
                return Err(MambaError::import(
                    LM_HEAD_KEY,
                    format!(
                        "the head is tied to the embedding of shape {expected:?}, got {:?}",
                        lm_head.shape
                    ),
                ));
            }
        }

        let mut loaded = 0;
        self.visit_slots("", &mut |key, _decay, slot| {
            let Some((source_key, data)) = pending.remove(&key) else {
                return Err(MambaError::import(key, "missing from the checkpoint"));
            };
            match slot {
                Slot::Rank1(param) => load_into(&source_key, param, data, false)?,
                Slot::Rank2 { param, transposed } => {
                    load_into(&source_key, param, data, transposed)?
                }
                Slot::Rank3(param) => load_into(&source_key, param, data, false)?,
            }
            loaded += 1;
            Ok(())
        })?;

        if let Some((source_key, _)) = pending.into_values().next() {
            return Err(MambaError::import(
                source_key,
                "the model has no such parameter (check the bias flags)",
            ));
        }

        tracing::info!(loaded, "imported weights");
        Ok(self)
    }

    /// Exports every parameter with its checkpoint key (prefixed by `backbone.`).
    ///
    /// The output of this can be loaded back with [`Self::import_weights`].
    pub fn export_weights(&self) -> HashMap<String, TensorData> {
        let mut weights = HashMap::new();
        let mut model = self.clone();
        let visited = model.visit_slots("", &mut |key, _decay, slot| {
            let data = match slot {
                Slot::Rank1(param) => export_from(param, false),
                Slot::Rank2 { param, transposed } => export_from(param, transposed),
                Slot::Rank3(param) => export_from(param, false),
            };
            weights.insert(format!("backbone.{key}"), data);
            Ok(())
        });
        debug_assert!(visited.is_ok());
        weights
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renames_mixer_keys() {
        assert_eq!(
            hf_key_to_module_path("backbone.layers.3.mixer.A_log").as_deref(),
            Some("layers.3.mamba_block.a_log")
        );
        assert_eq!(
            hf_key_to_module_path("backbone.layers.0.mixer.D").as_deref(),
            Some("layers.0.mamba_block.d")
        );
        assert_eq!(
            hf_key_to_module_path("backbone.layers.11.mixer.x_proj.weight").as_deref(),
            Some("layers.11.mamba_block.projector.x_proj.weight")
        );
        assert_eq!(
            hf_key_to_module_path("layers.1.mixer.conv1d.bias").as_deref(),
            Some("layers.1.mamba_block.conv1d.bias")
        );
        assert_eq!(
            hf_key_to_module_path("backbone.layers.2.norm.weight").as_deref(),
            Some("layers.2.norm.gamma")
        );
        assert_eq!(
            hf_key_to_module_path("backbone.norm_f.weight").as_deref(),
            Some("norm_f.gamma")
        );
        assert_eq!(
            hf_key_to_module_path("backbone.embedding.weight").as_deref(),
            Some("embedding.weight")
        );
    }

    #[test]
    fn rejects_unknown_keys() {
        assert_eq!(hf_key_to_module_path(LM_HEAD_KEY), None);
        assert_eq!(hf_key_to_module_path("backbone.layers.x.mixer.D"), None);
        assert_eq!(hf_key_to_module_path("backbone.layers.0.mixer.A"), None);
        assert_eq!(hf_key_to_module_path("backbone.layers.0.mixer.in_proj.scale"), None);
        assert_eq!(hf_key_to_module_path("backbone.layers.0.mixer.z_proj.weight"), None);
    }

    #[test]
    fn decodes_half_precision_safetensors() {
        let values = [f16::from_f32(1.5), f16::from_f32(-2.0)];
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let view = safetensors::tensor::TensorView::new(Dtype::F16, vec![2, 1], &bytes).unwrap();
        let blob = safetensors::serialize(vec![("backbone.layers.0.mixer.D", view)], &None).unwrap();

        let weights = read_safetensors(&blob).unwrap();
        let data = &weights["backbone.layers.0.mixer.D"];
        assert_eq!(vec![2, 1], data.shape);
        assert_eq!(vec![1.5f32, -2.0], data.to_vec::<f32>().unwrap());
    }

    #[test]
    fn rejects_garbage_blob() {
        let err = read_safetensors(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, MambaError::WeightImport { .. }));
    }
}
