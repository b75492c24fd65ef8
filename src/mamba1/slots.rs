//! The single walk over every model parameter.
//!
//! Each parameter is visited with its checkpoint key (without the `backbone.` prefix),
//! its layout in the checkpoint and whether weight decay applies to it. Both the weight
//! import and the weight-decay grouping are built on this walk.

use crate::error::Result;
use crate::mamba1::params::Decay;
use crate::mamba1::{Mamba1, Mamba1Layer, Mamba1Network};
use crate::utils::rms_norm::RmsNorm;
use burn::module::Param;
use burn::nn::Linear;
use burn::nn::conv::Conv1d;
use burn::prelude::*;

/// A visited parameter.
pub(crate) enum Slot<'a, B: Backend> {
    Rank1(&'a mut Param<Tensor<B, 1>>),
    Rank2 {
        param: &'a mut Param<Tensor<B, 2>>,
        /// Stored as (out, in) in the checkpoints.
        transposed: bool,
    },
    Rank3(&'a mut Param<Tensor<B, 3>>),
}

pub(crate) type SlotVisitor<'f, B> = dyn FnMut(String, Decay, Slot<'_, B>) -> Result<()> + 'f;

pub(crate) trait VisitSlots<B: Backend> {
    fn visit_slots(&mut self, key: &str, f: &mut SlotVisitor<'_, B>) -> Result<()>;
}

impl<B: Backend> VisitSlots<B> for Linear<B> {
    fn visit_slots(&mut self, key: &str, f: &mut SlotVisitor<'_, B>) -> Result<()> {
        f(
            format!("{key}.weight"),
            Decay::Eligible,
            Slot::Rank2 {
                param: &mut self.weight,
                transposed: true,
            },
        )?;
        if let Some(bias) = &mut self.bias {
            f(format!("{key}.bias"), Decay::Eligible, Slot::Rank1(bias))?;
        }
        Ok(())
    }
}

impl<B: Backend> VisitSlots<B> for Conv1d<B> {
    fn visit_slots(&mut self, key: &str, f: &mut SlotVisitor<'_, B>) -> Result<()> {
        // (d_inner, 1, d_conv) in both layouts
        f(
            format!("{key}.weight"),
            Decay::Eligible,
            Slot::Rank3(&mut self.weight),
        )?;
        if let Some(bias) = &mut self.bias {
            f(format!("{key}.bias"), Decay::Eligible, Slot::Rank1(bias))?;
        }
        Ok(())
    }
}

impl<B: Backend> VisitSlots<B> for RmsNorm<B> {
    fn visit_slots(&mut self, key: &str, f: &mut SlotVisitor<'_, B>) -> Result<()> {
        f(
            format!("{key}.weight"),
            Decay::Eligible,
            Slot::Rank1(&mut self.gamma),
        )
    }
}

impl<B: Backend> VisitSlots<B> for Mamba1<B> {
    fn visit_slots(&mut self, key: &str, f: &mut SlotVisitor<'_, B>) -> Result<()> {
        self.in_proj.visit_slots(&format!("{key}.in_proj"), f)?;
        self.conv1d.visit_slots(&format!("{key}.conv1d"), f)?;
        self.projector
            .x_proj
            .visit_slots(&format!("{key}.x_proj"), f)?;
        self.projector
            .dt_proj
            .visit_slots(&format!("{key}.dt_proj"), f)?;
        // the continuous decay and the skip scale are never decayed
        f(
            format!("{key}.A_log"),
            Decay::Exempt,
            Slot::Rank2 {
                param: &mut self.a_log,
                transposed: false,
            },
        )?;
        f(format!("{key}.D"), Decay::Exempt, Slot::Rank1(&mut self.d))?;
        self.out_proj.visit_slots(&format!("{key}.out_proj"), f)
    }
}

impl<B: Backend> VisitSlots<B> for Mamba1Layer<B> {
    fn visit_slots(&mut self, key: &str, f: &mut SlotVisitor<'_, B>) -> Result<()> {
        self.norm.visit_slots(&format!("{key}.norm"), f)?;
        self.mamba_block.visit_slots(&format!("{key}.mixer"), f)
    }
}

impl<B: Backend> VisitSlots<B> for Mamba1Network<B> {
    fn visit_slots(&mut self, _key: &str, f: &mut SlotVisitor<'_, B>) -> Result<()> {
        // the tied output head has no parameter of its own
        f(
            "embedding.weight".to_string(),
            Decay::Eligible,
            Slot::Rank2 {
                param: &mut self.embedding.weight,
                transposed: false,
            },
        )?;
        for (i, layer) in self.layers.iter_mut().enumerate() {
            layer.visit_slots(&format!("layers.{i}"), f)?;
        }
        self.norm_f.visit_slots("norm_f", f)
    }
}
