//! Weight-decay grouping of the model parameters.
//!
//! Each parameter's [`Decay`] is declared once, next to the parameter, in the walk that
//! also drives the weight import. Optimizer integrations read the groups through their
//! [`ParamId`]s and never look at names.

use crate::mamba1::Mamba1Network;
use crate::mamba1::import::hf_key_to_module_path;
use crate::mamba1::slots::{Slot, VisitSlots};
use burn::module::{Param, ParamId};
use burn::prelude::*;

/// Whether weight decay applies to a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decay {
    Eligible,
    Exempt,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamEntry {
    pub id: ParamId,
    /// Module path, for display only.
    pub path: String,
    /// Tensor rank, needed to move the gradient between gradient sets.
    pub rank: usize,
    pub num_elements: usize,
}

/// Partition of every float parameter into decay-eligible and decay-exempt sets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamGroups {
    pub decay: Vec<ParamEntry>,
    pub no_decay: Vec<ParamEntry>,
}

impl ParamGroups {
    /// Adds a parameter, e.g. one owned by a wrapper around the network.
    pub fn push<B: Backend, const D: usize>(
        &mut self,
        path: impl Into<String>,
        param: &Param<Tensor<B, D>>,
        decay: Decay,
    ) {
        let entry = ParamEntry {
            id: param.id,
            path: path.into(),
            rank: D,
            num_elements: param.shape().num_elements(),
        };
        match decay {
            Decay::Eligible => self.decay.push(entry),
            Decay::Exempt => self.no_decay.push(entry),
        }
    }

    pub fn is_exempt(&self, id: &ParamId) -> bool {
        self.no_decay.iter().any(|e| &e.id == id)
    }

    pub fn len(&self) -> usize {
        self.decay.len() + self.no_decay.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_elements(&self) -> usize {
        self.decay
            .iter()
            .chain(self.no_decay.iter())
            .map(|e| e.num_elements)
            .sum()
    }
}

impl<B: Backend> Mamba1Network<B> {
    /// The decay-eligible and decay-exempt parameters.
    ///
    /// The exempt set is exactly `a_log` and `d` of every layer. The tied output head
    /// has no parameter of its own.
    pub fn param_groups(&self) -> ParamGroups {
        let mut groups = ParamGroups::default();
        // clones share the tensor storage, the walk only reads ids and shapes
        let mut model = self.clone();
        let visited = model.visit_slots("", &mut |key, decay, slot| {
            let path = hf_key_to_module_path(&key).unwrap_or(key);
            match slot {
                Slot::Rank1(param) => groups.push(path, &*param, decay),
                Slot::Rank2 { param, .. } => groups.push(path, &*param, decay),
                Slot::Rank3(param) => groups.push(path, &*param, decay),
            }
            Ok(())
        });
        debug_assert!(visited.is_ok());
        groups
    }
}
