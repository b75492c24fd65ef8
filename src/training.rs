//! Extension point for training loops.
//!
//! A [`TrainingSession`] owns the optimizer state and borrows nothing: the model is handed
//! in by value for each step and handed back updated, which is how burn optimizers work.

use crate::error::MambaError;
use crate::mamba1::{Mamba1Network, ParamEntry, ParamGroups};
use burn::grad_clipping::GradientClippingConfig;
use burn::module::AutodiffModule;
use burn::nn::loss::CrossEntropyLossConfig;
use burn::optim::{AdamW, AdamWConfig, GradientsParams, Optimizer, adaptor::OptimizerAdaptor};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

/// Auxiliary state kept by decorrelation-augmented models.
///
/// Training loops query it through [`LanguageModel::decorrelation`], so the base model
/// does not need to know whether it is wrapped.
pub trait DecorrelationAware {
    /// Called before every forward pass of a training step.
    fn reset_auxiliary_state(&mut self);
    /// Called after the optimizers updated the model.
    fn update_auxiliary_parameters(&mut self);
}

/// A model producing next-token logits.
pub trait LanguageModel<B: Backend> {
    /// # Shapes
    ///   - Input [batch, sequence]
    ///   - Output [batch, sequence, padded_vocab]
    fn logits(&self, ids: Tensor<B, 2, Int>) -> crate::error::Result<Tensor<B, 3>>;

    /// Unpadded vocabulary size.
    fn vocab_size(&self) -> usize;

    fn param_groups(&self) -> ParamGroups;

    /// Capability query for decorrelation-augmented models.
    fn decorrelation(&mut self) -> Option<&mut dyn DecorrelationAware> {
        None
    }
}

impl<B: Backend> LanguageModel<B> for Mamba1Network<B> {
    fn logits(&self, ids: Tensor<B, 2, Int>) -> crate::error::Result<Tensor<B, 3>> {
        self.forward(ids)
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn param_groups(&self) -> ParamGroups {
        Mamba1Network::param_groups(self)
    }
}

#[derive(Config, Debug)]
pub struct TrainingConfig {
    #[config(default = 1e-3)]
    pub lr: f64,

    /// Applied to the decay-eligible group only.
    #[config(default = 0.1)]
    pub weight_decay: f32,

    #[config(default = 0.9)]
    pub adam_beta_1: f32,

    #[config(default = 0.999)]
    pub adam_beta_2: f32,

    #[config(default = 1e-8)]
    pub adam_epsilon: f32,

    /// Maximum l2 norm of each parameter gradient.
    ///
    /// Every parameter gradient is clipped on its own, unlike a single clip over the
    /// norm of all gradients taken together.
    pub gradient_clip: Option<f32>,
}

impl TrainingConfig {
    fn optimizer(&self, weight_decay: f32) -> AdamWConfig {
        AdamWConfig::new()
            .with_beta_1(self.adam_beta_1)
            .with_beta_2(self.adam_beta_2)
            .with_epsilon(self.adam_epsilon)
            .with_weight_decay(weight_decay)
            .with_grad_clipping(self.gradient_clip.map(GradientClippingConfig::Norm))
    }
}

/// What a training step reports.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutput {
    /// Mean next-token cross entropy, before the update.
    pub loss: f32,
    /// Number of completed steps, including this one.
    pub step: usize,
}

/// A failed training step.
///
/// The model is handed back as it was before the step, so the caller can inspect it or
/// keep training from it. Only the decorrelation state may have been reset.
pub struct StepError<M> {
    pub model: M,
    pub error: MambaError,
}

impl<M> std::fmt::Debug for StepError<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepError")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl<M> std::fmt::Display for StepError<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "training step failed: {}", self.error)
    }
}

impl<M> std::error::Error for StepError<M> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl<M> From<StepError<M>> for MambaError {
    fn from(e: StepError<M>) -> Self {
        e.error
    }
}

pub type StepResult<M> = std::result::Result<(M, StepOutput), StepError<M>>;

pub struct TrainingSession<B: AutodiffBackend, M: AutodiffModule<B>> {
    pub config: TrainingConfig,
    decay_optim: OptimizerAdaptor<AdamW, M, B>,
    no_decay_optim: OptimizerAdaptor<AdamW, M, B>,
    step: usize,
}

impl<B, M> TrainingSession<B, M>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + LanguageModel<B>,
{
    pub fn new(config: TrainingConfig) -> Self {
        Self {
            decay_optim: config.optimizer(config.weight_decay).init::<B, M>(),
            no_decay_optim: config.optimizer(0.).init::<B, M>(),
            config,
            step: 0,
        }
    }

    pub fn step(&self) -> usize {
        self.step
    }

    /// Runs one optimization step on next-token prediction.
    ///
    /// `targets[b, l]` is the token expected after `inputs[b, ..=l]`. On failure the
    /// model comes back untouched inside the [`StepError`].
    ///
    /// # Shapes
    ///   - Input inputs [batch, sequence]
    ///   - Input targets [batch, sequence]
    pub fn train_step(
        &mut self,
        mut model: M,
        inputs: Tensor<B, 2, Int>,
        targets: Tensor<B, 2, Int>,
    ) -> StepResult<M> {
        let (loss, loss_value) = match self.loss(&mut model, inputs, targets) {
            Ok(loss) => loss,
            Err(error) => return Err(StepError { model, error }),
        };

        let grads = loss.backward();
        let mut grads = GradientsParams::from_grads(grads, &model);
        let no_decay_grads = split_grads::<B>(&mut grads, &model.param_groups().no_decay);

        let lr = self.config.lr;
        model = self.decay_optim.step(lr, model, grads);
        model = self.no_decay_optim.step(lr, model, no_decay_grads);

        if let Some(decorrelation) = model.decorrelation() {
            decorrelation.update_auxiliary_parameters();
        }

        self.step += 1;
        tracing::debug!(step = self.step, loss = loss_value, "training step");
        Ok((
            model,
            StepOutput {
                loss: loss_value,
                step: self.step,
            },
        ))
    }

    /// Validates the batch and computes the mean next-token cross entropy.
    fn loss(
        &self,
        model: &mut M,
        inputs: Tensor<B, 2, Int>,
        targets: Tensor<B, 2, Int>,
    ) -> crate::error::Result<(Tensor<B, 1>, f32)> {
        let [batch, sequence] = inputs.dims();
        if targets.dims() != [batch, sequence] {
            return Err(MambaError::input(format!(
                "targets shape {:?} does not match inputs shape {:?}",
                targets.dims(),
                [batch, sequence]
            )));
        }
        if batch == 0 || sequence == 0 {
            return Err(MambaError::input("cannot train on an empty batch"));
        }
        let vocab_size = model.vocab_size();
        let max_target: i64 = targets.clone().max().into_scalar().elem();
        let min_target: i64 = targets.clone().min().into_scalar().elem();
        if min_target < 0 || max_target >= vocab_size as i64 {
            return Err(MambaError::input(format!(
                "target ids must lie in [0, {vocab_size}), got [{min_target}, {max_target}]"
            )));
        }

        if let Some(decorrelation) = model.decorrelation() {
            decorrelation.reset_auxiliary_state();
        }

        let logits = model.logits(inputs)?;
        let [_, _, padded_vocab] = logits.dims();
        let device = logits.device();
        let loss = CrossEntropyLossConfig::new().init(&device).forward(
            logits.reshape([batch * sequence, padded_vocab]),
            targets.reshape([batch * sequence]),
        );
        let loss_value: f32 = loss.clone().into_scalar().elem();
        if !loss_value.is_finite() {
            tracing::warn!(step = self.step, loss = loss_value, "non-finite training loss");
            return Err(MambaError::NumericInstability {
                layer: None,
                stage: "loss",
                step: None,
                channel: None,
            });
        }
        Ok((loss, loss_value))
    }
}

/// Moves the gradients of `entries` out of `grads`.
fn split_grads<B: AutodiffBackend>(
    grads: &mut GradientsParams,
    entries: &[ParamEntry],
) -> GradientsParams {
    let mut moved = GradientsParams::new();
    for entry in entries {
        match entry.rank {
            1 => move_grad::<B::InnerBackend, 1>(grads, &mut moved, entry),
            2 => move_grad::<B::InnerBackend, 2>(grads, &mut moved, entry),
            3 => move_grad::<B::InnerBackend, 3>(grads, &mut moved, entry),
            rank => unreachable!("no parameter of rank {rank}"),
        }
    }
    moved
}

fn move_grad<B: Backend, const D: usize>(
    from: &mut GradientsParams,
    to: &mut GradientsParams,
    entry: &ParamEntry,
) {
    if let Some(grad) = from.remove::<B, D>(entry.id) {
        to.register::<B, D>(entry.id, grad);
    }
}
