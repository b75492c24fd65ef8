use crate::error::MambaError;
use crate::mamba1::discretize::Discretization;
use crate::mamba1::projector::{DtInit, Selection, SelectionProjector, SelectionProjectorConfig};
use crate::mamba1::scan::{ScanMode, ScanTrace, ensure_finite};
use burn::module::Param;
use burn::nn::conv::{Conv1d, Conv1dConfig};
use burn::nn::{Initializer, PaddingConfig1d};
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::silu;

/// The selective state space mixer (Figure 3 in the Mamba paper).
///
/// `in_proj` splits into a main path (causal conv, SiLU, selective SSM) and a gate path;
/// the gated product goes through `out_proj`.
#[derive(Module, Debug)]
pub struct Mamba1<B: Backend> {
    /// Maps d_model into the main and gate paths, d_inner each.
    pub in_proj: Linear<B>,

    /// Causal depthwise convolution over the main path: one group per channel.
    ///
    /// Weight dims: [d_inner, 1, d_conv].
    pub conv1d: Conv1d<B>,

    /// Produces ∆, B and C.
    pub projector: SelectionProjector<B>,

    /// `log(-A)`, so that `A = -exp(a_log)` is always negative.
    ///
    /// Exempt from weight decay. Dims: [d_inner, d_state].
    pub a_log: Param<Tensor<B, 2>>,

    /// Skip scale. Exempt from weight decay.
    ///
    /// Dims: [d_inner].
    pub d: Param<Tensor<B, 1>>,

    /// Maps the gated d_inner representation back to d_model.
    pub out_proj: Linear<B>,

    pub discretization: Discretization,
    pub scan_mode: ScanMode,
    /// Whether the discretizer and scan outputs are checked for non-finite values.
    pub check_numerics: bool,
}

#[derive(Config, Debug)]
pub struct Mamba1Config {
    /// Width of the residual stream.
    pub d_model: usize,

    /// Recurrent state size per channel (`N` in Algorithm 2 from the Mamba paper).
    #[config(default = 16)]
    pub d_state: usize,

    /// Kernel width of the causal convolution.
    #[config(default = 4)]
    pub d_conv: usize,

    /// `d_inner = expand * d_model`, unless `d_inner` is set.
    #[config(default = 2)]
    pub expand: usize,

    /// Lower bound of the initial timesteps.
    #[config(default = 1e-3)]
    pub dt_min: f64,

    /// Upper bound of the initial timesteps.
    #[config(default = 1e-1)]
    pub dt_max: f64,

    #[config(default = 1.)]
    pub dt_scale: f64,

    /// Initial timesteps are clamped from below at this value.
    #[config(default = 1e-4)]
    pub dt_init_floor: f64,

    #[config(default = "DtInit::Random")]
    pub dt_init: DtInit,

    #[config(default = true)]
    pub conv_bias: bool,

    /// Bias of in_proj and out_proj.
    #[config(default = false)]
    pub bias: bool,

    /// Rank of the ∆ projection (Section 3.6 "Parameterization of ∆" from the Mamba paper).
    ///
    /// Defaults to ceil(d_model / 16).
    pub dt_rank: Option<usize>,

    /// Inner width (`D` in Algorithm 2 from the Mamba paper).
    ///
    /// Defaults to expand * d_model.
    pub d_inner: Option<usize>,

    #[config(default = "Discretization::Euler")]
    pub discretization: Discretization,

    #[config(default = "ScanMode::Sequential")]
    pub scan_mode: ScanMode,

    /// Fail with a numeric instability error instead of propagating non-finite values.
    #[config(default = true)]
    pub check_numerics: bool,
}

impl Mamba1Config {
    pub fn validate(&self) -> crate::error::Result<()> {
        let dims = [
            ("d_model", self.d_model),
            ("d_state", self.d_state),
            ("d_conv", self.d_conv),
            ("expand", self.expand),
            ("d_inner", self.d_inner()),
            ("dt_rank", self.dt_rank()),
        ];
        for (name, value) in dims {
            if value == 0 {
                return Err(MambaError::config(format!("{name} must be positive")));
            }
        }
        if !(self.dt_min > 0. && self.dt_min < self.dt_max) {
            return Err(MambaError::config(format!(
                "timestep bounds must satisfy 0 < dt_min < dt_max, got dt_min={} dt_max={}",
                self.dt_min, self.dt_max
            )));
        }
        if !(self.dt_init_floor > 0.) {
            return Err(MambaError::config(format!(
                "dt_init_floor must be positive, got {}",
                self.dt_init_floor
            )));
        }
        if !(self.dt_scale.is_finite() && self.dt_scale > 0.) {
            return Err(MambaError::config(format!(
                "dt_scale must be positive and finite, got {}",
                self.dt_scale
            )));
        }
        Ok(())
    }

    /// Validates the config and returns the initialized model.
    pub fn try_init<B: Backend>(&self, device: &B::Device) -> crate::error::Result<Mamba1<B>> {
        self.validate()?;
        Ok(self.init(device))
    }

    /// Returns the initialized model, for a stack of a single layer.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Mamba1<B> {
        self.init_rescaled(1, device)
    }

    /// Returns the initialized model.
    ///
    /// `n_layer` is the depth of the stack the block lives in: the out_proj weight is
    /// divided by `sqrt(n_layer)`, as per the GPT2 paper. This only affects the output of
    /// the mixer, not the residual connections around it.
    pub fn init_rescaled<B: Backend>(&self, n_layer: usize, device: &B::Device) -> Mamba1<B> {
        let d_inner = self.d_inner();
        debug_assert_ne!(self.d_state, 0);
        debug_assert_ne!(n_layer, 0);
        let dt_rank = self.dt_rank();

        // U(-scale/sqrt(fan_in), scale/sqrt(fan_in))
        let uniform_init = |d_input: usize, scale: f64| {
            let bound = scale / (d_input as f64).sqrt();
            Initializer::Uniform {
                min: -bound,
                max: bound,
            }
        };

        let a_log = {
            // S4D-real: A_n = -n, broadcast over the channels.
            // the minus sign is only added in the forward pass
            let a_row: Tensor<B, 1> =
                Tensor::<B, 1, Int>::arange(1..self.d_state as i64 + 1, device).float();
            debug_assert_eq!([self.d_state], a_row.dims());
            let a_row = a_row.unsqueeze();
            debug_assert_eq!([1, self.d_state], a_row.dims());
            let a = a_row.repeat(&[d_inner, 1]);
            debug_assert_eq!([d_inner, self.d_state], a.dims());
            Param::from_tensor(a.log())
        };

        let projector = SelectionProjectorConfig::new(d_inner, self.d_state, dt_rank)
            .with_dt_min(self.dt_min)
            .with_dt_max(self.dt_max)
            .with_dt_scale(self.dt_scale)
            .with_dt_init_floor(self.dt_init_floor)
            .with_dt_init(self.dt_init)
            .init(device);

        Mamba1 {
            in_proj: zero_bias(
                LinearConfig::new(self.d_model, 2 * d_inner)
                    .with_bias(self.bias)
                    .with_initializer(uniform_init(self.d_model, 1.))
                    .init(device),
            ),
            conv1d: Conv1dConfig::new(d_inner, d_inner, self.d_conv)
                .with_padding(PaddingConfig1d::Explicit(self.d_conv - 1))
                .with_groups(d_inner)
                .with_bias(self.conv_bias)
                // fan_in = in_channels / groups * kernel_size = d_conv
                .with_initializer(uniform_init(self.d_conv, 1.))
                .init(device),
            projector,
            a_log,
            d: Initializer::Ones.init([d_inner], device),
            out_proj: zero_bias(
                LinearConfig::new(d_inner, self.d_model)
                    .with_bias(self.bias)
                    // kaiming_uniform(a=√5), rescaled by the stack depth
                    .with_initializer(uniform_init(d_inner, 1. / (n_layer as f64).sqrt()))
                    .init(device),
            ),
            discretization: self.discretization,
            scan_mode: self.scan_mode,
            check_numerics: self.check_numerics,
        }
    }
    pub fn d_inner(&self) -> usize {
        self.d_inner.unwrap_or(self.expand * self.d_model)
    }
    pub fn dt_rank(&self) -> usize {
        self.dt_rank.unwrap_or(self.d_model.div_ceil(16))
    }
}

/// Linear biases start at zero.
fn zero_bias<B: Backend>(mut linear: Linear<B>) -> Linear<B> {
    linear.bias = linear.bias.map(|bias| bias.map(|b| b.zeros_like()));
    linear
}

impl<B: Backend> Mamba1<B> {
    /// # Shapes
    ///   - Input [batch, sequence, d_model]
    ///   - Output [batch, sequence, d_model]
    pub fn forward(&self, x: Tensor<B, 3>) -> crate::error::Result<Tensor<B, 3>> {
        let [batch, sequence, d_model] = x.dims();
        let [d_inner] = self.d.dims();
        let [_, _, d_conv] = self.conv1d.weight.dims();

        if sequence == 0 {
            return Ok(Tensor::zeros([batch, 0, d_model], &x.device()));
        }

        // main and gate paths
        let (xs, res) = {
            let xs_and_res = self.in_proj.forward(x);
            debug_assert_eq!([batch, sequence, 2 * d_inner], xs_and_res.dims());

            let mut split = xs_and_res
                .split_with_sizes(vec![d_inner, d_inner], 2)
                .into_iter();
            let (Some(xs), Some(res)) = (split.next(), split.next()) else {
                unreachable!("split_with_sizes returns one tensor per size")
            };
            (xs, res)
        };
        debug_assert_eq!([batch, sequence, d_inner], xs.dims());
        debug_assert_eq!([batch, sequence, d_inner], res.dims());

        // causal depthwise conv1d
        let xs = {
            let xs = xs.swap_dims(1, 2);
            debug_assert_eq!([batch, d_inner, sequence], xs.dims());

            debug_assert!(d_conv > 0);
            // padded by d_conv - 1 on both sides
            let xs = self.conv1d.forward(xs);
            debug_assert_eq!([batch, d_inner, sequence + d_conv - 1], xs.dims());

            // keeping only the first `sequence` outputs drops every position that sees the right padding
            let xs = xs.narrow(2, 0, sequence);
            debug_assert_eq!([batch, d_inner, sequence], xs.dims());

            let xs = xs.swap_dims(1, 2);
            debug_assert_eq!([batch, sequence, d_inner], xs.dims());

            silu(xs)
        };
        debug_assert_eq!([batch, sequence, d_inner], xs.dims());

        let (ss, _trace) = self.ss_traced(xs)?;
        debug_assert_eq!([batch, sequence, d_inner], ss.dims());

        // gating
        let ys = ss * silu(res);
        debug_assert_eq!([batch, sequence, d_inner], ys.dims());

        let y = self.out_proj.forward(ys);
        debug_assert_eq!([batch, sequence, d_model], y.dims());

        Ok(y)
    }

    /// `A = -exp(a_log)`.
    ///
    /// This is input independent (see Section 3.5.2 "Interpretation of A" from the Mamba paper).
    ///
    /// # Shapes
    ///   - Output [d_inner, d_state]
    pub fn a(&self) -> Tensor<B, 2> {
        self.a_log.val().exp().neg()
    }

    /// Runs the selective SSM and also returns the trace it was computed from.
    ///
    /// # Shapes
    ///   - Input u [batch, sequence, d_inner]
    ///   - Output [batch, sequence, d_inner]
    pub fn ss_traced(&self, u: Tensor<B, 3>) -> crate::error::Result<(Tensor<B, 3>, ScanTrace<B>)> {
        let [batch, sequence, d_inner] = u.dims();

        // only ∆, B and C depend on the input
        let Selection { delta, b, c } = self.projector.forward(u.clone());
        debug_assert_eq!([batch, sequence, d_inner], delta.dims());

        let discretized = self
            .discretization
            .discretize(delta, self.a(), b, u.clone());
        if self.check_numerics {
            ensure_finite(&discretized.a_bar, "discretizer")?;
            ensure_finite(&discretized.b_bar_x, "discretizer")?;
        }

        let trace = self.scan_mode.scan(discretized);
        if self.check_numerics {
            ensure_finite(&trace.hidden, "scan")?;
        }

        let y = trace.contract(c, self.d.val(), u);
        debug_assert_eq!([batch, sequence, d_inner], y.dims());

        Ok((y, trace))
    }
}
