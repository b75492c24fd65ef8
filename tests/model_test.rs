//! Model integration tests: shapes, finiteness, causality and error reporting.

mod common;

use burn::module::Param;
use burn::prelude::*;
use burn::tensor::Distribution;
use burn::tensor::activation::softmax;
use burn_mamba_lm::prelude::*;
use burn_mamba_lm::utils::rms_norm::RmsNormConfig;
use common::{
    TestBackend, assert_close, ids, test_device, test_model_config, tiny_model_config, to_vec,
};

#[test]
fn test_forward_end_to_end() {
    let device = test_device();
    let model = test_model_config().try_init::<TestBackend>(&device).unwrap();

    let input = ids::<TestBackend>(&[&[0, 17, 1023, 512, 3], &[999, 1, 2, 700, 44]], &device);
    let logits = model.forward(input).unwrap();
    assert_eq!([2, 5, 1024], logits.dims());

    let values = to_vec(logits.clone());
    assert!(values.iter().all(|v| v.is_finite()));

    let sums = to_vec(softmax(logits, 2).sum_dim(2));
    assert_eq!(10, sums.len());
    for s in sums {
        assert!((s - 1.0).abs() <= 1e-5, "softmax sums to {s}");
    }
}

#[test]
fn test_forward_random_ids_is_finite() {
    let device = test_device();
    let config = test_model_config()
        .with_mamba_block(test_model_config().mamba_block.with_expand(3).with_d_inner(None));
    let model = config.try_init::<TestBackend>(&device).unwrap();

    let input = Tensor::<TestBackend, 2>::random([3, 9], Distribution::Uniform(0., 1024.), &device)
        .int()
        .clamp(0, 1023);
    let logits = model.forward(input).unwrap();
    assert_eq!([3, 9, 1024], logits.dims());
    assert!(to_vec(logits).iter().all(|v| v.is_finite()));
}

#[test]
fn test_empty_sequence() {
    let device = test_device();
    let model = test_model_config().init::<TestBackend>(&device);

    let input = Tensor::<TestBackend, 2, Int>::zeros([2, 0], &device);
    let logits = model.forward(input).unwrap();
    assert_eq!([2, 0, 1024], logits.dims());
}

#[test]
fn test_mixer_empty_sequence() {
    let device = test_device();
    let block = Mamba1Config::new(8).init::<TestBackend>(&device);

    let y = block
        .forward(Tensor::zeros([3, 0, 8], &device))
        .unwrap();
    assert_eq!([3, 0, 8], y.dims());
}

fn assert_causal(config: &Mamba1NetworkConfig) {
    let device = test_device();
    let model = config.try_init::<TestBackend>(&device).unwrap();

    let changed_at = 3;
    let a = ids::<TestBackend>(&[&[5, 6, 7, 8, 9, 10]], &device);
    let b = ids::<TestBackend>(&[&[5, 6, 7, 20, 9, 10]], &device);

    let la = model.forward(a).unwrap();
    let lb = model.forward(b).unwrap();

    let before_a = to_vec(la.clone().narrow(1, 0, changed_at));
    let before_b = to_vec(lb.clone().narrow(1, 0, changed_at));
    assert_close(&before_a, &before_b, 1e-6);

    let at_a = to_vec(la.narrow(1, changed_at, 1));
    let at_b = to_vec(lb.narrow(1, changed_at, 1));
    assert!(at_a.iter().zip(at_b.iter()).any(|(x, y)| x != y));
}

fn with_scan_mode(scan_mode: ScanMode) -> Mamba1NetworkConfig {
    test_model_config()
        .with_mamba_block(test_model_config().mamba_block.with_scan_mode(scan_mode))
}

#[test]
fn test_causality_sequential() {
    assert_causal(&with_scan_mode(ScanMode::Sequential));
}

#[test]
fn test_causality_parallel() {
    assert_causal(&with_scan_mode(ScanMode::Parallel));
}

#[test]
fn test_forward_over_config_toggles() {
    let device = test_device();
    let block = || tiny_model_config().mamba_block;
    let with_block = |block: Mamba1Config| tiny_model_config().with_mamba_block(block);
    let cases = [
        ("projection biases", with_block(block().with_bias(true))),
        ("no conv bias", with_block(block().with_conv_bias(false))),
        ("pointwise conv", with_block(block().with_d_conv(1))),
        ("single layer", tiny_model_config().with_n_layer(1)),
        (
            "constant timestep init",
            with_block(block().with_dt_init(DtInit::Constant)),
        ),
        (
            "everything toggled",
            with_block(
                block()
                    .with_bias(true)
                    .with_conv_bias(false)
                    .with_d_conv(1)
                    .with_dt_init(DtInit::Constant)
                    .with_discretization(Discretization::ZeroOrderHold)
                    .with_scan_mode(ScanMode::Parallel),
            )
            .with_n_layer(1),
        ),
    ];

    for (name, config) in cases {
        let model = config.try_init::<TestBackend>(&device).unwrap();
        let input = ids::<TestBackend>(&[&[0, 31, 7, 4, 4], &[9, 1, 30, 2, 8]], &device);
        let logits = model.forward(input).unwrap();
        assert_eq!([2, 5, 32], logits.dims(), "{name}");
        assert!(to_vec(logits).iter().all(|v| v.is_finite()), "{name}");
        assert_causal(&config);
    }
}

#[test]
fn test_scan_modes_agree() {
    let device = test_device();
    let model = test_model_config().init::<TestBackend>(&device);
    let mut parallel = model.clone();
    for layer in parallel.layers.iter_mut() {
        layer.mamba_block.scan_mode = ScanMode::Parallel;
    }

    let input = ids::<TestBackend>(&[&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11], &[50; 11]], &device);
    let sequential = to_vec(model.forward(input.clone()).unwrap());
    let parallel = to_vec(parallel.forward(input).unwrap());
    assert_close(&sequential, &parallel, 1e-4);
}

#[test]
fn test_zero_order_hold_forward() {
    let device = test_device();
    let config = test_model_config().with_mamba_block(
        test_model_config()
            .mamba_block
            .with_discretization(Discretization::ZeroOrderHold),
    );
    let model = config.try_init::<TestBackend>(&device).unwrap();

    let logits = model
        .forward(ids::<TestBackend>(&[&[3, 1, 4, 1, 5, 9, 2, 6]], &device))
        .unwrap();
    assert!(to_vec(logits).iter().all(|v| v.is_finite()));
}

#[test]
fn test_transition_in_unit_interval() {
    let device = test_device();
    let block = Mamba1Config::new(16)
        .with_d_state(8)
        .init::<TestBackend>(&device);

    let u = Tensor::<TestBackend, 3>::random([2, 6, 32], Distribution::Normal(0., 1.), &device);
    let (y, trace) = block.ss_traced(u).unwrap();
    assert_eq!([2, 6, 32], y.dims());
    assert_eq!([2, 6, 32, 8], trace.hidden.dims());

    let a_bar = to_vec(trace.a_bar);
    assert!(a_bar.iter().all(|v| *v > 0.0 && *v <= 1.0));
}

#[test]
fn test_log_decay_initialization() {
    let device = test_device();
    let block = Mamba1Config::new(4)
        .with_d_state(5)
        .init::<TestBackend>(&device);

    let a_log = to_vec(block.a_log.val());
    assert_eq!(8 * 5, a_log.len());
    for row in a_log.chunks(5) {
        for (n, v) in row.iter().enumerate() {
            assert!((v - ((n + 1) as f32).ln()).abs() < 1e-6);
        }
    }
    assert!(to_vec(block.d.val()).iter().all(|v| *v == 1.0));
}

#[test]
fn test_out_proj_rescaled_by_depth() {
    let device = test_device();
    let config = Mamba1Config::new(16).with_d_inner(Some(64));
    let block = config.init_rescaled::<TestBackend>(4, &device);

    // kaiming bound 1/sqrt(64), halved for 4 layers
    let bound = 1.0 / 8.0 / 2.0;
    let w = to_vec(block.out_proj.weight.val());
    assert!(w.iter().all(|v| v.abs() <= bound + 1e-6));
    assert!(w.iter().any(|v| v.abs() > bound / 4.0));
}

#[test]
fn test_rms_norm_scale_equivariance() {
    let device = test_device();
    let norm = RmsNormConfig::new(6).init::<TestBackend>(&device);
    let mut scaled = norm.clone();
    scaled.gamma = Param::from_tensor(norm.gamma.val() * 4.0);

    let x = Tensor::<TestBackend, 3>::random([2, 3, 6], Distribution::Normal(0., 5.), &device);
    let y = to_vec(norm.forward(x.clone()) * 4.0);
    let y_scaled = to_vec(scaled.forward(x));
    assert_eq!(y, y_scaled);
}

#[test]
fn test_invalid_ids() {
    let device = test_device();
    let model = test_model_config().init::<TestBackend>(&device);

    let err = model
        .forward(ids::<TestBackend>(&[&[0, 1024]], &device))
        .unwrap_err();
    assert!(matches!(err, MambaError::InvalidInput(_)), "{err}");

    let err = model
        .forward(ids::<TestBackend>(&[&[-1, 3]], &device))
        .unwrap_err();
    assert!(matches!(err, MambaError::InvalidInput(_)), "{err}");
}

#[test]
fn test_padded_vocabulary() {
    let device = test_device();
    let config = tiny_model_config()
        .with_vocab_size(30)
        .with_pad_vocab_size_multiple(8);
    assert_eq!(32, config.padded_vocab_size());
    let model = config.init::<TestBackend>(&device);

    let logits = model
        .forward(ids::<TestBackend>(&[&[0, 29]], &device))
        .unwrap();
    assert_eq!([1, 2, 32], logits.dims());

    // ids in the padding are still out of the vocabulary
    let err = model
        .forward(ids::<TestBackend>(&[&[30]], &device))
        .unwrap_err();
    assert!(matches!(err, MambaError::InvalidInput(_)));
}

#[test]
fn test_numeric_instability_reports_location() {
    let device = test_device();
    let mut model = test_model_config().init::<TestBackend>(&device);
    let d_inner = 32;
    model.layers[1].mamba_block.projector.dt_proj.bias = Some(Param::from_tensor(
        Tensor::full([d_inner], f32::INFINITY, &device),
    ));

    let err = model
        .forward(ids::<TestBackend>(&[&[1, 2, 3]], &device))
        .unwrap_err();
    match err {
        MambaError::NumericInstability {
            layer,
            stage,
            step,
            channel,
        } => {
            assert_eq!(Some(1), layer);
            assert_eq!("discretizer", stage);
            assert_eq!(Some(0), step);
            assert!(channel.is_some_and(|c| c < d_inner));
        }
        other => panic!("unexpected error {other}"),
    }

    // without checks, the non-finite values reach the logits
    for layer in model.layers.iter_mut() {
        layer.mamba_block.check_numerics = false;
    }
    let logits = model
        .forward(ids::<TestBackend>(&[&[1, 2, 3]], &device))
        .unwrap();
    assert!(to_vec(logits).iter().any(|v| !v.is_finite()));
}
