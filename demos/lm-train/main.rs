//! Trains a small Mamba1 language model on a synthetic periodic token stream.
//!
//! ```sh
//! cargo run --example lm-train --features dev-ndarray -- --steps 20
//! ```

use burn::prelude::*;
use burn::record::CompactRecorder;
use burn::tensor::backend::AutodiffBackend;
use burn_mamba_lm::prelude::*;
use std::path::PathBuf;
use std::result::Result;

mod backend;
use backend::{MainAutoBackend, main_device};

const HELP: &str = "\
Mamba1 language model training demo

Trains on a synthetic stream where each token is followed by the next one modulo a period,
then saves the model and its config into the artifacts directory.

USAGE:
    lm-train [OPTIONS]

FLAGS:
    -h, --help                  Show this help message and exit

OPTIONS:
    -m, --model-config <PATH>   Load the model configuration from this json file
    -a, --artifacts-path <PATH> Directory where the config and the model weights are saved.
                                Defaults to a newly created temporary directory.
    -s, --steps <N>             Number of training steps [default: 50]
    -b, --batch-size <N>        Sequences per step [default: 8]
    -l, --sequence <N>          Tokens per sequence [default: 32]
    -p, --period <N>            Period of the token stream [default: 7]
        --lr <LR>               Learning rate [default: 3e-3]
";

#[derive(Debug)]
struct AppArgs {
    model_config: Option<PathBuf>,
    artifacts_path: PathBuf,
    steps: usize,
    batch_size: usize,
    sequence: usize,
    period: usize,
    lr: f64,
}

impl AppArgs {
    fn parse() -> Result<Self, pico_args::Error> {
        let mut pargs = pico_args::Arguments::from_env();

        // Help has a higher priority and should be handled separately.
        if pargs.contains(["-h", "--help"]) {
            println!("{HELP}");
            std::process::exit(0);
        }

        let args = AppArgs {
            model_config: pargs.opt_value_from_os_str(["-m", "--model-config"], parse_path)?,
            artifacts_path: pargs
                .opt_value_from_os_str(["-a", "--artifacts-path"], parse_path)?
                .unwrap_or_else(|| {
                    // e.g. /tmp/burn-mamba-lm-lm-train-abcd-0
                    let name = format!("{}-lm-train-", std::env!("CARGO_PKG_NAME"));
                    let tmp = temp_dir::TempDir::with_prefix(name)
                        .expect("Failed to create the temporary directory")
                        .dont_delete_on_drop();
                    tmp.path().into()
                }),
            steps: pargs.opt_value_from_str(["-s", "--steps"])?.unwrap_or(50),
            batch_size: pargs.opt_value_from_str(["-b", "--batch-size"])?.unwrap_or(8),
            sequence: pargs.opt_value_from_str(["-l", "--sequence"])?.unwrap_or(32),
            period: pargs.opt_value_from_str(["-p", "--period"])?.unwrap_or(7),
            lr: pargs.opt_value_from_str("--lr")?.unwrap_or(3e-3),
        };

        let remaining = pargs.finish();
        if !remaining.is_empty() {
            panic!("unused arguments: {remaining:?}");
        }

        Ok(args)
    }
}

fn parse_path(s: &std::ffi::OsStr) -> Result<PathBuf, &'static str> {
    Ok(s.into())
}

fn default_model_config() -> Mamba1NetworkConfig {
    Mamba1NetworkConfig::new(2, 64, Mamba1Config::new(32).with_d_state(8))
}

/// Inputs and next-token targets from `(offset + i) % period`.
fn periodic_batch<B: Backend>(
    batch_size: usize,
    sequence: usize,
    period: usize,
    step: usize,
    device: &B::Device,
) -> (Tensor<B, 2, Int>, Tensor<B, 2, Int>) {
    let mut inputs = Vec::with_capacity(batch_size * sequence);
    let mut targets = Vec::with_capacity(batch_size * sequence);
    for b in 0..batch_size {
        let offset = step * batch_size + b;
        for i in 0..sequence {
            inputs.push(((offset + i) % period) as i32);
            targets.push(((offset + i + 1) % period) as i32);
        }
    }
    let shape = [batch_size, sequence];
    (
        Tensor::from_data(TensorData::new(inputs, shape), device),
        Tensor::from_data(TensorData::new(targets, shape), device),
    )
}

fn train<B: AutodiffBackend>(
    app_args: &AppArgs,
    device: B::Device,
) -> burn_mamba_lm::error::Result<()> {
    std::fs::create_dir_all(&app_args.artifacts_path).ok();
    tracing::info!(path = ?app_args.artifacts_path, "artifacts directory");

    let model_config = match &app_args.model_config {
        Some(path) => Mamba1NetworkConfig::load_validated(path)?,
        None => default_model_config(),
    };
    if app_args.period > model_config.vocab_size {
        return Err(MambaError::Configuration(format!(
            "period {} exceeds the vocabulary size {}",
            app_args.period, model_config.vocab_size
        )));
    }
    model_config
        .save(app_args.artifacts_path.join("model_config.json"))
        .expect("Failed to save the model config");

    let mut model = model_config.try_init::<B>(&device)?;
    let mut session = TrainingSession::new(TrainingConfig::new().with_lr(app_args.lr));

    for step in 0..app_args.steps {
        let (inputs, targets) = periodic_batch::<B>(
            app_args.batch_size,
            app_args.sequence,
            app_args.period,
            step,
            &device,
        );
        let (updated, output) = session.train_step(model, inputs, targets)?;
        model = updated;
        tracing::info!(step = output.step, loss = output.loss, "trained");
    }

    let path = app_args.artifacts_path.join("model");
    model
        .save_file(&path, &CompactRecorder::new()) // ext added automatically
        .expect("Failed to save the model");
    tracing::info!(?path, "saved model");
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let app_args = AppArgs::parse().unwrap();
    if let Err(e) = train::<MainAutoBackend>(&app_args, main_device()) {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}
