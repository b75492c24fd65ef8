use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MambaError {
    #[error("Invalid config: {0}")]
    Configuration(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A non-finite value was produced by a mixer or by the training loss.
    ///
    /// `layer` is filled in by the network once the error leaves the block. `step` and
    /// `channel` locate the first bad value inside the mixer, and are `None` for the loss.
    #[error(
        "Non-finite value in {stage}{}; check the timestep scale and gradient magnitudes",
        location(.layer, .step, .channel)
    )]
    NumericInstability {
        layer: Option<usize>,
        stage: &'static str,
        step: Option<usize>,
        channel: Option<usize>,
    },

    #[error("Weight import failed for `{key}`: {reason}")]
    WeightImport { key: String, reason: String },
}

impl MambaError {
    /// Attaches the residual layer index to a numeric instability error.
    pub fn in_layer(self, layer_idx: usize) -> Self {
        match self {
            MambaError::NumericInstability {
                layer: None,
                stage,
                step,
                channel,
            } => MambaError::NumericInstability {
                layer: Some(layer_idx),
                stage,
                step,
                channel,
            },
            other => other,
        }
    }

    pub(crate) fn config(reason: impl Into<String>) -> Self {
        MambaError::Configuration(reason.into())
    }

    pub(crate) fn input(reason: impl Into<String>) -> Self {
        MambaError::InvalidInput(reason.into())
    }

    pub(crate) fn import(key: impl Into<String>, reason: impl Into<String>) -> Self {
        MambaError::WeightImport {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

fn location(layer: &Option<usize>, step: &Option<usize>, channel: &Option<usize>) -> String {
    let parts: Vec<String> = [("layer", layer), ("step", step), ("channel", channel)]
        .into_iter()
        .filter_map(|(name, v)| v.map(|v| format!("{name} {v}")))
        .collect();
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

pub type Result<T> = std::result::Result<T, MambaError>;
