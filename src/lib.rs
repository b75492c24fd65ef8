pub mod error;
pub mod mamba1;
pub mod training;
pub mod utils;

pub mod prelude {
    pub use crate::error::{MambaError, Result};
    pub use crate::mamba1::*;
    pub use crate::training::{
        DecorrelationAware, LanguageModel, StepError, StepOutput, StepResult, TrainingConfig,
        TrainingSession,
    };
}
