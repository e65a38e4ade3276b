//! Error type shared by the schedule, the blocks and the diffusion process

/// Error type for diffusion operations
#[derive(thiserror::Error, Debug)]
pub enum DiffusionError {
    /// Invalid construction parameters. Raised before any tensor work happens.
    #[error("invalid configuration for `{parameter}`: {reason}")]
    Config { parameter: &'static str, reason: String },
    /// Wrong rank or mismatched dimensions at a call boundary.
    #[error("shape mismatch in {context}: expected {expected}, got {actual:?}")]
    Shape {
        context: &'static str,
        expected: String,
        actual: Vec<usize>,
    },
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, DiffusionError>;

impl DiffusionError {
    pub(crate) fn config(parameter: &'static str, reason: impl Into<String>) -> Self {
        Self::Config {
            parameter,
            reason: reason.into(),
        }
    }

    pub(crate) fn shape(context: &'static str, expected: impl Into<String>, actual: &[usize]) -> Self {
        Self::Shape {
            context,
            expected: expected.into(),
            actual: actual.to_vec(),
        }
    }

    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config { .. })
    }

    pub fn is_shape(&self) -> bool {
        matches!(self, Self::Shape { .. })
    }
}
