//! Error types emitted by the distance kernels and attention module.

use thiserror::Error;

/// Attention-specific error category.
#[derive(Debug, Error)]
pub enum AttentionError {
    /// The supplied tensor shapes do not align with the documented contract.
    #[error("invalid tensor shape for {context}")]
    InvalidShape { context: String },
    /// A matrix that must be inverted is singular at the input precision.
    #[error("singular matrix in {context} (matrix {index} of the batch)")]
    SingularMatrix { context: &'static str, index: usize },
    /// A logarithm would be evaluated outside its domain.
    #[error("log domain violation in {context}: minimum argument {min} must exceed {bound}")]
    LogDomain {
        context: &'static str,
        min: f64,
        bound: f64,
    },
    /// The attention configuration is inconsistent.
    #[error("invalid attention config: {0}")]
    Config(String),
    /// A backend-specific failure propagated to the caller.
    #[error(transparent)]
    Backend(#[from] candle_core::Error),
}

impl AttentionError {
    pub(crate) fn shape(context: impl Into<String>) -> Self {
        AttentionError::InvalidShape {
            context: context.into(),
        }
    }
}
