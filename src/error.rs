//! Error types for velocity estimation.
//!
//! Fallible functions in this crate return `anyhow::Result`. Failures that callers may want to
//! match on are raised as [`VelocityError`] and can be recovered with
//! `anyhow::Error::downcast_ref::<VelocityError>()`.
//!
//! Numerical edge cases (zero-variance genes, non-converging maximum-likelihood fits) are not
//! errors: they are resolved locally with a defined fallback value.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum VelocityError {
    /// Input that cannot be resolved into a valid fitting setup, e.g. a group selection
    /// without a usable grouping annotation.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Layer '{0}' not found in dataset")]
    MissingLayer(String),

    #[error("Cell graph '{0}' not found in dataset")]
    MissingGraph(String),

    #[error("Shape mismatch for '{name}': expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        name: String,
        expected: (usize, usize),
        found: (usize, usize),
    },
}

impl VelocityError {
    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        VelocityError::Configuration(message.into())
    }
}
