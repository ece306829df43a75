//! Error types for statistical motion model operations.
//!
//! Structural and precondition failures surface here. QC gate failures are
//! never errors: they are reported as data by the [`crate::qc`] validators.

use thiserror::Error;

/// Main error type for motion model operations.
#[derive(Error, Debug)]
pub enum ModelError {
    /// Two grids that must match do not.
    #[error("Geometry mismatch: {0}")]
    GeometryMismatch(String),

    /// The analysis mask selects no voxels.
    #[error("Mask selects no voxels")]
    EmptyMask,

    /// The mask passed to an operation is not the mask the model was fitted on.
    #[error("Mask does not match the model mask: {0}")]
    MaskMismatch(String),

    /// Too few samples for the requested fit.
    #[error("Insufficient samples: need at least {required}, got {actual}")]
    InsufficientSamples { required: usize, actual: usize },

    /// The fitted model has fewer usable modes than the caller requires.
    #[error("Degenerate model: {available} usable modes, {required} required")]
    DegenerateModel { required: usize, available: usize },

    /// A mode index is outside the fitted model.
    #[error("Mode {mode} out of range for a model with {n_components} modes")]
    ModeOutOfRange { mode: usize, n_components: usize },

    /// Vector or array lengths disagree.
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Input validation errors.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Filesystem error while reading or writing artifacts.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// NIfTI decoding or encoding failed.
    #[error("NIfTI error: {0}")]
    Nifti(#[from] nifti::NiftiError),

    /// JSON artifact serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for motion model operations.
pub type Result<T> = std::result::Result<T, ModelError>;

impl ModelError {
    /// Create a geometry mismatch error.
    #[must_use]
    pub fn geometry_mismatch(msg: impl Into<String>) -> Self {
        Self::GeometryMismatch(msg.into())
    }

    /// Create a mask mismatch error.
    #[must_use]
    pub fn mask_mismatch(msg: impl Into<String>) -> Self {
        Self::MaskMismatch(msg.into())
    }

    /// Create an insufficient samples error.
    #[must_use]
    pub const fn insufficient_samples(required: usize, actual: usize) -> Self {
        Self::InsufficientSamples { required, actual }
    }

    /// Create a degenerate model error.
    #[must_use]
    pub const fn degenerate_model(required: usize, available: usize) -> Self {
        Self::DegenerateModel {
            required,
            available,
        }
    }

    /// Create a mode out of range error.
    #[must_use]
    pub const fn mode_out_of_range(mode: usize, n_components: usize) -> Self {
        Self::ModeOutOfRange { mode, n_components }
    }

    /// Create a dimension mismatch error.
    #[must_use]
    pub const fn dimension_mismatch(expected: usize, actual: usize) -> Self {
        Self::DimensionMismatch { expected, actual }
    }

    /// Create an invalid input error.
    #[must_use]
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create an invalid configuration error.
    #[must_use]
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}
