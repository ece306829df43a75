//! Mathematical utilities for the motion model.
//!
//! This module provides:
//! - [`linalg`]: Gram-matrix eigendecomposition and mode orientation
//! - [`stats`]: percentiles and other order statistics

pub mod linalg;
pub mod stats;

pub use linalg::{
    apply_sign_correction, gram_eigen, orthonormality_error, recover_directions, GramEigen,
    VoxelModes,
};
pub use stats::{mean, median, percentile};
