//! Statistical Motion Model Library
//!
//! Low-rank linear model of population motion learned from a handful of
//! dense 3D displacement fields.
//!
//! Given N fields (typically N = 3..10) on one voxel grid and an analysis
//! mask, the library fits a PCA model `u(β) = μ + Σ β_k σ_k U_k`, maps
//! coefficients to new fields and fields back to coefficients, and checks
//! synthesized fields for physical plausibility.
//!
//! # Features
//!
//! - **Small-N PCA**: eigendecomposition of the N×N Gram matrix, never the
//!   P×P covariance, so 10⁵ voxels cost nothing extra
//! - **SD units**: coefficients are expressed per mode standard deviation
//! - **Generation**: seeded Gaussian draws of new fields from the model
//! - **Deterministic**: modes are sign-normalized, repeated fits agree
//! - **QC**: inverse consistency, Jacobian folding, displacement magnitude
//! - **NIfTI I/O**: vector volumes in, model volumes and JSON reports out
//!
//! # Quick Start
//!
//! ```
//! use motion_model::{fit_default, project, synthesize, DeformationField, GridGeometry, Mask, SampleSet};
//!
//! let grid = GridGeometry::with_shape([4, 4, 4])?;
//! let amplitudes = [(1.0, 0.2), (-0.4, 0.9), (0.3, -1.0)];
//! let fields = amplitudes
//!     .iter()
//!     .map(|&(a, b)| {
//!         DeformationField::from_fn(grid.clone(), move |[i, j, k]| {
//!             [a * i as f64, b * j as f64, 0.1 * k as f64]
//!         })
//!     })
//!     .collect();
//! let samples = SampleSet::new(fields)?;
//! let mask = Mask::full(grid);
//!
//! let model = fit_default(&samples, &mask)?;
//! assert_eq!(model.n_components(), 2);
//!
//! // One SD along the first mode, then back to coefficients
//! let field = synthesize(&model, &[1.0, 0.0])?;
//! let beta = project(&model, &field, &mask)?;
//! assert!((beta[0] - 1.0).abs() < 1e-9);
//! # Ok::<(), motion_model::ModelError>(())
//! ```
//!
//! # Modules
//!
//! | Module | Role |
//! |--------|------|
//! | [`packing`] | dense field ↔ masked vector |
//! | [`fit`] | Gram-matrix PCA |
//! | [`synthesis`] | β → field, field → β, standard sweeps, random draws |
//! | [`qc`] | inverse consistency (±β and forward/backward), Jacobian, magnitude |
//! | [`io`] | NIfTI volumes |
//! | [`artifacts`] | JSON reports and full export |
//!
//! # Presets
//!
//! ```
//! use motion_model::{ModelConfig, QcThresholds};
//!
//! let default_fit = ModelConfig::default();
//! let one_mode = ModelConfig::single_mode();
//! let gates = QcThresholds::default();
//! let tight_gates = QcThresholds::strict();
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::similar_names)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod artifacts;
pub mod config;
pub mod error;
pub mod field;
pub mod fit;
pub mod geometry;
pub mod io;
pub mod math;
pub mod model;
pub mod packing;
pub mod qc;
pub mod synthesis;

// Re-exports for convenient access
pub use config::{ModelConfig, QcThresholds, RandomConfig, SweepConfig};
pub use error::{ModelError, Result};
pub use field::{DeformationField, Mask, SampleSet};
pub use fit::{fit, fit_default};
pub use geometry::GridGeometry;
pub use model::{ModelMetadata, StatisticalMotionModel};
pub use packing::{pack, pack_samples, unpack};
pub use qc::{
    check_composition_consistency, check_inverse_consistency, check_jacobian,
    displacement_magnitude, CompositionConsistency, ConsistencyGrade, InverseConsistencyResult,
    JacobianQc, MagnitudeStats,
};
pub use synthesis::{
    project, sample_betas, sample_random, standard_sweep, synthesize, synthesize_mode,
    BetaVector, RandomField, SampleBetaReport, SweepField,
};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
