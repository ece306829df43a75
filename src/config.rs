//! Configuration for model fitting, synthesis sweeps, and QC gates.
//!
//! This module centralizes every tunable constant of the pipeline:
//!
//! - [`ModelConfig`]: numerical floors and the optional mode cap used by
//!   [`crate::fit::fit`].
//! - [`SweepConfig`]: which modes and magnitudes a standard synthesis sweep
//!   visits.
//! - [`RandomConfig`]: size, spread and seed of a batch of randomly drawn
//!   fields.
//! - [`QcThresholds`]: pass/fail limits for the inverse-consistency and
//!   Jacobian safety checks.
//!
//! # Example
//!
//! ```
//! use motion_model::{ModelConfig, QcThresholds};
//!
//! let config = ModelConfig::default().with_n_components(2);
//! assert!(config.validate().is_ok());
//!
//! let gates = QcThresholds::strict();
//! assert!(gates.min_p01 > QcThresholds::default().min_p01);
//! ```

use crate::error::{ModelError, Result};
use crate::synthesis::sweep_label;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Configuration for fitting a statistical motion model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Singular values at or below `singular_floor * S_max` are discarded.
    pub singular_floor: f64,

    /// Absolute guard for near-zero scales (mm).
    ///
    /// Used both as the minimum retained singular value and as the
    /// denominator guard in projection.
    pub scale_eps: f64,

    /// Optional cap on the number of retained modes.
    ///
    /// Requesting `k` modes requires at least `k + 1` samples.
    pub n_components: Option<usize>,

    /// Flip each mode so its largest-magnitude component is positive.
    pub sign_correction: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            singular_floor: 1e-8,
            scale_eps: 1e-8,
            n_components: None,
            sign_correction: true,
        }
    }
}

impl ModelConfig {
    /// Create a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any parameter is out of valid range.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.singular_floor) {
            return Err(ModelError::invalid_config(
                "singular_floor must be in [0, 1)",
            ));
        }
        if self.scale_eps <= 0.0 || !self.scale_eps.is_finite() {
            return Err(ModelError::invalid_config(
                "scale_eps must be positive and finite",
            ));
        }
        if self.n_components == Some(0) {
            return Err(ModelError::invalid_config(
                "n_components must be at least 1 when set",
            ));
        }
        Ok(())
    }

    /// Preset retaining only the dominant mode.
    ///
    /// Useful when the sample set is a single motion cycle and only the
    /// amplitude direction is of interest.
    #[must_use]
    pub fn single_mode() -> Self {
        Self {
            n_components: Some(1),
            ..Self::default()
        }
    }

    /// Cap the number of retained modes.
    #[must_use]
    pub const fn with_n_components(mut self, k: usize) -> Self {
        self.n_components = Some(k);
        self
    }

    /// Set the relative singular value floor.
    #[must_use]
    pub const fn with_singular_floor(mut self, floor: f64) -> Self {
        self.singular_floor = floor;
        self
    }

    /// Set the absolute scale guard.
    #[must_use]
    pub const fn with_scale_eps(mut self, eps: f64) -> Self {
        self.scale_eps = eps;
        self
    }

    /// Enable/disable deterministic sign correction of the modes.
    #[must_use]
    pub const fn with_sign_correction(mut self, enabled: bool) -> Self {
        self.sign_correction = enabled;
        self
    }
}

/// Which synthesized fields a standard sweep produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Number of leading modes to sweep (clamped to the model's K).
    pub n_modes: usize,

    /// Beta magnitudes in SD units.
    pub betas: Vec<f64>,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            n_modes: 2,
            betas: vec![-2.0, -1.0, 1.0, 2.0],
        }
    }
}

impl SweepConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if no betas are given, a beta is not finite, or two
    /// betas would share a field label (`1, 1` or `0, -0`).
    pub fn validate(&self) -> Result<()> {
        if self.betas.is_empty() {
            return Err(ModelError::invalid_config("sweep needs at least one beta"));
        }
        if self.betas.iter().any(|b| !b.is_finite()) {
            return Err(ModelError::invalid_config("sweep betas must be finite"));
        }
        let mut labels = BTreeSet::new();
        for &beta in &self.betas {
            if !labels.insert(sweep_label(0, beta)) {
                return Err(ModelError::invalid_config(format!(
                    "sweep beta {beta} is listed more than once"
                )));
            }
        }
        Ok(())
    }

    /// Set the number of swept modes.
    #[must_use]
    pub const fn with_n_modes(mut self, n: usize) -> Self {
        self.n_modes = n;
        self
    }

    /// Set the swept magnitudes.
    #[must_use]
    pub fn with_betas(mut self, betas: Vec<f64>) -> Self {
        self.betas = betas;
        self
    }
}

/// A batch of fields drawn at random from the model.
///
/// Each coefficient is drawn independently as `β_k ~ N(0, variation_scale²)`
/// in SD units, so `variation_scale = 1` reproduces the training spread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomConfig {
    /// Number of fields to draw.
    pub n_samples: usize,

    /// Standard deviation of every coefficient, SD units.
    pub variation_scale: f64,

    /// Generator seed; equal seeds give identical batches.
    pub seed: u64,
}

impl Default for RandomConfig {
    fn default() -> Self {
        Self {
            n_samples: 10,
            variation_scale: 1.0,
            seed: 0,
        }
    }
}

impl RandomConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `variation_scale` is not positive and finite.
    pub fn validate(&self) -> Result<()> {
        if !(self.variation_scale.is_finite() && self.variation_scale > 0.0) {
            return Err(ModelError::invalid_config(
                "variation_scale must be positive and finite",
            ));
        }
        Ok(())
    }

    /// Set the batch size.
    #[must_use]
    pub const fn with_n_samples(mut self, n: usize) -> Self {
        self.n_samples = n;
        self
    }

    /// Set the coefficient spread.
    #[must_use]
    pub const fn with_variation_scale(mut self, scale: f64) -> Self {
        self.variation_scale = scale;
        self
    }

    /// Set the generator seed.
    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Pass/fail limits for the QC validators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QcThresholds {
    /// Inverse-consistency median below this is "excellent" (mm).
    pub ic_excellent_mm: f64,

    /// Inverse-consistency median below this is "good" (mm).
    pub ic_good_mm: f64,

    /// Mean-field median magnitude below this counts as near zero (mm).
    pub mean_near_zero_mm: f64,

    /// Maximum allowed percentage of voxels with negative Jacobian.
    pub max_negative_percent: f64,

    /// Jacobian P01 must exceed this.
    pub min_p01: f64,

    /// Jacobian P99 must stay below this.
    pub max_p99: f64,
}

impl Default for QcThresholds {
    fn default() -> Self {
        Self {
            ic_excellent_mm: 0.1,
            ic_good_mm: 1.0,
            mean_near_zero_mm: 0.1,
            max_negative_percent: 0.5,
            min_p01: 0.80,
            max_p99: 1.25,
        }
    }
}

impl QcThresholds {
    /// Validate the thresholds.
    ///
    /// # Errors
    ///
    /// Returns an error if the limits are inconsistent.
    pub fn validate(&self) -> Result<()> {
        if self.ic_excellent_mm <= 0.0 || self.ic_good_mm < self.ic_excellent_mm {
            return Err(ModelError::invalid_config(
                "inverse-consistency thresholds must satisfy 0 < excellent <= good",
            ));
        }
        if self.mean_near_zero_mm < 0.0 {
            return Err(ModelError::invalid_config(
                "mean_near_zero_mm must be non-negative",
            ));
        }
        if !(0.0..=100.0).contains(&self.max_negative_percent) {
            return Err(ModelError::invalid_config(
                "max_negative_percent must be in [0, 100]",
            ));
        }
        if self.min_p01 >= self.max_p99 {
            return Err(ModelError::invalid_config("min_p01 must be below max_p99"));
        }
        Ok(())
    }

    /// Tighter gates: no folding at all, at most ~10% local volume change.
    #[must_use]
    pub fn strict() -> Self {
        Self {
            max_negative_percent: 0.0,
            min_p01: 0.90,
            max_p99: 1.10,
            ..Self::default()
        }
    }

    /// Set the Jacobian percentile gates.
    #[must_use]
    pub const fn with_jacobian_limits(mut self, min_p01: f64, max_p99: f64) -> Self {
        self.min_p01 = min_p01;
        self.max_p99 = max_p99;
        self
    }
}
