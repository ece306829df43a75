//! Statistical motion model data structures.
//!
//! This module defines the immutable [`StatisticalMotionModel`] produced by
//! [`crate::fit::fit`] and its persisted [`ModelMetadata`].
//!
//! # Model Layout
//!
//! | Symbol | Shape | Meaning |
//! |--------|-------|---------|
//! | μ | P | mean packed field |
//! | U | P × K | orthonormal principal directions |
//! | S | K | singular values of the centered design matrix |
//! | σ | K | per-mode SD, `S_k / sqrt(N−1)` (mm) |
//! | ratio | K | `S_k² / Σ S_j²` |
//!
//! `P = 3|M|` where |M| is the mask voxel count.

use crate::error::{ModelError, Result};
use crate::field::{DeformationField, Mask};
use crate::geometry::GridGeometry;
use crate::packing::unpack;
use nalgebra::{DMatrix, DVector, DVectorView};
use serde::{Deserialize, Serialize};

/// Population-level low-rank linear motion model.
///
/// Created once by [`crate::fit::fit`] and never mutated; every accessor
/// borrows. The model is `Send + Sync` and can be shared across threads.
#[derive(Debug, Clone)]
pub struct StatisticalMotionModel {
    mean: DVector<f64>,
    directions: DMatrix<f64>,
    singular_values: DVector<f64>,
    scales: DVector<f64>,
    variance_ratio: Vec<f64>,
    n_samples: usize,
    mask: Mask,
    scale_eps: f64,
}

impl StatisticalMotionModel {
    /// Assemble a model from fitted parts.
    ///
    /// `scales` are derived here from `singular_values` and `n_samples`.
    pub(crate) fn from_parts(
        mean: DVector<f64>,
        directions: DMatrix<f64>,
        singular_values: DVector<f64>,
        n_samples: usize,
        mask: Mask,
        scale_eps: f64,
    ) -> Self {
        let dof = (n_samples.saturating_sub(1)).max(1) as f64;
        let scales = singular_values.map(|s| s / dof.sqrt());

        let total: f64 = singular_values.iter().map(|s| s * s).sum();
        let variance_ratio = singular_values
            .iter()
            .map(|s| if total > 0.0 { s * s / total } else { 0.0 })
            .collect();

        Self {
            mean,
            directions,
            singular_values,
            scales,
            variance_ratio,
            n_samples,
            mask,
            scale_eps,
        }
    }

    /// Number of retained modes K.
    #[must_use]
    pub fn n_components(&self) -> usize {
        self.directions.ncols()
    }

    /// Number of samples N the model was fitted on.
    #[must_use]
    pub const fn n_samples(&self) -> usize {
        self.n_samples
    }

    /// Packed dimension P = 3|M|.
    #[must_use]
    pub fn dimension(&self) -> usize {
        self.mean.len()
    }

    /// Mean packed field μ.
    #[must_use]
    pub const fn mean(&self) -> &DVector<f64> {
        &self.mean
    }

    /// Principal directions U (P × K), one mode per column.
    #[must_use]
    pub const fn directions(&self) -> &DMatrix<f64> {
        &self.directions
    }

    /// Principal direction `U_k`.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::ModeOutOfRange`] if `k >= K`.
    pub fn direction(&self, k: usize) -> Result<DVectorView<'_, f64>> {
        self.ensure_mode(k)?;
        Ok(self.directions.column(k))
    }

    /// Singular values S, descending.
    #[must_use]
    pub const fn singular_values(&self) -> &DVector<f64> {
        &self.singular_values
    }

    /// Per-mode SD σ_k = S_k / sqrt(N−1), in mm.
    #[must_use]
    pub const fn scales(&self) -> &DVector<f64> {
        &self.scales
    }

    /// Fraction of retained variance per mode.
    #[must_use]
    pub fn variance_ratio(&self) -> &[f64] {
        &self.variance_ratio
    }

    /// Running sum of [`Self::variance_ratio`].
    #[must_use]
    pub fn cumulative_variance(&self) -> Vec<f64> {
        self.variance_ratio
            .iter()
            .scan(0.0, |acc, &r| {
                *acc += r;
                Some(*acc)
            })
            .collect()
    }

    /// Analysis mask the model was fitted on.
    #[must_use]
    pub const fn mask(&self) -> &Mask {
        &self.mask
    }

    /// Grid of every field the model synthesizes.
    #[must_use]
    pub const fn geometry(&self) -> &GridGeometry {
        self.mask.geometry()
    }

    /// Near-zero guard applied to σ_k during projection.
    #[must_use]
    pub const fn scale_eps(&self) -> f64 {
        self.scale_eps
    }

    /// Whether fewer than two modes were retained.
    #[must_use]
    pub fn is_degenerate(&self) -> bool {
        self.n_components() < 2
    }

    /// Fail unless the model retains at least `min` modes.
    ///
    /// Fit never raises on a degenerate sample set; callers that need modes
    /// turn that condition into an error here.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::DegenerateModel`] if `K < max(min, 1)`.
    pub fn ensure_modes(&self, min: usize) -> Result<()> {
        let required = min.max(1);
        if self.n_components() < required {
            return Err(ModelError::degenerate_model(
                required,
                self.n_components(),
            ));
        }
        Ok(())
    }

    /// Fail unless `k` indexes a retained mode.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::ModeOutOfRange`] if `k >= K`.
    pub fn ensure_mode(&self, k: usize) -> Result<()> {
        if k >= self.n_components() {
            return Err(ModelError::mode_out_of_range(k, self.n_components()));
        }
        Ok(())
    }

    /// Mean field μ on the model grid.
    ///
    /// # Errors
    ///
    /// Propagates unpacking errors (not expected for a fitted model).
    pub fn mean_field(&self) -> Result<DeformationField> {
        unpack(self.mean.as_slice(), &self.mask, self.geometry())
    }

    /// Unit-norm principal direction `U_k` as a field.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::ModeOutOfRange`] if `k >= K`.
    pub fn component_field(&self, k: usize) -> Result<DeformationField> {
        let column = self.direction(k)?.into_owned();
        unpack(column.as_slice(), &self.mask, self.geometry())
    }

    /// Persistable summary of the fit.
    #[must_use]
    pub fn metadata(&self) -> ModelMetadata {
        ModelMetadata {
            n_samples: self.n_samples,
            n_components: self.n_components(),
            singular_values: self.singular_values.iter().copied().collect(),
            variance_explained: self.variance_ratio.clone(),
            cumulative_variance: self.cumulative_variance(),
        }
    }
}

/// Model metadata as persisted to `pca_meta.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// Number of fitted samples N.
    pub n_samples: usize,
    /// Retained modes K.
    pub n_components: usize,
    /// Singular values S, descending.
    pub singular_values: Vec<f64>,
    /// Per-mode variance fraction in `[0, 1]`.
    pub variance_explained: Vec<f64>,
    /// Running sum of `variance_explained`.
    pub cumulative_variance: Vec<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn toy_model() -> StatisticalMotionModel {
        let geometry = GridGeometry::with_shape([2, 1, 1]).unwrap();
        let mask = Mask::full(geometry);
        let mean = DVector::from_vec(vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0]);
        let directions = DMatrix::from_column_slice(
            6,
            2,
            &[
                1.0, 0.0, 0.0, 0.0, 0.0, 0.0, //
                0.0, 0.0, 0.0, 0.0, 0.0, 1.0,
            ],
        );
        let singular_values = DVector::from_vec(vec![4.0, 2.0]);
        StatisticalMotionModel::from_parts(mean, directions, singular_values, 3, mask, 1e-8)
    }

    #[test]
    fn test_scales_and_ratios() {
        let model = toy_model();
        assert_eq!(model.n_components(), 2);
        assert_eq!(model.dimension(), 6);
        assert_relative_eq!(model.scales()[0], 4.0 / 2f64.sqrt());
        assert_relative_eq!(model.scales()[1], 2.0 / 2f64.sqrt());
        assert_relative_eq!(model.variance_ratio()[0], 0.8);
        assert_relative_eq!(model.variance_ratio()[1], 0.2);
        assert_relative_eq!(model.cumulative_variance()[1], 1.0);
    }

    #[test]
    fn test_mode_guards() {
        let model = toy_model();
        assert!(model.ensure_modes(2).is_ok());
        assert!(matches!(
            model.ensure_modes(3),
            Err(ModelError::DegenerateModel {
                required: 3,
                available: 2
            })
        ));
        assert!(model.direction(1).is_ok());
        assert!(matches!(
            model.direction(2),
            Err(ModelError::ModeOutOfRange { mode: 2, .. })
        ));
    }

    #[test]
    fn test_fields() {
        let model = toy_model();
        let mean = model.mean_field().unwrap();
        assert_eq!(mean.vectors(), &[[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]);

        let pc2 = model.component_field(1).unwrap();
        assert_eq!(pc2.vectors(), &[[0.0, 0.0, 0.0], [0.0, 0.0, 1.0]]);
    }

    #[test]
    fn test_metadata_json_names() {
        let json = serde_json::to_value(toy_model().metadata()).unwrap();
        for key in [
            "n_samples",
            "n_components",
            "singular_values",
            "variance_explained",
            "cumulative_variance",
        ] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
        assert_eq!(json["n_components"], 2);
    }
}
