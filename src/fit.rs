//! Low-sample PCA engine.
//!
//! This module implements [`fit`], which turns a [`SampleSet`] and a
//! [`Mask`] into a [`StatisticalMotionModel`].
//!
//! # Pipeline Overview
//!
//! 1. Pack every sample into a column of `X ∈ ℝ^{P×N}`
//! 2. Center: `μ = mean(X)`, `Xc = X − μ`
//! 3. Eigendecompose the N×N Gram matrix `G = Xcᵗ Xc`
//! 4. Map each eigenvector to voxel space, `w_k = Xc v_k`, `S_k = ‖w_k‖`
//! 5. Keep modes above the numerical floor, `U_k = w_k / S_k`
//! 6. Orient each mode deterministically
//!
//! `S_k` is the norm of `w_k`, not `sqrt(λ_k)`: a vanishing Gram eigenvalue
//! carries rounding error of order `ε·S_max²`, whose square root is close to
//! the floor, while `‖Xc v_k‖` stays of order `ε·S_max`.
//!
//! The centered matrix has rank at most N−1, so at most N−1 modes survive
//! regardless of P.

use crate::config::ModelConfig;
use crate::error::{ModelError, Result};
use crate::field::{Mask, SampleSet};
use crate::math::linalg::{
    apply_sign_correction, center_columns, column_mean, gram_eigen, recover_directions,
};
use crate::model::StatisticalMotionModel;
use crate::packing::pack_samples;
use nalgebra::DVector;
use tracing::{debug, info, warn};

/// Minimum number of samples required for a fit.
pub const MIN_SAMPLES: usize = 2;

/// Fit a statistical motion model with default configuration.
///
/// # Errors
///
/// See [`fit`].
pub fn fit_default(samples: &SampleSet, mask: &Mask) -> Result<StatisticalMotionModel> {
    fit(samples, mask, &ModelConfig::default())
}

/// Fit a statistical motion model.
///
/// This is the main entry point of the PCA engine. The result is
/// deterministic for a fixed sample order.
///
/// A sample set with fewer than two non-degenerate modes does not fail:
/// the model is returned with `K < 2` and a warning is logged. Callers that
/// need modes should check [`StatisticalMotionModel::n_components`] or call
/// [`StatisticalMotionModel::ensure_modes`].
///
/// # Arguments
///
/// * `samples` - N displacement fields on one grid
/// * `mask` - Analysis domain on the same grid
/// * `config` - Numerical floors and optional mode cap
///
/// # Errors
///
/// Returns an error if:
/// - N < 2, or N < k + 1 when `config.n_components = Some(k)`
/// - The mask is empty
/// - Sample and mask grids differ
/// - The configuration is invalid
///
/// # Example
///
/// ```
/// use motion_model::{fit_default, DeformationField, GridGeometry, Mask, SampleSet};
///
/// let grid = GridGeometry::with_shape([4, 4, 4])?;
/// let fields = (0..3)
///     .map(|s| DeformationField::from_fn(grid.clone(), |[i, j, _]| {
///         let t = s as f64;
///         [t * i as f64, t * t * j as f64, 0.0]
///     }))
///     .collect();
/// let samples = SampleSet::new(fields)?;
/// let mask = Mask::full(grid);
///
/// let model = fit_default(&samples, &mask)?;
/// assert_eq!(model.n_components(), 2);
/// # Ok::<(), motion_model::ModelError>(())
/// ```
pub fn fit(
    samples: &SampleSet,
    mask: &Mask,
    config: &ModelConfig,
) -> Result<StatisticalMotionModel> {
    validate_inputs(samples, mask, config)?;

    let n = samples.len();

    // =========================================================================
    // 1. DESIGN MATRIX
    // =========================================================================
    let x = pack_samples(samples, mask)?;
    debug!(
        rows = x.nrows(),
        cols = x.ncols(),
        mask_voxels = mask.count(),
        "packed design matrix"
    );

    // =========================================================================
    // 2. CENTERING
    // =========================================================================
    let mean = column_mean(&x);
    let centered = center_columns(&x, &mean);

    // =========================================================================
    // 3. GRAM EIGENDECOMPOSITION
    // =========================================================================
    let eigen = gram_eigen(&centered);

    // =========================================================================
    // 4. VOXEL-SPACE CANDIDATES
    // =========================================================================
    let candidates = recover_directions(&centered, &eigen.eigenvectors, mode_cap(n, config));

    // =========================================================================
    // 5. RETAINED MODES
    // =========================================================================
    let retained = retained_modes(&candidates.singular_values, config);
    for k in 0..retained {
        debug!(
            mode = k + 1,
            singular_value = candidates.singular_values[k],
            "recovered mode"
        );
    }

    let mut directions = candidates.directions.columns(0, retained).into_owned();
    if config.sign_correction {
        apply_sign_correction(&mut directions);
    }
    let singular_values = candidates.singular_values.rows(0, retained).into_owned();

    let model = StatisticalMotionModel::from_parts(
        mean,
        directions,
        singular_values,
        n,
        mask.clone(),
        config.scale_eps,
    );

    if model.is_degenerate() {
        warn!(
            n_samples = n,
            n_components = model.n_components(),
            "degenerate motion model: fewer than 2 non-degenerate modes"
        );
    }
    info!(
        n_samples = n,
        n_components = model.n_components(),
        variance_explained = ?model.variance_ratio(),
        "fitted statistical motion model"
    );

    Ok(model)
}

/// Validate fit inputs.
fn validate_inputs(samples: &SampleSet, mask: &Mask, config: &ModelConfig) -> Result<()> {
    config.validate()?;

    let n = samples.len();
    if n < MIN_SAMPLES {
        return Err(ModelError::insufficient_samples(MIN_SAMPLES, n));
    }
    if let Some(k) = config.n_components {
        if n < k + 1 {
            return Err(ModelError::insufficient_samples(k + 1, n));
        }
    }

    mask.ensure_not_empty()?;
    if let Some(geometry) = samples.geometry() {
        mask.geometry().ensure_compatible(geometry)?;
    }
    Ok(())
}

/// Upper bound on K: N−1, and `n_components` when set.
fn mode_cap(n_samples: usize, config: &ModelConfig) -> usize {
    let cap = n_samples.saturating_sub(1);
    config.n_components.map_or(cap, |k| cap.min(k))
}

/// Count leading singular values that survive the numerical floor.
///
/// A mode survives when `S_k > floor · S_max` and `S_k > scale_eps`, where
/// `S_k = ‖Xc v_k‖` is measured in voxel space. Counting stops at the first
/// mode below the floor.
fn retained_modes(singular: &DVector<f64>, config: &ModelConfig) -> usize {
    let s_max = singular.iter().copied().fold(0.0f64, f64::max);
    let threshold = (config.singular_floor * s_max).max(config.scale_eps);
    singular.iter().take_while(|&&s| s > threshold).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::DeformationField;
    use crate::geometry::GridGeometry;
    use crate::math::linalg::orthonormality_error;
    use approx::assert_relative_eq;

    fn grid() -> GridGeometry {
        GridGeometry::with_shape([3, 3, 3]).unwrap()
    }

    fn wave(grid: &GridGeometry, amp: [f64; 2]) -> DeformationField {
        DeformationField::from_fn(grid.clone(), |[i, j, k]| {
            let x = i as f64;
            let y = j as f64;
            let z = k as f64;
            [
                amp[0] * (x + 0.5 * y).sin(),
                amp[1] * (z - x).cos(),
                amp[0] * amp[1] * 0.1 * y,
            ]
        })
    }

    fn sample_set(amps: &[[f64; 2]]) -> SampleSet {
        let g = grid();
        SampleSet::new(amps.iter().map(|&a| wave(&g, a)).collect()).unwrap()
    }

    #[test]
    fn test_fit_retains_n_minus_one() {
        let samples = sample_set(&[[1.0, 0.2], [0.5, 1.0], [-0.3, 0.7], [0.9, -1.1]]);
        let model = fit_default(&samples, &Mask::full(grid())).unwrap();

        assert_eq!(model.n_components(), 3);
        assert!(orthonormality_error(model.directions()) < 1e-6);
        assert_relative_eq!(model.variance_ratio().iter().sum::<f64>(), 1.0, epsilon = 1e-6);

        let s = model.singular_values();
        assert!(s[0] >= s[1] && s[1] >= s[2]);
    }

    #[test]
    fn test_fit_is_deterministic() {
        let samples = sample_set(&[[1.0, 0.2], [0.5, 1.0], [-0.3, 0.7]]);
        let mask = Mask::full(grid());
        let a = fit_default(&samples, &mask).unwrap();
        let b = fit_default(&samples, &mask).unwrap();
        assert_eq!(a.directions(), b.directions());
        assert_eq!(a.mean(), b.mean());
    }

    #[test]
    fn test_insufficient_samples() {
        let samples = sample_set(&[[1.0, 0.2]]);
        let err = fit_default(&samples, &Mask::full(grid())).unwrap_err();
        assert!(matches!(
            err,
            ModelError::InsufficientSamples {
                required: 2,
                actual: 1
            }
        ));

        let two = sample_set(&[[1.0, 0.2], [0.3, 0.4]]);
        let config = ModelConfig::default().with_n_components(2);
        let err = fit(&two, &Mask::full(grid()), &config).unwrap_err();
        assert!(matches!(
            err,
            ModelError::InsufficientSamples {
                required: 3,
                actual: 2
            }
        ));
    }

    #[test]
    fn test_two_samples_is_degenerate_not_error() {
        let samples = sample_set(&[[1.0, 0.2], [0.3, 0.4]]);
        let model = fit_default(&samples, &Mask::full(grid())).unwrap();
        assert_eq!(model.n_components(), 1);
        assert!(model.is_degenerate());
        assert_relative_eq!(model.variance_ratio()[0], 1.0);
    }

    #[test]
    fn test_identical_samples_yield_no_modes() {
        let samples = sample_set(&[[0.1, 0.3], [0.1, 0.3], [0.1, 0.3]]);
        let model = fit_default(&samples, &Mask::full(grid())).unwrap();
        assert_eq!(model.n_components(), 0);
        assert!(matches!(
            model.ensure_modes(1),
            Err(ModelError::DegenerateModel { .. })
        ));
    }

    #[test]
    fn test_rank_two_samples_keep_two_modes() {
        let g = grid();
        let coefficients = [
            (1.0, 0.2),
            (0.5, 1.0),
            (-0.3, 0.7),
            (0.9, -1.1),
            (0.1, 0.1),
            (-1.4, 0.0),
        ];
        let fields = coefficients
            .iter()
            .map(|&(a, b)| {
                DeformationField::from_fn(g.clone(), move |[i, j, k]| {
                    let (x, y, z) = (i as f64, j as f64, k as f64);
                    [a * (x + 0.5 * y).sin(), b * (z - x).cos(), 0.2 * a - 0.1 * b * y]
                })
            })
            .collect();
        let samples = SampleSet::new(fields).unwrap();
        let model = fit_default(&samples, &Mask::full(g)).unwrap();

        assert_eq!(model.n_components(), 2);
        assert!(orthonormality_error(model.directions()) < 1e-6);
        assert_relative_eq!(model.variance_ratio().iter().sum::<f64>(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_component_cap() {
        let samples = sample_set(&[[1.0, 0.2], [0.5, 1.0], [-0.3, 0.7], [0.9, -1.1]]);
        let model = fit(&samples, &Mask::full(grid()), &ModelConfig::single_mode()).unwrap();
        assert_eq!(model.n_components(), 1);
        assert_relative_eq!(model.variance_ratio()[0], 1.0);
    }

    #[test]
    fn test_mask_geometry_checked() {
        let samples = sample_set(&[[1.0, 0.2], [0.5, 1.0]]);
        let other = Mask::full(GridGeometry::with_shape([3, 3, 4]).unwrap());
        assert!(matches!(
            fit_default(&samples, &other),
            Err(ModelError::GeometryMismatch(_))
        ));

        let empty = Mask::from_fn(grid(), |_| false);
        assert!(matches!(
            fit_default(&samples, &empty),
            Err(ModelError::EmptyMask)
        ));
    }

    #[test]
    fn test_sign_correction_orients_modes() {
        let samples = sample_set(&[[1.0, 0.2], [0.5, 1.0], [-0.3, 0.7]]);
        let model = fit_default(&samples, &Mask::full(grid())).unwrap();
        for column in model.directions().column_iter() {
            let pivot = column
                .iter()
                .copied()
                .fold(0.0f64, |best, v| if v.abs() > best.abs() { v } else { best });
            assert!(pivot > 0.0);
        }
    }
}
