//! Inverse consistency of a forward/backward field pair.
//!
//! For a forward field `u_f` (A → B) and a backward field `u_b` (B → A) on
//! the same grid, the composed displacement at a voxel `x` is
//!
//! ```text
//! r(x) = u_f(x) + u_b(x + u_f(x))
//! ```
//!
//! which vanishes when `u_b` exactly undoes `u_f`. `u_b` is sampled off the
//! lattice by trilinear interpolation in voxel space; points outside the
//! grid take the value of the nearest border voxel.

use crate::config::QcThresholds;
use crate::error::{ModelError, Result};
use crate::field::{DeformationField, Mask};
use crate::qc::inverse_consistency::{ConsistencyGrade, ResidualStats};
use crate::qc::masked;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Trilinear sample of `field` at continuous voxel index `index`.
///
/// Coordinates are clamped to `[0, n−1]` per axis before interpolation.
#[must_use]
pub fn sample_trilinear(field: &DeformationField, index: [f64; 3]) -> [f64; 3] {
    let shape = field.geometry().shape;

    let mut lo = [0usize; 3];
    let mut hi = [0usize; 3];
    let mut weight = [0.0f64; 3];
    for axis in 0..3 {
        let last = shape[axis].saturating_sub(1);
        let t = index[axis].clamp(0.0, last as f64);
        let floor = t.floor();
        lo[axis] = floor as usize;
        hi[axis] = (lo[axis] + 1).min(last);
        weight[axis] = t - floor;
    }

    let mut out = [0.0; 3];
    for corner in 0..8 {
        let mut at = [0usize; 3];
        let mut w = 1.0;
        for axis in 0..3 {
            if (corner >> axis) & 1 == 1 {
                at[axis] = hi[axis];
                w *= weight[axis];
            } else {
                at[axis] = lo[axis];
                w *= 1.0 - weight[axis];
            }
        }
        if w == 0.0 {
            continue;
        }
        let v = field.at(at);
        for c in 0..3 {
            out[c] += w * v[c];
        }
    }
    out
}

/// `|u_f(x) + u_b(x + u_f(x))|` at every voxel, in linear order.
///
/// # Errors
///
/// Returns an error if the two grids differ or the grid is invalid.
pub fn composition_residuals(
    forward: &DeformationField,
    backward: &DeformationField,
) -> Result<Vec<f64>> {
    let geometry = forward.geometry();
    geometry.validate()?;
    geometry.ensure_compatible(backward.geometry())?;

    (0..geometry.n_voxels())
        .into_par_iter()
        .map(|linear| {
            let index = geometry.voxel_index(linear);
            let u = forward.vectors()[linear];
            let x = geometry.index_to_physical(index);
            let target = geometry
                .physical_to_index([x[0] + u[0], x[1] + u[1], x[2] + u[2]])
                .ok_or_else(|| ModelError::invalid_input("grid direction is singular"))?;
            let v = sample_trilinear(backward, target);
            Ok(((u[0] + v[0]).powi(2) + (u[1] + v[1]).powi(2) + (u[2] + v[2]).powi(2)).sqrt())
        })
        .collect()
}

/// Result of [`check_composition_consistency`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositionConsistency {
    /// Masked composition residual (mm).
    #[serde(flatten)]
    pub residual: ResidualStats,
    /// Grade of the median residual.
    pub grade: ConsistencyGrade,
    /// Whether the grade is excellent or good.
    pub passed: bool,
    /// Human-readable findings.
    pub issues: Vec<String>,
}

/// Check how well `backward` inverts `forward` inside `mask`.
///
/// Graded with the same median limits as the ±β symmetry check.
///
/// # Errors
///
/// Returns an error if the thresholds are invalid, the grids differ, or the
/// mask is empty. A poor residual is not an error.
pub fn check_composition_consistency(
    forward: &DeformationField,
    backward: &DeformationField,
    mask: &Mask,
    thresholds: &QcThresholds,
) -> Result<CompositionConsistency> {
    thresholds.validate()?;
    let residuals = composition_residuals(forward, backward)?;
    let residual = ResidualStats::from_values(&masked(&residuals, mask, forward.geometry())?);
    let grade = ConsistencyGrade::from_median(residual.median_mm, thresholds);

    let mut issues = Vec::new();
    if grade == ConsistencyGrade::Warning {
        issues.push(format!(
            "median composition residual {:.4} mm exceeds {} mm",
            residual.median_mm, thresholds.ic_good_mm
        ));
        warn!(median_mm = residual.median_mm, "forward/backward pair is not inverse-consistent");
    }
    debug!(
        median_mm = residual.median_mm,
        p95_mm = residual.p95_mm,
        ?grade,
        "composition consistency"
    );

    Ok(CompositionConsistency {
        residual,
        grade,
        passed: grade != ConsistencyGrade::Warning,
        issues,
    })
}
