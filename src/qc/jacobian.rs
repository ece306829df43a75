//! Jacobian safety check.
//!
//! The transform `x ↦ x + u(x)` has local volume change `det(I + ∇u)`.
//! Values near 1 mean little compression or expansion; negative values mean
//! the field folds space onto itself, which no physical tissue motion does.
//!
//! `∇u` is evaluated in physical space. Index-space differences (central in
//! the interior, one-sided on the border) are divided by the voxel spacing
//! and rotated by the direction cosines: `∇u = G · diag(1/s) · Dᵗ`.

use crate::config::QcThresholds;
use crate::error::{ModelError, Result};
use crate::field::{DeformationField, Mask};
use crate::math::stats::{percentile_sorted, sorted};
use crate::qc::masked;
use nalgebra::Matrix3;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Jacobian determinant `det(I + ∇u)` at every voxel, in linear order.
#[must_use]
pub fn jacobian_determinants(field: &DeformationField) -> Vec<f64> {
    let geometry = field.geometry();
    let rotation_t = geometry.direction_matrix().transpose();
    let spacing = geometry.spacing;

    (0..geometry.n_voxels())
        .into_par_iter()
        .map(|linear| {
            let index = geometry.voxel_index(linear);
            let mut gradient = Matrix3::zeros();
            for axis in 0..3 {
                let d = axis_derivative(field, index, axis);
                for c in 0..3 {
                    gradient[(c, axis)] = d[c] / spacing[axis];
                }
            }
            (Matrix3::identity() + gradient * rotation_t).determinant()
        })
        .collect()
}

/// `∂u/∂index_axis` at `index`; zero along axes of extent 1.
fn axis_derivative(field: &DeformationField, index: [usize; 3], axis: usize) -> [f64; 3] {
    let extent = field.geometry().shape[axis];
    if extent < 2 {
        return [0.0; 3];
    }
    let i = index[axis];
    let (lo, hi, step) = if i == 0 {
        (0, 1, 1.0)
    } else if i == extent - 1 {
        (extent - 2, extent - 1, 1.0)
    } else {
        (i - 1, i + 1, 2.0)
    };

    let mut at_lo = index;
    at_lo[axis] = lo;
    let mut at_hi = index;
    at_hi[axis] = hi;
    let (a, b) = (field.at(at_lo), field.at(at_hi));
    [(b[0] - a[0]) / step, (b[1] - a[1]) / step, (b[2] - a[2]) / step]
}

/// Masked Jacobian distribution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JacobianStats {
    /// 1st percentile.
    pub p01: f64,
    /// Median.
    pub p50: f64,
    /// 99th percentile.
    pub p99: f64,
    /// Percentage of masked voxels with a negative determinant.
    pub neg_percent: f64,
    /// Smallest determinant.
    pub min: f64,
    /// Largest determinant.
    pub max: f64,
}

impl JacobianStats {
    fn from_values(values: &[f64]) -> Self {
        let s = sorted(values);
        let negative = s.iter().take_while(|&&v| v < 0.0).count();
        let neg_percent = if s.is_empty() {
            0.0
        } else {
            100.0 * negative as f64 / s.len() as f64
        };
        Self {
            p01: percentile_sorted(&s, 1.0).unwrap_or(1.0),
            p50: percentile_sorted(&s, 50.0).unwrap_or(1.0),
            p99: percentile_sorted(&s, 99.0).unwrap_or(1.0),
            neg_percent,
            min: s.first().copied().unwrap_or(1.0),
            max: s.last().copied().unwrap_or(1.0),
        }
    }
}

/// Jacobian gate outcome for one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JacobianQc {
    /// Masked distribution.
    #[serde(flatten)]
    pub stats: JacobianStats,
    /// Whether every gate holds.
    pub passed: bool,
    /// Failed gates, human-readable.
    pub issues: Vec<String>,
}

impl JacobianQc {
    fn grade(stats: JacobianStats, thresholds: &QcThresholds) -> Self {
        let mut issues = Vec::new();
        if stats.neg_percent >= thresholds.max_negative_percent && stats.neg_percent > 0.0 {
            issues.push(format!(
                "{:.3}% of voxels fold (limit {}%)",
                stats.neg_percent, thresholds.max_negative_percent
            ));
        }
        if stats.p01 <= thresholds.min_p01 {
            issues.push(format!(
                "P01 {:.4} is not above {}",
                stats.p01, thresholds.min_p01
            ));
        }
        if stats.p99 >= thresholds.max_p99 {
            issues.push(format!(
                "P99 {:.4} is not below {}",
                stats.p99, thresholds.max_p99
            ));
        }
        Self {
            stats,
            passed: issues.is_empty(),
            issues,
        }
    }
}

/// Jacobian QC of one field inside `mask`.
///
/// # Errors
///
/// Returns an error if the thresholds or the field grid are invalid, the
/// mask is empty, or its grid differs from the field grid. Failing gates
/// are reported, not raised.
pub fn check_jacobian(
    field: &DeformationField,
    mask: &Mask,
    thresholds: &QcThresholds,
) -> Result<JacobianQc> {
    thresholds.validate()?;
    field.geometry().validate()?;
    let values = masked(&jacobian_determinants(field), mask, field.geometry())?;
    let qc = JacobianQc::grade(JacobianStats::from_values(&values), thresholds);
    debug!(
        p01 = qc.stats.p01,
        p50 = qc.stats.p50,
        p99 = qc.stats.p99,
        neg_percent = qc.stats.neg_percent,
        "jacobian stats"
    );
    Ok(qc)
}

/// Jacobian QC keyed by field id.
///
/// Serializes as `{<id>: {p01, p50, p99, neg_percent, min, max, passed,
/// issues}, ...}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JacobianQcReport {
    /// Per-field outcome.
    pub entries: BTreeMap<String, JacobianQc>,
}

impl JacobianQcReport {
    /// Whether every field passed.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.entries.values().all(|qc| qc.passed)
    }

    /// Ids of failing fields, in key order.
    #[must_use]
    pub fn failures(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(_, qc)| !qc.passed)
            .map(|(id, _)| id.as_str())
            .collect()
    }
}

/// Jacobian QC over many named fields, evaluated in parallel.
///
/// # Errors
///
/// Returns [`ModelError::InvalidInput`] if an id is listed twice, and
/// otherwise propagates the first structural error.
pub fn jacobian_report(
    fields: &[(&str, &DeformationField)],
    mask: &Mask,
    thresholds: &QcThresholds,
) -> Result<JacobianQcReport> {
    thresholds.validate()?;
    let mut seen = BTreeSet::new();
    if let Some(&(id, _)) = fields.iter().find(|&&(id, _)| !seen.insert(id)) {
        return Err(ModelError::invalid_input(format!(
            "field id {id} is listed more than once"
        )));
    }

    let entries = fields
        .par_iter()
        .map(|&(id, field)| Ok((id.to_string(), check_jacobian(field, mask, thresholds)?)))
        .collect::<Result<BTreeMap<_, _>>>()?;
    let report = JacobianQcReport { entries };

    let failures = report.failures();
    if !failures.is_empty() {
        warn!(failures = ?failures, "jacobian gate failed");
    }
    Ok(report)
}
