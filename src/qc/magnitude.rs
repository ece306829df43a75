//! Displacement magnitude distribution.

use crate::error::Result;
use crate::field::{DeformationField, Mask};
use crate::math::stats::{mean, percentile_sorted, sorted};
use crate::qc::masked;
use serde::{Deserialize, Serialize};

/// Masked `|u|` distribution (mm).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MagnitudeStats {
    /// Median magnitude.
    pub median_mm: f64,
    /// 75th percentile.
    pub p75_mm: f64,
    /// 95th percentile.
    pub p95_mm: f64,
    /// Mean magnitude.
    pub mean_mm: f64,
    /// Largest magnitude.
    pub max_mm: f64,
}

/// Summarize `|u|` inside `mask`.
///
/// # Errors
///
/// Returns an error if the mask is empty or on a different grid.
pub fn displacement_magnitude(field: &DeformationField, mask: &Mask) -> Result<MagnitudeStats> {
    let s = sorted(&masked(&field.magnitudes(), mask, field.geometry())?);
    Ok(MagnitudeStats {
        median_mm: percentile_sorted(&s, 50.0).unwrap_or(0.0),
        p75_mm: percentile_sorted(&s, 75.0).unwrap_or(0.0),
        p95_mm: percentile_sorted(&s, 95.0).unwrap_or(0.0),
        mean_mm: mean(&s).unwrap_or(0.0),
        max_mm: s.last().copied().unwrap_or(0.0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModelError;
    use crate::geometry::GridGeometry;
    use approx::assert_relative_eq;

    #[test]
    fn test_magnitude_stats() {
        let g = GridGeometry::with_shape([5, 1, 1]).unwrap();
        // magnitudes 0, 5, 10, 15, 20 via a 3-4-5 triangle
        let field = DeformationField::from_fn(g.clone(), |[i, _, _]| {
            let t = i as f64;
            [3.0 * t, 4.0 * t, 0.0]
        });
        let stats = displacement_magnitude(&field, &Mask::full(g)).unwrap();
        assert_relative_eq!(stats.median_mm, 10.0, epsilon = 1e-12);
        assert_relative_eq!(stats.p75_mm, 15.0, epsilon = 1e-12);
        assert_relative_eq!(stats.p95_mm, 19.0, epsilon = 1e-12);
        assert_relative_eq!(stats.mean_mm, 10.0, epsilon = 1e-12);
        assert_relative_eq!(stats.max_mm, 20.0, epsilon = 1e-12);
    }

    #[test]
    fn test_mask_restricts() {
        let g = GridGeometry::with_shape([5, 1, 1]).unwrap();
        let field = DeformationField::from_fn(g.clone(), |[i, _, _]| [i as f64, 0.0, 0.0]);
        let mask = Mask::from_fn(g.clone(), |[i, _, _]| i < 2);
        let stats = displacement_magnitude(&field, &mask).unwrap();
        assert_relative_eq!(stats.max_mm, 1.0);

        let empty = Mask::from_fn(g, |_| false);
        assert!(matches!(
            displacement_magnitude(&field, &empty),
            Err(ModelError::EmptyMask)
        ));
    }
}
