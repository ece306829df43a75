//! Quality-control validators for synthesized fields.
//!
//! All validators are read-only diagnostics. Gate failures come back as
//! data (`passed = false` plus human-readable issues), never as errors;
//! only structural problems such as a grid mismatch are raised.
//!
//! - [`inverse_consistency`]: magnitude of `u(+β) + u(−β)` per mode
//! - [`composition`]: `u_f(x) + u_b(x + u_f(x))` for a forward/backward pair
//! - [`jacobian`]: local volume change `det(I + ∇u)` and folding
//! - [`magnitude`]: displacement magnitude distribution

pub mod composition;
pub mod inverse_consistency;
pub mod jacobian;
pub mod magnitude;

pub use composition::{
    check_composition_consistency, composition_residuals, sample_trilinear, CompositionConsistency,
};
pub use inverse_consistency::{
    check_inverse_consistency, inverse_consistency_report, pair_label, ConsistencyGrade,
    InverseConsistencyMetadata, InverseConsistencyReport, InverseConsistencyResult,
    ResidualStats,
};
pub use jacobian::{
    check_jacobian, jacobian_determinants, jacobian_report, JacobianQc, JacobianQcReport,
    JacobianStats,
};
pub use magnitude::{displacement_magnitude, MagnitudeStats};

use crate::error::Result;
use crate::field::Mask;
use crate::geometry::GridGeometry;

/// Masked values of a per-voxel quantity, checking the mask fits `geometry`.
pub(crate) fn masked(values: &[f64], mask: &Mask, geometry: &GridGeometry) -> Result<Vec<f64>> {
    mask.ensure_not_empty()?;
    geometry.ensure_compatible(mask.geometry())?;
    Ok(mask.select(values))
}
