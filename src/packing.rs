//! Conversion between dense fields and flat masked-voxel vectors.
//!
//! A packed vector holds `[ux, uy, uz]` for every masked voxel, voxels taken
//! in the mask's ascending linear order. Every vector built from the same
//! mask therefore shares one coordinate basis, which is what lets the PCA
//! engine treat fields as points in ℝ^{3|M|}.

use crate::error::{ModelError, Result};
use crate::field::{DeformationField, Mask, SampleSet};
use crate::geometry::GridGeometry;
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;

/// Components per voxel.
pub const COMPONENTS: usize = 3;

/// Pack the masked voxels of `field` into a vector of length `3|M|`.
///
/// # Errors
///
/// Returns [`ModelError::GeometryMismatch`] if the field and mask grids
/// differ, or [`ModelError::EmptyMask`] if the mask selects nothing.
pub fn pack(field: &DeformationField, mask: &Mask) -> Result<DVector<f64>> {
    mask.ensure_not_empty()?;
    field.geometry().ensure_compatible(mask.geometry())?;

    let vectors = field.vectors();
    let packed = mask
        .indices()
        .iter()
        .flat_map(|&i| vectors[i])
        .collect::<Vec<f64>>();
    Ok(DVector::from_vec(packed))
}

/// Scatter a packed vector back onto a dense grid.
///
/// Voxels outside the mask get zero displacement.
///
/// # Errors
///
/// Returns [`ModelError::GeometryMismatch`] if `geometry` differs from the
/// mask grid, [`ModelError::EmptyMask`] for an empty mask, and
/// [`ModelError::DimensionMismatch`] if `vector.len() != 3|M|`.
pub fn unpack(vector: &[f64], mask: &Mask, geometry: &GridGeometry) -> Result<DeformationField> {
    mask.ensure_not_empty()?;
    geometry.ensure_compatible(mask.geometry())?;

    let expected = COMPONENTS * mask.count();
    if vector.len() != expected {
        return Err(ModelError::dimension_mismatch(expected, vector.len()));
    }

    let mut field = DeformationField::zeros(geometry.clone());
    let out = field.vectors_mut();
    for (&voxel, v) in mask.indices().iter().zip(vector.chunks_exact(COMPONENTS)) {
        out[voxel] = [v[0], v[1], v[2]];
    }
    Ok(field)
}

/// Build the design matrix `X ∈ ℝ^{P×N}`, one packed sample per column.
///
/// Samples are packed independently in parallel; column order follows the
/// sample order.
///
/// # Errors
///
/// Propagates the first packing error (geometry mismatch or empty mask).
pub fn pack_samples(samples: &SampleSet, mask: &Mask) -> Result<DMatrix<f64>> {
    mask.ensure_not_empty()?;
    let columns = samples
        .fields()
        .par_iter()
        .map(|field| pack(field, mask))
        .collect::<Result<Vec<DVector<f64>>>>()?;

    let p = COMPONENTS * mask.count();
    if columns.is_empty() {
        return Ok(DMatrix::zeros(p, 0));
    }
    Ok(DMatrix::from_columns(&columns))
}
