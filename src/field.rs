//! Dense displacement fields, analysis masks, and sample sets.
//!
//! All three types own their [`GridGeometry`] and keep voxel data in the
//! grid's linear order. Lengths are checked at construction, so downstream
//! code can index freely.

use crate::error::{ModelError, Result};
use crate::geometry::GridGeometry;

/// Dense grid of 3-component displacement vectors (mm).
#[derive(Debug, Clone, PartialEq)]
pub struct DeformationField {
    geometry: GridGeometry,
    vectors: Vec<[f64; 3]>,
}

impl DeformationField {
    /// Wrap voxel vectors stored in the geometry's linear order.
    ///
    /// # Errors
    ///
    /// Returns an error if the geometry is invalid or `vectors.len()`
    /// differs from the voxel count.
    pub fn new(geometry: GridGeometry, vectors: Vec<[f64; 3]>) -> Result<Self> {
        geometry.validate()?;
        if vectors.len() != geometry.n_voxels() {
            return Err(ModelError::dimension_mismatch(
                geometry.n_voxels(),
                vectors.len(),
            ));
        }
        Ok(Self { geometry, vectors })
    }

    /// Zero displacement everywhere.
    #[must_use]
    pub fn zeros(geometry: GridGeometry) -> Self {
        let n = geometry.n_voxels();
        Self {
            geometry,
            vectors: vec![[0.0; 3]; n],
        }
    }

    /// Build a field by evaluating `f` at every voxel index `(i, j, k)`.
    #[must_use]
    pub fn from_fn(geometry: GridGeometry, f: impl Fn([usize; 3]) -> [f64; 3]) -> Self {
        let vectors = (0..geometry.n_voxels())
            .map(|linear| f(geometry.voxel_index(linear)))
            .collect();
        Self { geometry, vectors }
    }

    /// Grid the field lives on.
    #[must_use]
    pub const fn geometry(&self) -> &GridGeometry {
        &self.geometry
    }

    /// Voxel vectors in linear order.
    #[must_use]
    pub fn vectors(&self) -> &[[f64; 3]] {
        &self.vectors
    }

    /// Mutable voxel vectors in linear order.
    pub fn vectors_mut(&mut self) -> &mut [[f64; 3]] {
        &mut self.vectors
    }

    /// Displacement at voxel `(i, j, k)`.
    #[must_use]
    pub fn at(&self, index: [usize; 3]) -> [f64; 3] {
        self.vectors[self.geometry.linear_index(index[0], index[1], index[2])]
    }

    /// Euclidean displacement magnitude per voxel.
    #[must_use]
    pub fn magnitudes(&self) -> Vec<f64> {
        self.vectors
            .iter()
            .map(|v| (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt())
            .collect()
    }

    /// Pointwise sum of two fields on the same grid.
    ///
    /// # Errors
    ///
    /// Returns an error if the geometries differ.
    pub fn pointwise_sum(&self, other: &Self) -> Result<Self> {
        self.geometry.ensure_compatible(&other.geometry)?;
        let vectors = self
            .vectors
            .iter()
            .zip(other.vectors.iter())
            .map(|(a, b)| [a[0] + b[0], a[1] + b[1], a[2] + b[2]])
            .collect();
        Ok(Self {
            geometry: self.geometry.clone(),
            vectors,
        })
    }
}

/// Boolean region of interest over a grid.
///
/// The selected voxel indices are cached in ascending linear order; that
/// order is the packing basis shared by every vector built from this mask.
#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
    geometry: GridGeometry,
    voxels: Vec<bool>,
    indices: Vec<usize>,
}

impl Mask {
    /// Wrap per-voxel flags stored in the geometry's linear order.
    ///
    /// # Errors
    ///
    /// Returns an error if the geometry is invalid or `voxels.len()`
    /// differs from the voxel count.
    pub fn new(geometry: GridGeometry, voxels: Vec<bool>) -> Result<Self> {
        geometry.validate()?;
        if voxels.len() != geometry.n_voxels() {
            return Err(ModelError::dimension_mismatch(
                geometry.n_voxels(),
                voxels.len(),
            ));
        }
        let indices = voxels
            .iter()
            .enumerate()
            .filter_map(|(i, &inside)| inside.then_some(i))
            .collect();
        Ok(Self {
            geometry,
            voxels,
            indices,
        })
    }

    /// Mask from scalar voxel values; values `> 0` are inside.
    ///
    /// # Errors
    ///
    /// Returns an error if `values.len()` differs from the voxel count.
    pub fn from_values(geometry: GridGeometry, values: &[f64]) -> Result<Self> {
        Self::new(geometry, values.iter().map(|&v| v > 0.0).collect())
    }

    /// Mask covering the whole grid.
    #[must_use]
    pub fn full(geometry: GridGeometry) -> Self {
        let n = geometry.n_voxels();
        Self {
            geometry,
            voxels: vec![true; n],
            indices: (0..n).collect(),
        }
    }

    /// Build a mask by evaluating `f` at every voxel index `(i, j, k)`.
    #[must_use]
    pub fn from_fn(geometry: GridGeometry, f: impl Fn([usize; 3]) -> bool) -> Self {
        let voxels: Vec<bool> = (0..geometry.n_voxels())
            .map(|linear| f(geometry.voxel_index(linear)))
            .collect();
        let indices = voxels
            .iter()
            .enumerate()
            .filter_map(|(i, &inside)| inside.then_some(i))
            .collect();
        Self {
            geometry,
            voxels,
            indices,
        }
    }

    /// Grid the mask lives on.
    #[must_use]
    pub const fn geometry(&self) -> &GridGeometry {
        &self.geometry
    }

    /// Per-voxel flags in linear order.
    #[must_use]
    pub fn voxels(&self) -> &[bool] {
        &self.voxels
    }

    /// Linear indices of the selected voxels, ascending.
    #[must_use]
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// Number of selected voxels |M|.
    #[must_use]
    pub fn count(&self) -> usize {
        self.indices.len()
    }

    /// Whether the mask selects nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Whether voxel `(i, j, k)` is inside.
    #[must_use]
    pub fn contains(&self, index: [usize; 3]) -> bool {
        self.voxels[self.geometry.linear_index(index[0], index[1], index[2])]
    }

    /// Fail with [`ModelError::EmptyMask`] if nothing is selected.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty mask.
    pub fn ensure_not_empty(&self) -> Result<()> {
        if self.is_empty() {
            Err(ModelError::EmptyMask)
        } else {
            Ok(())
        }
    }

    /// Gather `values` (one per voxel, linear order) at the masked voxels.
    #[must_use]
    pub fn select<T: Copy>(&self, values: &[T]) -> Vec<T> {
        self.indices.iter().map(|&i| values[i]).collect()
    }
}

/// Ordered observed motion states sharing one grid.
#[derive(Debug, Clone)]
pub struct SampleSet {
    fields: Vec<DeformationField>,
    names: Vec<String>,
}

impl SampleSet {
    /// Collect fields into a sample set named `sample_1..sample_N`.
    ///
    /// # Errors
    ///
    /// Returns an error if the shared grid is invalid, or
    /// [`ModelError::GeometryMismatch`] if any field's grid differs from the
    /// first one.
    pub fn new(fields: Vec<DeformationField>) -> Result<Self> {
        if let Some((first, rest)) = fields.split_first() {
            first.geometry().validate()?;
            for (i, field) in rest.iter().enumerate() {
                first
                    .geometry()
                    .ensure_compatible(field.geometry())
                    .map_err(|e| {
                        ModelError::geometry_mismatch(format!("sample {}: {e}", i + 2))
                    })?;
            }
        }
        let names = (1..=fields.len()).map(|i| format!("sample_{i}")).collect();
        Ok(Self { fields, names })
    }

    /// Replace the sample names.
    ///
    /// # Errors
    ///
    /// Returns an error if the name count differs from the sample count.
    pub fn with_names(mut self, names: Vec<String>) -> Result<Self> {
        if names.len() != self.fields.len() {
            return Err(ModelError::dimension_mismatch(self.fields.len(), names.len()));
        }
        self.names = names;
        Ok(self)
    }

    /// Number of samples N.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the set has no samples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Samples in order.
    #[must_use]
    pub fn fields(&self) -> &[DeformationField] {
        &self.fields
    }

    /// Sample names in order.
    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Shared grid, if the set is non-empty.
    #[must_use]
    pub fn geometry(&self) -> Option<&GridGeometry> {
        self.fields.first().map(DeformationField::geometry)
    }
}
