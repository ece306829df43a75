//! Voxel grid geometry.
//!
//! A [`GridGeometry`] fixes the voxel lattice a field lives on: shape,
//! spacing (mm), origin (mm), and direction cosines. Voxels are addressed in
//! linear order `i + j*nx + k*nx*ny` (x fastest), which is also the packing
//! order used by [`crate::packing`].

use crate::error::{ModelError, Result};
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

/// Tolerance used when comparing spacing, origin and direction.
///
/// Volumetric headers store these as `f32`, so exact equality is too strict
/// for grids that went through a save/load cycle.
pub const GEOMETRY_TOLERANCE: f64 = 1e-5;

/// Voxel lattice of a volumetric field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridGeometry {
    /// Number of voxels along x, y, z.
    pub shape: [usize; 3],

    /// Voxel size along x, y, z in mm.
    pub spacing: [f64; 3],

    /// Physical position of voxel (0, 0, 0) in mm.
    pub origin: [f64; 3],

    /// Direction cosines, row-major; column `c` is the physical direction
    /// of index axis `c`.
    pub direction: [[f64; 3]; 3],
}

impl GridGeometry {
    /// Create a geometry with identity direction cosines.
    ///
    /// # Errors
    ///
    /// Returns an error if any dimension is zero or any spacing is not
    /// strictly positive.
    pub fn new(shape: [usize; 3], spacing: [f64; 3], origin: [f64; 3]) -> Result<Self> {
        let geometry = Self {
            shape,
            spacing,
            origin,
            direction: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
        };
        geometry.validate()?;
        Ok(geometry)
    }

    /// Unit-spacing, zero-origin geometry of the given shape.
    ///
    /// # Errors
    ///
    /// Returns an error if any dimension is zero.
    pub fn with_shape(shape: [usize; 3]) -> Result<Self> {
        Self::new(shape, [1.0; 3], [0.0; 3])
    }

    /// Replace the direction cosines.
    #[must_use]
    pub const fn with_direction(mut self, direction: [[f64; 3]; 3]) -> Self {
        self.direction = direction;
        self
    }

    /// Check that the geometry describes a usable lattice.
    ///
    /// # Errors
    ///
    /// Returns an error for empty shapes, non-positive spacing, or direction
    /// cosines that are not finite or do not span space.
    pub fn validate(&self) -> Result<()> {
        if self.shape.iter().any(|&n| n == 0) {
            return Err(ModelError::invalid_input(format!(
                "grid shape {:?} has an empty axis",
                self.shape
            )));
        }
        if self.spacing.iter().any(|&s| !(s > 0.0 && s.is_finite())) {
            return Err(ModelError::invalid_input(format!(
                "grid spacing {:?} must be positive",
                self.spacing
            )));
        }
        let direction = self.direction_matrix();
        if direction.iter().any(|v| !v.is_finite()) || direction.determinant().abs() < 1e-6 {
            return Err(ModelError::invalid_input(format!(
                "grid direction {:?} is singular",
                self.direction
            )));
        }
        Ok(())
    }

    /// Total number of voxels.
    #[must_use]
    pub const fn n_voxels(&self) -> usize {
        self.shape[0] * self.shape[1] * self.shape[2]
    }

    /// Linear index of voxel `(i, j, k)`.
    #[must_use]
    #[inline]
    pub const fn linear_index(&self, i: usize, j: usize, k: usize) -> usize {
        i + self.shape[0] * (j + self.shape[1] * k)
    }

    /// Inverse of [`Self::linear_index`].
    #[must_use]
    #[inline]
    pub const fn voxel_index(&self, linear: usize) -> [usize; 3] {
        let nx = self.shape[0];
        let ny = self.shape[1];
        [linear % nx, (linear / nx) % ny, linear / (nx * ny)]
    }

    /// Direction cosine matrix.
    #[must_use]
    pub fn direction_matrix(&self) -> Matrix3<f64> {
        let d = &self.direction;
        Matrix3::new(
            d[0][0], d[0][1], d[0][2], d[1][0], d[1][1], d[1][2], d[2][0], d[2][1], d[2][2],
        )
    }

    /// Physical position (mm) of voxel `(i, j, k)`.
    #[must_use]
    pub fn index_to_physical(&self, index: [usize; 3]) -> [f64; 3] {
        let scaled = Vector3::new(
            index[0] as f64 * self.spacing[0],
            index[1] as f64 * self.spacing[1],
            index[2] as f64 * self.spacing[2],
        );
        let p = self.direction_matrix() * scaled;
        [
            p[0] + self.origin[0],
            p[1] + self.origin[1],
            p[2] + self.origin[2],
        ]
    }

    /// Continuous voxel index of physical point `p` (mm).
    ///
    /// Inverse of [`Self::index_to_physical`] extended to fractional
    /// indices. Returns `None` if the direction cosines are singular.
    #[must_use]
    pub fn physical_to_index(&self, p: [f64; 3]) -> Option<[f64; 3]> {
        let inverse = self.direction_matrix().try_inverse()?;
        let offset = Vector3::new(
            p[0] - self.origin[0],
            p[1] - self.origin[1],
            p[2] - self.origin[2],
        );
        let scaled = inverse * offset;
        Some([
            scaled[0] / self.spacing[0],
            scaled[1] / self.spacing[1],
            scaled[2] / self.spacing[2],
        ])
    }

    /// Whether two geometries describe the same lattice.
    #[must_use]
    pub fn is_compatible(&self, other: &Self) -> bool {
        self.mismatch(other).is_none()
    }

    /// Fail with [`ModelError::GeometryMismatch`] unless both grids match.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first differing attribute.
    pub fn ensure_compatible(&self, other: &Self) -> Result<()> {
        match self.mismatch(other) {
            None => Ok(()),
            Some(reason) => Err(ModelError::geometry_mismatch(reason)),
        }
    }

    fn mismatch(&self, other: &Self) -> Option<String> {
        if self.shape != other.shape {
            return Some(format!("shape {:?} vs {:?}", self.shape, other.shape));
        }
        if !close3(&self.spacing, &other.spacing) {
            return Some(format!("spacing {:?} vs {:?}", self.spacing, other.spacing));
        }
        if !close3(&self.origin, &other.origin) {
            return Some(format!("origin {:?} vs {:?}", self.origin, other.origin));
        }
        let same_direction = self
            .direction
            .iter()
            .zip(other.direction.iter())
            .all(|(a, b)| close3(a, b));
        if !same_direction {
            return Some("direction cosines differ".to_string());
        }
        None
    }
}

fn close3(a: &[f64; 3], b: &[f64; 3]) -> bool {
    a.iter()
        .zip(b.iter())
        .all(|(x, y)| (x - y).abs() <= GEOMETRY_TOLERANCE * (1.0 + x.abs().max(y.abs())))
}
