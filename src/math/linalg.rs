//! Linear algebra utilities for the low-sample PCA engine.
//!
//! This module provides the Gram-matrix eigendecomposition, recovery of
//! voxel-space directions, deterministic sign correction of principal
//! directions, and orthonormality checks, using nalgebra for the dense work.

use nalgebra::{DMatrix, DVector, SymmetricEigen};

/// Eigendecomposition of a symmetric sample-space Gram matrix.
#[derive(Debug, Clone)]
pub struct GramEigen {
    /// Eigenvalues sorted in descending order.
    pub eigenvalues: DVector<f64>,

    /// Eigenvectors as columns, sorted by corresponding eigenvalue.
    pub eigenvectors: DMatrix<f64>,
}

impl GramEigen {
    /// Singular values `sqrt(max(λ, 0))`, in the same (descending) order.
    #[must_use]
    pub fn singular_values(&self) -> DVector<f64> {
        self.eigenvalues.map(|v| v.max(0.0).sqrt())
    }
}

/// Column means of `x` as a single column vector.
#[must_use]
pub fn column_mean(x: &DMatrix<f64>) -> DVector<f64> {
    let n = x.ncols().max(1) as f64;
    x.column_sum() / n
}

/// Subtract `mean` from every column of `x`.
#[must_use]
pub fn center_columns(x: &DMatrix<f64>, mean: &DVector<f64>) -> DMatrix<f64> {
    let mut centered = x.clone();
    for mut column in centered.column_iter_mut() {
        column -= mean;
    }
    centered
}

/// Eigendecompose the N×N Gram matrix `Xcᵗ Xc` of centered columns.
///
/// Never forms the P×P covariance; cost is O(N²·P) for the product plus
/// an N×N symmetric eigensolve.
#[must_use]
pub fn gram_eigen(centered: &DMatrix<f64>) -> GramEigen {
    let gram = centered.tr_mul(centered);
    let n = gram.nrows();
    let eigen = SymmetricEigen::new(gram);

    // Collect eigenvalue-eigenvector pairs and sort descending
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| {
        eigen.eigenvalues[b]
            .partial_cmp(&eigen.eigenvalues[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let eigenvalues = DVector::from_iterator(n, order.iter().map(|&i| eigen.eigenvalues[i]));
    let eigenvectors = DMatrix::from_fn(n, n, |r, c| eigen.eigenvectors[(r, order[c])]);

    GramEigen {
        eigenvalues,
        eigenvectors,
    }
}

/// Voxel-space images of Gram eigenvectors.
#[derive(Debug, Clone)]
pub struct VoxelModes {
    /// Unit columns `w_k / ‖w_k‖`; zero where `w_k` vanishes.
    pub directions: DMatrix<f64>,

    /// `‖w_k‖`, in eigenvalue order.
    pub singular_values: DVector<f64>,
}

/// Map the leading `count` eigenvectors to voxel space, `w_k = Xc v_k`.
///
/// Returns the normalized columns and their norms. The norm is the
/// singular value of `Xc` to working precision even where the eigenvalue
/// it came from is rounding noise.
#[must_use]
pub fn recover_directions(
    centered: &DMatrix<f64>,
    eigenvectors: &DMatrix<f64>,
    count: usize,
) -> VoxelModes {
    let count = count.min(eigenvectors.ncols());
    let mut directions = DMatrix::<f64>::zeros(centered.nrows(), count);
    let mut singular_values = DVector::<f64>::zeros(count);

    for k in 0..count {
        let w = centered * eigenvectors.column(k);
        let norm = w.norm();
        singular_values[k] = norm;
        if norm > 0.0 {
            directions.set_column(k, &(w / norm));
        }
    }

    VoxelModes {
        directions,
        singular_values,
    }
}

/// Flip each column so its largest-magnitude component is positive.
///
/// Eigenvectors are only defined up to sign; this fixes the orientation so
/// that refitting the same samples yields bit-identical modes. Ties go to
/// the lowest index.
pub fn apply_sign_correction(directions: &mut DMatrix<f64>) {
    for mut column in directions.column_iter_mut() {
        let pivot = column
            .iter()
            .copied()
            .fold(0.0f64, |best, v| if v.abs() > best.abs() { v } else { best });
        if pivot < 0.0 {
            column.neg_mut();
        }
    }
}

/// Largest absolute deviation of `Uᵗ U` from the identity.
#[must_use]
pub fn orthonormality_error(directions: &DMatrix<f64>) -> f64 {
    let gram = directions.tr_mul(directions);
    let k = gram.nrows();
    let mut worst = 0.0f64;
    for r in 0..k {
        for c in 0..k {
            let target = if r == c { 1.0 } else { 0.0 };
            worst = worst.max((gram[(r, c)] - target).abs());
        }
    }
    worst
}
