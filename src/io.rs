//! NIfTI-1 volume I/O for fields, masks and model artifacts.
//!
//! Vector fields are stored as `[nx, ny, nz, 1, 3]` volumes with the
//! vector intent code, the layout registration toolkits emit for
//! displacement fields. `[nx, ny, nz, 3]` is also accepted on read.
//!
//! Grid geometry is taken from the sform, falling back to the qform and
//! then to `pixdim` alone. Written volumes always carry an sform. The
//! header's world frame is used as-is; no RAS/LPS conversion happens here.

use crate::error::{ModelError, Result};
use crate::field::{DeformationField, Mask, SampleSet};
use crate::geometry::GridGeometry;
use crate::model::StatisticalMotionModel;
use ndarray::Array;
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// NIfTI intent code for vector-valued voxels.
pub const INTENT_VECTOR: i16 = 1007;

/// File name of the persisted mean field.
pub const MEAN_FIELD_FILE: &str = "pc_mean.nii.gz";

/// File name of the persisted principal direction for zero-based `mode`.
#[must_use]
pub fn component_file(mode: usize) -> String {
    format!("pc_{}.nii.gz", mode + 1)
}

/// Read a displacement field.
///
/// # Errors
///
/// Returns an error if the file cannot be decoded, is not a 3-component
/// vector volume, or carries an unusable geometry.
pub fn load_field(path: impl AsRef<Path>) -> Result<DeformationField> {
    let path = path.as_ref();
    let obj = ReaderOptions::new().read_file(path)?;
    let header = obj.header().clone();
    let data = obj.into_volume().into_ndarray::<f64>()?;

    let shape = data.shape().to_vec();
    let five_d = match shape.as_slice() {
        [_, _, _, 1, 3] => true,
        [_, _, _, 3] => false,
        other => {
            return Err(ModelError::invalid_input(format!(
                "{}: expected a [nx, ny, nz, (1,) 3] vector volume, found {other:?}",
                path.display()
            )))
        }
    };

    let geometry = header_geometry(&header, [shape[0], shape[1], shape[2]])?;
    let component = |[i, j, k]: [usize; 3], c: usize| -> f64 {
        if five_d {
            data[&[i, j, k, 0, c][..]]
        } else {
            data[&[i, j, k, c][..]]
        }
    };
    let field = DeformationField::from_fn(geometry, |index| {
        [component(index, 0), component(index, 1), component(index, 2)]
    });

    debug!(path = %path.display(), shape = ?field.geometry().shape, "loaded field");
    Ok(field)
}

/// Read a mask; voxels with value `> 0` are inside.
///
/// # Errors
///
/// Returns an error if the file cannot be decoded or is not a scalar
/// volume.
pub fn load_mask(path: impl AsRef<Path>) -> Result<Mask> {
    let path = path.as_ref();
    let obj = ReaderOptions::new().read_file(path)?;
    let header = obj.header().clone();
    let data = obj.into_volume().into_ndarray::<f64>()?;

    let shape = data.shape().to_vec();
    if shape.len() < 3 || shape[3..].iter().any(|&n| n != 1) {
        return Err(ModelError::invalid_input(format!(
            "{}: expected a scalar volume, found {shape:?}",
            path.display()
        )));
    }

    let geometry = header_geometry(&header, [shape[0], shape[1], shape[2]])?;
    let ndim = shape.len();
    let mask = Mask::from_fn(geometry, |[i, j, k]| {
        let mut index = vec![0; ndim];
        index[..3].copy_from_slice(&[i, j, k]);
        data[index.as_slice()] > 0.0
    });

    debug!(path = %path.display(), voxels = mask.count(), "loaded mask");
    Ok(mask)
}

/// Read a sample set; sample names are the file stems.
///
/// # Errors
///
/// Returns an error if any file fails to load or the grids differ.
pub fn load_sample_set<P: AsRef<Path>>(paths: &[P]) -> Result<SampleSet> {
    let fields = paths
        .iter()
        .map(|p| load_field(p))
        .collect::<Result<Vec<_>>>()?;
    let names = paths.iter().map(|p| volume_stem(p.as_ref())).collect();
    info!(n_samples = fields.len(), "loaded sample set");
    SampleSet::new(fields)?.with_names(names)
}

/// File name without `.nii` / `.nii.gz`.
#[must_use]
pub fn volume_stem(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.strip_suffix(".nii.gz")
        .or_else(|| name.strip_suffix(".nii"))
        .unwrap_or(&name)
        .to_string()
}

/// Write a displacement field as a `[nx, ny, nz, 1, 3]` vector volume.
///
/// A `.gz` suffix selects gzip compression.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn save_field(field: &DeformationField, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let geometry = field.geometry();
    let [nx, ny, nz] = geometry.shape;

    let array = Array::from_shape_fn((nx, ny, nz, 1, 3), |(i, j, k, _, c)| {
        field.at([i, j, k])[c]
    });
    let header = NiftiHeader {
        intent_code: INTENT_VECTOR,
        ..geometry_header(geometry)
    };

    WriterOptions::new(path)
        .reference_header(&header)
        .write_nifti(&array)?;
    debug!(path = %path.display(), "saved field");
    Ok(())
}

/// Write a mask as a `u8` volume of zeros and ones.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn save_mask(mask: &Mask, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let geometry = mask.geometry();
    let [nx, ny, nz] = geometry.shape;

    let array = Array::from_shape_fn((nx, ny, nz), |(i, j, k)| u8::from(mask.contains([i, j, k])));
    WriterOptions::new(path)
        .reference_header(&geometry_header(geometry))
        .write_nifti(&array)?;
    Ok(())
}

/// Persist the mean field and every principal direction into `dir`.
///
/// Returns the written paths, mean first.
///
/// # Errors
///
/// Returns an error if the directory or any volume cannot be written.
pub fn save_model_volumes(
    model: &StatisticalMotionModel,
    dir: impl AsRef<Path>,
) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;

    let mut written = Vec::with_capacity(model.n_components() + 1);
    let mean_path = dir.join(MEAN_FIELD_FILE);
    save_field(&model.mean_field()?, &mean_path)?;
    written.push(mean_path);

    for k in 0..model.n_components() {
        let path = dir.join(component_file(k));
        save_field(&model.component_field(k)?, &path)?;
        written.push(path);
    }
    info!(dir = %dir.display(), volumes = written.len(), "saved model volumes");
    Ok(written)
}

// ============================================================================
// HEADER GEOMETRY
// ============================================================================

/// Grid geometry encoded in a header: sform, else qform, else pixdim.
fn header_geometry(header: &NiftiHeader, shape: [usize; 3]) -> Result<GridGeometry> {
    let affine = header_affine(header);

    let mut spacing = [0.0; 3];
    let mut direction = [[0.0; 3]; 3];
    for c in 0..3 {
        let norm = (0..3).map(|r| affine[r][c] * affine[r][c]).sum::<f64>().sqrt();
        spacing[c] = norm;
        for r in 0..3 {
            direction[r][c] = if norm > 1e-9 {
                affine[r][c] / norm
            } else if r == c {
                1.0
            } else {
                0.0
            };
        }
    }
    let origin = [affine[0][3], affine[1][3], affine[2][3]];

    Ok(GridGeometry::new(shape, spacing, origin)?.with_direction(direction))
}

/// Top three rows of the voxel-to-world affine.
fn header_affine(header: &NiftiHeader) -> [[f64; 4]; 3] {
    let widen = |row: [f32; 4]| row.map(f64::from);

    if header.sform_code > 0 {
        return [
            widen(header.srow_x),
            widen(header.srow_y),
            widen(header.srow_z),
        ];
    }

    let dx = f64::from(header.pixdim[1]);
    let dy = f64::from(header.pixdim[2]);
    let dz = f64::from(header.pixdim[3]);

    if header.qform_code > 0 {
        let b = f64::from(header.quatern_b);
        let c = f64::from(header.quatern_c);
        let d = f64::from(header.quatern_d);
        let a = (1.0 - (b * b + c * c + d * d).min(1.0)).sqrt();
        let qfac = if header.pixdim[0] < 0.0 { -1.0 } else { 1.0 };
        let dz = dz * qfac;

        return [
            [
                (a * a + b * b - c * c - d * d) * dx,
                (2.0 * b * c - 2.0 * a * d) * dy,
                (2.0 * b * d + 2.0 * a * c) * dz,
                f64::from(header.quatern_x),
            ],
            [
                (2.0 * b * c + 2.0 * a * d) * dx,
                (a * a + c * c - b * b - d * d) * dy,
                (2.0 * c * d - 2.0 * a * b) * dz,
                f64::from(header.quatern_y),
            ],
            [
                (2.0 * b * d - 2.0 * a * c) * dx,
                (2.0 * c * d + 2.0 * a * b) * dy,
                (a * a + d * d - c * c - b * b) * dz,
                f64::from(header.quatern_z),
            ],
        ];
    }

    [
        [dx, 0.0, 0.0, 0.0],
        [0.0, dy, 0.0, 0.0],
        [0.0, 0.0, dz, 0.0],
    ]
}

/// Header carrying `geometry` as an sform.
fn geometry_header(geometry: &GridGeometry) -> NiftiHeader {
    let s = geometry.spacing;
    let d = &geometry.direction;
    let o = geometry.origin;
    let row = |r: usize| {
        [
            (d[r][0] * s[0]) as f32,
            (d[r][1] * s[1]) as f32,
            (d[r][2] * s[2]) as f32,
            o[r] as f32,
        ]
    };

    NiftiHeader {
        pixdim: [1.0, s[0] as f32, s[1] as f32, s[2] as f32, 1.0, 1.0, 1.0, 1.0],
        sform_code: 1,
        qform_code: 0,
        srow_x: row(0),
        srow_y: row(1),
        srow_z: row(2),
        // millimetres
        xyzt_units: 2,
        ..NiftiHeader::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use tempfile::tempdir;

    fn geometry() -> GridGeometry {
        GridGeometry::new([4, 3, 2], [1.5, 2.0, 2.5], [-10.0, 5.0, 20.0])
            .unwrap()
            .with_direction([[-1.0, 0.0, 0.0], [0.0, -1.0, 0.0], [0.0, 0.0, 1.0]])
    }

    fn field() -> DeformationField {
        DeformationField::from_fn(geometry(), |[i, j, k]| {
            [i as f64 * 0.5, j as f64 - 1.0, 0.25 * k as f64]
        })
    }

    #[test]
    fn test_field_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("field.nii.gz");
        save_field(&field(), &path).unwrap();

        let back = load_field(&path).unwrap();
        assert!(back.geometry().is_compatible(&geometry()));
        for (a, b) in back.vectors().iter().zip(field().vectors()) {
            for c in 0..3 {
                assert_relative_eq!(a[c], b[c], epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_mask_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mask.nii");
        let mask = Mask::from_fn(geometry(), |[i, j, _]| i > j);
        save_mask(&mask, &path).unwrap();

        let back = load_mask(&path).unwrap();
        assert_eq!(back.indices(), mask.indices());
        assert!(back.geometry().is_compatible(mask.geometry()));
    }

    #[test]
    fn test_scalar_volume_is_not_a_field() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mask.nii");
        save_mask(&Mask::full(geometry()), &path).unwrap();
        assert!(matches!(
            load_field(&path),
            Err(ModelError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_sample_set_names() {
        let dir = tempdir().unwrap();
        let paths: Vec<_> = ["phase_a.nii.gz", "phase_b.nii"]
            .iter()
            .map(|name| dir.path().join(name))
            .collect();
        for p in &paths {
            save_field(&field(), p).unwrap();
        }
        let set = load_sample_set(&paths).unwrap();
        assert_eq!(set.names(), &["phase_a".to_string(), "phase_b".to_string()]);
    }

    #[test]
    fn test_missing_file() {
        assert!(load_field("/nonexistent/field.nii.gz").is_err());
    }
}
