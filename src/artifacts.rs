//! Persisted fit artifacts.
//!
//! [`export_model`] writes everything a fit produces into one directory:
//!
//! | File | Content |
//! |------|---------|
//! | `pc_mean.nii.gz` | mean field μ |
//! | `pc_{k}.nii.gz` | principal direction `U_k` |
//! | `pca_meta.json` | [`ModelMetadata`] |
//! | `sample_betas.json` | [`SampleBetaReport`] |
//! | `pc{k}_{m,p}{n}sd.nii.gz` | standard sweep fields |
//! | `inverse_consistency_pm_beta.json` | [`InverseConsistencyReport`] at β = 1 |
//! | `jacobian_qc.json` | [`JacobianQcReport`] over the sweep |
//!
//! [`export_random`] adds a seeded batch of drawn fields to the same
//! directory: `random_{nnn}.nii.gz` plus `random_betas.json`.
//!
//! Handoff is by explicit path; nothing here discovers files by timestamp.

use crate::config::{QcThresholds, RandomConfig, SweepConfig};
use crate::error::Result;
use crate::field::{Mask, SampleSet};
use crate::io::{save_field, save_model_volumes};
use crate::model::{ModelMetadata, StatisticalMotionModel};
use crate::qc::{inverse_consistency_report, jacobian_report, InverseConsistencyReport, JacobianQcReport};
use crate::synthesis::{sample_betas, sample_random, standard_sweep, BetaVector, SampleBetaReport};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Model metadata file.
pub const META_FILE: &str = "pca_meta.json";
/// Per-sample beta report file.
pub const SAMPLE_BETAS_FILE: &str = "sample_betas.json";
/// Inverse-consistency report file.
pub const INVERSE_CONSISTENCY_FILE: &str = "inverse_consistency_pm_beta.json";
/// Jacobian QC report file.
pub const JACOBIAN_QC_FILE: &str = "jacobian_qc.json";
/// Coefficients of a random batch.
pub const RANDOM_BETAS_FILE: &str = "random_betas.json";

/// Serialize `value` as pretty-printed JSON.
///
/// # Errors
///
/// Returns an error if the file cannot be created or written.
pub fn write_json<T: Serialize + ?Sized>(value: &T, path: impl AsRef<Path>) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

/// Deserialize a JSON artifact.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or parsed.
pub fn read_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}

/// What [`export_model`] produced.
#[derive(Debug, Clone)]
pub struct ExportSummary {
    /// Every file written, in write order.
    pub files: Vec<PathBuf>,
    /// Fit metadata.
    pub metadata: ModelMetadata,
    /// Per-sample coordinates.
    pub betas: SampleBetaReport,
    /// Symmetry check over the swept modes; `None` for a model without modes.
    pub inverse_consistency: Option<InverseConsistencyReport>,
    /// Jacobian QC over the sweep fields.
    pub jacobian: JacobianQcReport,
}

impl ExportSummary {
    /// Whether every QC gate passed.
    #[must_use]
    pub fn qc_passed(&self) -> bool {
        self.jacobian.passed()
            && self
                .inverse_consistency
                .as_ref()
                .map_or(true, InverseConsistencyReport::passed)
    }
}

/// Write the model, its sample coordinates, the standard sweep and QC
/// reports into `dir`.
///
/// QC runs inside `qc_mask`; pass the model mask when no separate
/// anatomical mask is available. Modes beyond `K` are skipped.
///
/// # Errors
///
/// Returns an error on any I/O failure or if the samples, mask and model
/// grids disagree. QC gate failures are reported in the summary.
pub fn export_model(
    model: &StatisticalMotionModel,
    samples: &SampleSet,
    qc_mask: &Mask,
    sweep: &SweepConfig,
    thresholds: &QcThresholds,
    dir: impl AsRef<Path>,
) -> Result<ExportSummary> {
    let dir = dir.as_ref();
    let mut files = save_model_volumes(model, dir)?;

    let metadata = model.metadata();
    let meta_path = dir.join(META_FILE);
    write_json(&metadata, &meta_path)?;
    files.push(meta_path);

    let betas = sample_betas(model, samples)?;
    let betas_path = dir.join(SAMPLE_BETAS_FILE);
    write_json(&betas, &betas_path)?;
    files.push(betas_path);

    let sweep_fields = standard_sweep(model, sweep)?;
    for s in &sweep_fields {
        let path = dir.join(format!("{}.nii.gz", s.label));
        save_field(&s.field, &path)?;
        files.push(path);
    }

    let swept_modes: Vec<usize> = (0..sweep.n_modes.min(model.n_components())).collect();
    let inverse_consistency = if swept_modes.is_empty() {
        warn!("model has no modes; skipping inverse-consistency check");
        None
    } else {
        let report = inverse_consistency_report(model, &swept_modes, 1.0, qc_mask, thresholds)?;
        let path = dir.join(INVERSE_CONSISTENCY_FILE);
        write_json(&report, &path)?;
        files.push(path);
        Some(report)
    };

    let named: Vec<(&str, &_)> = sweep_fields
        .iter()
        .map(|s| (s.label.as_str(), &s.field))
        .collect();
    let jacobian = jacobian_report(&named, qc_mask, thresholds)?;
    let jacobian_path = dir.join(JACOBIAN_QC_FILE);
    write_json(&jacobian, &jacobian_path)?;
    files.push(jacobian_path);

    info!(dir = %dir.display(), files = files.len(), "exported model artifacts");
    Ok(ExportSummary {
        files,
        metadata,
        betas,
        inverse_consistency,
        jacobian,
    })
}

/// Coefficients of a random batch, persisted as `random_betas.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomBetaReport {
    /// Generator seed.
    pub seed: u64,
    /// Coefficient spread, SD units.
    pub variation_scale: f64,
    /// Drawn coefficients keyed by field label.
    pub betas: BTreeMap<String, BetaVector>,
}

/// Draw a random batch from `model` and write it into `dir`.
///
/// Returns the files written and the coefficient report.
///
/// # Errors
///
/// Returns an error for an invalid configuration or on any I/O failure.
pub fn export_random(
    model: &StatisticalMotionModel,
    config: &RandomConfig,
    dir: impl AsRef<Path>,
) -> Result<(Vec<PathBuf>, RandomBetaReport)> {
    let dir = dir.as_ref();
    let batch = sample_random(model, config)?;

    let mut files = Vec::with_capacity(batch.len() + 1);
    let mut betas = BTreeMap::new();
    for drawn in batch {
        let path = dir.join(format!("{}.nii.gz", drawn.label));
        save_field(&drawn.field, &path)?;
        files.push(path);
        betas.insert(drawn.label, drawn.beta);
    }

    let report = RandomBetaReport {
        seed: config.seed,
        variation_scale: config.variation_scale,
        betas,
    };
    let path = dir.join(RANDOM_BETAS_FILE);
    write_json(&report, &path)?;
    files.push(path);

    info!(
        dir = %dir.display(),
        n_samples = config.n_samples,
        seed = config.seed,
        "exported random fields"
    );
    Ok((files, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::DeformationField;
    use crate::fit::fit_default;
    use crate::geometry::GridGeometry;
    use approx::assert_relative_eq;
    use tempfile::tempdir;

    fn samples() -> SampleSet {
        let g = GridGeometry::with_shape([4, 4, 3]).unwrap();
        let fields = [(0.05, 0.02), (-0.05, 0.02), (0.0, -0.04)]
            .iter()
            .map(|&(a, b)| {
                DeformationField::from_fn(g.clone(), move |[i, j, _]| {
                    [a * (i as f64 - 1.5), b * (j as f64 - 1.5), 0.0]
                })
            })
            .collect();
        SampleSet::new(fields).unwrap()
    }

    #[test]
    fn test_export_writes_all_artifacts() {
        let dir = tempdir().unwrap();
        let samples = samples();
        let mask = Mask::full(samples.geometry().unwrap().clone());
        let model = fit_default(&samples, &mask).unwrap();

        let summary = export_model(
            &model,
            &samples,
            &mask,
            &SweepConfig::default(),
            &QcThresholds::default(),
            dir.path(),
        )
        .unwrap();

        for name in [
            "pc_mean.nii.gz",
            "pc_1.nii.gz",
            "pc_2.nii.gz",
            META_FILE,
            SAMPLE_BETAS_FILE,
            "pc1_m2sd.nii.gz",
            "pc2_p1sd.nii.gz",
            INVERSE_CONSISTENCY_FILE,
            JACOBIAN_QC_FILE,
        ] {
            assert!(dir.path().join(name).exists(), "missing {name}");
        }
        assert_eq!(summary.jacobian.entries.len(), 8);
        assert!(summary.qc_passed());

        let meta: ModelMetadata = read_json(dir.path().join(META_FILE)).unwrap();
        assert_eq!(meta.n_components, summary.metadata.n_components);
        for (a, b) in meta.singular_values.iter().zip(&summary.metadata.singular_values) {
            assert_relative_eq!(a, b, max_relative = 1e-12);
        }

        let betas: serde_json::Value = read_json(dir.path().join(SAMPLE_BETAS_FILE)).unwrap();
        assert_eq!(betas["betas_rows_PCs_cols_samples"].as_array().unwrap().len(), 2);
        assert_eq!(betas["sample_names"][0], "sample_1");
    }

    #[test]
    fn test_export_random_batch() {
        let dir = tempdir().unwrap();
        let samples = samples();
        let mask = Mask::full(samples.geometry().unwrap().clone());
        let model = fit_default(&samples, &mask).unwrap();
        let config = RandomConfig::default().with_n_samples(3).with_seed(11);

        let (files, report) = export_random(&model, &config, dir.path()).unwrap();
        assert_eq!(files.len(), 4);
        for name in ["random_001.nii.gz", "random_003.nii.gz", RANDOM_BETAS_FILE] {
            assert!(dir.path().join(name).exists(), "missing {name}");
        }

        let reloaded: RandomBetaReport = read_json(dir.path().join(RANDOM_BETAS_FILE)).unwrap();
        assert_eq!(reloaded.seed, 11);
        assert_eq!(reloaded.betas.len(), 3);
        for (label, beta) in &report.betas {
            assert_eq!(reloaded.betas[label].len(), model.n_components());
            for (a, b) in beta.iter().zip(&reloaded.betas[label]) {
                assert_relative_eq!(a, b, epsilon = 1e-12);
            }
        }

        // A second export with the same seed writes the same coefficients
        let again = tempdir().unwrap();
        let (_, repeat) = export_random(&model, &config, again.path()).unwrap();
        assert_eq!(repeat, report);
    }
}
