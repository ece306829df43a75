//! Synthesis and projection against a fitted motion model.
//!
//! [`synthesize`] maps a beta vector (SD units) to a dense field:
//!
//! ```text
//! u(β) = Unpack(μ + Σ_k β_k · σ_k · U_k)
//! ```
//!
//! [`project`] goes the other way, returning the least-squares beta of a
//! field on span{U_1..U_K} around μ. For any field already in that affine
//! subspace (every training sample in particular) the two are exact inverses.
//!
//! [`standard_sweep`] and [`sample_random`] produce batches of new fields:
//! a deterministic ±β grid over the leading modes, and a seeded Gaussian
//! draw over all of them.

use crate::config::{RandomConfig, SweepConfig};
use crate::error::{ModelError, Result};
use crate::field::{DeformationField, Mask, SampleSet};
use crate::model::StatisticalMotionModel;
use crate::packing::{pack, unpack};
use nalgebra::DVector;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Model coefficients in standard-deviation units, one per mode.
pub type BetaVector = Vec<f64>;

/// Synthesize a field from model coefficients.
///
/// # Arguments
///
/// * `model` - Fitted motion model
/// * `beta` - One coefficient per mode, in SD units
///
/// # Errors
///
/// Returns [`ModelError::DimensionMismatch`] if `beta.len() != K`.
///
/// # Example
///
/// ```
/// use motion_model::{fit_default, synthesize, DeformationField, GridGeometry, Mask, SampleSet};
///
/// let grid = GridGeometry::with_shape([2, 2, 2])?;
/// let samples = SampleSet::new(vec![
///     DeformationField::from_fn(grid.clone(), |_| [1.0, 0.0, 0.0]),
///     DeformationField::from_fn(grid.clone(), |_| [3.0, 0.0, 0.0]),
/// ])?;
/// let model = fit_default(&samples, &Mask::full(grid))?;
///
/// // β = 0 reproduces the mean field
/// let mean = synthesize(&model, &[0.0])?;
/// assert!((mean.vectors()[0][0] - 2.0).abs() < 1e-12);
/// # Ok::<(), motion_model::ModelError>(())
/// ```
pub fn synthesize(model: &StatisticalMotionModel, beta: &[f64]) -> Result<DeformationField> {
    let k = model.n_components();
    if beta.len() != k {
        return Err(ModelError::dimension_mismatch(k, beta.len()));
    }

    let mut packed = model.mean().clone();
    for (mode, (&b, &sigma)) in beta.iter().zip(model.scales().iter()).enumerate() {
        if b != 0.0 {
            packed.axpy(b * sigma, &model.directions().column(mode), 1.0);
        }
    }
    unpack(packed.as_slice(), model.mask(), model.geometry())
}

/// Synthesize along a single mode: `synthesize(model, β·e_k)`.
///
/// # Errors
///
/// Returns [`ModelError::ModeOutOfRange`] if `k >= K`.
pub fn synthesize_mode(
    model: &StatisticalMotionModel,
    k: usize,
    beta: f64,
) -> Result<DeformationField> {
    model.ensure_mode(k)?;
    let mut coefficients = vec![0.0; model.n_components()];
    coefficients[k] = beta;
    synthesize(model, &coefficients)
}

/// The `(+β·e_k, −β·e_k)` pair used by the inverse-consistency check.
///
/// # Errors
///
/// Returns [`ModelError::ModeOutOfRange`] if `k >= K`.
pub fn symmetric_pair(
    model: &StatisticalMotionModel,
    k: usize,
    beta: f64,
) -> Result<(DeformationField, DeformationField)> {
    Ok((
        synthesize_mode(model, k, beta)?,
        synthesize_mode(model, k, -beta)?,
    ))
}

/// Project a field onto the model, returning its beta vector.
///
/// `β_k = U_kᵗ (pack(field) − μ) / max(σ_k, ε)`. The residual outside the
/// model subspace is discarded.
///
/// # Errors
///
/// Returns [`ModelError::MaskMismatch`] if `mask` is not the model's mask,
/// or [`ModelError::GeometryMismatch`] if the field grid differs.
pub fn project(
    model: &StatisticalMotionModel,
    field: &DeformationField,
    mask: &Mask,
) -> Result<BetaVector> {
    ensure_model_mask(model, mask)?;
    let packed = pack(field, mask)?;
    Ok(project_packed(model, &packed))
}

fn project_packed(model: &StatisticalMotionModel, packed: &DVector<f64>) -> BetaVector {
    let residual = packed - model.mean();
    let alphas = model.directions().tr_mul(&residual);
    alphas
        .iter()
        .zip(model.scales().iter())
        .map(|(&alpha, &sigma)| alpha / sigma.max(model.scale_eps()))
        .collect()
}

fn ensure_model_mask(model: &StatisticalMotionModel, mask: &Mask) -> Result<()> {
    let own = model.mask();
    own.geometry().ensure_compatible(mask.geometry())?;
    if own.indices() != mask.indices() {
        return Err(ModelError::mask_mismatch(format!(
            "model mask has {} voxels, given mask has {}",
            own.count(),
            mask.count()
        )));
    }
    Ok(())
}

/// Betas of every training sample, in SD units.
///
/// Persisted as `sample_betas.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleBetaReport {
    /// Sample names in fit order.
    pub sample_names: Vec<String>,

    /// K × N matrix: `betas[k][i]` is sample `i` on mode `k`.
    #[serde(rename = "betas_rows_PCs_cols_samples")]
    pub betas: Vec<Vec<f64>>,

    /// σ_k per mode (mm).
    #[serde(rename = "per_mode_SD_mm")]
    pub per_mode_sd_mm: Vec<f64>,
}

impl SampleBetaReport {
    /// Beta vector of sample `i` (column `i`).
    #[must_use]
    pub fn sample(&self, i: usize) -> Option<BetaVector> {
        if i >= self.sample_names.len() {
            return None;
        }
        Some(self.betas.iter().map(|row| row[i]).collect())
    }
}

/// Project every sample of `samples` onto `model`.
///
/// # Errors
///
/// Propagates projection errors.
pub fn sample_betas(
    model: &StatisticalMotionModel,
    samples: &SampleSet,
) -> Result<SampleBetaReport> {
    let per_sample = samples
        .fields()
        .iter()
        .map(|field| project(model, field, model.mask()))
        .collect::<Result<Vec<BetaVector>>>()?;

    let betas = (0..model.n_components())
        .map(|k| per_sample.iter().map(|b| b[k]).collect())
        .collect();

    Ok(SampleBetaReport {
        sample_names: samples.names().to_vec(),
        betas,
        per_mode_sd_mm: model.scales().iter().copied().collect(),
    })
}

/// One field of a standard sweep.
#[derive(Debug, Clone)]
pub struct SweepField {
    /// Artifact label, e.g. `pc1_m2sd`.
    pub label: String,
    /// Zero-based mode index.
    pub mode: usize,
    /// Coefficient along `mode`, SD units.
    pub beta: f64,
    /// Synthesized displacement.
    pub field: DeformationField,
}

/// Label of the field at `beta` SD along zero-based `mode`.
///
/// `pc{mode+1}_{m|p}{|beta|}sd`, with a fractional magnitude written as
/// `1p5` for 1.5.
#[must_use]
pub fn sweep_label(mode: usize, beta: f64) -> String {
    let sign = if beta < 0.0 { 'm' } else { 'p' };
    format!("pc{}_{sign}{}sd", mode + 1, magnitude_digits(beta))
}

/// `|beta|` as a file-name fragment: `2`, `1p5`.
pub(crate) fn magnitude_digits(beta: f64) -> String {
    let magnitude = beta.abs();
    if magnitude.fract() == 0.0 {
        format!("{magnitude:.0}")
    } else {
        format!("{magnitude}").replace('.', "p")
    }
}

/// Synthesize the standard ±β sweep over the leading modes.
///
/// Modes beyond K are skipped, so a degenerate model yields fewer fields.
///
/// # Errors
///
/// Returns an error for an invalid sweep configuration.
pub fn standard_sweep(
    model: &StatisticalMotionModel,
    sweep: &SweepConfig,
) -> Result<Vec<SweepField>> {
    sweep.validate()?;
    let n_modes = sweep.n_modes.min(model.n_components());

    let mut fields = Vec::with_capacity(n_modes * sweep.betas.len());
    for mode in 0..n_modes {
        for &beta in &sweep.betas {
            fields.push(SweepField {
                label: sweep_label(mode, beta),
                mode,
                beta,
                field: synthesize_mode(model, mode, beta)?,
            });
        }
    }
    Ok(fields)
}

/// One randomly drawn field.
#[derive(Debug, Clone)]
pub struct RandomField {
    /// Artifact label, e.g. `random_003`.
    pub label: String,
    /// Drawn coefficients, SD units.
    pub beta: BetaVector,
    /// Synthesized displacement.
    pub field: DeformationField,
}

/// Draw `config.n_samples` fields with `β_k ~ N(0, variation_scale²)`.
///
/// Coefficients come from a [`StdRng`] seeded with `config.seed`, drawn
/// sample by sample and mode by mode, so a fixed seed reproduces the batch.
/// A model without modes yields copies of the mean field.
///
/// # Errors
///
/// Returns an error for an invalid configuration.
///
/// # Example
///
/// ```
/// use motion_model::config::RandomConfig;
/// use motion_model::{fit_default, sample_random, DeformationField, GridGeometry, Mask, SampleSet};
///
/// let grid = GridGeometry::with_shape([2, 2, 2])?;
/// let samples = SampleSet::new(vec![
///     DeformationField::from_fn(grid.clone(), |_| [1.0, 0.0, 0.0]),
///     DeformationField::from_fn(grid.clone(), |_| [3.0, 0.0, 0.0]),
/// ])?;
/// let model = fit_default(&samples, &Mask::full(grid))?;
///
/// let batch = sample_random(&model, &RandomConfig::default().with_n_samples(4).with_seed(1))?;
/// assert_eq!(batch.len(), 4);
/// assert_eq!(batch[0].beta.len(), 1);
/// # Ok::<(), motion_model::ModelError>(())
/// ```
pub fn sample_random(
    model: &StatisticalMotionModel,
    config: &RandomConfig,
) -> Result<Vec<RandomField>> {
    config.validate()?;
    let mut rng = StdRng::seed_from_u64(config.seed);
    let k = model.n_components();

    let mut fields = Vec::with_capacity(config.n_samples);
    for i in 0..config.n_samples {
        let beta: BetaVector = (0..k)
            .map(|_| config.variation_scale * rng.sample::<f64, _>(StandardNormal))
            .collect();
        debug!(sample = i + 1, beta = ?beta, "drew random coefficients");
        fields.push(RandomField {
            label: random_label(i),
            field: synthesize(model, &beta)?,
            beta,
        });
    }
    Ok(fields)
}

/// Label of the `i`-th (zero-based) random field: `random_001`, ...
#[must_use]
pub fn random_label(i: usize) -> String {
    format!("random_{:03}", i + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fit::fit_default;
    use crate::geometry::GridGeometry;
    use approx::assert_relative_eq;

    fn grid() -> GridGeometry {
        GridGeometry::with_shape([3, 2, 2]).unwrap()
    }

    fn samples() -> SampleSet {
        let g = grid();
        let fields = [(1.0, 0.0), (0.0, 1.0), (-0.5, -0.5), (0.2, 0.9)]
            .iter()
            .map(|&(a, b)| {
                DeformationField::from_fn(g.clone(), move |[i, j, k]| {
                    let x = i as f64;
                    [a * x, b * (j + k) as f64, a * b + 0.3 * x * x]
                })
            })
            .collect();
        SampleSet::new(fields).unwrap()
    }

    fn model() -> StatisticalMotionModel {
        fit_default(&samples(), &Mask::full(grid())).unwrap()
    }

    #[test]
    fn test_zero_beta_is_mean() {
        let model = model();
        let field = synthesize(&model, &vec![0.0; model.n_components()]).unwrap();
        assert_eq!(field, model.mean_field().unwrap());
    }

    #[test]
    fn test_beta_length_checked() {
        let model = model();
        assert!(matches!(
            synthesize(&model, &[1.0]),
            Err(ModelError::DimensionMismatch { .. })
        ));
        assert!(matches!(
            synthesize_mode(&model, 7, 1.0),
            Err(ModelError::ModeOutOfRange { mode: 7, .. })
        ));
    }

    #[test]
    fn test_project_inverts_synthesize() {
        let model = model();
        let beta: Vec<f64> = (0..model.n_components()).map(|k| 0.5 - k as f64).collect();
        let field = synthesize(&model, &beta).unwrap();
        let recovered = project(&model, &field, model.mask()).unwrap();
        for (a, b) in beta.iter().zip(recovered.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_project_rejects_other_mask() {
        let model = model();
        let partial = Mask::from_fn(grid(), |[i, _, _]| i > 0);
        let field = model.mean_field().unwrap();
        assert!(matches!(
            project(&model, &field, &partial),
            Err(ModelError::MaskMismatch(_))
        ));
    }

    #[test]
    fn test_symmetric_pair_sums_to_twice_mean() {
        let model = model();
        let (plus, minus) = symmetric_pair(&model, 0, 1.5).unwrap();
        let sum = plus.pointwise_sum(&minus).unwrap();
        let mean = model.mean_field().unwrap();
        for (s, m) in sum.vectors().iter().zip(mean.vectors()) {
            for c in 0..3 {
                assert_relative_eq!(s[c], 2.0 * m[c], epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn test_sample_betas_shape() {
        let model = model();
        let report = sample_betas(&model, &samples()).unwrap();
        assert_eq!(report.betas.len(), model.n_components());
        assert!(report.betas.iter().all(|row| row.len() == 4));
        assert_eq!(report.per_mode_sd_mm.len(), model.n_components());

        // Centered samples have zero-mean betas on every mode
        for row in &report.betas {
            assert_relative_eq!(row.iter().sum::<f64>(), 0.0, epsilon = 1e-9);
        }
        assert!(report.sample(4).is_none());

        let json = serde_json::to_value(&report).unwrap();
        assert!(json.get("betas_rows_PCs_cols_samples").is_some());
        assert!(json.get("per_mode_SD_mm").is_some());
    }

    #[test]
    fn test_sweep_labels() {
        assert_eq!(sweep_label(0, -2.0), "pc1_m2sd");
        assert_eq!(sweep_label(1, 1.0), "pc2_p1sd");
        assert_eq!(sweep_label(0, 1.5), "pc1_p1p5sd");
    }

    #[test]
    fn test_standard_sweep() {
        let model = model();
        let fields = standard_sweep(&model, &SweepConfig::default()).unwrap();
        assert_eq!(fields.len(), 8);
        assert_eq!(fields[0].label, "pc1_m2sd");
        assert_eq!(fields[7].label, "pc2_p2sd");
        assert_eq!(fields[5].mode, 1);
    }

    #[test]
    fn test_sweep_rejects_repeated_magnitudes() {
        let model = model();
        let sweep = SweepConfig::default().with_betas(vec![1.0, 2.0, 1.0]);
        assert!(matches!(
            standard_sweep(&model, &sweep),
            Err(ModelError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_random_batch_is_reproducible() {
        let model = model();
        let config = RandomConfig::default().with_n_samples(5).with_seed(42);
        let a = sample_random(&model, &config).unwrap();
        let b = sample_random(&model, &config).unwrap();

        assert_eq!(a.len(), 5);
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.label, y.label);
            assert_eq!(x.beta, y.beta);
            assert_eq!(x.field, y.field);
        }
        assert_eq!(a[0].label, "random_001");
        assert_eq!(a[4].label, "random_005");

        let other = sample_random(&model, &config.clone().with_seed(43)).unwrap();
        assert_ne!(a[0].beta, other[0].beta);
    }

    #[test]
    fn test_random_fields_match_their_betas() {
        let model = model();
        let batch = sample_random(&model, &RandomConfig::default().with_n_samples(3)).unwrap();
        for drawn in &batch {
            assert_eq!(drawn.beta.len(), model.n_components());
            let recovered = project(&model, &drawn.field, model.mask()).unwrap();
            for (a, b) in drawn.beta.iter().zip(&recovered) {
                assert_relative_eq!(a, b, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn test_random_spread_follows_variation_scale() {
        let model = model();
        let draw = |scale: f64| {
            let config = RandomConfig::default()
                .with_n_samples(400)
                .with_variation_scale(scale)
                .with_seed(9);
            let batch = sample_random(&model, &config).unwrap();
            let values: Vec<f64> = batch.iter().flat_map(|r| r.beta.clone()).collect();
            let n = values.len() as f64;
            let mean = values.iter().sum::<f64>() / n;
            let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
            (mean, var.sqrt())
        };

        let (mean, sd) = draw(1.0);
        assert!(mean.abs() < 0.15);
        assert!((sd - 1.0).abs() < 0.1);

        // Same seed, doubled scale: every coefficient doubles
        let (_, sd_double) = draw(2.0);
        assert_relative_eq!(sd_double, 2.0 * sd, epsilon = 1e-9);
    }

    #[test]
    fn test_random_rejects_bad_scale() {
        let model = model();
        let config = RandomConfig::default().with_variation_scale(-1.0);
        assert!(matches!(
            sample_random(&model, &config),
            Err(ModelError::InvalidConfig(_))
        ));
    }
}
