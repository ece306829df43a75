//! QC validators on synthesized fields.

use approx::assert_relative_eq;
use motion_model::qc::{inverse_consistency_report, jacobian_report};
use motion_model::{
    check_composition_consistency, check_inverse_consistency, check_jacobian, displacement_magnitude, fit_default,
    synthesize_mode, ConsistencyGrade, DeformationField, GridGeometry, Mask, QcThresholds,
    SampleSet, StatisticalMotionModel,
};

fn grid() -> GridGeometry {
    GridGeometry::with_shape([4, 4, 4]).unwrap()
}

/// Three samples with zero-mean coefficients on two smooth patterns, plus
/// a constant `offset` shared by all samples (which lands in μ).
fn model(offset: f64) -> StatisticalMotionModel {
    let g = grid();
    let coefficients = [(0.04, 0.01), (-0.04, 0.01), (0.0, -0.02)];
    let fields = coefficients
        .iter()
        .map(|&(a, b)| {
            DeformationField::from_fn(g.clone(), move |[i, j, k]| {
                let x = i as f64 - 1.5;
                let y = j as f64 - 1.5;
                [offset + a * x, b * y, 0.5 * a * (k as f64 - 1.5)]
            })
        })
        .collect();
    fit_default(&SampleSet::new(fields).unwrap(), &Mask::full(g)).unwrap()
}

// =============================================================================
// JACOBIAN
// =============================================================================

#[test]
fn test_smooth_synthesis_passes_jacobian_gate() {
    let model = model(0.0);
    let thresholds = QcThresholds::default();
    for beta in [-2.0, -1.0, 1.0, 2.0] {
        let field = synthesize_mode(&model, 0, beta).unwrap();
        let qc = check_jacobian(&field, model.mask(), &thresholds).unwrap();
        assert!(qc.passed, "β = {beta}: {:?}", qc.issues);
        assert_eq!(qc.stats.neg_percent, 0.0);
    }
}

#[test]
fn test_extreme_voxel_fails_jacobian_gate() {
    let model = model(0.0);
    let mut field = synthesize_mode(&model, 0, 1.0).unwrap();
    let spike = grid().linear_index(1, 1, 1);
    field.vectors_mut()[spike] = [100.0, 0.0, 0.0];

    let qc = check_jacobian(&field, model.mask(), &QcThresholds::default()).unwrap();
    assert!(qc.stats.neg_percent > 0.0);
    assert!(qc.stats.p01 <= 0.80 || qc.stats.p99 >= 1.25);
    assert!(!qc.passed);
    assert!(!qc.issues.is_empty());
}

#[test]
fn test_jacobian_report_over_sweep() {
    let model = model(0.0);
    let plus = synthesize_mode(&model, 1, 2.0).unwrap();
    let mut folded = synthesize_mode(&model, 1, -2.0).unwrap();
    folded.vectors_mut()[grid().linear_index(2, 2, 2)] = [-80.0, 0.0, 0.0];

    let report = jacobian_report(
        &[("pc2_p2sd", &plus), ("pc2_m2sd", &folded)],
        model.mask(),
        &QcThresholds::default(),
    )
    .unwrap();
    assert_eq!(report.failures(), vec!["pc2_m2sd"]);
    assert!(report.entries["pc2_p2sd"].passed);
}

// =============================================================================
// INVERSE CONSISTENCY
// =============================================================================

#[test]
fn test_zero_mean_model_is_excellent() {
    let model = model(0.0);
    let result =
        check_inverse_consistency(&model, 0, 1.0, model.mask(), &QcThresholds::default()).unwrap();
    assert!(result.residual.median_mm < 0.1);
    assert_eq!(result.grade, ConsistencyGrade::Excellent);
    assert!(result.mean_field_median_mm < 1e-9);
    assert!(result.issues.is_empty());
}

#[test]
fn test_offset_mean_is_surfaced() {
    let model = model(2.0);
    let report = inverse_consistency_report(
        &model,
        &[0, 1],
        1.0,
        model.mask(),
        &QcThresholds::default(),
    )
    .unwrap();

    // u(+β) + u(−β) = 2μ, so the residual tracks the offset, not the modes
    assert_relative_eq!(report.modes["pc1_pm1sd"].median_mm, 4.0, epsilon = 1e-9);
    assert_eq!(report.metadata.overall_grade, ConsistencyGrade::Warning);
    assert!(!report.metadata.mean_field_near_zero);
    assert!(report
        .metadata
        .issues
        .iter()
        .any(|issue| issue.contains("not near zero")));
}

// =============================================================================
// MAGNITUDE
// =============================================================================

#[test]
fn test_sweep_magnitude_scales_with_beta() {
    let model = model(0.0);
    let one = synthesize_mode(&model, 0, 1.0).unwrap();
    let two = synthesize_mode(&model, 0, 2.0).unwrap();
    let m1 = displacement_magnitude(&one, model.mask()).unwrap();
    let m2 = displacement_magnitude(&two, model.mask()).unwrap();

    assert_relative_eq!(m2.median_mm, 2.0 * m1.median_mm, epsilon = 1e-9);
    assert_relative_eq!(m2.max_mm, 2.0 * m1.max_mm, epsilon = 1e-9);
    assert!(m1.median_mm <= m1.p75_mm && m1.p75_mm <= m1.p95_mm && m1.p95_mm <= m1.max_mm);
}

// =============================================================================
// FORWARD/BACKWARD COMPOSITION
// =============================================================================

#[test]
fn test_opposite_mode_fields_nearly_invert() {
    let model = model(0.0);
    let thresholds = QcThresholds::default();
    let forward = synthesize_mode(&model, 0, 1.0).unwrap();
    let backward = synthesize_mode(&model, 0, -1.0).unwrap();

    let pair = check_composition_consistency(&forward, &backward, model.mask(), &thresholds)
        .unwrap();
    let size = displacement_magnitude(&forward, model.mask()).unwrap();
    assert_eq!(pair.grade, ConsistencyGrade::Excellent);
    assert!(pair.residual.max_mm < 0.2 * size.max_mm);

    // Composing a field with itself doubles it instead of undoing it
    let doubled = check_composition_consistency(&forward, &forward, model.mask(), &thresholds)
        .unwrap();
    assert!(doubled.residual.median_mm > 1.5 * size.median_mm);
}
