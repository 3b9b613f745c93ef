//! Published reference values for the 13 BCG vaccine trials.

use approx::assert_abs_diff_eq;
use metareg::datasets::bcg;
use metareg::pooled::dersimonian_laird_tau_squared;
use metareg::{
    RegressionError, StudyRecord, compute_derived_stats, fit_mixed_effects_regression,
    fit_weighted_regression, pool_fixed_effect, pool_random_effects,
};

fn bcg_inputs() -> (Vec<metareg::DerivedStudyStats>, Vec<f64>) {
    let studies = bcg();
    let stats = compute_derived_stats(&studies).unwrap();
    let covariates = studies.iter().map(|s| s.covariate).collect();
    (stats, covariates)
}

#[test]
fn weighted_regression_on_latitude() {
    let (stats, covariates) = bcg_inputs();
    let fit = fit_weighted_regression(&stats, &covariates).unwrap();

    assert_abs_diff_eq!(fit.intercept, 0.3436, epsilon = 1e-3);
    assert_abs_diff_eq!(fit.slope, -0.0292, epsilon = 1e-3);
    assert!(fit.slope < 0.0);
    assert_eq!(fit.study_count, 13);
    assert_eq!(fit.residual_degrees_of_freedom, 11);
}

#[test]
fn fixed_effect_known_variance_tests() {
    let (stats, covariates) = bcg_inputs();
    let fit = fit_weighted_regression(&stats, &covariates).unwrap();

    assert_abs_diff_eq!(fit.known_variance.intercept_std_error, 0.0810, epsilon = 5e-4);
    assert_abs_diff_eq!(fit.known_variance.slope_std_error, 0.00265, epsilon = 5e-5);
    assert_abs_diff_eq!(fit.residual_heterogeneity.q, 30.733, epsilon = 1e-2);
    assert_eq!(fit.residual_heterogeneity.degrees_of_freedom, 11);
    assert!(fit.residual_heterogeneity.p_value < 0.01);

    // The t-based errors rescale the known-variance errors by sqrt(QE / df).
    let scale = (fit.residual_heterogeneity.q / 11.0).sqrt();
    assert_abs_diff_eq!(
        fit.slope_std_error,
        fit.known_variance.slope_std_error * scale,
        epsilon = 1e-12
    );
}

#[test]
fn pooled_estimates() {
    let (stats, _) = bcg_inputs();

    let fixed = pool_fixed_effect(&stats).unwrap();
    assert_abs_diff_eq!(fixed.estimate, -0.4303, epsilon = 1e-3);
    assert_abs_diff_eq!(fixed.std_error, 0.0405, epsilon = 5e-4);
    assert_abs_diff_eq!(fixed.heterogeneity.q, 152.23, epsilon = 5e-2);
    assert_abs_diff_eq!(fixed.i_squared, 0.921, epsilon = 1e-3);

    let random = pool_random_effects(&stats).unwrap();
    assert_abs_diff_eq!(random.tau_squared, 0.3088, epsilon = 1e-3);
    assert_abs_diff_eq!(random.estimate, -0.7141, epsilon = 1e-3);
    assert_abs_diff_eq!(
        dersimonian_laird_tau_squared(&stats).unwrap(),
        random.tau_squared,
        epsilon = 1e-15
    );
}

#[test]
fn mixed_effects_regression_explains_most_heterogeneity() {
    let (stats, covariates) = bcg_inputs();
    let mixed = fit_mixed_effects_regression(&stats, &covariates).unwrap();

    assert_abs_diff_eq!(mixed.tau_squared, 0.0633, epsilon = 1e-3);
    assert_abs_diff_eq!(mixed.fit.slope, -0.0292, epsilon = 1e-3);
    let explained = mixed.heterogeneity_explained.unwrap();
    assert_abs_diff_eq!(explained, 0.79, epsilon = 0.01);
}

#[test]
fn truncated_and_degenerate_inputs() {
    let studies = bcg();
    let stats = compute_derived_stats(&studies).unwrap();
    let covariates: Vec<f64> = studies.iter().map(|s| s.covariate).collect();

    assert_eq!(
        fit_weighted_regression(&stats[..2], &covariates[..2]).unwrap_err(),
        RegressionError::InsufficientData {
            found: 2,
            required: 3
        }
    );

    let flat = vec![33.0; stats.len()];
    assert_eq!(
        fit_weighted_regression(&stats, &flat).unwrap_err(),
        RegressionError::SingularDesign
    );
}

#[test]
fn arm_swap_flips_the_regression() {
    let studies = bcg();
    let swapped: Vec<StudyRecord> = studies.iter().map(StudyRecord::with_arms_swapped).collect();
    let covariates: Vec<f64> = studies.iter().map(|s| s.covariate).collect();

    let fit = fit_weighted_regression(&compute_derived_stats(&studies).unwrap(), &covariates).unwrap();
    let flipped =
        fit_weighted_regression(&compute_derived_stats(&swapped).unwrap(), &covariates).unwrap();

    assert_abs_diff_eq!(flipped.slope, -fit.slope, epsilon = 1e-12);
    assert_abs_diff_eq!(flipped.intercept, -fit.intercept, epsilon = 1e-12);
    assert_abs_diff_eq!(flipped.slope_std_error, fit.slope_std_error, epsilon = 1e-12);
}
