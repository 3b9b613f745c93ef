//! # Mixed-Effects Meta-Regression
//!
//! Random-effects meta-regression with one moderator. The residual
//! between-study variance is estimated by the method of moments from the
//! fixed-effect residual heterogeneity:
//!
//! ```text
//! τ² = max(0, (Q_E − (k − 2)) / tr(P)),   tr(P) = Σwᵢ − Σwᵢhᵢ
//! ```
//!
//! where `hᵢ` are the fixed-effect leverages. The model is then refit with
//! weights `1/(vᵢ + τ²)`. In the refit, the known-variance z tests are the
//! usual random-effects tests and the residual-scaled t tests are the
//! Knapp–Hartung tests.

use crate::effect::DerivedStudyStats;
use crate::pooled::dersimonian_laird_tau_squared;
use crate::regression::{Heterogeneity, RegressionError, RegressionResult, WeightedDesign, fit_design};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixedEffectsResult {
    /// Residual between-study variance after accounting for the moderator.
    pub tau_squared: f64,
    /// `Q_E` of the fixed-effect fit, the test for residual heterogeneity.
    pub residual_heterogeneity: Heterogeneity,
    /// Between-study variance of the intercept-only random-effects model.
    pub pooled_tau_squared: f64,
    /// Proportional reduction in `τ²` explained by the moderator; `None` when
    /// the intercept-only model shows no heterogeneity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heterogeneity_explained: Option<f64>,
    /// The refit under weights `1/(vᵢ + τ²)`.
    pub fit: RegressionResult,
}

/// Method-of-moments residual `τ²` for a one-moderator meta-regression.
pub fn residual_tau_squared(
    stats: &[DerivedStudyStats],
    covariates: &[f64],
) -> Result<f64, RegressionError> {
    let design = WeightedDesign::new(stats, covariates)?;
    let fixed = fit_design(&design);
    Ok(moment_estimate(&design, &fixed))
}

fn moment_estimate(design: &WeightedDesign, fixed: &RegressionResult) -> f64 {
    let trace_p = design.total_weight - (&design.w * &design.hat_values()).sum();
    let excess = fixed.residual_heterogeneity.q - fixed.residual_degrees_of_freedom as f64;
    (excess / trace_p).max(0.0)
}

/// Fits the mixed-effects meta-regression of log risk ratio on `covariates`.
pub fn fit_mixed_effects_regression(
    stats: &[DerivedStudyStats],
    covariates: &[f64],
) -> Result<MixedEffectsResult, RegressionError> {
    let design = WeightedDesign::new(stats, covariates)?;
    let fixed = fit_design(&design);
    let tau_squared = moment_estimate(&design, &fixed);

    let reweighted: Vec<DerivedStudyStats> = stats
        .iter()
        .map(|s| s.with_added_variance(tau_squared))
        .collect();
    let fit = fit_design(&WeightedDesign::new(&reweighted, covariates)?);

    let pooled_tau_squared = dersimonian_laird_tau_squared(stats)?;
    let heterogeneity_explained = if pooled_tau_squared > 0.0 {
        Some(((pooled_tau_squared - tau_squared) / pooled_tau_squared).max(0.0))
    } else {
        None
    };

    log::info!(
        "Mixed-effects meta-regression: tau^2={tau_squared:.4} (intercept-only {pooled_tau_squared:.4}), slope={:.5}",
        fit.slope
    );
    if tau_squared == 0.0 {
        log::debug!("Residual heterogeneity below its expectation; refit equals the fixed-effect fit");
    }

    Ok(MixedEffectsResult {
        tau_squared,
        residual_heterogeneity: fixed.residual_heterogeneity,
        pooled_tau_squared,
        heterogeneity_explained,
        fit,
    })
}
