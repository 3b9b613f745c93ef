//! Intercept-only meta-analysis: the pooled log risk ratio under fixed-effect
//! and DerSimonian–Laird random-effects weighting.

use crate::effect::DerivedStudyStats;
use crate::inference::{confidence_interval_z, pvalue_z};
use crate::regression::{Heterogeneity, RegressionError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default coverage for reported intervals.
pub const DEFAULT_CONFIDENCE_LEVEL: f64 = 0.95;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectsModel {
    FixedEffect,
    RandomEffects,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PooledEstimate {
    pub model: EffectsModel,
    pub study_count: usize,
    /// Pooled log risk ratio.
    pub estimate: f64,
    pub std_error: f64,
    pub z_stat: f64,
    pub p_value: f64,
    pub confidence_level: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
    /// Cochran's Q around the fixed-effect mean, on `k − 1` degrees of freedom.
    pub heterogeneity: Heterogeneity,
    /// Share of total variability attributable to between-study heterogeneity.
    pub i_squared: f64,
    /// Between-study variance; zero under the fixed-effect model.
    pub tau_squared: f64,
}

impl PooledEstimate {
    /// The pooled estimate and its interval on the risk-ratio scale.
    pub fn risk_ratio(&self) -> (f64, f64, f64) {
        (self.estimate.exp(), self.ci_lower.exp(), self.ci_upper.exp())
    }

    /// Recomputes the interval at a different coverage.
    pub fn with_confidence_level(mut self, confidence_level: f64) -> Self {
        let (ci_lower, ci_upper) =
            confidence_interval_z(self.estimate, self.std_error, confidence_level);
        self.confidence_level = confidence_level;
        self.ci_lower = ci_lower;
        self.ci_upper = ci_upper;
        self
    }
}

impl fmt::Display for PooledEstimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (rr, rr_lo, rr_hi) = self.risk_ratio();
        writeln!(f, "Studies: {}", self.study_count)?;
        writeln!(
            f,
            "Pooled log risk ratio ({:?}): {:.4} (SE {:.4}, z = {:.3}, p = {:.4})",
            self.model, self.estimate, self.std_error, self.z_stat, self.p_value
        )?;
        writeln!(
            f,
            "Risk ratio: {rr:.4} [{:.0}% CI {rr_lo:.4}, {rr_hi:.4}]",
            self.confidence_level * 100.0
        )?;
        writeln!(
            f,
            "Heterogeneity: Q({}) = {:.4}, p = {:.4}, I^2 = {:.1}%, tau^2 = {:.4}",
            self.heterogeneity.degrees_of_freedom,
            self.heterogeneity.q,
            self.heterogeneity.p_value,
            self.i_squared * 100.0,
            self.tau_squared
        )
    }
}

struct InverseVarianceMean {
    sum_w: f64,
    sum_w2: f64,
    mean: f64,
    q: f64,
}

fn inverse_variance_mean(stats: &[DerivedStudyStats]) -> InverseVarianceMean {
    let sum_w: f64 = stats.iter().map(|s| s.weight).sum();
    let sum_w2: f64 = stats.iter().map(|s| s.weight * s.weight).sum();
    let mean = stats.iter().map(|s| s.weight * s.log_risk_ratio).sum::<f64>() / sum_w;
    let q = stats
        .iter()
        .map(|s| s.weight * (s.log_risk_ratio - mean).powi(2))
        .sum();
    InverseVarianceMean {
        sum_w,
        sum_w2,
        mean,
        q,
    }
}

fn validate(stats: &[DerivedStudyStats], required: usize) -> Result<(), RegressionError> {
    if stats.len() < required {
        return Err(RegressionError::InsufficientData {
            found: stats.len(),
            required,
        });
    }
    for (index, stat) in stats.iter().enumerate() {
        if !stat.log_risk_ratio.is_finite() {
            return Err(RegressionError::NonFiniteEffect { index });
        }
        if !(stat.weight.is_finite() && stat.weight > 0.0) {
            return Err(RegressionError::InvalidWeight {
                index,
                weight: stat.weight,
            });
        }
    }
    Ok(())
}

fn i_squared(heterogeneity: &Heterogeneity) -> f64 {
    if heterogeneity.q > 0.0 {
        ((heterogeneity.q - heterogeneity.degrees_of_freedom as f64) / heterogeneity.q).max(0.0)
    } else {
        0.0
    }
}

/// DerSimonian–Laird moment estimate of the between-study variance.
pub fn dersimonian_laird_tau_squared(stats: &[DerivedStudyStats]) -> Result<f64, RegressionError> {
    validate(stats, 2)?;
    let fe = inverse_variance_mean(stats);
    let df = (stats.len() - 1) as f64;
    let c = fe.sum_w - fe.sum_w2 / fe.sum_w;
    Ok(((fe.q - df) / c).max(0.0))
}

/// Fixed-effect (common-effect) pooled estimate.
pub fn pool_fixed_effect(stats: &[DerivedStudyStats]) -> Result<PooledEstimate, RegressionError> {
    validate(stats, 1)?;
    let fe = inverse_variance_mean(stats);
    let heterogeneity = Heterogeneity::new(fe.q, stats.len() - 1);
    Ok(summarize(
        EffectsModel::FixedEffect,
        stats.len(),
        fe.mean,
        fe.sum_w,
        heterogeneity,
        0.0,
    ))
}

/// Random-effects pooled estimate with DerSimonian–Laird `τ²`.
pub fn pool_random_effects(stats: &[DerivedStudyStats]) -> Result<PooledEstimate, RegressionError> {
    let tau_squared = dersimonian_laird_tau_squared(stats)?;
    let fe = inverse_variance_mean(stats);
    let heterogeneity = Heterogeneity::new(fe.q, stats.len() - 1);

    let reweighted: Vec<DerivedStudyStats> = stats
        .iter()
        .map(|s| s.with_added_variance(tau_squared))
        .collect();
    let re = inverse_variance_mean(&reweighted);

    log::info!(
        "Random-effects pooling over {} studies: tau^2={tau_squared:.4}, estimate={:.4}",
        stats.len(),
        re.mean
    );

    Ok(summarize(
        EffectsModel::RandomEffects,
        stats.len(),
        re.mean,
        re.sum_w,
        heterogeneity,
        tau_squared,
    ))
}

fn summarize(
    model: EffectsModel,
    study_count: usize,
    estimate: f64,
    sum_w: f64,
    heterogeneity: Heterogeneity,
    tau_squared: f64,
) -> PooledEstimate {
    let std_error = (1.0 / sum_w).sqrt();
    let z_stat = estimate / std_error;
    let (ci_lower, ci_upper) = confidence_interval_z(estimate, std_error, DEFAULT_CONFIDENCE_LEVEL);
    PooledEstimate {
        model,
        study_count,
        estimate,
        std_error,
        z_stat,
        p_value: pvalue_z(z_stat),
        confidence_level: DEFAULT_CONFIDENCE_LEVEL,
        ci_lower,
        ci_upper,
        i_squared: i_squared(&heterogeneity),
        heterogeneity,
        tau_squared,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn homogeneous() -> Vec<DerivedStudyStats> {
        vec![
            DerivedStudyStats::from_variance(-0.3, 0.04),
            DerivedStudyStats::from_variance(-0.3, 0.09),
            DerivedStudyStats::from_variance(-0.3, 0.01),
        ]
    }

    #[test]
    fn test_fixed_effect_weighted_mean() {
        let stats = vec![
            DerivedStudyStats::from_variance(0.0, 1.0),
            DerivedStudyStats::from_variance(1.0, 0.5),
        ];
        let pooled = pool_fixed_effect(&stats).unwrap();
        // (0*1 + 1*2) / 3
        assert_abs_diff_eq!(pooled.estimate, 2.0 / 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(pooled.std_error, (1.0_f64 / 3.0).sqrt(), epsilon = 1e-12);
        assert_eq!(pooled.heterogeneity.degrees_of_freedom, 1);
        assert_eq!(pooled.tau_squared, 0.0);
    }

    #[test]
    fn test_homogeneous_studies_have_no_between_study_variance() {
        let stats = homogeneous();
        let fixed = pool_fixed_effect(&stats).unwrap();
        let random = pool_random_effects(&stats).unwrap();

        assert_abs_diff_eq!(fixed.heterogeneity.q, 0.0, epsilon = 1e-20);
        assert_eq!(fixed.i_squared, 0.0);
        assert_eq!(random.tau_squared, 0.0);
        assert_abs_diff_eq!(random.estimate, fixed.estimate, epsilon = 1e-12);
        assert_abs_diff_eq!(random.std_error, fixed.std_error, epsilon = 1e-12);
    }

    #[test]
    fn test_risk_ratio_scale() {
        let pooled = pool_fixed_effect(&homogeneous()).unwrap();
        let (rr, lo, hi) = pooled.risk_ratio();
        assert_abs_diff_eq!(rr, (-0.3_f64).exp(), epsilon = 1e-12);
        assert!(lo < rr && rr < hi);

        let wide = pooled.clone().with_confidence_level(0.99);
        assert!(wide.ci_lower < pooled.ci_lower && wide.ci_upper > pooled.ci_upper);
        assert_eq!(wide.estimate, pooled.estimate);
    }

    #[test]
    fn test_display_reports_interval_at_chosen_level() {
        let pooled = pool_fixed_effect(&homogeneous()).unwrap().with_confidence_level(0.9);
        let text = pooled.to_string();
        assert!(text.starts_with("Studies: 3\n"));
        assert!(text.contains("FixedEffect"));
        assert!(text.contains("[90% CI"));
        assert!(text.contains("Q(2)"));
    }

    #[test]
    fn test_random_effects_needs_two_studies() {
        let err = pool_random_effects(&homogeneous()[..1]).unwrap_err();
        assert_eq!(
            err,
            RegressionError::InsufficientData {
                found: 1,
                required: 2
            }
        );
        assert!(pool_fixed_effect(&homogeneous()[..1]).is_ok());
    }

    #[test]
    fn test_empty_input_rejected() {
        assert!(matches!(
            pool_fixed_effect(&[]),
            Err(RegressionError::InsufficientData { found: 0, .. })
        ));
    }
}
