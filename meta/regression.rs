//! # Weighted Meta-Regression
//!
//! Closed-form weighted least squares of log risk ratio on a single study-level
//! moderator:
//!
//! ```text
//! W = Σwᵢ, Wx = Σwᵢxᵢ, Wy = Σwᵢyᵢ, Wxx = Σwᵢxᵢ², Wxy = Σwᵢxᵢyᵢ
//! slope     = (W·Wxy − Wx·Wy) / (W·Wxx − Wx²)
//! intercept = (Wy − slope·Wx) / W
//! ```
//!
//! The sums are accumulated around the weighted covariate mean, so
//! `W·Wxx − Wx² = W·Sxx` with `Sxx = Σwᵢ(xᵢ − x̄)²`. This is algebraically the
//! same estimator but does not cancel catastrophically for large covariates.
//!
//! Two sets of standard errors come out of the same inverse Gram matrix:
//!
//! - scaled by the residual variance `s² = Σwᵢeᵢ²/(n−2)`, tested against
//!   Student's t and the standard normal (classical weighted regression);
//! - unscaled, tested against the standard normal, treating the weights as
//!   known inverse sampling variances (fixed-effect meta-regression).

use crate::effect::DerivedStudyStats;
use crate::inference::{confidence_interval_t, confidence_interval_z, pvalue_chi_squared, pvalue_t, pvalue_z};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fewest studies that leave one residual degree of freedom.
pub const MINIMUM_STUDIES: usize = 3;

/// Relative threshold below which the covariate is considered constant.
const SINGULARITY_TOLERANCE: f64 = 1e-12;

/// Spread of the covariate around its mean, relative to its magnitude, below
/// which the remaining variation is rounding noise.
const SPREAD_TOLERANCE: f64 = 1e-10;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegressionError {
    #[error(
        "Received {stats} effect sizes but {covariates} covariate values; every study needs exactly one moderator value."
    )]
    LengthMismatch { stats: usize, covariates: usize },

    #[error("Only {found} studies were supplied, but at least {required} are required.")]
    InsufficientData { found: usize, required: usize },

    #[error(
        "The moderator does not vary across studies, so the slope is not identifiable (singular design matrix)."
    )]
    SingularDesign,

    #[error("Study {index} has a non-finite moderator value.")]
    NonFiniteCovariate { index: usize },

    #[error("Study {index} has an invalid weight ({weight}); weights must be positive and finite.")]
    InvalidWeight { index: usize, weight: f64 },

    #[error("Study {index} has a non-finite effect size.")]
    NonFiniteEffect { index: usize },
}

/// Cochran-type heterogeneity test `Q ~ χ²(df)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Heterogeneity {
    pub q: f64,
    pub degrees_of_freedom: usize,
    pub p_value: f64,
}

impl Heterogeneity {
    pub fn new(q: f64, degrees_of_freedom: usize) -> Self {
        Self {
            q,
            degrees_of_freedom,
            p_value: pvalue_chi_squared(q, degrees_of_freedom as f64),
        }
    }
}

/// Coefficient tests that take the weights as exact inverse sampling variances.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KnownVarianceTests {
    pub intercept_std_error: f64,
    pub slope_std_error: f64,
    pub z_stat_intercept: f64,
    pub z_stat_slope: f64,
    pub p_value_intercept: f64,
    pub p_value_slope: f64,
}

/// Output of [`fit_weighted_regression`]. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionResult {
    pub intercept: f64,
    pub slope: f64,
    pub intercept_std_error: f64,
    pub slope_std_error: f64,
    pub study_count: usize,
    pub residual_degrees_of_freedom: usize,
    /// Weighted residual variance `s²`.
    pub residual_variance: f64,

    pub t_stat_intercept: f64,
    pub t_stat_slope: f64,
    pub t_p_value_intercept: f64,
    pub t_p_value_slope: f64,

    pub z_stat_intercept: f64,
    pub z_stat_slope: f64,
    pub z_p_value_intercept: f64,
    pub z_p_value_slope: f64,

    pub known_variance: KnownVarianceTests,
    /// Residual heterogeneity `Q_E = Σwᵢeᵢ²` on `n − 2` degrees of freedom.
    pub residual_heterogeneity: Heterogeneity,
}

impl RegressionResult {
    /// Predicted log risk ratio at moderator value `x`.
    pub fn predict(&self, x: f64) -> f64 {
        self.intercept + self.slope * x
    }

    /// Evenly spaced points along the fitted line over `[min, max]`, for overlays.
    pub fn fitted_line(&self, min: f64, max: f64, points: usize) -> Vec<(f64, f64)> {
        match points {
            0 => Vec::new(),
            1 => vec![(min, self.predict(min))],
            _ => {
                let step = (max - min) / (points - 1) as f64;
                (0..points)
                    .map(|i| {
                        let x = min + step * i as f64;
                        (x, self.predict(x))
                    })
                    .collect()
            }
        }
    }

    /// t-based intervals for `(intercept, slope)` at the given confidence level.
    pub fn confidence_intervals_t(&self, confidence: f64) -> [(f64, f64); 2] {
        let df = self.residual_degrees_of_freedom as f64;
        [
            confidence_interval_t(self.intercept, self.intercept_std_error, df, confidence),
            confidence_interval_t(self.slope, self.slope_std_error, df, confidence),
        ]
    }

    /// Normal-based intervals for `(intercept, slope)` using the known-variance standard errors.
    pub fn confidence_intervals_known_variance(&self, confidence: f64) -> [(f64, f64); 2] {
        [
            confidence_interval_z(
                self.intercept,
                self.known_variance.intercept_std_error,
                confidence,
            ),
            confidence_interval_z(self.slope, self.known_variance.slope_std_error, confidence),
        ]
    }
}

/// Validated weighted design for a one-moderator regression, centred on the
/// weighted covariate mean.
#[derive(Debug, Clone)]
pub(crate) struct WeightedDesign {
    pub(crate) y: Array1<f64>,
    pub(crate) x: Array1<f64>,
    pub(crate) w: Array1<f64>,
    pub(crate) total_weight: f64,
    pub(crate) x_bar: f64,
    pub(crate) sxx: f64,
}

impl WeightedDesign {
    pub(crate) fn new(
        stats: &[DerivedStudyStats],
        covariates: &[f64],
    ) -> Result<Self, RegressionError> {
        if stats.len() != covariates.len() {
            return Err(RegressionError::LengthMismatch {
                stats: stats.len(),
                covariates: covariates.len(),
            });
        }
        if stats.len() < MINIMUM_STUDIES {
            return Err(RegressionError::InsufficientData {
                found: stats.len(),
                required: MINIMUM_STUDIES,
            });
        }
        for (index, (stat, &x)) in stats.iter().zip(covariates).enumerate() {
            if !x.is_finite() {
                return Err(RegressionError::NonFiniteCovariate { index });
            }
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

        let y: Array1<f64> = stats.iter().map(|s| s.log_risk_ratio).collect();
        let w: Array1<f64> = stats.iter().map(|s| s.weight).collect();
        let x = Array1::from(covariates.to_vec());

        let total_weight = w.sum();
        let x_bar = w.dot(&x) / total_weight;
        let centered = x.mapv(|xi| xi - x_bar);
        let sxx = (&w * &centered * &centered).sum();

        // Both checks are relative to the centred spread, so shifting the
        // moderator by a constant never changes the outcome.
        let spread = centered.iter().fold(0.0_f64, |m, d| m.max(d.abs()));
        let magnitude = x.iter().fold(0.0_f64, |m, xi| m.max(xi.abs()));
        if !(spread > SPREAD_TOLERANCE * magnitude)
            || !(sxx > SINGULARITY_TOLERANCE * total_weight * spread * spread)
        {
            return Err(RegressionError::SingularDesign);
        }

        Ok(Self {
            y,
            x,
            w,
            total_weight,
            x_bar,
            sxx,
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.y.len()
    }

    /// Leverages `hᵢ = wᵢ · (1/W + (xᵢ − x̄)²/Sxx)`, the diagonal of the weighted hat matrix.
    pub(crate) fn hat_values(&self) -> Array1<f64> {
        let inv_w = 1.0 / self.total_weight;
        let mut hat = self.x.mapv(|xi| {
            let d = xi - self.x_bar;
            inv_w + d * d / self.sxx
        });
        hat *= &self.w;
        hat
    }
}

/// Fits the weighted least-squares regression of `stats[i].log_risk_ratio` on
/// `covariates[i]` with weights `stats[i].weight`.
pub fn fit_weighted_regression(
    stats: &[DerivedStudyStats],
    covariates: &[f64],
) -> Result<RegressionResult, RegressionError> {
    let design = WeightedDesign::new(stats, covariates)?;
    Ok(fit_design(&design))
}

pub(crate) fn fit_design(design: &WeightedDesign) -> RegressionResult {
    let n = design.len();
    let w = &design.w;

    let y_bar = w.dot(&design.y) / design.total_weight;
    let sxy: f64 = w
        .iter()
        .zip(design.x.iter().zip(design.y.iter()))
        .map(|(&wi, (&xi, &yi))| wi * (xi - design.x_bar) * (yi - y_bar))
        .sum();

    let slope = sxy / design.sxx;
    let intercept = y_bar - slope * design.x_bar;

    let residuals = &design.y - &design.x.mapv(|xi| intercept + slope * xi);
    let q_e = (w * &residuals * &residuals).sum();
    let residual_degrees_of_freedom = n - 2;
    let residual_variance = q_e / residual_degrees_of_freedom as f64;

    // Diagonal of (XᵀWX)⁻¹.
    let var_intercept_unscaled =
        1.0 / design.total_weight + design.x_bar * design.x_bar / design.sxx;
    let var_slope_unscaled = 1.0 / design.sxx;

    let kv_intercept_se = var_intercept_unscaled.sqrt();
    let kv_slope_se = var_slope_unscaled.sqrt();
    let intercept_std_error = (residual_variance * var_intercept_unscaled).sqrt();
    let slope_std_error = (residual_variance * var_slope_unscaled).sqrt();

    let t_stat_intercept = intercept / intercept_std_error;
    let t_stat_slope = slope / slope_std_error;
    let df = residual_degrees_of_freedom as f64;

    let known_variance = KnownVarianceTests {
        intercept_std_error: kv_intercept_se,
        slope_std_error: kv_slope_se,
        z_stat_intercept: intercept / kv_intercept_se,
        z_stat_slope: slope / kv_slope_se,
        p_value_intercept: pvalue_z(intercept / kv_intercept_se),
        p_value_slope: pvalue_z(slope / kv_slope_se),
    };

    log::debug!(
        "Weighted regression on {n} studies: intercept={intercept:.6}, slope={slope:.6}, Q_E={q_e:.4}"
    );

    RegressionResult {
        intercept,
        slope,
        intercept_std_error,
        slope_std_error,
        study_count: n,
        residual_degrees_of_freedom,
        residual_variance,
        t_stat_intercept,
        t_stat_slope,
        t_p_value_intercept: pvalue_t(t_stat_intercept, df),
        t_p_value_slope: pvalue_t(t_stat_slope, df),
        z_stat_intercept: t_stat_intercept,
        z_stat_slope: t_stat_slope,
        z_p_value_intercept: pvalue_z(t_stat_intercept),
        z_p_value_slope: pvalue_z(t_stat_slope),
        known_variance,
        residual_heterogeneity: Heterogeneity::new(q_e, residual_degrees_of_freedom),
    }
}
