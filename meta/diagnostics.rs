//! Residual diagnostics for a fitted meta-regression: leverages, standardized
//! residuals, and the coordinates of a normal quantile-quantile plot.

use crate::effect::DerivedStudyStats;
use crate::inference::normal_quantile;
use crate::regression::{RegressionError, RegressionResult, WeightedDesign};
use ndarray::Array1;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResidualDiagnostics {
    pub fitted: Array1<f64>,
    pub residuals: Array1<f64>,
    pub hat_values: Array1<f64>,
    /// `eᵢ / sqrt((vᵢ + τ²)(1 − hᵢ))`; `NaN` for studies with leverage one.
    pub standardized_residuals: Array1<f64>,
}

/// One point of a normal QQ plot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QqPoint {
    pub theoretical: f64,
    pub sample: f64,
}

/// Computes residual diagnostics for `fit`, which must have been produced from
/// the same `stats` and `covariates` (inflated by `tau_squared` for a
/// mixed-effects fit; pass `0.0` for a fixed-effect fit).
pub fn residual_diagnostics(
    stats: &[DerivedStudyStats],
    covariates: &[f64],
    fit: &RegressionResult,
    tau_squared: f64,
) -> Result<ResidualDiagnostics, RegressionError> {
    let total: Vec<DerivedStudyStats> = stats
        .iter()
        .map(|s| s.with_added_variance(tau_squared))
        .collect();
    let design = WeightedDesign::new(&total, covariates)?;

    let fitted = design.x.mapv(|x| fit.predict(x));
    let residuals = &design.y - &fitted;
    let hat_values = design.hat_values();

    let standardized_residuals = Array1::from_iter(
        residuals
            .iter()
            .zip(total.iter().zip(hat_values.iter()))
            .map(|(&e, (s, &h))| {
                let denominator = s.variance * (1.0 - h);
                if denominator > 0.0 {
                    e / denominator.sqrt()
                } else {
                    f64::NAN
                }
            }),
    );

    Ok(ResidualDiagnostics {
        fitted,
        residuals,
        hat_values,
        standardized_residuals,
    })
}

/// Plotting positions `(i − a)/(n + 1 − 2a)` with `a = 3/8` for small samples.
fn plotting_positions(n: usize) -> impl Iterator<Item = f64> {
    let a = if n <= 10 { 0.375 } else { 0.5 };
    (1..=n).map(move |i| (i as f64 - a) / (n as f64 + 1.0 - 2.0 * a))
}

/// Pairs the sorted finite `values` with standard normal quantiles.
pub fn normal_qq(values: &[f64]) -> Vec<QqPoint> {
    let mut sample: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    sample.sort_by(f64::total_cmp);

    plotting_positions(sample.len())
        .zip(sample)
        .map(|(p, sample)| QqPoint {
            theoretical: normal_quantile(p),
            sample,
        })
        .collect()
}

/// Sample quantile with linear interpolation between order statistics.
fn quantile_sorted(sorted: &[f64], p: f64) -> f64 {
    let h = (sorted.len() - 1) as f64 * p;
    let lo = h.floor() as usize;
    let hi = h.ceil() as usize;
    sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
}

/// Reference line through the first and third quartiles of the sample
/// values, as `(intercept, slope)`. The points may be in any order.
pub fn qq_reference_line(points: &[QqPoint]) -> Option<(f64, f64)> {
    if points.len() < 2 {
        return None;
    }
    let mut sorted: Vec<f64> = points.iter().map(|p| p.sample).collect();
    sorted.sort_by(f64::total_cmp);
    let (y1, y3) = (quantile_sorted(&sorted, 0.25), quantile_sorted(&sorted, 0.75));
    let (x1, x3) = (normal_quantile(0.25), normal_quantile(0.75));
    let slope = (y3 - y1) / (x3 - x1);
    Some((y1 - slope * x1, slope))
}
