// =============================================================================
// Reference Distributions
// =============================================================================
//
// Two-sided p-values and confidence intervals for regression coefficients and
// pooled estimates, plus the upper-tail chi-square probability used by the
// heterogeneity tests.
//
// Classical weighted regression treats the residual variance as estimated and
// tests against Student's t; meta-analytic practice treats the sampling
// variances as known and tests against the standard normal. Both are exposed
// so callers can report either convention.
//
// =============================================================================

use statrs::distribution::{ChiSquared, ContinuousCDF, Normal, StudentsT};

fn standard_normal() -> Option<Normal> {
    Normal::new(0.0, 1.0).ok()
}

/// Two-tailed p-value of a z-statistic under the standard normal.
pub fn pvalue_z(z: f64) -> f64 {
    if z.is_nan() {
        return f64::NAN;
    }
    if z.is_infinite() {
        return 0.0;
    }
    match standard_normal() {
        // P(|Z| > |z|) = 2 * P(Z > |z|)
        Some(normal) => 2.0 * normal.sf(z.abs()),
        None => f64::NAN,
    }
}

/// Two-tailed p-value of a t-statistic with `df` degrees of freedom.
pub fn pvalue_t(t: f64, df: f64) -> f64 {
    if t.is_nan() || df <= 0.0 {
        return f64::NAN;
    }
    if t.is_infinite() {
        return 0.0;
    }
    match StudentsT::new(0.0, 1.0, df) {
        Ok(dist) => 2.0 * dist.sf(t.abs()),
        Err(_) => f64::NAN,
    }
}

/// Upper-tail probability `P(X >= q)` for a chi-square variable with `df` degrees of freedom.
pub fn pvalue_chi_squared(q: f64, df: f64) -> f64 {
    if !q.is_finite() || df <= 0.0 {
        return f64::NAN;
    }
    match ChiSquared::new(df) {
        Ok(dist) => dist.sf(q.max(0.0)),
        Err(_) => f64::NAN,
    }
}

/// Standard normal quantile, `NaN` outside `(0, 1)`.
pub fn normal_quantile(p: f64) -> f64 {
    if !(p > 0.0 && p < 1.0) {
        return f64::NAN;
    }
    match standard_normal() {
        Some(normal) => normal.inverse_cdf(p),
        None => f64::NAN,
    }
}

/// Confidence interval `estimate ± z_{1-α/2} · se`.
pub fn confidence_interval_z(estimate: f64, std_error: f64, confidence: f64) -> (f64, f64) {
    if !estimate.is_finite() || !std_error.is_finite() || std_error < 0.0 {
        return (f64::NAN, f64::NAN);
    }
    let alpha = 1.0 - confidence;
    let margin = normal_quantile(1.0 - alpha / 2.0) * std_error;
    (estimate - margin, estimate + margin)
}

/// Confidence interval `estimate ± t_{df, 1-α/2} · se`.
pub fn confidence_interval_t(
    estimate: f64,
    std_error: f64,
    df: f64,
    confidence: f64,
) -> (f64, f64) {
    if !estimate.is_finite() || !std_error.is_finite() || std_error < 0.0 || df <= 0.0 {
        return (f64::NAN, f64::NAN);
    }
    let t_dist = match StudentsT::new(0.0, 1.0, df) {
        Ok(d) => d,
        Err(_) => return (f64::NAN, f64::NAN),
    };
    let alpha = 1.0 - confidence;
    let margin = t_dist.inverse_cdf(1.0 - alpha / 2.0) * std_error;
    (estimate - margin, estimate + margin)
}

/// Significance code used in coefficient tables.
pub fn significance_stars(pvalue: f64) -> &'static str {
    if pvalue < 0.001 {
        "***"
    } else if pvalue < 0.01 {
        "**"
    } else if pvalue < 0.05 {
        "*"
    } else if pvalue < 0.1 {
        "."
    } else {
        ""
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_pvalue_z_reference_points() {
        assert_abs_diff_eq!(pvalue_z(0.0), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(pvalue_z(1.959964), 0.05, epsilon = 1e-5);
        assert_abs_diff_eq!(pvalue_z(-1.959964), 0.05, epsilon = 1e-5);
        assert!(pvalue_z(f64::NAN).is_nan());
        assert_eq!(pvalue_z(f64::INFINITY), 0.0);
    }

    #[test]
    fn test_pvalue_t_is_heavier_tailed_than_normal() {
        // t_{0.975, 10} = 2.228139
        assert_abs_diff_eq!(pvalue_t(2.228139, 10.0), 0.05, epsilon = 1e-5);
        assert!(pvalue_t(2.0, 5.0) > pvalue_z(2.0));
        assert!(pvalue_t(2.0, 0.0).is_nan());
    }

    #[test]
    fn test_chi_squared_upper_tail() {
        // chi2_{0.95, 1} = 3.841459
        assert_abs_diff_eq!(pvalue_chi_squared(3.841459, 1.0), 0.05, epsilon = 1e-5);
        assert_abs_diff_eq!(pvalue_chi_squared(0.0, 4.0), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_confidence_intervals() {
        let (lo, hi) = confidence_interval_z(1.0, 0.5, 0.95);
        assert_abs_diff_eq!(lo, 1.0 - 1.959964 * 0.5, epsilon = 1e-5);
        assert_abs_diff_eq!(hi, 1.0 + 1.959964 * 0.5, epsilon = 1e-5);

        let (lo_t, hi_t) = confidence_interval_t(1.0, 0.5, 10.0, 0.95);
        assert_abs_diff_eq!(hi_t - lo_t, 2.0 * 2.228139 * 0.5, epsilon = 1e-5);
    }

    #[test]
    fn test_normal_quantile_bounds() {
        assert_abs_diff_eq!(normal_quantile(0.5), 0.0, epsilon = 1e-12);
        assert!(normal_quantile(0.0).is_nan());
        assert!(normal_quantile(1.0).is_nan());
    }

    #[test]
    fn test_significance_stars() {
        assert_eq!(significance_stars(0.0001), "***");
        assert_eq!(significance_stars(0.005), "**");
        assert_eq!(significance_stars(0.03), "*");
        assert_eq!(significance_stars(0.07), ".");
        assert_eq!(significance_stars(0.5), "");
    }
}
