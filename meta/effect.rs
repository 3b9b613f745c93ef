//! # Effect Sizes from 2x2 Count Tables
//!
//! Converts per-study event counts into log risk ratios, their large-sample
//! sampling variances, and inverse-variance weights. These derived statistics
//! are the only inputs the regression and pooling stages ever see.
//!
//! With treated events `a` out of `n1` and control events `c` out of `n2`:
//!
//! - `yi = ln((a / n1) / (c / n2))`
//! - `vi = 1/a - 1/n1 + 1/c - 1/n2`
//! - `wi = 1 / vi`
//!
//! The variance formula divides by each raw count, so zero counts are rejected
//! unless the caller explicitly opts into a continuity correction.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One study's 2x2 table plus its moderator value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyRecord {
    /// Adverse outcomes in the treated (exposed) arm.
    pub treated_events: u64,
    /// Treated-arm sample size.
    pub treated_total: u64,
    /// Adverse outcomes in the control arm.
    pub control_events: u64,
    /// Control-arm sample size.
    pub control_total: u64,
    /// Study-level moderator (e.g. absolute latitude).
    pub covariate: f64,
    /// Optional display label, carried through to output tables only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl StudyRecord {
    pub fn new(
        treated_events: u64,
        treated_total: u64,
        control_events: u64,
        control_total: u64,
        covariate: f64,
    ) -> Self {
        Self {
            treated_events,
            treated_total,
            control_events,
            control_total,
            covariate,
            label: None,
        }
    }

    /// Builds a record from the events / non-events layout (`tpos, tneg, cpos, cneg`)
    /// used by most published 2x2 tables.
    ///
    /// The arm totals `tpos + tneg` and `cpos + cneg` must fit in a `u64`.
    pub fn from_cells(tpos: u64, tneg: u64, cpos: u64, cneg: u64, covariate: f64) -> Self {
        Self::new(tpos, tpos + tneg, cpos, cpos + cneg, covariate)
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Returns the same study with the treated and control arms exchanged.
    pub fn with_arms_swapped(&self) -> Self {
        Self {
            treated_events: self.control_events,
            treated_total: self.control_total,
            control_events: self.treated_events,
            control_total: self.treated_total,
            covariate: self.covariate,
            label: self.label.clone(),
        }
    }

    fn has_zero_cell(&self) -> bool {
        self.treated_events == 0
            || self.treated_events == self.treated_total
            || self.control_events == 0
            || self.control_events == self.control_total
    }
}

/// Per-study statistics derived from a [`StudyRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DerivedStudyStats {
    pub log_risk_ratio: f64,
    pub variance: f64,
    pub weight: f64,
}

impl DerivedStudyStats {
    /// Builds the statistics from an effect size and its sampling variance.
    pub fn from_variance(log_risk_ratio: f64, variance: f64) -> Self {
        Self {
            log_risk_ratio,
            variance,
            weight: 1.0 / variance,
        }
    }

    /// The risk ratio on its natural scale.
    pub fn risk_ratio(&self) -> f64 {
        self.log_risk_ratio.exp()
    }

    /// Returns a copy whose variance is inflated by the between-study variance `tau_squared`.
    pub fn with_added_variance(&self, tau_squared: f64) -> Self {
        Self::from_variance(self.log_risk_ratio, self.variance + tau_squared)
    }
}

/// Options controlling how zero cells are handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EffectSizeOptions {
    /// Constant added to every cell of a study that has at least one empty cell.
    /// `None` rejects such studies outright.
    pub continuity_correction: Option<f64>,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EffectSizeError {
    #[error(
        "Study {index} has a non-positive '{field}' count. Log risk ratios and their variances are undefined for empty cells."
    )]
    InvalidCount { index: usize, field: &'static str },

    #[error("Study {index} reports {events} events in the {arm} arm but only {total} participants.")]
    EventsExceedTotal {
        index: usize,
        arm: &'static str,
        events: u64,
        total: u64,
    },

    #[error("Study {index} has zero events in both arms; its risk ratio carries no information.")]
    DoubleZero { index: usize },

    #[error("Study {index} has a non-positive sampling variance ({variance}); its weight is undefined.")]
    NonPositiveVariance { index: usize, variance: f64 },

    #[error("Continuity correction must be a positive finite number, got {0}.")]
    InvalidContinuityCorrection(f64),
}

/// Computes log risk ratios, variances and weights with strict zero-count rejection.
///
/// The output preserves the order and length of `studies`. The first invalid study
/// aborts the whole batch.
pub fn compute_derived_stats(
    studies: &[StudyRecord],
) -> Result<Vec<DerivedStudyStats>, EffectSizeError> {
    compute_derived_stats_with(studies, &EffectSizeOptions::default())
}

/// Computes derived statistics, applying `options` to studies with empty cells.
pub fn compute_derived_stats_with(
    studies: &[StudyRecord],
    options: &EffectSizeOptions,
) -> Result<Vec<DerivedStudyStats>, EffectSizeError> {
    if let Some(correction) = options.continuity_correction
        && (!correction.is_finite() || correction <= 0.0)
    {
        return Err(EffectSizeError::InvalidContinuityCorrection(correction));
    }

    let mut corrected = 0usize;
    let stats = studies
        .iter()
        .enumerate()
        .map(|(index, study)| {
            validate_study(index, study, options.continuity_correction.is_some())?;

            let mut a = study.treated_events as f64;
            let mut n1 = study.treated_total as f64;
            let mut c = study.control_events as f64;
            let mut n2 = study.control_total as f64;

            if let Some(correction) = options.continuity_correction
                && study.has_zero_cell()
            {
                a += correction;
                c += correction;
                n1 += 2.0 * correction;
                n2 += 2.0 * correction;
                corrected += 1;
            }

            let log_risk_ratio = ((a / n1) / (c / n2)).ln();
            let variance = 1.0 / a - 1.0 / n1 + 1.0 / c - 1.0 / n2;
            if !(variance.is_finite() && variance > 0.0) {
                return Err(EffectSizeError::NonPositiveVariance { index, variance });
            }

            Ok(DerivedStudyStats::from_variance(log_risk_ratio, variance))
        })
        .collect::<Result<Vec<_>, _>>()?;

    if corrected > 0 {
        log::info!("Applied continuity correction to {corrected} of {} studies", studies.len());
    }
    log::debug!("Derived effect sizes for {} studies", stats.len());
    Ok(stats)
}

fn validate_study(
    index: usize,
    study: &StudyRecord,
    allow_zero_events: bool,
) -> Result<(), EffectSizeError> {
    if study.treated_total == 0 {
        return Err(EffectSizeError::InvalidCount {
            index,
            field: "treated_total",
        });
    }
    if study.control_total == 0 {
        return Err(EffectSizeError::InvalidCount {
            index,
            field: "control_total",
        });
    }
    if study.treated_events > study.treated_total {
        return Err(EffectSizeError::EventsExceedTotal {
            index,
            arm: "treated",
            events: study.treated_events,
            total: study.treated_total,
        });
    }
    if study.control_events > study.control_total {
        return Err(EffectSizeError::EventsExceedTotal {
            index,
            arm: "control",
            events: study.control_events,
            total: study.control_total,
        });
    }

    if allow_zero_events {
        if study.treated_events == 0 && study.control_events == 0 {
            return Err(EffectSizeError::DoubleZero { index });
        }
        return Ok(());
    }

    if study.treated_events == 0 {
        return Err(EffectSizeError::InvalidCount {
            index,
            field: "treated_events",
        });
    }
    if study.control_events == 0 {
        return Err(EffectSizeError::InvalidCount {
            index,
            field: "control_events",
        });
    }
    Ok(())
}
