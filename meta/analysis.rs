//! End-to-end analysis of one study table: effect sizes, pooled estimate,
//! meta-regression on the moderator, and per-study diagnostics.

use crate::diagnostics::{QqPoint, ResidualDiagnostics, normal_qq, residual_diagnostics};
use crate::effect::{EffectSizeError, EffectSizeOptions, StudyRecord, compute_derived_stats_with};
use crate::mixed::{MixedEffectsResult, fit_mixed_effects_regression};
use crate::pooled::{
    DEFAULT_CONFIDENCE_LEVEL, EffectsModel, PooledEstimate, pool_fixed_effect, pool_random_effects,
};
use crate::regression::{RegressionError, RegressionResult, fit_weighted_regression};
use crate::report::{AnalysisReport, StudyRow};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The effective settings of one analysis, stored alongside its results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    pub model: EffectsModel,
    pub moderator: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuity_correction: Option<f64>,
    pub confidence_level: f64,
}

impl AnalysisConfig {
    pub fn new(model: EffectsModel, moderator: impl Into<String>) -> Self {
        Self {
            model,
            moderator: moderator.into(),
            continuity_correction: None,
            confidence_level: DEFAULT_CONFIDENCE_LEVEL,
        }
    }

    fn effect_size_options(&self) -> EffectSizeOptions {
        EffectSizeOptions {
            continuity_correction: self.continuity_correction,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnalysisError {
    #[error(transparent)]
    EffectSize(#[from] EffectSizeError),
    #[error(transparent)]
    Regression(#[from] RegressionError),
    #[error("Confidence level must lie strictly between 0 and 1, got {0}.")]
    InvalidConfidenceLevel(f64),
}

/// Intermediate products shared by the report and QQ outputs.
struct Fitted {
    pooled: PooledEstimate,
    fixed_effect: RegressionResult,
    mixed_effects: Option<MixedEffectsResult>,
    diagnostics: ResidualDiagnostics,
    rows: Vec<StudyRow>,
}

fn fit_all(studies: &[StudyRecord], config: &AnalysisConfig) -> Result<Fitted, AnalysisError> {
    if !(config.confidence_level > 0.0 && config.confidence_level < 1.0) {
        return Err(AnalysisError::InvalidConfidenceLevel(config.confidence_level));
    }

    let stats = compute_derived_stats_with(studies, &config.effect_size_options())?;
    let covariates: Vec<f64> = studies.iter().map(|s| s.covariate).collect();

    let pooled = match config.model {
        EffectsModel::FixedEffect => pool_fixed_effect(&stats)?,
        EffectsModel::RandomEffects => pool_random_effects(&stats)?,
    }
    .with_confidence_level(config.confidence_level);

    let fixed_effect = fit_weighted_regression(&stats, &covariates)?;
    let mixed_effects = match config.model {
        EffectsModel::FixedEffect => None,
        EffectsModel::RandomEffects => Some(fit_mixed_effects_regression(&stats, &covariates)?),
    };

    let (selected, tau_squared) = match &mixed_effects {
        Some(mixed) => (&mixed.fit, mixed.tau_squared),
        None => (&fixed_effect, 0.0),
    };
    let diagnostics = residual_diagnostics(&stats, &covariates, selected, tau_squared)?;

    let rows = studies
        .iter()
        .zip(&stats)
        .enumerate()
        .map(|(i, (study, stat))| StudyRow {
            label: study.label.clone().unwrap_or_else(|| (i + 1).to_string()),
            treated_events: study.treated_events,
            treated_total: study.treated_total,
            control_events: study.control_events,
            control_total: study.control_total,
            covariate: study.covariate,
            log_risk_ratio: stat.log_risk_ratio,
            variance: stat.variance,
            weight: 1.0 / (stat.variance + tau_squared),
            fitted: diagnostics.fitted[i],
            residual: diagnostics.residuals[i],
            hat_value: diagnostics.hat_values[i],
            standardized_residual: diagnostics.standardized_residuals[i],
        })
        .collect();

    Ok(Fitted {
        pooled,
        fixed_effect,
        mixed_effects,
        diagnostics,
        rows,
    })
}

/// Runs the complete analysis described by `config` on `studies`.
pub fn run_analysis(
    studies: &[StudyRecord],
    config: &AnalysisConfig,
) -> Result<AnalysisReport, AnalysisError> {
    log::info!(
        "Running {:?} meta-regression of log risk ratio on '{}' over {} studies",
        config.model,
        config.moderator,
        studies.len()
    );
    let fitted = fit_all(studies, config)?;
    Ok(AnalysisReport {
        config: config.clone(),
        pooled: fitted.pooled,
        fixed_effect: fitted.fixed_effect,
        mixed_effects: fitted.mixed_effects,
        studies: fitted.rows,
    })
}

/// Normal QQ coordinates of the standardized residuals of the selected model.
pub fn residual_qq(
    studies: &[StudyRecord],
    config: &AnalysisConfig,
) -> Result<Vec<QqPoint>, AnalysisError> {
    let fitted = fit_all(studies, config)?;
    let standardized = fitted.diagnostics.standardized_residuals.to_vec();
    Ok(normal_qq(&standardized))
}
