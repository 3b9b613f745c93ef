//! # Analysis Artifacts
//!
//! The analysis report is a self-contained, human-readable TOML file holding
//! the configuration that produced it, the pooled estimate, the regression
//! fits and a per-study table. The per-study table and QQ coordinates can
//! also be written as TSV for plotting.

use crate::analysis::AnalysisConfig;
use crate::diagnostics::QqPoint;
use crate::effect::{DerivedStudyStats, StudyRecord};
use crate::inference::significance_stars;
use crate::mixed::MixedEffectsResult;
use crate::pooled::PooledEstimate;
use crate::regression::RegressionResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

/// One row of the per-study output table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyRow {
    pub label: String,
    pub treated_events: u64,
    pub treated_total: u64,
    pub control_events: u64,
    pub control_total: u64,
    pub covariate: f64,
    pub log_risk_ratio: f64,
    pub variance: f64,
    /// Weight in the selected model (`1/(vᵢ + τ²)`).
    pub weight: f64,
    pub fitted: f64,
    pub residual: f64,
    pub hat_value: f64,
    pub standardized_residual: f64,
}

/// The complete result of one analysis, saved to and loaded from TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub config: AnalysisConfig,
    pub pooled: PooledEstimate,
    pub fixed_effect: RegressionResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mixed_effects: Option<MixedEffectsResult>,
    pub studies: Vec<StudyRow>,
}

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Failed to read or write report file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML report file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize report to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Failed to write TSV output: {0}")]
    CsvError(#[from] csv::Error),
}

impl AnalysisReport {
    /// The regression fit of the configured model.
    pub fn selected_fit(&self) -> &RegressionResult {
        match &self.mixed_effects {
            Some(mixed) => &mixed.fit,
            None => &self.fixed_effect,
        }
    }

    /// Saves the report to a TOML file.
    pub fn save(&self, path: &Path) -> Result<(), ReportError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Loads a report from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ReportError> {
        let toml_string = fs::read_to_string(path)?;
        let report = toml::from_str(&toml_string)?;
        Ok(report)
    }
}

/// Plain-text summary in the layout of a regression coefficient table.
impl fmt::Display for AnalysisReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = self.config.confidence_level;
        let ci_header = format!("{:.0}% CI", level * 100.0);
        write!(f, "{}", self.pooled)?;

        let fe = &self.fixed_effect;
        writeln!(f)?;
        writeln!(
            f,
            "Weighted regression on '{}' (residual df = {}, s^2 = {:.4})",
            self.config.moderator, fe.residual_degrees_of_freedom, fe.residual_variance
        )?;
        writeln!(
            f,
            "{:<12}{:>10}{:>10}{:>9}{:>10}{:>10}  {ci_header}",
            "", "estimate", "se", "t", "p(t)", "p(z)"
        )?;
        let intervals = fe.confidence_intervals_t(level);
        let rows = [
            (
                "intercept",
                fe.intercept,
                fe.intercept_std_error,
                fe.t_stat_intercept,
                fe.t_p_value_intercept,
                fe.z_p_value_intercept,
                intervals[0],
            ),
            (
                "slope",
                fe.slope,
                fe.slope_std_error,
                fe.t_stat_slope,
                fe.t_p_value_slope,
                fe.z_p_value_slope,
                intervals[1],
            ),
        ];
        for (name, est, se, t, pt, pz, (lo, hi)) in rows {
            writeln!(
                f,
                "{name:<12}{est:>10.4}{se:>10.4}{t:>9.3}{pt:>10.4}{pz:>10.4}  [{lo:.4}, {hi:.4}] {}",
                significance_stars(pt)
            )?;
        }

        writeln!(f)?;
        writeln!(f, "Fixed-effect meta-regression (known variances)")?;
        write_known_variance(f, fe, level)?;
        writeln!(
            f,
            "Residual heterogeneity: QE({}) = {:.4}, p = {:.4}",
            fe.residual_heterogeneity.degrees_of_freedom,
            fe.residual_heterogeneity.q,
            fe.residual_heterogeneity.p_value
        )?;

        if let Some(mixed) = &self.mixed_effects {
            writeln!(f)?;
            writeln!(
                f,
                "Mixed-effects meta-regression (tau^2 = {:.4})",
                mixed.tau_squared
            )?;
            write_known_variance(f, &mixed.fit, level)?;
            if let Some(explained) = mixed.heterogeneity_explained {
                writeln!(f, "Heterogeneity accounted for: {:.1}%", explained * 100.0)?;
            }
        }
        Ok(())
    }
}

fn write_known_variance(
    f: &mut fmt::Formatter<'_>,
    fit: &RegressionResult,
    level: f64,
) -> fmt::Result {
    let kv = &fit.known_variance;
    writeln!(
        f,
        "{:<12}{:>10}{:>10}{:>9}{:>10}  {:.0}% CI",
        "",
        "estimate",
        "se",
        "z",
        "p(z)",
        level * 100.0
    )?;
    let intervals = fit.confidence_intervals_known_variance(level);
    let rows = [
        (
            "intercept",
            fit.intercept,
            kv.intercept_std_error,
            kv.z_stat_intercept,
            kv.p_value_intercept,
            intervals[0],
        ),
        (
            "slope",
            fit.slope,
            kv.slope_std_error,
            kv.z_stat_slope,
            kv.p_value_slope,
            intervals[1],
        ),
    ];
    for (name, est, se, z, p, (lo, hi)) in rows {
        writeln!(
            f,
            "{name:<12}{est:>10.4}{se:>10.4}{z:>9.3}{p:>10.4}  [{lo:.4}, {hi:.4}] {}",
            significance_stars(p)
        )?;
    }
    Ok(())
}

/// Writes the per-study table as TSV with a header row.
pub fn write_study_table<W: Write>(rows: &[StudyRow], writer: W) -> Result<(), ReportError> {
    let mut out = csv::WriterBuilder::new().delimiter(b'\t').from_writer(writer);
    for row in rows {
        out.serialize(row)?;
    }
    out.flush()?;
    Ok(())
}

#[derive(Serialize)]
struct EffectRow<'a> {
    label: &'a str,
    covariate: f64,
    log_risk_ratio: f64,
    variance: f64,
    weight: f64,
}

/// Writes the derived effect sizes (`yᵢ`, `vᵢ`, `wᵢ`) as TSV.
pub fn write_effect_table<W: Write>(
    studies: &[StudyRecord],
    stats: &[DerivedStudyStats],
    writer: W,
) -> Result<(), ReportError> {
    let mut out = csv::WriterBuilder::new().delimiter(b'\t').from_writer(writer);
    for (i, (study, stat)) in studies.iter().zip(stats).enumerate() {
        let fallback = (i + 1).to_string();
        out.serialize(EffectRow {
            label: study.label.as_deref().unwrap_or(&fallback),
            covariate: study.covariate,
            log_risk_ratio: stat.log_risk_ratio,
            variance: stat.variance,
            weight: stat.weight,
        })?;
    }
    out.flush()?;
    Ok(())
}

/// Writes QQ coordinates as TSV (`theoretical`, `sample`).
pub fn write_qq_table<W: Write>(points: &[QqPoint], writer: W) -> Result<(), ReportError> {
    let mut out = csv::WriterBuilder::new().delimiter(b'\t').from_writer(writer);
    for point in points {
        out.serialize(point)?;
    }
    out.flush()?;
    Ok(())
}
