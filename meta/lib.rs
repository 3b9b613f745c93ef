#![deny(dead_code)]
#![deny(unused_imports)]

//! Inverse-variance meta-regression of risk ratios.
//!
//! The pipeline runs in two explicit steps: per-study effect sizes are derived
//! from 2x2 count tables ([`effect`]), then the log risk ratios are regressed on
//! a single study-level moderator ([`regression`]). Pooled estimates,
//! random-effects refits and residual diagnostics build on the same derived
//! statistics.

pub mod analysis;
pub mod data;
pub mod datasets;
pub mod diagnostics;
pub mod effect;
pub mod inference;
pub mod mixed;
pub mod pooled;
pub mod regression;
pub mod report;

pub use effect::{
    DerivedStudyStats, EffectSizeError, EffectSizeOptions, StudyRecord, compute_derived_stats,
    compute_derived_stats_with,
};
pub use mixed::{MixedEffectsResult, fit_mixed_effects_regression};
pub use pooled::{PooledEstimate, pool_fixed_effect, pool_random_effects};
pub use regression::{RegressionError, RegressionResult, fit_weighted_regression};
