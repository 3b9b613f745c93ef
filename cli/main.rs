#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process;

use metareg::analysis::{AnalysisConfig, residual_qq, run_analysis};
use metareg::data::{DEFAULT_MODERATOR, LoadOptions, load_studies, write_studies};
use metareg::datasets::{BCG_MODERATOR, bcg};
use metareg::diagnostics::qq_reference_line;
use metareg::effect::{EffectSizeOptions, StudyRecord, compute_derived_stats_with};
use metareg::pooled::{DEFAULT_CONFIDENCE_LEVEL, EffectsModel, pool_fixed_effect, pool_random_effects};
use metareg::report::{write_effect_table, write_qq_table, write_study_table};

#[derive(Clone, Copy, ValueEnum)]
pub enum ModelCli {
    Fixed,
    Random,
}

impl From<ModelCli> for EffectsModel {
    fn from(model: ModelCli) -> Self {
        match model {
            ModelCli::Fixed => EffectsModel::FixedEffect,
            ModelCli::Random => EffectsModel::RandomEffects,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
pub enum DatasetCli {
    /// BCG vaccine trials, moderator `ablat`
    Bcg,
}

#[derive(Args)]
pub struct InputArgs {
    /// Path to a study table (TSV, or CSV by extension) with tpos,tneg,cpos,cneg
    /// or treated_events,treated_total,control_events,control_total columns,
    /// plus the moderator column for regressions
    #[arg(value_name = "DATA")]
    pub data: PathBuf,

    /// Name of the moderator column [regressions default to `ablat`; `pool`
    /// and `effects` read it only when given]
    #[arg(long)]
    pub moderator: Option<String>,

    /// Add this constant to every cell of studies with a zero cell
    #[arg(long, value_name = "C")]
    pub continuity_correction: Option<f64>,
}

impl InputArgs {
    fn regression_moderator(&self) -> &str {
        self.moderator.as_deref().unwrap_or(DEFAULT_MODERATOR)
    }

    /// Loads the table for a regression, which always needs a moderator.
    fn load_for_regression(&self) -> Result<Vec<StudyRecord>, Box<dyn std::error::Error>> {
        self.load_with(Some(self.regression_moderator().to_string()))
    }

    /// Loads the table, reading the moderator only when one was named.
    fn load(&self) -> Result<Vec<StudyRecord>, Box<dyn std::error::Error>> {
        self.load_with(self.moderator.clone())
    }

    fn load_with(
        &self,
        moderator: Option<String>,
    ) -> Result<Vec<StudyRecord>, Box<dyn std::error::Error>> {
        let options = LoadOptions {
            moderator,
            separator: None,
        };
        Ok(load_studies(&self.data, &options)?)
    }

    fn config(&self, model: ModelCli, confidence_level: f64) -> AnalysisConfig {
        let mut config = AnalysisConfig::new(model.into(), self.regression_moderator());
        config.continuity_correction = self.continuity_correction;
        config.confidence_level = confidence_level;
        config
    }
}

#[derive(Parser)]
#[command(
    name = "metareg",
    about = "Inverse-variance meta-regression of risk ratios",
    long_about = "Derives log risk ratios from 2x2 study tables, pools them, and regresses \
                 them on a study-level moderator with fixed- or mixed-effects weighting."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Per-study log risk ratios, variances and weights
    Effects {
        #[command(flatten)]
        input: InputArgs,

        /// Write the TSV table here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Pooled log risk ratio without a moderator
    Pool {
        #[command(flatten)]
        input: InputArgs,

        #[arg(long, value_enum, default_value_t = ModelCli::Random)]
        model: ModelCli,

        /// Coverage of the reported interval
        #[arg(long, default_value_t = DEFAULT_CONFIDENCE_LEVEL)]
        confidence_level: f64,
    },

    /// Meta-regression of the log risk ratio on the moderator
    Fit {
        #[command(flatten)]
        input: InputArgs,

        #[arg(long, value_enum, default_value_t = ModelCli::Fixed)]
        model: ModelCli,

        /// Coverage of the reported intervals
        #[arg(long, default_value_t = DEFAULT_CONFIDENCE_LEVEL)]
        confidence_level: f64,

        /// Path of the saved TOML report
        #[arg(long, default_value = "report.toml")]
        output: PathBuf,

        /// Also write the per-study table (fitted values, residuals, leverage) as TSV
        #[arg(long)]
        studies: Option<PathBuf>,
    },

    /// Normal QQ coordinates of the standardized residuals
    Qq {
        #[command(flatten)]
        input: InputArgs,

        #[arg(long, value_enum, default_value_t = ModelCli::Fixed)]
        model: ModelCli,

        /// Write the TSV table here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Export a bundled dataset as a study table
    Dataset {
        #[arg(value_enum)]
        name: DatasetCli,

        /// Write the TSV table here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Effects { input, output }) => run_effects(input, output),
        Some(Commands::Pool {
            input,
            model,
            confidence_level,
        }) => run_pool(input, model, confidence_level),
        Some(Commands::Fit {
            input,
            model,
            confidence_level,
            output,
            studies,
        }) => run_fit(input, model, confidence_level, output, studies),
        Some(Commands::Qq {
            input,
            model,
            output,
        }) => run_qq(input, model, output),
        Some(Commands::Dataset { name, output }) => run_dataset(name, output),
        None => Cli::command()
            .print_help()
            .map(|()| println!())
            .map_err(Into::into),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

/// Opens `path` for writing, or stdout when no path is given.
fn open_output(path: Option<&Path>) -> io::Result<Box<dyn Write>> {
    Ok(match path {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(io::stdout().lock()),
    })
}

fn run_effects(input: InputArgs, output: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let studies = input.load()?;
    let options = EffectSizeOptions {
        continuity_correction: input.continuity_correction,
    };
    let stats = compute_derived_stats_with(&studies, &options)?;
    write_effect_table(&studies, &stats, open_output(output.as_deref())?)?;
    Ok(())
}

fn run_pool(
    input: InputArgs,
    model: ModelCli,
    confidence_level: f64,
) -> Result<(), Box<dyn std::error::Error>> {
    if !(confidence_level > 0.0 && confidence_level < 1.0) {
        return Err(format!(
            "Confidence level must lie strictly between 0 and 1, got {confidence_level}."
        )
        .into());
    }
    let studies = input.load()?;
    let options = EffectSizeOptions {
        continuity_correction: input.continuity_correction,
    };
    let stats = compute_derived_stats_with(&studies, &options)?;
    let pooled = match EffectsModel::from(model) {
        EffectsModel::FixedEffect => pool_fixed_effect(&stats)?,
        EffectsModel::RandomEffects => pool_random_effects(&stats)?,
    }
    .with_confidence_level(confidence_level);

    print!("{pooled}");
    Ok(())
}

fn run_fit(
    input: InputArgs,
    model: ModelCli,
    confidence_level: f64,
    output: PathBuf,
    studies_output: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let studies = input.load_for_regression()?;
    let config = input.config(model, confidence_level);
    let report = run_analysis(&studies, &config)?;

    print!("{report}");
    report.save(&output)?;
    println!("\nReport saved to: {}", output.display());

    if let Some(path) = studies_output {
        write_study_table(&report.studies, open_output(Some(&path))?)?;
        println!("Per-study table saved to: {}", path.display());
    }
    Ok(())
}

fn run_qq(
    input: InputArgs,
    model: ModelCli,
    output: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let studies = input.load_for_regression()?;
    let config = input.config(model, DEFAULT_CONFIDENCE_LEVEL);
    let points = residual_qq(&studies, &config)?;
    write_qq_table(&points, open_output(output.as_deref())?)?;

    if let Some((intercept, slope)) = qq_reference_line(&points) {
        let line = format!("QQ reference line: intercept = {intercept:.4}, slope = {slope:.4}");
        // stdout carries the table when no path is given.
        match output {
            Some(path) => println!("{line}\nQQ table saved to: {}", path.display()),
            None => eprintln!("{line}"),
        }
    }
    Ok(())
}

fn run_dataset(name: DatasetCli, output: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let (studies, moderator) = match name {
        DatasetCli::Bcg => (bcg(), BCG_MODERATOR),
    };
    write_studies(&studies, moderator, open_output(output.as_deref())?)?;
    Ok(())
}
