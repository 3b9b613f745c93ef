//! # Study Table Loading and Validation
//!
//! Reads delimited study tables and validates them against a strict schema
//! before anything reaches the statistical core. Two count layouts are
//! recognised:
//!
//! - `tpos`, `tneg`, `cpos`, `cneg`: events and non-events per arm, the layout
//!   used by most published 2x2 tables;
//! - `treated_events`, `treated_total`, `control_events`, `control_total`.
//!
//! The moderator column is named by the caller and may be omitted for
//! analyses without one. An optional `study` or `author` column supplies row
//! labels. Rows that are empty in every column (trailing blank lines) are
//! skipped. Failures are assumed to be user-input
//! errors, so `DataError` names the offending column and row.

use crate::effect::StudyRecord;
use polars::prelude::*;
use std::collections::HashSet;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use thiserror::Error;

/// Moderator column used when none is given (absolute latitude in the BCG table).
pub const DEFAULT_MODERATOR: &str = "ablat";

const CELL_COLUMNS: [&str; 4] = ["tpos", "tneg", "cpos", "cneg"];
const TOTAL_COLUMNS: [&str; 4] = [
    "treated_events",
    "treated_total",
    "control_events",
    "control_total",
];
const LABEL_COLUMNS: [&str; 2] = ["study", "author"];

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("CSV writer error: {0}")]
    CsvError(#[from] csv::Error),
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "No count columns found. Provide either tpos, tneg, cpos, cneg or treated_events, treated_total, control_events, control_total."
    )]
    CountSchemaNotRecognized,
    #[error(
        "The required column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error(
        "Missing or null values were found in the required column '{0}'. Every study needs complete data."
    )]
    MissingValuesFound(String),
    #[error("Non-finite values (NaN or Infinity) were found in the required column '{0}'.")]
    NonFiniteValuesFound(String),
    #[error("Column '{column_name}' has a negative count ({value}) at row {row}.")]
    NegativeCount {
        column_name: String,
        row: usize,
        value: f64,
    },
    #[error("Column '{column_name}' has a non-integer count ({value}) at row {row}.")]
    NonIntegerCount {
        column_name: String,
        row: usize,
        value: f64,
    },
    #[error(
        "Column '{column_name}' has a count ({value}) at row {row} above the largest exactly representable count."
    )]
    CountOutOfRange {
        column_name: String,
        row: usize,
        value: f64,
    },
    #[error("Study {row} reports {events} events but only {total} participants in the {arm} arm.")]
    EventsExceedTotal {
        row: usize,
        arm: &'static str,
        events: u64,
        total: u64,
    },
    #[error("Input file contains only {found} data rows, but at least {required} are required.")]
    InsufficientRows { found: usize, required: usize },
}

/// How to read a study table.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Column holding the moderator. When `None`, every covariate is `NaN`.
    pub moderator: Option<String>,
    /// Field separator; inferred from the file extension when `None`.
    pub separator: Option<u8>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            moderator: Some(DEFAULT_MODERATOR.to_string()),
            separator: None,
        }
    }
}

/// `,` for `.csv` files, tab otherwise.
fn infer_separator(path: &Path) -> u8 {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("csv") => b',',
        _ => b'\t',
    }
}

/// Loads and validates a study table.
pub fn load_studies(path: &Path, options: &LoadOptions) -> Result<Vec<StudyRecord>, DataError> {
    let separator = options.separator.unwrap_or_else(|| infer_separator(path));
    log::info!("Loading study table from '{}'", path.display());

    let df = CsvReader::new(File::open(path)?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_parse_options(CsvParseOptions::default().with_separator(separator)),
        )
        .finish()?;

    studies_from_frame(&df, options)
}

/// Validates an in-memory frame and converts it to study records.
pub fn studies_from_frame(
    df: &DataFrame,
    options: &LoadOptions,
) -> Result<Vec<StudyRecord>, DataError> {
    const MINIMUM_ROWS: usize = 1;

    let df = &drop_blank_rows(df)?;
    if df.height() < MINIMUM_ROWS {
        return Err(DataError::InsufficientRows {
            found: df.height(),
            required: MINIMUM_ROWS,
        });
    }

    let columns: HashSet<String> = df
        .get_column_names()
        .into_iter()
        .map(|s| s.to_string())
        .collect();

    let has_all = |names: &[&str]| names.iter().all(|c| columns.contains(*c));
    let uses_cells = if has_all(&CELL_COLUMNS) {
        true
    } else if has_all(&TOTAL_COLUMNS) {
        false
    } else {
        return Err(DataError::CountSchemaNotRecognized);
    };

    if let Some(moderator) = &options.moderator
        && !columns.contains(moderator)
    {
        return Err(DataError::ColumnNotFound(moderator.clone()));
    }

    let count_names = if uses_cells { CELL_COLUMNS } else { TOTAL_COLUMNS };
    log::debug!("Using count columns {count_names:?} and moderator {:?}", options.moderator);

    let counts = count_names
        .iter()
        .map(|name| extract_count_column(df, name))
        .collect::<Result<Vec<_>, _>>()?;
    let covariates = match &options.moderator {
        Some(moderator) => extract_numeric_column(df, moderator)?,
        None => vec![f64::NAN; df.height()],
    };
    let labels = match LABEL_COLUMNS.iter().find(|c| columns.contains(**c)) {
        Some(name) => Some(extract_label_column(df, name)?),
        None => None,
    };

    let mut studies = Vec::with_capacity(df.height());
    for (i, &covariate) in covariates.iter().enumerate() {
        let (a, b, c, d) = (counts[0][i], counts[1][i], counts[2][i], counts[3][i]);
        let mut study = if uses_cells {
            StudyRecord::from_cells(a, b, c, d, covariate)
        } else {
            StudyRecord::new(a, b, c, d, covariate)
        };
        if let Some(label) = labels.as_ref().and_then(|l| l[i].clone()) {
            study = study.with_label(label);
        }
        studies.push(study);
    }

    log::info!("Loaded {} studies", studies.len());
    Ok(studies)
}

/// Removes rows that are null in every column, as polars reads a trailing
/// blank line.
fn drop_blank_rows(df: &DataFrame) -> Result<DataFrame, DataError> {
    let mut keep = BooleanChunked::full("keep".into(), false, df.height());
    for column in df.get_columns() {
        keep = &keep | &column.as_materialized_series().is_not_null();
    }
    let dropped = keep.into_iter().filter(|k| *k != Some(true)).count();
    if dropped == 0 {
        return Ok(df.clone());
    }
    log::debug!("Skipping {dropped} blank rows");
    Ok(df.filter(&keep)?)
}

fn extract_numeric_column(df: &DataFrame, column_name: &str) -> Result<Vec<f64>, DataError> {
    let series = df.column(column_name)?;
    if series.null_count() > 0 {
        return Err(DataError::MissingValuesFound(column_name.to_string()));
    }

    let wrong_type = || DataError::ColumnWrongType {
        column_name: column_name.to_string(),
        expected_type: "f64 (numeric)",
        found_type: format!("{:?}", series.dtype()),
    };
    if matches!(series.dtype(), DataType::String) {
        return Err(wrong_type());
    }
    let casted = series.cast(&DataType::Float64).map_err(|_| wrong_type())?;
    if casted.null_count() > 0 {
        return Err(wrong_type());
    }

    let chunked = casted.f64()?.rechunk();
    let values: Vec<f64> = chunked.into_no_null_iter().collect();
    if values.iter().any(|v| !v.is_finite()) {
        return Err(DataError::NonFiniteValuesFound(column_name.to_string()));
    }
    Ok(values)
}

/// Largest integer an `f64` holds exactly; any two such counts sum without overflow.
const MAX_COUNT: f64 = 9_007_199_254_740_992.0;

fn extract_count_column(df: &DataFrame, column_name: &str) -> Result<Vec<u64>, DataError> {
    extract_numeric_column(df, column_name)?
        .into_iter()
        .enumerate()
        .map(|(i, value)| {
            if value < 0.0 {
                Err(DataError::NegativeCount {
                    column_name: column_name.to_string(),
                    row: i + 1,
                    value,
                })
            } else if value > MAX_COUNT {
                Err(DataError::CountOutOfRange {
                    column_name: column_name.to_string(),
                    row: i + 1,
                    value,
                })
            } else if value.fract() != 0.0 {
                Err(DataError::NonIntegerCount {
                    column_name: column_name.to_string(),
                    row: i + 1,
                    value,
                })
            } else {
                Ok(value as u64)
            }
        })
        .collect()
}

fn extract_label_column(
    df: &DataFrame,
    column_name: &str,
) -> Result<Vec<Option<String>>, DataError> {
    let casted = df.column(column_name)?.cast(&DataType::String)?;
    let labels = casted
        .str()?
        .into_iter()
        .map(|value| value.filter(|s| !s.is_empty()).map(str::to_string))
        .collect();
    Ok(labels)
}

/// Writes studies in the `tpos, tneg, cpos, cneg` layout readable by [`load_studies`].
///
/// Fails on a study whose events exceed its arm total, since it has no
/// non-event count to write.
pub fn write_studies<W: Write>(
    studies: &[StudyRecord],
    moderator: &str,
    writer: W,
) -> Result<(), DataError> {
    let mut out = csv::WriterBuilder::new().delimiter(b'\t').from_writer(writer);
    out.write_record(["study", "tpos", "tneg", "cpos", "cneg", moderator])?;
    for (i, study) in studies.iter().enumerate() {
        let non_events = |arm: &'static str, events: u64, total: u64| {
            total.checked_sub(events).ok_or(DataError::EventsExceedTotal {
                row: i + 1,
                arm,
                events,
                total,
            })
        };
        let tneg = non_events("treated", study.treated_events, study.treated_total)?;
        let cneg = non_events("control", study.control_events, study.control_total)?;
        let label = study.label.clone().unwrap_or_else(|| (i + 1).to_string());
        out.write_record([
            label,
            study.treated_events.to_string(),
            tneg.to_string(),
            study.control_events.to_string(),
            cneg.to_string(),
            study.covariate.to_string(),
        ])?;
    }
    out.flush()?;
    Ok(())
}

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::io;
    use tempfile::{Builder, NamedTempFile};

    fn create_test_file(content: &str, suffix: &str) -> io::Result<NamedTempFile> {
        let mut file = Builder::new().suffix(suffix).tempfile()?;
        writeln!(file, "{}", content)?;
        file.flush()?;
        Ok(file)
    }

    fn load(content: &str) -> Result<Vec<StudyRecord>, DataError> {
        let file = create_test_file(content, ".tsv").unwrap();
        load_studies(file.path(), &LoadOptions::default())
    }

    #[test]
    fn test_load_cell_layout() {
        let content = "author\ttpos\ttneg\tcpos\tcneg\tablat\n\
                       Aronson\t4\t119\t11\t128\t44\n\
                       Ferguson & Simes\t6\t300\t29\t274\t55";
        let studies = load(content).unwrap();

        assert_eq!(studies.len(), 2);
        assert_eq!(studies[0], StudyRecord::from_cells(4, 119, 11, 128, 44.0).with_label("Aronson"));
        assert_eq!(studies[1].treated_total, 306);
        assert_eq!(studies[1].control_total, 303);
        assert_eq!(studies[1].label.as_deref(), Some("Ferguson & Simes"));
    }

    #[test]
    fn test_load_totals_layout_from_csv() {
        let file = create_test_file(
            "treated_events,treated_total,control_events,control_total,dose\n3,231,11,220,1.5\n",
            ".csv",
        )
        .unwrap();
        let options = LoadOptions {
            moderator: Some("dose".to_string()),
            separator: None,
        };
        let studies = load_studies(file.path(), &options).unwrap();

        assert_eq!(studies.len(), 1);
        assert_eq!(studies[0].treated_total, 231);
        assert_abs_diff_eq!(studies[0].covariate, 1.5, epsilon = 1e-12);
        assert!(studies[0].label.is_none());
    }

    #[test]
    fn test_error_unrecognized_schema() {
        let err = load("tpos\ttneg\tcpos\tablat\n1\t2\t3\t4").unwrap_err();
        assert!(matches!(err, DataError::CountSchemaNotRecognized));
    }

    #[test]
    fn test_error_moderator_not_found() {
        let err = load("tpos\ttneg\tcpos\tcneg\tyear\n1\t2\t3\t4\t1948").unwrap_err();
        match err {
            DataError::ColumnNotFound(col) => assert_eq!(col, "ablat"),
            other => panic!("Expected ColumnNotFound(ablat), got {:?}", other),
        }
    }

    #[test]
    fn test_error_negative_count() {
        let err = load("tpos\ttneg\tcpos\tcneg\tablat\n1\t2\t3\t4\t10\n1\t-2\t3\t4\t20").unwrap_err();
        match err {
            DataError::NegativeCount {
                column_name, row, ..
            } => {
                assert_eq!(column_name, "tneg");
                assert_eq!(row, 2);
            }
            other => panic!("Expected NegativeCount, got {:?}", other),
        }
    }

    #[test]
    fn test_error_non_integer_count() {
        let err = load("tpos\ttneg\tcpos\tcneg\tablat\n1.5\t2\t3\t4\t10").unwrap_err();
        assert!(matches!(err, DataError::NonIntegerCount { row: 1, .. }));
    }

    #[test]
    fn test_error_missing_values() {
        let result = load("tpos\ttneg\tcpos\tcneg\tablat\n1\t2\t3\t4\t\n5\t6\t7\t8\t20");
        match result {
            Err(DataError::MissingValuesFound(col_name)) => assert_eq!(col_name, "ablat"),
            other => panic!("Expected MissingValuesFound(ablat), got {:?}", other),
        }
    }

    #[test]
    fn test_error_wrong_type() {
        let result = load("tpos\ttneg\tcpos\tcneg\tablat\n1\t2\t3\t4\tnorth");
        match result {
            Err(DataError::ColumnWrongType {
                column_name,
                expected_type,
                ..
            }) => {
                assert_eq!(column_name, "ablat");
                assert_eq!(expected_type, "f64 (numeric)");
            }
            other => panic!("Expected ColumnWrongType for 'ablat', got {:?}", other),
        }
    }

    #[test]
    fn test_error_empty_table() {
        let err = load("tpos\ttneg\tcpos\tcneg\tablat").unwrap_err();
        assert!(matches!(
            err,
            DataError::InsufficientRows {
                found: 0,
                required: 1
            }
        ));
    }

    #[test]
    fn test_written_table_loads_back() {
        let studies = vec![
            StudyRecord::from_cells(4, 119, 11, 128, 44.0).with_label("Aronson"),
            StudyRecord::from_cells(6, 300, 29, 274, 55.0),
        ];
        let mut buffer = Vec::new();
        write_studies(&studies, "ablat", &mut buffer).unwrap();
        let file = create_test_file(&String::from_utf8(buffer).unwrap(), ".tsv").unwrap();
        let loaded = load_studies(file.path(), &LoadOptions::default()).unwrap();

        assert_eq!(loaded[0], studies[0]);
        assert_eq!(loaded[1].label.as_deref(), Some("2"));
        assert_eq!(loaded[1].treated_total, 306);
    }

    #[test]
    fn test_trailing_blank_lines_are_skipped() {
        let studies = load("tpos\ttneg\tcpos\tcneg\tablat\n4\t119\t11\t128\t44\n\n\n").unwrap();
        assert_eq!(studies.len(), 1);
        assert_eq!(studies[0].control_total, 139);
    }

    #[test]
    fn test_table_without_moderator() {
        let file = create_test_file("tpos,tneg,cpos,cneg\n4,119,11,128\n6,300,29,274", ".csv").unwrap();
        let options = LoadOptions {
            moderator: None,
            separator: None,
        };
        let studies = load_studies(file.path(), &options).unwrap();
        assert_eq!(studies.len(), 2);
        assert!(studies.iter().all(|s| s.covariate.is_nan()));

        let err = load_studies(file.path(), &LoadOptions::default()).unwrap_err();
        assert!(matches!(err, DataError::ColumnNotFound(col) if col == "ablat"));
    }

    #[test]
    fn test_error_count_out_of_range() {
        let err = load("tpos\ttneg\tcpos\tcneg\tablat\n1e19\t1e19\t3\t4\t10").unwrap_err();
        match err {
            DataError::CountOutOfRange {
                column_name, row, ..
            } => {
                assert_eq!(column_name, "tpos");
                assert_eq!(row, 1);
            }
            other => panic!("Expected CountOutOfRange, got {:?}", other),
        }
    }

    #[test]
    fn test_write_rejects_events_above_total() {
        let studies = vec![StudyRecord::new(12, 10, 3, 20, 1.0)];
        let err = write_studies(&studies, "ablat", Vec::new()).unwrap_err();
        assert!(matches!(
            err,
            DataError::EventsExceedTotal {
                row: 1,
                arm: "treated",
                events: 12,
                total: 10
            }
        ));
    }
}
