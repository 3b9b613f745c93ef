//! Bundled reference data.

use crate::effect::StudyRecord;

/// The 13 BCG vaccine trials against tuberculosis (Colditz et al., 1994).
///
/// Columns: author and year, vaccinated TB cases, vaccinated non-cases,
/// unvaccinated TB cases, unvaccinated non-cases, absolute latitude of the
/// study site in degrees.
const BCG_TRIALS: [(&str, u64, u64, u64, u64, f64); 13] = [
    ("Aronson 1948", 4, 119, 11, 128, 44.0),
    ("Ferguson & Simes 1949", 6, 300, 29, 274, 55.0),
    ("Rosenthal et al 1960", 3, 228, 11, 209, 42.0),
    ("Hart & Sutherland 1977", 62, 13536, 248, 12619, 52.0),
    ("Frimodt-Moller et al 1973", 33, 5036, 47, 5761, 13.0),
    ("Stein & Aronson 1953", 180, 1361, 372, 1079, 44.0),
    ("Vandiviere et al 1973", 8, 2537, 10, 619, 19.0),
    ("TPT Madras 1980", 505, 87886, 499, 87892, 13.0),
    ("Coetzee & Berjak 1968", 29, 7470, 45, 7232, 27.0),
    ("Rosenthal et al 1961", 17, 1699, 65, 1600, 42.0),
    ("Comstock et al 1974", 186, 50448, 141, 27197, 18.0),
    ("Comstock & Webster 1969", 5, 2493, 3, 2338, 33.0),
    ("Comstock et al 1976", 27, 16886, 29, 17825, 33.0),
];

/// Name of the moderator column in the BCG table.
pub const BCG_MODERATOR: &str = "ablat";

/// The BCG trials with absolute latitude as the moderator.
pub fn bcg() -> Vec<StudyRecord> {
    BCG_TRIALS
        .iter()
        .map(|&(label, tpos, tneg, cpos, cneg, ablat)| {
            StudyRecord::from_cells(tpos, tneg, cpos, cneg, ablat).with_label(label)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bcg_shape() {
        let studies = bcg();
        assert_eq!(studies.len(), 13);
        assert_eq!(studies[0].treated_events, 4);
        assert_eq!(studies[0].treated_total, 123);
        assert_eq!(studies[0].control_total, 139);
        assert_eq!(studies[7].label.as_deref(), Some("TPT Madras 1980"));
        assert!(studies.iter().all(|s| s.covariate > 0.0));
    }
}
