//! Feature preparation ahead of imputation: occupation grouping, country
//! selection by data coverage and school-level means.

use crate::missing::MissingTable;
use crate::shared::config::ImputeConfig;
use crate::shared::frame::{
    FrameError, drop_existing, filter_by_membership, group_rows, has_column, is_numeric_column,
    key_column, numeric_column, set_numeric_column,
};
use crate::shared::stats::{canonical_key, finite_mean};
use polars::prelude::DataFrame;

/// Major occupational group: the leading digit of the occupation code.
/// Listed invalid codes and missing values map to `NaN`.
pub fn occupation_major_group(codes: &[f64], invalid: &[f64]) -> Vec<f64> {
    codes
        .iter()
        .map(|&code| {
            if !code.is_finite() || invalid.contains(&code) {
                return f64::NAN;
            }
            canonical_key(code.abs())
                .chars()
                .next()
                .and_then(|c| c.to_digit(10))
                .map_or(f64::NAN, f64::from)
        })
        .collect()
}

/// Adds the occupation group column and drops the raw occupation code plus
/// the configured drop list.
pub fn add_occupation_group(df: &DataFrame, config: &ImputeConfig) -> Result<DataFrame, FrameError> {
    let mut out = df.clone();
    if has_column(df, &config.occupation_column) {
        let codes = numeric_column(df, &config.occupation_column)?;
        let groups = occupation_major_group(&codes, &config.occupation_invalid_codes);
        set_numeric_column(&mut out, &config.occupation_group_column, &groups)?;
        log::info!(
            "Column '{}' created from '{}'.",
            config.occupation_group_column,
            config.occupation_column
        );
    } else {
        log::warn!(
            "Column '{}' not found; '{}' will not be created.",
            config.occupation_column,
            config.occupation_group_column
        );
    }
    let mut drop: Vec<&str> = vec![config.occupation_column.as_str()];
    drop.extend(config.drop_columns.iter().map(String::as_str));
    drop_existing(&out, &drop)
}

/// Keeps the countries whose share of highly missing variables is below the
/// configured proportion.
pub fn select_good_countries(
    df: &DataFrame,
    country_column: &str,
    config: &ImputeConfig,
) -> Result<(DataFrame, Vec<String>), FrameError> {
    let table = MissingTable::from_frame(df, country_column)?;
    let good = table.countries_below(config.highly_missing_percent, config.good_country_proportion);
    let filtered = filter_by_membership(df, country_column, &good)?;
    log::info!(
        "Selected {} of {} countries with good coverage ({} rows).",
        good.len(),
        table.countries.len(),
        filtered.height()
    );
    Ok((filtered, good))
}

/// Adds `<var>_sch_mean` for each listed numeric variable present in `df`.
/// Rows without a school id get a missing mean. Returns the number of columns added.
pub fn add_school_means(
    df: &mut DataFrame,
    school_column: &str,
    variables: &[String],
) -> Result<usize, FrameError> {
    let schools = group_rows(&key_column(df, school_column)?);
    let mut added = 0;
    for variable in variables {
        if !has_column(df, variable) {
            continue;
        }
        if !is_numeric_column(df, variable)? {
            log::warn!("Could not create school mean for '{variable}'.");
            continue;
        }
        let values = numeric_column(df, variable)?;
        let mut means = vec![f64::NAN; values.len()];
        let mut members = Vec::new();
        for (_, rows) in &schools {
            members.clear();
            members.extend(rows.iter().map(|&row| values[row]));
            let mean = finite_mean(&members);
            for &row in rows {
                means[row] = mean;
            }
        }
        set_numeric_column(df, &format!("{variable}_sch_mean"), &means)?;
        added += 1;
    }
    log::info!("Created {added} school-level mean variables.");
    Ok(added)
}

#[cfg(test)]
mod tests {
    use super::*;
    use polars::prelude::*;

    #[test]
    fn occupation_group_is_leading_digit() {
        let groups = occupation_major_group(&[2311.0, 9997.0, f64::NAN, 512.0], &[9997.0]);
        assert_eq!(groups[0], 2.0);
        assert!(groups[1].is_nan());
        assert!(groups[2].is_nan());
        assert_eq!(groups[3], 5.0);
    }

    #[test]
    fn school_means_ignore_missing_values() {
        let mut df = DataFrame::new(vec![
            Series::new("CNTSCHID".into(), vec![Some(1i64), Some(1), Some(2), None]).into(),
            Series::new("AGE".into(), vec![Some(15.0), None, Some(16.0), Some(17.0)]).into(),
        ])
        .unwrap();
        let added = add_school_means(&mut df, "CNTSCHID", &["AGE".to_string(), "NOPE".to_string()])
            .unwrap();
        assert_eq!(added, 1);
        let means = numeric_column(&df, "AGE_sch_mean").unwrap();
        assert_eq!(&means[..3], &[15.0, 15.0, 16.0]);
        assert!(means[3].is_nan());
    }
}
