//! # Tabular I/O and Column Access
//!
//! Every stage exchanges data with the next one through CSV files. This module
//! is the single place where those files are read and written, and where
//! `polars` columns are turned into the plain `f64` vectors used by the
//! statistical code.
//!
//! - Missing values: CSV empty cells become polars nulls on read. Numeric
//!   extraction maps nulls to `NaN`, and writing maps `NaN` back to nulls, so
//!   a missing cell survives any number of stage round trips.
//! - Keys: identifiers are compared through `canonical_key`, which makes
//!   `1001` and `1001.0` the same student even when two files disagree on the
//!   inferred column type.

use crate::shared::stats::canonical_key;
use ahash::AHashMap;
use polars::prelude::*;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("The file was not found at '{}'. Please check the path.", .0.display())]
    FileNotFound(PathBuf),
    #[error("The required column '{0}' was not found. Please check spelling and case.")]
    ColumnNotFound(String),
    #[error("Column '{column}' has {found} values but the frame has {expected} rows.")]
    LengthMismatch {
        column: String,
        expected: usize,
        found: usize,
    },
}

/// Reads a CSV file with a header row. The whole file is used for schema
/// inference so that late non-integer values do not break typed columns.
pub fn read_csv(path: &Path) -> Result<DataFrame, FrameError> {
    if !path.exists() {
        return Err(FrameError::FileNotFound(path.to_path_buf()));
    }
    log::info!("Loading data from '{}'", path.display());
    let df = CsvReader::new(File::open(path)?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_infer_schema_length(None),
        )
        .finish()?;
    log::info!(
        "Loaded {} rows and {} columns from '{}'",
        df.height(),
        df.width(),
        path.display()
    );
    Ok(df)
}

/// Writes a frame as CSV, creating the parent directory when needed.
pub fn write_csv(df: &mut DataFrame, path: &Path) -> Result<(), FrameError> {
    ensure_parent_dir(path)?;
    let mut file = File::create(path)?;
    CsvWriter::new(&mut file).include_header(true).finish(df)?;
    log::info!(
        "Saved {} rows and {} columns to '{}'",
        df.height(),
        df.width(),
        path.display()
    );
    Ok(())
}

pub fn ensure_parent_dir(path: &Path) -> Result<(), FrameError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            log::info!("Created directory: {}", parent.display());
        }
    }
    Ok(())
}

pub fn column_names(df: &DataFrame) -> Vec<String> {
    df.get_column_names()
        .into_iter()
        .map(|name| name.to_string())
        .collect()
}

pub fn has_column(df: &DataFrame, name: &str) -> bool {
    df.get_column_names()
        .into_iter()
        .any(|column| column.as_str() == name)
}

/// Extracts a column as `f64`, with nulls and unparseable cells as `NaN`.
pub fn numeric_column(df: &DataFrame, name: &str) -> Result<Vec<f64>, FrameError> {
    let column = df
        .column(name)
        .map_err(|_| FrameError::ColumnNotFound(name.to_string()))?;
    let casted = column.cast(&DataType::Float64)?;
    let chunked = casted.f64()?;
    Ok(chunked
        .into_iter()
        .map(|value| value.unwrap_or(f64::NAN))
        .collect())
}

/// Extracts a column as text, keeping nulls as `None`.
pub fn text_column(df: &DataFrame, name: &str) -> Result<Vec<Option<String>>, FrameError> {
    let column = df
        .column(name)
        .map_err(|_| FrameError::ColumnNotFound(name.to_string()))?;
    let casted = column.cast(&DataType::String)?;
    let chunked = casted.str()?;
    Ok(chunked
        .into_iter()
        .map(|value| value.map(str::to_string))
        .collect())
}

/// Returns `true` when every non-null cell of the column parses as a number.
pub fn is_numeric_column(df: &DataFrame, name: &str) -> Result<bool, FrameError> {
    let column = df
        .column(name)
        .map_err(|_| FrameError::ColumnNotFound(name.to_string()))?;
    let casted = column.cast(&DataType::Float64)?;
    Ok(casted.null_count() == column.null_count())
}

/// Extracts a column as comparable keys. Numeric columns are canonicalised so
/// that integer and float renderings of the same identifier agree.
pub fn key_column(df: &DataFrame, name: &str) -> Result<Vec<Option<String>>, FrameError> {
    if is_numeric_column(df, name)? {
        Ok(numeric_column(df, name)?
            .into_iter()
            .map(|value| value.is_finite().then(|| canonical_key(value)))
            .collect())
    } else {
        Ok(text_column(df, name)?
            .into_iter()
            .map(|value| value.map(|text| text.trim().to_string()))
            .collect())
    }
}

/// Builds a nullable `Float64` series from values using `NaN` as missing.
pub fn numeric_series(name: &str, values: &[f64]) -> Series {
    let nullable: Vec<Option<f64>> = values
        .iter()
        .map(|&value| if value.is_finite() { Some(value) } else { None })
        .collect();
    Series::new(name.into(), nullable)
}

/// Adds or replaces a numeric column.
pub fn set_numeric_column(
    df: &mut DataFrame,
    name: &str,
    values: &[f64],
) -> Result<(), FrameError> {
    if values.len() != df.height() {
        return Err(FrameError::LengthMismatch {
            column: name.to_string(),
            expected: df.height(),
            found: values.len(),
        });
    }
    df.with_column(numeric_series(name, values))?;
    Ok(())
}

pub fn filter_rows(df: &DataFrame, mask: &[bool]) -> Result<DataFrame, FrameError> {
    let mask = BooleanChunked::from_slice("mask".into(), mask);
    Ok(df.filter(&mask)?)
}

pub fn take_rows(df: &DataFrame, rows: &[usize]) -> Result<DataFrame, FrameError> {
    let indices: Vec<IdxSize> = rows.iter().map(|&row| row as IdxSize).collect();
    let indices = IdxCa::from_vec("rows".into(), indices);
    Ok(df.take(&indices)?)
}

/// Keeps the listed columns in the given order, skipping any that are absent.
pub fn select_existing(df: &DataFrame, names: &[String]) -> Result<DataFrame, FrameError> {
    let projection: Vec<&str> = names
        .iter()
        .map(String::as_str)
        .filter(|name| has_column(df, name))
        .collect();
    Ok(df.select(projection)?)
}

pub fn drop_existing(df: &DataFrame, names: &[&str]) -> Result<DataFrame, FrameError> {
    let keep: Vec<String> = column_names(df)
        .into_iter()
        .filter(|column| !names.contains(&column.as_str()))
        .collect();
    select_existing(df, &keep)
}

/// Keeps rows whose value in `column` belongs to `allowed`.
pub fn filter_by_membership(
    df: &DataFrame,
    column: &str,
    allowed: &[String],
) -> Result<DataFrame, FrameError> {
    let keys = key_column(df, column)?;
    let mask: Vec<bool> = keys
        .iter()
        .map(|key| {
            key.as_ref()
                .is_some_and(|key| allowed.iter().any(|value| value == key))
        })
        .collect();
    filter_rows(df, &mask)
}

/// Row indices grouped by key, in order of first appearance.
pub fn group_rows(keys: &[Option<String>]) -> Vec<(String, Vec<usize>)> {
    let mut positions: AHashMap<&str, usize> = AHashMap::new();
    let mut groups: Vec<(String, Vec<usize>)> = Vec::new();
    for (row, key) in keys.iter().enumerate() {
        let Some(key) = key else { continue };
        match positions.get(key.as_str()) {
            Some(&slot) => groups[slot].1.push(row),
            None => {
                positions.insert(key.as_str(), groups.len());
                groups.push((key.clone(), vec![row]));
            }
        }
    }
    groups
}

/// Row indices of each imputed replicate, ordered by replicate number.
pub fn replicate_groups(
    df: &DataFrame,
    imputation_column: &str,
) -> Result<Vec<(String, Vec<usize>)>, FrameError> {
    let mut groups = group_rows(&key_column(df, imputation_column)?);
    groups.sort_by(|a, b| {
        let left = a.0.parse::<f64>().unwrap_or(f64::INFINITY);
        let right = b.0.parse::<f64>().unwrap_or(f64::INFINITY);
        left.total_cmp(&right).then_with(|| a.0.cmp(&b.0))
    });
    Ok(groups)
}

/// The replicate frames of a long imputed table, ordered by replicate number.
pub fn split_replicates(
    df: &DataFrame,
    imputation_column: &str,
) -> Result<Vec<(String, DataFrame)>, FrameError> {
    replicate_groups(df, imputation_column)?
        .into_iter()
        .map(|(label, rows)| Ok((label, take_rows(df, &rows)?)))
        .collect()
}

/// Inner join on a key column. Columns of `right` already present in `left`
/// are dropped, so `left` is authoritative for shared identifiers.
pub fn inner_join(
    left: &DataFrame,
    right: &DataFrame,
    key: &str,
) -> Result<DataFrame, FrameError> {
    let left_keys = key_column(left, key)?;
    let right_keys = key_column(right, key)?;

    let mut right_index: AHashMap<&str, usize> = AHashMap::with_capacity(right_keys.len());
    for (row, value) in right_keys.iter().enumerate() {
        if let Some(value) = value {
            right_index.entry(value.as_str()).or_insert(row);
        }
    }

    let mut left_rows = Vec::new();
    let mut right_rows = Vec::new();
    for (row, value) in left_keys.iter().enumerate() {
        if let Some(matched) = value.as_ref().and_then(|v| right_index.get(v.as_str())) {
            left_rows.push(row);
            right_rows.push(*matched);
        }
    }

    let left_names = column_names(left);
    let right_only: Vec<String> = column_names(right)
        .into_iter()
        .filter(|name| !left_names.contains(name))
        .collect();

    let joined_left = take_rows(left, &left_rows)?;
    let joined_right = take_rows(&select_existing(right, &right_only)?, &right_rows)?;
    Ok(joined_left.hstack(joined_right.get_columns())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::Builder;

    fn sample_frame() -> DataFrame {
        DataFrame::new(vec![
            Series::new("CNTSTUID".into(), vec![1i64, 2, 3]).into(),
            Series::new("CNT".into(), vec!["TUR", "HKG", "TUR"]).into(),
            Series::new("AGE".into(), vec![Some(15.5), None, Some(16.0)]).into(),
        ])
        .expect("construct sample frame")
    }

    #[test]
    fn numeric_column_maps_nulls_to_nan() {
        let df = sample_frame();
        let ages = numeric_column(&df, "AGE").unwrap();
        assert_eq!(ages[0], 15.5);
        assert!(ages[1].is_nan());
        assert!(matches!(
            numeric_column(&df, "NOPE"),
            Err(FrameError::ColumnNotFound(_))
        ));
    }

    #[test]
    fn csv_round_trip_preserves_missing_cells() {
        let mut df = sample_frame();
        let file = Builder::new().suffix(".csv").tempfile().unwrap();
        write_csv(&mut df, file.path()).unwrap();
        let loaded = read_csv(file.path()).unwrap();
        let ages = numeric_column(&loaded, "AGE").unwrap();
        assert!(ages[1].is_nan());
        assert_eq!(
            text_column(&loaded, "CNT").unwrap()[1].as_deref(),
            Some("HKG")
        );
    }

    #[test]
    fn join_matches_integer_and_float_keys() {
        let left = sample_frame();
        let right = DataFrame::new(vec![
            Series::new("CNTSTUID".into(), vec![3.0f64, 1.0]).into(),
            Series::new("CNT".into(), vec!["XXX", "XXX"]).into(),
            Series::new("Block_PC1".into(), vec![0.3, 0.1]).into(),
        ])
        .unwrap();
        let joined = inner_join(&left, &right, "CNTSTUID").unwrap();
        assert_eq!(joined.height(), 2);
        assert_eq!(numeric_column(&joined, "Block_PC1").unwrap(), vec![0.1, 0.3]);
        // Shared columns come from the left frame.
        assert_eq!(
            text_column(&joined, "CNT").unwrap()[0].as_deref(),
            Some("TUR")
        );
    }

    #[test]
    fn grouping_preserves_first_appearance_order() {
        let keys = vec![
            Some("b".to_string()),
            Some("a".to_string()),
            None,
            Some("b".to_string()),
        ];
        let groups = group_rows(&keys);
        assert_eq!(groups[0], ("b".to_string(), vec![0, 3]));
        assert_eq!(groups[1], ("a".to_string(), vec![1]));
    }

    #[test]
    fn missing_file_is_reported_with_path() {
        let err = read_csv(Path::new("does/not/exist.csv")).unwrap_err();
        assert!(err.to_string().contains("does/not/exist.csv"));
    }
}
