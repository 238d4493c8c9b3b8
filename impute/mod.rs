//! # Imputation and Standardisation
//!
//! Turns the cleaned survey table into the long-format file of completed
//! replicates used by every later stage:
//!
//! 1. Occupation codes become major occupational groups; unused columns are dropped.
//! 2. Only countries with good data coverage are kept.
//! 3. School-level means are added for the continuous-like variables.
//! 4. MICE produces the configured number of completed replicates from one chain.
//! 5. Complex scales are z-scored within each replicate.
//!
//! Identifier, outcome and weight columns are carried through untouched and
//! never used as predictors.

pub mod mice;
pub mod prepare;
pub mod standardize;

use crate::shared::config::{ColumnsConfig, ImputeConfig};
use crate::shared::frame::{
    FrameError, column_names, has_column, is_numeric_column, numeric_column, select_existing,
    set_numeric_column,
};
use crate::shared::progress::create_progress_bar;
use mice::MiceImputer;
use ndarray::Array2;
use polars::prelude::*;
use prepare::{add_occupation_group, add_school_means, select_good_countries};
use standardize::standardize_columns;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImputeError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
    #[error("Regression for '{variable}' could not be solved: {source}")]
    Linalg {
        variable: String,
        source: ndarray_linalg::error::LinalgError,
    },
    #[error("Variable '{0}' has no observed values to impute from.")]
    NoObservedValues(String),
    #[error("No country passed the data-coverage rule; nothing to impute.")]
    NoGoodCountries,
    #[error("No numeric variables are left to impute.")]
    NothingToImpute,
    #[error("Inconsistent imputation input: {0}")]
    Shape(String),
}

#[derive(Debug)]
pub struct ImputationOutput {
    /// All replicates stacked, ordered `imputation, student, country, school, ...`.
    pub frame: DataFrame,
    pub countries: Vec<String>,
    pub imputed_variables: Vec<String>,
    /// Variables dropped because they were never observed or not numeric.
    pub skipped_variables: Vec<String>,
}

pub fn run_imputation(
    df: &DataFrame,
    columns: &ColumnsConfig,
    config: &ImputeConfig,
) -> Result<ImputationOutput, ImputeError> {
    log::info!("Transforming occupation codes and dropping unnecessary variables...");
    let prepared = add_occupation_group(df, config)?;

    let (mut pilot, countries) = select_good_countries(&prepared, &columns.country, config)?;
    if pilot.height() == 0 {
        return Err(ImputeError::NoGoodCountries);
    }
    add_school_means(&mut pilot, &columns.school, &config.school_mean_variables)?;

    let id_columns: Vec<String> = [
        &columns.country,
        &columns.school,
        &columns.student,
        &columns.outcome,
        &columns.weight,
    ]
    .into_iter()
    .filter(|name| has_column(&pilot, name))
    .cloned()
    .collect();

    let mut names = Vec::new();
    let mut values = Vec::new();
    let mut skipped = Vec::new();
    for name in column_names(&pilot) {
        if id_columns.contains(&name) {
            continue;
        }
        if !is_numeric_column(&pilot, &name)? {
            log::warn!("Variable '{name}' is not numeric and will not be imputed.");
            skipped.push(name);
            continue;
        }
        let column = numeric_column(&pilot, &name)?;
        if column.iter().all(|v| !v.is_finite()) {
            log::warn!("Variable '{name}' has no observed values and will be dropped.");
            skipped.push(name);
            continue;
        }
        names.push(name);
        values.push(column);
    }
    if names.is_empty() {
        return Err(ImputeError::NothingToImpute);
    }

    let rows = pilot.height();
    let data = Array2::from_shape_fn((rows, names.len()), |(r, c)| values[c][r]);
    drop(values);
    let standardized: Vec<usize> = config
        .standardize
        .iter()
        .filter_map(|variable| names.iter().position(|name| name == variable))
        .collect();

    log::info!(
        "Performing MICE on {} variables for {} students...",
        names.len(),
        rows
    );
    let mut imputer = MiceImputer::new(names.clone(), data, config.pmm_neighbors, config.seed)?;
    let ids = select_existing(&pilot, &id_columns)?;
    let pb = create_progress_bar(config.n_imputations as u64, "Imputing datasets");
    let mut long: Option<DataFrame> = None;
    for replicate in 1..=config.n_imputations {
        log::info!(
            "Generating imputed dataset {replicate}/{}...",
            config.n_imputations
        );
        imputer.update_all()?;
        let mut completed = imputer.data().clone();
        standardize_columns(&mut completed, &standardized);

        let mut frame = ids.clone();
        frame.with_column(Series::new(
            columns.imputation.as_str().into(),
            vec![replicate as i64; rows],
        ))?;
        for (c, name) in names.iter().enumerate() {
            set_numeric_column(&mut frame, name, &completed.column(c).to_vec())?;
        }
        match long.as_mut() {
            Some(stacked) => {
                stacked.vstack_mut(&frame)?;
            }
            None => long = Some(frame),
        }
        pb.inc(1);
    }
    pb.finish_and_clear();
    let stacked = long.ok_or(ImputeError::NothingToImpute)?;

    let mut ordered: Vec<String> = vec![
        columns.imputation.clone(),
        columns.student.clone(),
        columns.country.clone(),
        columns.school.clone(),
    ];
    ordered.extend(
        column_names(&stacked)
            .into_iter()
            .filter(|name| {
                name != &columns.imputation
                    && name != &columns.student
                    && name != &columns.country
                    && name != &columns.school
            }),
    );
    let frame = select_existing(&stacked, &ordered)?;

    log::info!(
        "Multiple imputation complete: {} replicates of {} students, {} columns standardised.",
        config.n_imputations,
        rows,
        standardized.len()
    );
    Ok(ImputationOutput {
        frame,
        countries,
        imputed_variables: names,
        skipped_variables: skipped,
    })
}
