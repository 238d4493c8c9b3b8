//! # Component Reduction
//!
//! Semantic blocks of related scales are summarised by their principal
//! components. PCA runs separately on every imputed replicate; the scores are
//! then averaged per student across the replicates that produced them, so the
//! number of retained components may differ between replicates without losing
//! a column.

pub mod pca;

use crate::shared::frame::{
    FrameError, filter_by_membership, has_column, key_column, numeric_column, replicate_groups,
    select_existing, set_numeric_column, take_rows,
};
use ndarray::Array2;
use pca::BlockPca;
use polars::prelude::DataFrame;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PcaError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("Block '{block}' has {rows} rows; at least two are needed.")]
    TooFewObservations { block: String, rows: usize },
    #[error("Block '{0}' still contains missing values; run the imputation stage first.")]
    MissingValues(String),
    #[error("Eigendecomposition failed for block '{block}': {source}")]
    Eigen {
        block: String,
        source: ndarray_linalg::error::LinalgError,
    },
    #[error("Replicate {replicate} lists students in a different order than replicate {reference}.")]
    MisalignedReplicates { replicate: String, reference: String },
    #[error("No rows left after filtering to countries {0:?}.")]
    NoRows(Vec<String>),
    #[error("None of the blocks could be reduced.")]
    NoBlocks,
}

/// A named group of variables reduced together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockSpec {
    pub name: String,
    pub variables: Vec<String>,
}

#[derive(Debug)]
pub struct Reduction {
    /// Identifier columns of the first replicate followed by averaged component scores.
    pub frame: DataFrame,
    /// Fits of the first replicate, for diagnostics.
    pub first_replicate: Vec<BlockPca>,
    pub replicates: usize,
}

/// Running sums for averaging one component across replicates.
struct ScoreAccumulator {
    name: String,
    sum: Vec<f64>,
    count: usize,
}

fn fit_replicate(
    df: &DataFrame,
    rows: &[usize],
    blocks: &[&BlockSpec],
    threshold: f64,
) -> Result<Vec<BlockPca>, PcaError> {
    let replicate = take_rows(df, rows)?;
    blocks
        .iter()
        .map(|block| {
            let columns = block
                .variables
                .iter()
                .map(|variable| numeric_column(&replicate, variable))
                .collect::<Result<Vec<_>, _>>()?;
            let data = Array2::from_shape_fn((rows.len(), columns.len()), |(r, c)| columns[c][r]);
            BlockPca::fit(&block.name, data.view(), threshold)
        })
        .collect()
}

/// Runs every block on every replicate of the listed countries and averages
/// the scores. `id_columns` are copied from the first replicate.
pub fn reduce_blocks(
    df: &DataFrame,
    blocks: &[BlockSpec],
    countries: &[String],
    country_column: &str,
    imputation_column: &str,
    student_column: &str,
    id_columns: &[String],
    threshold: f64,
) -> Result<Reduction, PcaError> {
    log::info!("Filtering data for: {}", countries.join(", "));
    let subset = filter_by_membership(df, country_column, countries)?;
    if subset.height() == 0 {
        return Err(PcaError::NoRows(countries.to_vec()));
    }

    let usable: Vec<&BlockSpec> = blocks
        .iter()
        .filter(|block| {
            let complete = block.variables.iter().all(|v| has_column(&subset, v));
            if !complete {
                log::warn!(
                    "Skipping PCA for '{}' as some variables are missing.",
                    block.name
                );
            }
            complete
        })
        .collect();
    if usable.is_empty() {
        return Err(PcaError::NoBlocks);
    }

    let replicates = replicate_groups(&subset, imputation_column)?;
    if replicates.is_empty() {
        return Err(PcaError::NoRows(countries.to_vec()));
    }
    let students = key_column(&subset, student_column)?;
    let (reference_label, reference_rows) = &replicates[0];
    let reference_ids: Vec<&Option<String>> =
        reference_rows.iter().map(|&row| &students[row]).collect();
    for (label, rows) in &replicates[1..] {
        let aligned = rows.len() == reference_rows.len()
            && rows
                .iter()
                .zip(&reference_ids)
                .all(|(&row, reference)| &students[row] == *reference);
        if !aligned {
            return Err(PcaError::MisalignedReplicates {
                replicate: label.clone(),
                reference: reference_label.clone(),
            });
        }
    }

    log::info!(
        "Running PCA on {} blocks across {} imputations...",
        usable.len(),
        replicates.len()
    );
    let fits: Vec<Vec<BlockPca>> = replicates
        .par_iter()
        .map(|(_, rows)| fit_replicate(&subset, rows, &usable, threshold))
        .collect::<Result<_, _>>()?;

    let n = reference_rows.len();
    let mut accumulators: Vec<ScoreAccumulator> = Vec::new();
    for replicate in &fits {
        for fit in replicate {
            for (k, name) in fit.component_names().into_iter().enumerate() {
                let position = match accumulators.iter().position(|acc| acc.name == name) {
                    Some(position) => position,
                    None => {
                        accumulators.push(ScoreAccumulator {
                            name,
                            sum: vec![0.0; n],
                            count: 0,
                        });
                        accumulators.len() - 1
                    }
                };
                let accumulator = &mut accumulators[position];
                for (total, score) in accumulator.sum.iter_mut().zip(fit.component_scores(k)) {
                    *total += score;
                }
                accumulator.count += 1;
            }
        }
    }

    let ids = take_rows(&subset, reference_rows)?;
    let mut frame = select_existing(&ids, id_columns)?;
    for accumulator in &accumulators {
        let averaged: Vec<f64> = accumulator
            .sum
            .iter()
            .map(|total| total / accumulator.count as f64)
            .collect();
        set_numeric_column(&mut frame, &accumulator.name, &averaged)?;
    }

    let mut first_replicate = fits.into_iter().next().unwrap_or_default();
    for fit in &first_replicate {
        log::info!(
            "Block '{}': {} component(s) explaining {:.1}% of the variance",
            fit.block,
            fit.n_components(),
            100.0 * fit.explained_ratio().iter().sum::<f64>()
        );
    }
    first_replicate.shrink_to_fit();
    Ok(Reduction {
        frame,
        first_replicate,
        replicates: replicates.len(),
    })
}
