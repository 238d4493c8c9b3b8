//! # Statistical Analysis
//!
//! Mixed models, their pooling across imputed replicates, the variance
//! decomposition behind the multilevel design, nested model comparisons and
//! the random-forest validation.

pub mod design;
pub mod forest;
pub mod formula;
pub mod icc;
pub mod mixed;
pub mod nested;
pub mod pooling;
pub mod runner;
pub mod validate;

use crate::shared::frame::{FrameError, inner_join};
use forest::ForestError;
use formula::FormulaError;
use mixed::MixedError;
use polars::prelude::DataFrame;
use pooling::PoolingError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("Formula error: {0}")]
    Formula(#[from] FormulaError),
    #[error("Mixed model fit failed: {0}")]
    Mixed(#[from] MixedError),
    #[error("Pooling failed: {0}")]
    Pooling(#[from] PoolingError),
    #[error("Random forest failed: {0}")]
    Forest(#[from] ForestError),
    #[error("No imputed replicates were available for '{0}'.")]
    NoReplicates(String),
    #[error("Model sequence '{0}' has no steps.")]
    EmptySequence(String),
}

/// Joins component tables onto `base` by student id. Identifier columns the
/// component tables share with `base` are taken from `base`.
pub fn merge_components(
    base: &DataFrame,
    components: &[&DataFrame],
    student: &str,
) -> Result<DataFrame, FrameError> {
    let mut merged = base.clone();
    for table in components {
        merged = inner_join(&merged, table, student)?;
    }
    log::info!(
        "Merged analysis frame: {} of {} students, {} columns",
        merged.height(),
        base.height(),
        merged.width()
    );
    Ok(merged)
}
