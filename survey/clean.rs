//! Column whitelist and invalid-code removal.

use crate::codebook::{Codebook, replace_codes};
use crate::shared::frame::{
    FrameError, column_names, has_column, numeric_column, select_existing, set_numeric_column,
};
use polars::prelude::DataFrame;

const REPORT_TOP: usize = 15;

#[derive(Debug, Clone, Default)]
pub struct CleanReport {
    pub kept: Vec<String>,
    /// Codebook variables absent from the input.
    pub absent: Vec<String>,
    pub replaced_cells: usize,
    /// Variables with the most missing cells after cleaning, largest first.
    pub top_missing: Vec<(String, usize)>,
}

/// Keeps the codebook variables and the outcome, then turns every listed
/// invalid code into a missing value.
pub fn clean_frame(
    df: &DataFrame,
    codebook: &Codebook,
    outcome: &str,
) -> Result<(DataFrame, CleanReport), FrameError> {
    let mut wanted = codebook.all_variables();
    wanted.push(outcome.to_string());

    let (kept, absent): (Vec<String>, Vec<String>) =
        wanted.into_iter().partition(|name| has_column(df, name));
    if !absent.is_empty() {
        log::warn!(
            "The following specified variables were not found in the dataset and will be ignored: {}",
            absent.join(", ")
        );
    }
    let mut cleaned = select_existing(df, &kept)?;
    log::info!(
        "Dataset shape after selecting variables: ({}, {})",
        cleaned.height(),
        cleaned.width()
    );

    let mut replaced_cells = 0;
    for entry in &codebook.invalid_codes {
        if !has_column(&cleaned, &entry.variable) {
            continue;
        }
        let mut values = numeric_column(&cleaned, &entry.variable)?;
        let replaced = replace_codes(&mut values, &entry.codes);
        if replaced > 0 {
            set_numeric_column(&mut cleaned, &entry.variable, &values)?;
            replaced_cells += replaced;
        }
    }
    log::info!("Replaced {replaced_cells} invalid codes with missing values.");

    let mut missing: Vec<(String, usize)> = column_names(&cleaned)
        .into_iter()
        .filter_map(|name| {
            let count = cleaned.column(&name).ok()?.null_count();
            (count > 0).then_some((name, count))
        })
        .collect();
    missing.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    missing.truncate(REPORT_TOP);

    Ok((
        cleaned,
        CleanReport {
            kept,
            absent,
            replaced_cells,
            top_missing: missing,
        },
    ))
}
