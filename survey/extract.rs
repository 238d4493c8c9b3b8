//! # Disadvantaged Subsample Extraction
//!
//! Two passes over the SPSS file. The first reads only the country and ESCS
//! columns and computes, for every country with enough observations, the
//! ESCS value at the configured percentile. The second streams every case in
//! fixed-size chunks and appends the rows at or below their country's cutoff
//! to the output CSV, so the full survey never has to be resident in memory.

use crate::sav::{SavError, SavFile, Value};
use crate::shared::config::{ColumnsConfig, ConfigError, ExtractConfig};
use crate::shared::frame::{FrameError, ensure_parent_dir};
use crate::shared::progress::create_progress_bar;
use crate::shared::stats::quantile;
use ahash::AHashMap;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Errors raised by the stages that read the raw survey file.
#[derive(Error, Debug)]
pub enum SurveyError {
    #[error("SPSS file error: {0}")]
    Sav(#[from] SavError),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("No country has at least {min_rows} rows with a valid '{column}'.")]
    NoEligibleCountries { column: String, min_rows: usize },
    #[error("The required column '{0}' was not found in '{1}'.")]
    MissingColumn(String, String),
    #[error("Reading stopped after {records} records: {source}")]
    Interrupted { records: usize, source: SavError },
}

/// Per-country cutoffs, in country order.
#[derive(Debug, Clone, Default)]
pub struct CountryCutoffs {
    pub cutoffs: BTreeMap<String, f64>,
    /// Percentile over all countries; reported only.
    pub global: Option<f64>,
}

impl CountryCutoffs {
    /// Computes the `q` quantile of `values` per country, ignoring missing
    /// values and countries with fewer than `min_rows` observations.
    pub fn compute(countries: &[Option<String>], values: &[f64], q: f64, min_rows: usize) -> Self {
        let mut by_country: AHashMap<&str, Vec<f64>> = AHashMap::new();
        let mut all = Vec::with_capacity(values.len());
        for (country, &value) in countries.iter().zip(values) {
            if !value.is_finite() {
                continue;
            }
            all.push(value);
            if let Some(country) = country {
                by_country.entry(country.as_str()).or_default().push(value);
            }
        }
        let cutoffs = by_country
            .into_iter()
            .filter(|(_, values)| values.len() >= min_rows)
            .filter_map(|(country, values)| quantile(&values, q).map(|c| (country.to_string(), c)))
            .collect();
        Self {
            cutoffs,
            global: quantile(&all, q),
        }
    }

    pub fn get(&self, country: &str) -> Option<f64> {
        self.cutoffs.get(country).copied()
    }

    pub fn len(&self) -> usize {
        self.cutoffs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cutoffs.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExtractSummary {
    pub records_read: usize,
    pub rows_written: usize,
    pub countries: usize,
}

/// Reads the country and ESCS columns and derives the per-country cutoffs.
pub fn prescan_cutoffs(
    sav: &SavFile,
    columns: &ColumnsConfig,
    config: &ExtractConfig,
) -> Result<CountryCutoffs, SurveyError> {
    log::info!(
        "Pre-scanning '{}' and '{}'...",
        columns.country,
        config.escs_column
    );
    let mut read = sav.read_columns(&[columns.country.as_str(), config.escs_column.as_str()])?;
    let escs: Vec<f64> = read.pop().unwrap_or_default().iter().map(Value::as_number).collect();
    let countries: Vec<Option<String>> = read
        .pop()
        .unwrap_or_default()
        .iter()
        .map(Value::as_key)
        .collect();

    let cutoffs = CountryCutoffs::compute(
        &countries,
        &escs,
        config.escs_quantile,
        config.min_country_rows,
    );
    if cutoffs.is_empty() {
        return Err(SurveyError::NoEligibleCountries {
            column: config.escs_column.clone(),
            min_rows: config.min_country_rows,
        });
    }
    if let Some(global) = cutoffs.global {
        log::info!(
            "Global {} percentile of {}: {global:.4}",
            config.escs_quantile * 100.0,
            config.escs_column
        );
    }
    log::info!("{} countries meet the minimum row count", cutoffs.len());
    Ok(cutoffs)
}

/// Streams the SPSS file and writes the rows at or below their country's
/// ESCS cutoff. The header is written before the first chunk; when a record
/// cannot be decoded the rows already written stay in the output.
pub fn extract_disadvantaged(
    sav: &SavFile,
    cutoffs: &CountryCutoffs,
    columns: &ColumnsConfig,
    config: &ExtractConfig,
    output: &Path,
) -> Result<ExtractSummary, SurveyError> {
    if config.chunk_size == 0 {
        return Err(ConfigError::Invalid("extract.chunk_size must be positive".into()).into());
    }
    let country_index = sav.variable_index(&columns.country)?;
    let escs_index = sav.variable_index(&config.escs_column)?;

    ensure_parent_dir(output)?;
    let mut writer = csv::Writer::from_path(output)?;
    writer.write_record(sav.variables().iter().map(|v| v.name.as_str()))?;

    let total = sav.case_count().unwrap_or(0) as u64;
    let pb = create_progress_bar(total, "Filtering chunks");
    let mut buffer = ryu::Buffer::new();
    let mut summary = ExtractSummary {
        countries: cutoffs.len(),
        ..ExtractSummary::default()
    };

    let mut records = sav.records();
    let mut chunk: Vec<Vec<Value>> = Vec::with_capacity(config.chunk_size);
    loop {
        chunk.clear();
        let mut failure = None;
        for record in records.by_ref().take(config.chunk_size) {
            match record {
                Ok(values) => chunk.push(values),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        for row in &chunk {
            let escs = row[escs_index].as_number();
            if !escs.is_finite() {
                continue;
            }
            let keep = row[country_index]
                .as_key()
                .and_then(|country| cutoffs.get(&country))
                .is_some_and(|cutoff| escs <= cutoff);
            if keep {
                writer.write_record(row.iter().map(|value| value.to_field(&mut buffer)))?;
                summary.rows_written += 1;
            }
        }
        summary.records_read += chunk.len();
        pb.inc(chunk.len() as u64);

        if let Some(source) = failure {
            writer.flush()?;
            pb.abandon();
            log::error!(
                "Error reading at offset {}: {source}",
                summary.records_read
            );
            return Err(SurveyError::Interrupted {
                records: summary.records_read,
                source,
            });
        }
        if chunk.len() < config.chunk_size {
            break;
        }
    }
    writer.flush()?;
    pb.finish_and_clear();

    log::info!(
        "Kept {} of {} records from {} countries; saved to '{}'",
        summary.rows_written,
        summary.records_read,
        summary.countries,
        output.display()
    );
    Ok(summary)
}
