//! Academic-resilience labelling.
//!
//! A student is resilient when the mean of their plausible mathematics scores
//! is strictly above the upper quartile of their country. The scores are read
//! from the SPSS file; the label is prepended to every row of the extracted
//! subsample.

use crate::extract::SurveyError;
use crate::sav::{SavFile, Value};
use crate::shared::config::{ColumnsConfig, LabelConfig};
use crate::shared::frame::ensure_parent_dir;
use crate::shared::progress::create_progress_bar;
use crate::shared::stats::{canonical_key, finite_mean, quantile};
use ahash::AHashMap;
use std::path::Path;

struct StudentScore {
    country: Option<String>,
    mean: f64,
}

/// Mean scores per student and score thresholds per country.
pub struct ResilienceLookup {
    students: AHashMap<String, StudentScore>,
    thresholds: AHashMap<String, f64>,
}

impl ResilienceLookup {
    /// Builds the lookup from parallel columns: student ids, countries and
    /// one vector per plausible value.
    pub fn from_columns(
        students: &[Option<String>],
        countries: &[Option<String>],
        scores: &[Vec<f64>],
        q: f64,
    ) -> Self {
        let mut means: AHashMap<String, StudentScore> = AHashMap::with_capacity(students.len());
        let mut by_country: AHashMap<String, Vec<f64>> = AHashMap::new();
        let mut row_scores = Vec::with_capacity(scores.len());
        for (row, student) in students.iter().enumerate() {
            row_scores.clear();
            row_scores.extend(scores.iter().map(|column| column[row]));
            let mean = finite_mean(&row_scores);
            let country = countries[row].clone();
            if let Some(country) = &country {
                if mean.is_finite() {
                    by_country.entry(country.clone()).or_default().push(mean);
                }
            }
            if let Some(student) = student {
                means.insert(student.clone(), StudentScore { country, mean });
            }
        }
        let thresholds = by_country
            .into_iter()
            .filter_map(|(country, values)| quantile(&values, q).map(|t| (country, t)))
            .collect();
        Self {
            students: means,
            thresholds,
        }
    }

    pub fn threshold(&self, country: &str) -> Option<f64> {
        self.thresholds.get(country).copied()
    }

    /// 1 when the student's mean score exceeds their country's threshold;
    /// unknown students, countries and missing means give 0.
    pub fn label(&self, student: &str) -> u8 {
        let Some(score) = self.students.get(student) else {
            return 0;
        };
        let threshold = score
            .country
            .as_deref()
            .and_then(|country| self.threshold(country))
            .unwrap_or(f64::INFINITY);
        u8::from(score.mean > threshold)
    }
}

/// Reads ids, countries and plausible values from the SPSS file.
pub fn load_scores(
    sav: &SavFile,
    columns: &ColumnsConfig,
    config: &LabelConfig,
) -> Result<ResilienceLookup, SurveyError> {
    let mut names: Vec<&str> = vec![columns.student.as_str(), columns.country.as_str()];
    names.extend(config.score_columns.iter().map(String::as_str));
    log::info!(
        "Computing per-country {} percentile of the mean of {} plausible values...",
        config.score_quantile * 100.0,
        config.score_columns.len()
    );
    let mut read = sav.read_columns(&names)?.into_iter();
    let students: Vec<Option<String>> = read
        .next()
        .unwrap_or_default()
        .iter()
        .map(Value::as_key)
        .collect();
    let countries: Vec<Option<String>> = read
        .next()
        .unwrap_or_default()
        .iter()
        .map(Value::as_key)
        .collect();
    let scores: Vec<Vec<f64>> = read
        .map(|column| column.iter().map(Value::as_number).collect())
        .collect();
    Ok(ResilienceLookup::from_columns(
        &students,
        &countries,
        &scores,
        config.score_quantile,
    ))
}

fn key_of(field: &str) -> String {
    let trimmed = field.trim();
    match trimmed.parse::<f64>() {
        Ok(value) if value.is_finite() => canonical_key(value),
        _ => trimmed.to_string(),
    }
}

/// Streams `input` and writes it to `output` with the outcome column first.
/// Returns `(rows, resilient rows)`.
pub fn write_labelled(
    lookup: &ResilienceLookup,
    columns: &ColumnsConfig,
    input: &Path,
    output: &Path,
) -> Result<(usize, usize), SurveyError> {
    let mut reader = csv::Reader::from_path(input)?;
    let headers = reader.headers()?.clone();
    let student_index = headers
        .iter()
        .position(|name| name == columns.student)
        .ok_or_else(|| {
            SurveyError::MissingColumn(columns.student.clone(), input.display().to_string())
        })?;
    let existing_outcome = headers.iter().position(|name| name == columns.outcome);

    ensure_parent_dir(output)?;
    let mut writer = csv::Writer::from_path(output)?;
    let mut header_row = vec![columns.outcome.as_str()];
    header_row.extend(
        headers
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != existing_outcome)
            .map(|(_, name)| name),
    );
    writer.write_record(&header_row)?;

    let pb = create_progress_bar(0, "Labelling students");
    let mut rows = 0usize;
    let mut resilient = 0usize;
    let mut record = csv::StringRecord::new();
    while reader.read_record(&mut record)? {
        let flag = lookup.label(&key_of(&record[student_index]));
        resilient += usize::from(flag);
        let flag_text = flag.to_string();
        let mut out = vec![flag_text.as_str()];
        out.extend(
            record
                .iter()
                .enumerate()
                .filter(|(i, _)| Some(*i) != existing_outcome)
                .map(|(_, field)| field),
        );
        writer.write_record(&out)?;
        rows += 1;
        pb.inc(1);
    }
    writer.flush()?;
    pb.finish_and_clear();

    log::info!(
        "Labelled {rows} students ({resilient} resilient); saved to '{}'",
        output.display()
    );
    Ok((rows, resilient))
}
