//! Missing-data diagnostics by country.
//!
//! The percentage table is the basis for three decisions: which countries and
//! variables are too sparse to keep, which countries have good coverage, and
//! which cells the heatmap marks as highly missing.

use crate::shared::config::MissingConfig;
use crate::shared::frame::{FrameError, column_names, group_rows, key_column};
use polars::prelude::*;

#[derive(Debug, Clone, PartialEq)]
pub struct MissingTable {
    /// Sorted country codes, one row each.
    pub countries: Vec<String>,
    pub variables: Vec<String>,
    /// `percent[country][variable]`, in `0..=100`.
    pub percent: Vec<Vec<f64>>,
}

#[derive(Debug, Clone, Default)]
pub struct MissingAssessment {
    /// `(country, variable, percent)` for every cell above the threshold.
    pub high_cells: Vec<(String, String, f64)>,
    pub exclude_countries: Vec<String>,
    pub exclude_variables: Vec<String>,
    /// Good countries with the variables that are still highly missing in them.
    pub good_countries: Vec<(String, Vec<String>)>,
}

impl MissingTable {
    /// Missing percentage of every column other than `country_column`, per
    /// country. Rows without a country are ignored.
    pub fn from_frame(df: &DataFrame, country_column: &str) -> Result<Self, FrameError> {
        let keys = key_column(df, country_column)?;
        let mut groups = group_rows(&keys);
        groups.sort_by(|a, b| a.0.cmp(&b.0));
        let variables: Vec<String> = column_names(df)
            .into_iter()
            .filter(|name| name != country_column)
            .collect();

        let mut null_masks = Vec::with_capacity(variables.len());
        for name in &variables {
            let mask: Vec<bool> = df
                .column(name)?
                .is_null()
                .into_iter()
                .map(|flag| flag.unwrap_or(true))
                .collect();
            null_masks.push(mask);
        }

        let percent = groups
            .iter()
            .map(|(_, rows)| {
                null_masks
                    .iter()
                    .map(|mask| {
                        let missing = rows.iter().filter(|&&row| mask[row]).count();
                        100.0 * missing as f64 / rows.len() as f64
                    })
                    .collect()
            })
            .collect();

        Ok(Self {
            countries: groups.into_iter().map(|(country, _)| country).collect(),
            variables,
            percent,
        })
    }

    fn is_high(value: f64, threshold: f64) -> bool {
        value >= threshold
    }

    /// Share of variables that are highly missing, per country.
    pub fn country_proportions(&self, threshold: f64) -> Vec<f64> {
        self.percent
            .iter()
            .map(|row| {
                if row.is_empty() {
                    return 0.0;
                }
                row.iter().filter(|&&v| Self::is_high(v, threshold)).count() as f64
                    / row.len() as f64
            })
            .collect()
    }

    /// Share of countries in which each variable is highly missing.
    pub fn variable_proportions(&self, threshold: f64) -> Vec<f64> {
        (0..self.variables.len())
            .map(|column| {
                if self.percent.is_empty() {
                    return 0.0;
                }
                self.percent
                    .iter()
                    .filter(|row| Self::is_high(row[column], threshold))
                    .count() as f64
                    / self.percent.len() as f64
            })
            .collect()
    }

    pub fn assess(&self, config: &MissingConfig) -> MissingAssessment {
        let threshold = config.highly_missing_percent;
        let mut assessment = MissingAssessment::default();
        for (country, row) in self.countries.iter().zip(&self.percent) {
            for (variable, &value) in self.variables.iter().zip(row) {
                if value > threshold {
                    assessment
                        .high_cells
                        .push((country.clone(), variable.clone(), value));
                }
            }
        }
        for ((country, proportion), row) in self
            .countries
            .iter()
            .zip(self.country_proportions(threshold))
            .zip(&self.percent)
        {
            if proportion > config.exclude_proportion {
                assessment.exclude_countries.push(country.clone());
            }
            if proportion < config.good_proportion {
                let problems = self
                    .variables
                    .iter()
                    .zip(row)
                    .filter(|(_, value)| Self::is_high(**value, threshold))
                    .map(|(variable, _)| variable.clone())
                    .collect();
                assessment.good_countries.push((country.clone(), problems));
            }
        }
        for (variable, proportion) in self
            .variables
            .iter()
            .zip(self.variable_proportions(threshold))
        {
            if proportion > config.exclude_proportion {
                assessment.exclude_variables.push(variable.clone());
            }
        }
        assessment
    }

    /// Countries whose share of highly missing variables is below `proportion`.
    pub fn countries_below(&self, threshold: f64, proportion: f64) -> Vec<String> {
        self.countries
            .iter()
            .zip(self.country_proportions(threshold))
            .filter(|(_, share)| *share < proportion)
            .map(|(country, _)| country.clone())
            .collect()
    }

    /// Table without the excluded rows and columns, and without variables that
    /// are complete everywhere.
    pub fn for_heatmap(&self, assessment: &MissingAssessment) -> Self {
        let rows: Vec<usize> = (0..self.countries.len())
            .filter(|&i| !assessment.exclude_countries.contains(&self.countries[i]))
            .collect();
        let columns: Vec<usize> = (0..self.variables.len())
            .filter(|&j| !assessment.exclude_variables.contains(&self.variables[j]))
            .filter(|&j| rows.iter().any(|&i| self.percent[i][j] > 0.0))
            .collect();
        Self {
            countries: rows.iter().map(|&i| self.countries[i].clone()).collect(),
            variables: columns.iter().map(|&j| self.variables[j].clone()).collect(),
            percent: rows
                .iter()
                .map(|&i| columns.iter().map(|&j| self.percent[i][j]).collect())
                .collect(),
        }
    }

    /// The table as a frame with the country column first.
    pub fn to_frame(&self, country_column: &str) -> Result<DataFrame, FrameError> {
        let mut columns: Vec<Column> = Vec::with_capacity(self.variables.len() + 1);
        columns.push(Series::new(country_column.into(), self.countries.clone()).into());
        for (j, variable) in self.variables.iter().enumerate() {
            let values: Vec<f64> = self.percent.iter().map(|row| row[j]).collect();
            columns.push(Series::new(variable.as_str().into(), values).into());
        }
        Ok(DataFrame::new(columns)?)
    }
}
