//! Design matrices for a formula over a data frame.

use super::formula::{Formula, FormulaError, Term};
use crate::shared::frame::{group_rows, is_numeric_column, key_column, numeric_column};
use ndarray::{Array1, Array2};
use polars::prelude::DataFrame;

pub const INTERCEPT: &str = "Intercept";

/// Relative residual below which a column counts as a linear combination of
/// the columns before it.
const COLLINEARITY_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone)]
pub struct Design {
    /// Column names, `Intercept` first, dummies as `C(col)[T.level]`.
    pub names: Vec<String>,
    pub x: Array2<f64>,
    pub y: Array1<f64>,
    /// Group index of each row, in order of first appearance.
    pub groups: Vec<usize>,
    pub n_groups: usize,
    /// Rows dropped for a missing value in any referenced column.
    pub dropped_rows: usize,
    /// Columns removed as linear combinations of earlier ones.
    pub pruned: Vec<String>,
}

enum Source {
    Numeric(Vec<f64>),
    Categorical(Vec<Option<String>>),
}

/// Category levels in ascending order; numerically when every level parses.
pub fn sorted_levels<'a>(values: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut levels: Vec<String> = values.map(str::to_string).collect();
    levels.sort_unstable();
    levels.dedup();
    let numeric: Option<Vec<f64>> = levels.iter().map(|l| l.parse::<f64>().ok()).collect();
    if let Some(keys) = numeric {
        let mut paired: Vec<(f64, String)> = keys.into_iter().zip(levels).collect();
        paired.sort_by(|a, b| a.0.total_cmp(&b.0));
        levels = paired.into_iter().map(|(_, level)| level).collect();
    }
    levels
}

impl Design {
    /// Builds `y`, `X` and the grouping for `formula`, dropping incomplete rows
    /// listwise. Categorical terms use treatment coding against the first level.
    pub fn build(df: &DataFrame, formula: &Formula, group: &str) -> Result<Self, FormulaError> {
        let outcome = numeric_column(df, &formula.outcome)?;
        let group_keys = key_column(df, group)?;
        let mut sources = Vec::with_capacity(formula.terms.len());
        for term in &formula.terms {
            let source = match term {
                Term::Numeric(name) => {
                    if !is_numeric_column(df, name)? {
                        return Err(FormulaError::NotNumeric(name.clone()));
                    }
                    Source::Numeric(numeric_column(df, name)?)
                }
                Term::Categorical(name) => Source::Categorical(key_column(df, name)?),
            };
            sources.push(source);
        }

        let complete: Vec<usize> = (0..df.height())
            .filter(|&row| {
                outcome[row].is_finite()
                    && group_keys[row].is_some()
                    && sources.iter().all(|source| match source {
                        Source::Numeric(values) => values[row].is_finite(),
                        Source::Categorical(keys) => keys[row].is_some(),
                    })
            })
            .collect();
        let dropped_rows = df.height() - complete.len();
        if complete.is_empty() {
            return Err(FormulaError::NoCompleteRows(formula.to_string()));
        }
        if dropped_rows > 0 {
            log::info!(
                "Dropped {dropped_rows} of {} rows with missing values for '{formula}'.",
                df.height()
            );
        }

        let n = complete.len();
        let mut names = vec![INTERCEPT.to_string()];
        let mut columns: Vec<Vec<f64>> = vec![vec![1.0; n]];
        for (term, source) in formula.terms.iter().zip(&sources) {
            match source {
                Source::Numeric(values) => {
                    names.push(term.column().to_string());
                    columns.push(complete.iter().map(|&row| values[row]).collect());
                }
                Source::Categorical(keys) => {
                    let present = complete.iter().filter_map(|&row| keys[row].as_deref());
                    let levels = sorted_levels(present);
                    for level in levels.iter().skip(1) {
                        names.push(format!("C({})[T.{level}]", term.column()));
                        columns.push(
                            complete
                                .iter()
                                .map(|&row| f64::from(u8::from(keys[row].as_deref() == Some(level))))
                                .collect(),
                        );
                    }
                }
            }
        }

        let (kept, pruned) = prune_collinear(&columns);
        let pruned: Vec<String> = pruned.into_iter().map(|j| names[j].clone()).collect();
        for name in &pruned {
            log::warn!("Dropping '{name}' from '{formula}': it is collinear with earlier columns.");
        }
        let x = Array2::from_shape_fn((n, kept.len()), |(i, j)| columns[kept[j]][i]);
        let names = kept.iter().map(|&j| names[j].clone()).collect();
        let y = complete.iter().map(|&row| outcome[row]).collect();

        let subset: Vec<Option<String>> = complete.iter().map(|&row| group_keys[row].clone()).collect();
        let grouped = group_rows(&subset);
        let mut groups = vec![0; n];
        for (index, (_, rows)) in grouped.iter().enumerate() {
            for &row in rows {
                groups[row] = index;
            }
        }

        Ok(Self {
            names,
            x,
            y,
            groups,
            n_groups: grouped.len(),
            dropped_rows,
            pruned,
        })
    }

    pub fn n_obs(&self) -> usize {
        self.y.len()
    }
}

/// Greedy pivot-free Cholesky over the Gram matrix: a column is kept when its
/// residual against the kept columns is not negligible. Returns the kept and
/// pruned column indices.
fn prune_collinear(columns: &[Vec<f64>]) -> (Vec<usize>, Vec<usize>) {
    let dot = |a: &[f64], b: &[f64]| a.iter().zip(b).map(|(x, y)| x * y).sum::<f64>();
    let mut kept: Vec<usize> = Vec::new();
    let mut pruned = Vec::new();
    // Rows of the lower factor of the kept columns' Gram matrix.
    let mut factor: Vec<Vec<f64>> = Vec::new();
    for (j, column) in columns.iter().enumerate() {
        let norm = dot(column, column);
        let mut row = Vec::with_capacity(kept.len() + 1);
        for (i, &k) in kept.iter().enumerate() {
            let mut value = dot(&columns[k], column);
            for (m, previous) in row.iter().enumerate() {
                value -= factor[i][m] * previous;
            }
            row.push(value / factor[i][i]);
        }
        let residual = norm - row.iter().map(|v| v * v).sum::<f64>();
        if norm > 0.0 && residual > COLLINEARITY_TOLERANCE * norm {
            row.push(residual.sqrt());
            factor.push(row);
            kept.push(j);
        } else {
            pruned.push(j);
        }
    }
    (kept, pruned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use polars::prelude::*;

    fn frame() -> DataFrame {
        DataFrame::new(vec![
            Series::new("Y".into(), vec![Some(1.0), Some(0.0), Some(1.0), None, Some(0.0), Some(1.0)]).into(),
            Series::new("AGE".into(), vec![15.0, 16.0, 15.5, 16.0, 15.2, 15.8]).into(),
            Series::new("TWICE".into(), vec![30.0, 32.0, 31.0, 32.0, 30.4, 31.6]).into(),
            Series::new("ST004D01T".into(), vec![Some(2i64), Some(1), Some(10), Some(1), None, Some(2)]).into(),
            Series::new("CNTSCHID".into(), vec![7i64, 7, 8, 8, 9, 9]).into(),
        ])
        .unwrap()
    }

    #[test]
    fn treatment_coding_uses_numeric_level_order() {
        let formula = Formula::parse("Y ~ AGE + C(ST004D01T)").unwrap();
        let design = Design::build(&frame(), &formula, "CNTSCHID").unwrap();
        assert_eq!(design.dropped_rows, 2);
        assert_eq!(design.n_obs(), 4);
        assert_eq!(
            design.names,
            vec!["Intercept", "AGE", "C(ST004D01T)[T.2]", "C(ST004D01T)[T.10]"]
        );
        assert_eq!(design.x.column(2).to_vec(), vec![1.0, 0.0, 0.0, 1.0]);
        assert_eq!(design.groups, vec![0, 0, 1, 2]);
        assert_eq!(design.n_groups, 3);
    }

    #[test]
    fn collinear_columns_are_pruned() {
        let formula = Formula::parse("Y ~ AGE + TWICE").unwrap();
        let design = Design::build(&frame(), &formula, "CNTSCHID").unwrap();
        assert_eq!(design.names, vec!["Intercept", "AGE"]);
        assert_eq!(design.pruned, vec!["TWICE".to_string()]);
    }

    #[test]
    fn text_columns_need_categorical_terms() {
        let df = DataFrame::new(vec![
            Series::new("Y".into(), vec![1.0, 0.0]).into(),
            Series::new("CNT".into(), vec!["TUR", "HKG"]).into(),
        ])
        .unwrap();
        let formula = Formula::parse("Y ~ CNT").unwrap();
        assert!(matches!(
            Design::build(&df, &formula, "CNT"),
            Err(FormulaError::NotNumeric(_))
        ));
        let formula = Formula::parse("Y ~ C(CNT)").unwrap();
        let design = Design::build(&df, &formula, "CNT").unwrap();
        assert_eq!(design.names, vec!["Intercept", "C(CNT)[T.TUR]"]);
    }
}
