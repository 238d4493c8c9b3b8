//! Random-forest check of how well the selected features separate resilient
//! from non-resilient students.

use super::AnalysisError;
use super::design::sorted_levels;
use super::forest::{ForestParams, RandomForest, accuracy, stratified_split};
use crate::shared::config::ForestConfig;
use crate::shared::frame::{FrameError, column_names, is_numeric_column, key_column, numeric_column};
use itertools::Itertools;
use ndarray::{Array2, Axis};
use polars::prelude::*;

/// Numeric feature matrix with class labels.
#[derive(Debug, Clone)]
pub struct EncodedFeatures {
    pub names: Vec<String>,
    pub x: Array2<f64>,
    pub labels: Vec<usize>,
    pub classes: Vec<String>,
    pub dropped_rows: usize,
}

#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub accuracy: f64,
    pub n_train: usize,
    pub n_test: usize,
    pub n_features: usize,
    /// Features by decreasing importance.
    pub importances: Vec<(String, f64)>,
}

enum Encoded {
    Numeric(Vec<f64>),
    Indicators(Vec<(String, Vec<f64>)>),
}

/// Every column except `outcome` and `exclude` becomes a feature. Text
/// columns are one-hot encoded without their first level. Rows with a
/// missing feature or outcome are dropped.
pub fn encode_features(
    df: &DataFrame,
    outcome: &str,
    exclude: &[String],
) -> Result<EncodedFeatures, AnalysisError> {
    let outcome_keys = key_column(df, outcome)?;
    let mut complete: Vec<bool> = outcome_keys.iter().map(Option::is_some).collect();

    let mut encoded = Vec::new();
    for name in column_names(df) {
        if name == outcome || exclude.contains(&name) {
            continue;
        }
        if is_numeric_column(df, &name)? {
            let values = numeric_column(df, &name)?;
            for (keep, value) in complete.iter_mut().zip(&values) {
                *keep &= value.is_finite();
            }
            encoded.push((name, Encoded::Numeric(values)));
        } else {
            let keys = key_column(df, &name)?;
            for (keep, key) in complete.iter_mut().zip(&keys) {
                *keep &= key.is_some();
            }
            let levels = sorted_levels(keys.iter().flatten().map(String::as_str));
            let indicators = levels
                .iter()
                .skip(1)
                .map(|level| {
                    let column = keys
                        .iter()
                        .map(|key| f64::from(u8::from(key.as_deref() == Some(level.as_str()))))
                        .collect();
                    (format!("{name}_{level}"), column)
                })
                .collect();
            encoded.push((name, Encoded::Indicators(indicators)));
        }
    }

    let rows: Vec<usize> = (0..df.height()).filter(|&r| complete[r]).collect();
    let mut names = Vec::new();
    let mut columns: Vec<Vec<f64>> = Vec::new();
    for (name, column) in encoded {
        match column {
            Encoded::Numeric(values) => {
                names.push(name);
                columns.push(rows.iter().map(|&r| values[r]).collect());
            }
            Encoded::Indicators(indicators) => {
                for (indicator, values) in indicators {
                    names.push(indicator);
                    columns.push(rows.iter().map(|&r| values[r]).collect());
                }
            }
        }
    }
    let x = Array2::from_shape_fn((rows.len(), columns.len()), |(i, j)| columns[j][i]);

    let present = rows.iter().filter_map(|&r| outcome_keys[r].as_deref());
    let classes = sorted_levels(present);
    let labels = rows
        .iter()
        .map(|&r| {
            let key = outcome_keys[r].as_deref().unwrap_or_default();
            classes.iter().position(|c| c == key).unwrap_or_default()
        })
        .collect();

    Ok(EncodedFeatures {
        names,
        x,
        labels,
        classes,
        dropped_rows: df.height() - rows.len(),
    })
}

pub fn run_validation(
    df: &DataFrame,
    outcome: &str,
    exclude: &[String],
    config: &ForestConfig,
) -> Result<ValidationReport, AnalysisError> {
    let features = encode_features(df, outcome, exclude)?;
    if features.dropped_rows > 0 {
        log::warn!(
            "Dropped {} rows with missing values before training.",
            features.dropped_rows
        );
    }
    log::info!(
        "Training data: {} rows, {} features, classes {}",
        features.labels.len(),
        features.names.len(),
        features.classes.iter().join("/")
    );

    let (train, test) = stratified_split(&features.labels, config.test_fraction, config.seed)?;
    let x_train = features.x.select(Axis(0), &train);
    let y_train: Vec<usize> = train.iter().map(|&r| features.labels[r]).collect();
    let x_test = features.x.select(Axis(0), &test);
    let y_test: Vec<usize> = test.iter().map(|&r| features.labels[r]).collect();

    log::info!("Training a random forest of {} trees...", config.n_trees);
    let forest = RandomForest::fit(
        x_train.view(),
        &y_train,
        &ForestParams {
            n_trees: config.n_trees,
            max_features: config.max_features,
            min_samples_split: config.min_samples_split,
            seed: config.seed,
        },
    )?;
    let accuracy = accuracy(&forest.predict(x_test.view()), &y_test);

    let importances: Vec<(String, f64)> = features
        .names
        .iter()
        .cloned()
        .zip(forest.feature_importances().iter().copied())
        .sorted_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)))
        .collect();

    Ok(ValidationReport {
        accuracy,
        n_train: train.len(),
        n_test: test.len(),
        n_features: features.names.len(),
        importances,
    })
}

pub fn print_report(report: &ValidationReport, top_n: usize) {
    println!("\n=== Random forest validation ===");
    println!(
        "Train/test rows: {}/{}, features: {}",
        report.n_train, report.n_test, report.n_features
    );
    println!("Test accuracy: {:.4}", report.accuracy);
    println!("\nTop {top_n} features by importance:");
    for (rank, (name, importance)) in report.importances.iter().take(top_n).enumerate() {
        println!("{:>3}. {:<40} {:.4}", rank + 1, name, importance);
    }
}

pub fn importance_frame(report: &ValidationReport) -> Result<DataFrame, FrameError> {
    Ok(DataFrame::new(vec![
        Series::new(
            "feature".into(),
            report.importances.iter().map(|(n, _)| n.clone()).collect::<Vec<_>>(),
        )
        .into(),
        Series::new(
            "importance".into(),
            report.importances.iter().map(|(_, v)| *v).collect::<Vec<_>>(),
        )
        .into(),
    ])?)
}
