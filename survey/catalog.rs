//! Variable catalogue: names, labels and value labels read from the SPSS
//! dictionary, written as CSV for browsing outside the pipeline.

use crate::extract::SurveyError;
use crate::sav::{SavFile, Value};
use crate::shared::frame::ensure_parent_dir;
use crate::shared::stats::canonical_key;
use std::path::Path;

const NOT_FOUND: &str = "--- VARIABLE NOT FOUND IN FILE ---";
const NOT_APPLICABLE: &str = "--- N/A ---";
const NO_LABELS: &str = "Continuous variable or no defined value labels.";

/// Writes `Variable,Label` for every variable in the file. Returns the row count.
pub fn write_variable_labels(sav: &SavFile, path: &Path) -> Result<usize, SurveyError> {
    ensure_parent_dir(path)?;
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["Variable", "Label"])?;
    for variable in sav.variables() {
        writer.write_record([
            variable.name.as_str(),
            variable.label.as_deref().unwrap_or(""),
        ])?;
    }
    writer.flush()?;
    log::info!(
        "Wrote {} variable labels to '{}'",
        sav.variables().len(),
        path.display()
    );
    Ok(sav.variables().len())
}

fn describe_value_labels(labels: &[(Value, String)]) -> String {
    labels
        .iter()
        .map(|(value, label)| {
            let key = match value {
                Value::Number(number) => canonical_key(*number),
                Value::Text(text) => text.clone(),
            };
            format!("{key}: '{label}'")
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// Writes name, label and value labels for the requested variables. Variables
/// absent from the file still get a row, marked as not found.
pub fn write_variable_info(
    sav: &SavFile,
    variables: &[String],
    path: &Path,
) -> Result<usize, SurveyError> {
    ensure_parent_dir(path)?;
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["variableNames", "VariableExplanation", "PossibleValues"])?;
    let mut missing = 0usize;
    for name in variables {
        match sav.variable_index(name) {
            Ok(index) => {
                let variable = &sav.variables()[index];
                let possible = sav
                    .value_labels(index)
                    .map(describe_value_labels)
                    .unwrap_or_else(|| NO_LABELS.to_string());
                writer.write_record([
                    name.as_str(),
                    variable.label.as_deref().unwrap_or(""),
                    possible.as_str(),
                ])?;
            }
            Err(_) => {
                missing += 1;
                writer.write_record([name.as_str(), NOT_FOUND, NOT_APPLICABLE])?;
            }
        }
    }
    writer.flush()?;
    if missing > 0 {
        log::warn!("{missing} requested variables were not found in the SPSS file.");
    }
    log::info!(
        "Wrote information for {} variables to '{}'",
        variables.len(),
        path.display()
    );
    Ok(variables.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_labels_render_as_key_label_pairs() {
        let labels = vec![
            (Value::Number(1.0), "Female".to_string()),
            (Value::Number(2.0), "Male".to_string()),
        ];
        assert_eq!(describe_value_labels(&labels), "1: 'Female'; 2: 'Male'");
    }
}
