//! PNG diagnostics: scree plots, feature-importance bars and the missingness
//! heatmap. Callers treat every `PlotError` as a warning.

use crate::shared::frame::ensure_parent_dir;
use plotters::prelude::*;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlotError {
    #[error("Failed to prepare the output location: {0}")]
    Output(#[from] crate::shared::frame::FrameError),
    #[error("Drawing failed: {0}")]
    Draw(String),
    #[error("Nothing to plot for '{0}'.")]
    Empty(String),
}

fn draw_err<E: std::fmt::Display>(err: E) -> PlotError {
    PlotError::Draw(err.to_string())
}

/// Eigenvalues (left) and cumulative explained variance (right) of one block.
pub fn scree_plot(
    path: &Path,
    block: &str,
    eigenvalues: &[f64],
    threshold: f64,
) -> Result<(), PlotError> {
    if eigenvalues.is_empty() {
        return Err(PlotError::Empty(block.to_string()));
    }
    ensure_parent_dir(path)?;
    let total: f64 = eigenvalues.iter().sum();
    let mut cumulative = Vec::with_capacity(eigenvalues.len());
    let mut running = 0.0;
    for value in eigenvalues {
        running += value / total;
        cumulative.push(running);
    }
    let count = eigenvalues.len() as i32;
    let top = eigenvalues.iter().copied().fold(threshold, f64::max) * 1.1;

    let root = BitMapBackend::new(path, (1200, 500)).into_drawing_area();
    root.fill(&WHITE).map_err(draw_err)?;
    let (left, right) = root.split_horizontally(600);

    {
        let mut chart = ChartBuilder::on(&left)
            .caption(format!("{block}: eigenvalues"), ("sans-serif", 22))
            .margin(10)
            .x_label_area_size(35)
            .y_label_area_size(50)
            .build_cartesian_2d(1..count + 1, 0f64..top)
            .map_err(draw_err)?;
        chart
            .configure_mesh()
            .x_desc("Component")
            .y_desc("Eigenvalue")
            .draw()
            .map_err(draw_err)?;
        chart
            .draw_series(LineSeries::new(
                eigenvalues
                    .iter()
                    .enumerate()
                    .map(|(i, v)| (i as i32 + 1, *v)),
                &BLUE,
            ))
            .map_err(draw_err)?;
        chart
            .draw_series(
                eigenvalues
                    .iter()
                    .enumerate()
                    .map(|(i, v)| Circle::new((i as i32 + 1, *v), 4, BLUE.filled())),
            )
            .map_err(draw_err)?;
        chart
            .draw_series(LineSeries::new(
                [(1, threshold), (count + 1, threshold)],
                &RED,
            ))
            .map_err(draw_err)?;
    }

    {
        let mut chart = ChartBuilder::on(&right)
            .caption(format!("{block}: cumulative variance"), ("sans-serif", 22))
            .margin(10)
            .x_label_area_size(35)
            .y_label_area_size(50)
            .build_cartesian_2d(1..count + 1, 0f64..1.05f64)
            .map_err(draw_err)?;
        chart
            .configure_mesh()
            .x_desc("Component")
            .y_desc("Explained variance")
            .draw()
            .map_err(draw_err)?;
        chart
            .draw_series(LineSeries::new(
                cumulative
                    .iter()
                    .enumerate()
                    .map(|(i, v)| (i as i32 + 1, *v)),
                &GREEN,
            ))
            .map_err(draw_err)?;
    }

    root.present().map_err(draw_err)?;
    log::info!("Saved scree plot to '{}'", path.display());
    Ok(())
}

/// Horizontal bars, largest importance on top.
pub fn importance_chart(path: &Path, importances: &[(String, f64)]) -> Result<(), PlotError> {
    if importances.is_empty() {
        return Err(PlotError::Empty("feature importance".to_string()));
    }
    ensure_parent_dir(path)?;
    let count = importances.len() as i32;
    let max = importances
        .iter()
        .map(|(_, value)| *value)
        .fold(0.0, f64::max)
        .max(f64::EPSILON)
        * 1.1;
    // Row 0 is drawn at the bottom, so the list is reversed onto the axis.
    let name_at = |row: i32| -> String {
        let index = count - 1 - row;
        importances
            .get(index as usize)
            .map(|(name, _)| name.clone())
            .unwrap_or_default()
    };

    let root = BitMapBackend::new(path, (1000, 120 + 30 * count as u32)).into_drawing_area();
    root.fill(&WHITE).map_err(draw_err)?;
    let mut chart = ChartBuilder::on(&root)
        .caption(
            format!("Top {count} feature importances"),
            ("sans-serif", 24),
        )
        .margin(15)
        .x_label_area_size(40)
        .y_label_area_size(220)
        .build_cartesian_2d(0f64..max, 0..count)
        .map_err(draw_err)?;
    chart
        .configure_mesh()
        .y_labels(count as usize)
        .y_label_formatter(&|row| name_at(*row))
        .x_desc("Mean decrease in impurity")
        .draw()
        .map_err(draw_err)?;
    chart
        .draw_series(importances.iter().enumerate().map(|(i, (_, value))| {
            let row = count - 1 - i as i32;
            Rectangle::new([(0.0, row), (*value, row + 1)], BLUE.mix(0.7).filled())
        }))
        .map_err(draw_err)?;
    root.present().map_err(draw_err)?;
    log::info!("Saved feature importance chart to '{}'", path.display());
    Ok(())
}

/// Country by variable grid; cells above `threshold` percent missing are red.
pub fn missingness_heatmap(
    path: &Path,
    countries: &[String],
    variables: &[String],
    percent: &[Vec<f64>],
    threshold: f64,
) -> Result<(), PlotError> {
    if countries.is_empty() || variables.is_empty() {
        return Err(PlotError::Empty("missingness heatmap".to_string()));
    }
    ensure_parent_dir(path)?;
    let columns = variables.len() as i32;
    let rows = countries.len() as i32;
    let width = (300 + 14 * variables.len()).min(6000) as u32;
    let height = (200 + 14 * countries.len()).min(4000) as u32;

    let root = BitMapBackend::new(path, (width, height)).into_drawing_area();
    root.fill(&WHITE).map_err(draw_err)?;
    let mut chart = ChartBuilder::on(&root)
        .caption(
            format!("Variables missing above {threshold}% by country"),
            ("sans-serif", 22),
        )
        .margin(10)
        .x_label_area_size(120)
        .y_label_area_size(60)
        .build_cartesian_2d(0..columns, 0..rows)
        .map_err(draw_err)?;
    chart
        .configure_mesh()
        .disable_mesh()
        .x_labels(variables.len().min(200))
        .y_labels(countries.len().min(200))
        .x_label_formatter(&|x| variables.get(*x as usize).cloned().unwrap_or_default())
        .y_label_formatter(&|y| countries.get(*y as usize).cloned().unwrap_or_default())
        .x_label_style(("sans-serif", 9).into_font().transform(FontTransform::Rotate90))
        .y_label_style(("sans-serif", 9))
        .draw()
        .map_err(draw_err)?;
    chart
        .draw_series(percent.iter().enumerate().flat_map(|(row, cells)| {
            cells.iter().enumerate().map(move |(column, value)| {
                let colour = if *value > threshold {
                    RED.filled()
                } else {
                    RGBColor(235, 235, 235).filled()
                };
                Rectangle::new(
                    [
                        (column as i32, row as i32),
                        (column as i32 + 1, row as i32 + 1),
                    ],
                    colour,
                )
            })
        }))
        .map_err(draw_err)?;
    root.present().map_err(draw_err)?;
    log::info!("Saved missingness heatmap to '{}'", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_inputs_are_rejected_before_drawing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scree.png");
        assert!(matches!(
            scree_plot(&path, "Block", &[], 1.0),
            Err(PlotError::Empty(_))
        ));
        assert!(matches!(
            importance_chart(&path, &[]),
            Err(PlotError::Empty(_))
        ));
        assert!(!path.exists());
    }
}
