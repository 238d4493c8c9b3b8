//! # Stage Orchestration
//!
//! One function per batch stage. Each reads the previous stage's output
//! named in [`PipelineConfig::paths`], runs the stage and writes its own
//! output. Plots are diagnostics only: a failed plot is logged and the stage
//! carries on.

use crate::analyze::formula::Formula;
use crate::analyze::icc::{pooled_icc, summary_frame};
use crate::analyze::runner::{
    coefficients_frame, comparison_frame, fit_pooled, pooled_frame, print_pooled, print_step,
    run_sequence,
};
use crate::analyze::validate::{importance_frame, print_report, run_validation};
use crate::analyze::{AnalysisError, merge_components};
use crate::catalog::{write_variable_info, write_variable_labels};
use crate::clean::clean_frame;
use crate::extract::{SurveyError, extract_disadvantaged, prescan_cutoffs};
use crate::impute::{ImputeError, run_imputation};
use crate::label::{load_scores, write_labelled};
use crate::missing::MissingTable;
use crate::reduce::{PcaError, Reduction, reduce_blocks};
use crate::sav::{SavError, SavFile};
use crate::shared::config::{ConfigError, PipelineConfig};
use crate::shared::frame::{
    FrameError, filter_by_membership, read_csv, split_replicates, write_csv,
};
use crate::shared::plot::{importance_chart, missingness_heatmap, scree_plot};
use polars::prelude::DataFrame;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("SPSS file error: {0}")]
    Sav(#[from] SavError),
    #[error("Survey extraction error: {0}")]
    Survey(#[from] SurveyError),
    #[error("Data frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Imputation error: {0}")]
    Impute(#[from] ImputeError),
    #[error("Component reduction error: {0}")]
    Pca(#[from] PcaError),
    #[error("Analysis error: {0}")]
    Analysis(#[from] AnalysisError),
}

pub fn run_metadata(config: &PipelineConfig) -> Result<(), PipelineError> {
    let sav = SavFile::open(&config.paths.sav)?;
    let header = sav.header();
    println!("Product:     {}", header.product.trim());
    println!("Created:     {} {}", header.creation_date, header.creation_time);
    println!("Compression: {:?}", header.compression);
    println!("Variables:   {}", sav.variables().len());
    if let Some(cases) = sav.case_count() {
        println!("Cases:       {cases}");
    }
    if let Some(encoding) = sav.encoding() {
        println!("Encoding:    {encoding}");
    }
    let labelled = write_variable_labels(&sav, &config.paths.variable_labels)?;
    let described = write_variable_info(
        &sav,
        &config.codebook.all_variables(),
        &config.paths.variable_info,
    )?;
    println!(
        "Wrote {labelled} variable labels and {described} codebook descriptions."
    );
    Ok(())
}

pub fn run_extract(config: &PipelineConfig) -> Result<(), PipelineError> {
    let sav = SavFile::open(&config.paths.sav)?;
    let cutoffs = prescan_cutoffs(&sav, &config.columns, &config.extract)?;
    let summary = extract_disadvantaged(
        &sav,
        &cutoffs,
        &config.columns,
        &config.extract,
        &config.paths.extracted,
    )?;
    println!(
        "Kept {} of {} records from {} countries at or below the country ESCS cutoff.",
        summary.rows_written, summary.records_read, summary.countries
    );
    Ok(())
}

pub fn run_label(config: &PipelineConfig) -> Result<(), PipelineError> {
    let sav = SavFile::open(&config.paths.sav)?;
    let lookup = load_scores(&sav, &config.columns, &config.label)?;
    let (rows, resilient) = write_labelled(
        &lookup,
        &config.columns,
        &config.paths.extracted,
        &config.paths.labelled,
    )?;
    let share = if rows > 0 {
        100.0 * resilient as f64 / rows as f64
    } else {
        0.0
    };
    println!("{resilient} of {rows} students ({share:.2}%) are academically resilient.");
    Ok(())
}

pub fn run_clean(config: &PipelineConfig) -> Result<(), PipelineError> {
    let df = read_csv(&config.paths.labelled)?;
    let (mut cleaned, report) = clean_frame(&df, &config.codebook, &config.columns.outcome)?;
    write_csv(&mut cleaned, &config.paths.cleaned)?;
    println!(
        "Kept {} variables; {} listed variables were absent; {} invalid codes set to missing.",
        report.kept.len(),
        report.absent.len(),
        report.replaced_cells
    );
    println!("\nVariables with the most missing values:");
    for (name, count) in &report.top_missing {
        println!("  {name:<20} {count}");
    }
    Ok(())
}

pub fn run_missing(config: &PipelineConfig) -> Result<(), PipelineError> {
    let df = read_csv(&config.paths.cleaned)?;
    let table = MissingTable::from_frame(&df, &config.columns.country)?;
    let assessment = table.assess(&config.missing);
    write_csv(
        &mut table.to_frame(&config.columns.country)?,
        &config.paths.missing_table,
    )?;

    println!(
        "{} country/variable cells exceed {:.0}% missing.",
        assessment.high_cells.len(),
        config.missing.highly_missing_percent
    );
    println!("Countries to exclude: {:?}", assessment.exclude_countries);
    println!("Variables to exclude: {:?}", assessment.exclude_variables);
    println!("Countries with good coverage: {}", assessment.good_countries.len());
    for (country, problems) in &assessment.good_countries {
        if problems.is_empty() {
            println!("  {country}: no highly missing variables");
        } else {
            println!("  {country}: still highly missing {}", problems.join(", "));
        }
    }

    let shown = table.for_heatmap(&assessment);
    if let Err(err) = missingness_heatmap(
        &config.paths.missing_heatmap,
        &shown.countries,
        &shown.variables,
        &shown.percent,
        config.missing.highly_missing_percent,
    ) {
        log::warn!("Could not draw the missingness heatmap: {err}");
    }
    Ok(())
}

pub fn run_impute(config: &PipelineConfig) -> Result<(), PipelineError> {
    let df = read_csv(&config.paths.cleaned)?;
    let mut output = run_imputation(&df, &config.columns, &config.impute)?;
    write_csv(&mut output.frame, &config.paths.imputed)?;
    println!(
        "Imputed {} variables for {} countries ({} skipped).",
        output.imputed_variables.len(),
        output.countries.len(),
        output.skipped_variables.len()
    );
    Ok(())
}

fn replicate_frames(df: &DataFrame, imputation: &str) -> Result<Vec<DataFrame>, PipelineError> {
    let replicates: Vec<DataFrame> = split_replicates(df, imputation)?
        .into_iter()
        .map(|(_, frame)| frame)
        .collect();
    if replicates.is_empty() {
        return Err(AnalysisError::NoReplicates(imputation.to_string()).into());
    }
    Ok(replicates)
}

pub fn run_icc(config: &PipelineConfig) -> Result<(), PipelineError> {
    let columns = &config.columns;
    let df = read_csv(&config.paths.imputed)?;
    let replicates = replicate_frames(&df, &columns.imputation)?;
    let summaries = vec![
        pooled_icc(&replicates, "School", &columns.outcome, &columns.school)?,
        pooled_icc(&replicates, "Country", &columns.outcome, &columns.country)?,
    ];
    println!("\n=== Null-model intraclass correlations ===");
    for summary in &summaries {
        println!(
            "{:<8} ICC = {:.4} (logit scale {:.4})",
            summary.level, summary.icc, summary.logit_icc
        );
        println!("  {}", summary.interpretation());
    }
    write_csv(&mut summary_frame(&summaries)?, &config.paths.icc_summary)?;
    Ok(())
}

fn draw_scree_plots(reduction: &Reduction, directory: &Path, threshold: f64) {
    for fit in &reduction.first_replicate {
        let path = directory.join(format!("{}_scree.png", fit.block));
        if let Err(err) = scree_plot(&path, &fit.block, &fit.eigenvalues, threshold) {
            log::warn!("Could not draw the scree plot for '{}': {err}", fit.block);
        }
    }
}

pub fn run_reduce(config: &PipelineConfig) -> Result<(), PipelineError> {
    let columns = &config.columns;
    let reduce = &config.reduce;
    let df = read_csv(&config.paths.imputed)?;

    let psychological_ids = vec![
        columns.country.clone(),
        columns.school.clone(),
        columns.student.clone(),
        columns.outcome.clone(),
    ];
    let environmental_ids = vec![columns.student.clone(), columns.school.clone()];
    let outputs = [
        (
            "psychological",
            &reduce.psychological_blocks,
            psychological_ids,
            &config.paths.psychological_components,
        ),
        (
            "environmental",
            &reduce.environmental_blocks,
            environmental_ids,
            &config.paths.environmental_components,
        ),
    ];
    for (kind, blocks, ids, path) in outputs {
        log::info!("Reducing {kind} blocks...");
        let mut reduction = reduce_blocks(
            &df,
            blocks,
            &reduce.countries,
            &columns.country,
            &columns.imputation,
            &columns.student,
            &ids,
            reduce.eigenvalue_threshold,
        )?;
        println!(
            "{kind}: {} students, {} columns averaged over {} replicates",
            reduction.frame.height(),
            reduction.frame.width(),
            reduction.replicates
        );
        for fit in &reduction.first_replicate {
            println!(
                "  {:<28} {} component(s), eigenvalues {:?}",
                fit.block,
                fit.n_components(),
                fit.eigenvalues
                    .iter()
                    .map(|v| (v * 1000.0).round() / 1000.0)
                    .collect::<Vec<_>>()
            );
        }
        write_csv(&mut reduction.frame, path)?;
        draw_scree_plots(&reduction, &config.paths.pca_plots, reduce.eigenvalue_threshold);
    }
    Ok(())
}

/// Replicates of the imputed file restricted to `countries`.
fn country_replicates(
    config: &PipelineConfig,
    countries: &[String],
) -> Result<Vec<DataFrame>, PipelineError> {
    let df = read_csv(&config.paths.imputed)?;
    let subset = filter_by_membership(&df, &config.columns.country, countries)?;
    log::info!(
        "Kept {} of {} imputed rows for {}",
        subset.height(),
        df.height(),
        countries.join(", ")
    );
    replicate_frames(&subset, &config.columns.imputation)
}

/// The first replicate joined with both component tables.
fn analysis_frame(config: &PipelineConfig, first: &DataFrame) -> Result<DataFrame, PipelineError> {
    let psychological = read_csv(&config.paths.psychological_components)?;
    let environmental = read_csv(&config.paths.environmental_components)?;
    Ok(merge_components(
        first,
        &[&psychological, &environmental],
        &config.columns.student,
    )?)
}

pub fn run_model(config: &PipelineConfig) -> Result<(), PipelineError> {
    let columns = &config.columns;
    let models = &config.models;
    let replicates = country_replicates(config, &models.countries)?;
    let results = &config.paths.model_results;

    let formula = Formula::parse(&models.pooled_formula).map_err(AnalysisError::from)?;
    let pooled = fit_pooled(&replicates, &formula, &columns.school)?;
    print_pooled(&pooled);
    write_csv(&mut pooled_frame(&pooled)?, &results.join("pooled_model_A.csv"))?;

    let merged = analysis_frame(config, &replicates[0])?;
    for sequence in &models.sequences {
        println!("\n=== Model sequence: {} ===", sequence.name);
        let result = run_sequence(&merged, sequence, &columns.outcome, &columns.school)?;
        for step in &result.steps {
            print_step(step);
        }
        write_csv(
            &mut coefficients_frame(&result)?,
            &results.join(format!("{}_coefficients.csv", result.name)),
        )?;
        write_csv(
            &mut comparison_frame(&result)?,
            &results.join(format!("{}_comparison.csv", result.name)),
        )?;
    }
    Ok(())
}

pub fn run_validate(config: &PipelineConfig) -> Result<(), PipelineError> {
    let columns = &config.columns;
    let replicates = country_replicates(config, &config.models.countries)?;
    let merged = analysis_frame(config, &replicates[0])?;

    // Every other imputed column and component score is a candidate feature.
    let exclude = vec![
        columns.student.clone(),
        columns.school.clone(),
        columns.imputation.clone(),
    ];
    let report = run_validation(&merged, &columns.outcome, &exclude, &config.forest)?;
    print_report(&report, config.forest.top_n_print);
    write_csv(
        &mut importance_frame(&report)?,
        &config.paths.feature_importance,
    )?;
    let top: Vec<(String, f64)> = report
        .importances
        .iter()
        .take(config.forest.top_n_plot)
        .cloned()
        .collect();
    if let Err(err) = importance_chart(&config.paths.feature_importance_plot, &top) {
        log::warn!("Could not draw the feature importance chart: {err}");
    }
    Ok(())
}
