//! # Model Runner
//!
//! Two kinds of analysis share the mixed-model machinery:
//!
//! - the pooled model, fitted by REML on every imputed replicate and combined
//!   with Rubin's Rules, fixed effects and the random-intercept variance alike;
//! - nested sequences on the first replicate joined with the component
//!   scores, fitted by ML and compared step by step with likelihood-ratio
//!   tests.
//!
//! A sequence is plain data: each step adds formula fragments and component
//! blocks to everything the steps before it added.

use super::AnalysisError;
use super::design::Design;
use super::formula::Formula;
use super::mixed::{Method, MixedFit};
use super::nested::{LikelihoodRatio, likelihood_ratio};
use super::pooling::{PooledEstimate, ReplicateEstimates, pool};
use crate::shared::frame::{FrameError, column_names, filter_rows, key_column};
use crate::shared::stats::two_sided_normal_p;
use polars::prelude::*;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelStep {
    pub name: String,
    /// Formula fragments such as `AGE + C(IMMIG)`.
    #[serde(default)]
    pub terms: Vec<String>,
    /// Component blocks; every `<block>_PC<k>` column is added.
    #[serde(default)]
    pub components: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSequence {
    pub name: String,
    pub steps: Vec<ModelStep>,
}

/// Row label of the pooled random-intercept variance.
pub const GROUP_VARIANCE_TERM: &str = "School Var (Random Effect)";

#[derive(Debug, Clone)]
pub struct PooledModel {
    pub formula: String,
    pub replicates: usize,
    pub n_obs: usize,
    pub n_groups: usize,
    /// Fixed effects, in design order.
    pub estimates: Vec<PooledEstimate>,
    pub group_variance: PooledEstimate,
}

impl PooledModel {
    /// Fixed effects followed by the variance component.
    pub fn rows(&self) -> impl Iterator<Item = &PooledEstimate> {
        self.estimates.iter().chain(std::iter::once(&self.group_variance))
    }
}

#[derive(Debug, Clone)]
pub struct StepFit {
    pub name: String,
    pub formula: String,
    pub fit: MixedFit,
    /// Test against the previous step; `None` for the first.
    pub comparison: Option<LikelihoodRatio>,
}

#[derive(Debug, Clone)]
pub struct SequenceResult {
    pub name: String,
    pub steps: Vec<StepFit>,
}

/// Fits `formula` on every replicate by REML and pools the fixed effects and
/// the random-intercept variance.
pub fn fit_pooled(
    replicates: &[DataFrame],
    formula: &Formula,
    group: &str,
) -> Result<PooledModel, AnalysisError> {
    if replicates.is_empty() {
        return Err(AnalysisError::NoReplicates(formula.to_string()));
    }
    log::info!(
        "Fitting '{formula}' on {} replicates (REML, random intercept for {group})...",
        replicates.len()
    );
    let fits: Vec<MixedFit> = replicates
        .par_iter()
        .map(|df| -> Result<MixedFit, AnalysisError> {
            let design = Design::build(df, formula, group)?;
            Ok(MixedFit::fit(&design, Method::Reml)?)
        })
        .collect::<Result<_, AnalysisError>>()?;
    let estimates: Vec<ReplicateEstimates> = fits
        .iter()
        .map(|fit| ReplicateEstimates {
            terms: fit.terms.clone(),
            coef: fit.coef.clone(),
            std_err: fit.std_err.clone(),
        })
        .collect();
    let variances: Vec<ReplicateEstimates> = fits
        .iter()
        .map(|fit| ReplicateEstimates {
            terms: vec![GROUP_VARIANCE_TERM.to_string()],
            coef: vec![fit.group_var],
            std_err: vec![fit.group_var_std_err],
        })
        .collect();
    if fits.iter().any(|fit| !fit.group_var_std_err.is_finite()) {
        log::warn!("The group variance sits on the boundary in some replicates; its pooled standard error is undefined.");
    }
    let Some(group_variance) = pool(&variances)?.pop() else {
        return Err(AnalysisError::NoReplicates(formula.to_string()));
    };
    Ok(PooledModel {
        formula: formula.to_string(),
        replicates: fits.len(),
        n_obs: fits[0].n_obs,
        n_groups: fits[0].n_groups,
        estimates: pool(&estimates)?,
        group_variance,
    })
}

/// Columns named `<block>_PC<k>`, in frame order.
pub fn component_columns(df: &DataFrame, block: &str) -> Vec<String> {
    let prefix = format!("{block}_PC");
    column_names(df)
        .into_iter()
        .filter(|name| {
            name.strip_prefix(&prefix)
                .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
        })
        .collect()
}

/// The formula of every step, each extending the one before.
pub fn step_formulas(
    df: &DataFrame,
    sequence: &ModelSequence,
    outcome: &str,
) -> Result<Vec<Formula>, AnalysisError> {
    let mut current = Formula::null(outcome);
    let mut formulas = Vec::with_capacity(sequence.steps.len());
    for step in &sequence.steps {
        current = current.with_fragments(&step.terms)?;
        for block in &step.components {
            let columns = component_columns(df, block);
            if columns.is_empty() {
                log::warn!(
                    "No component columns found for block '{block}' in step '{}'.",
                    step.name
                );
            }
            current = current.with_numeric(columns);
        }
        formulas.push(current.clone());
    }
    Ok(formulas)
}

/// Rows complete for every column in `columns`.
fn complete_rows(df: &DataFrame, columns: &[&str]) -> Result<DataFrame, FrameError> {
    let mut mask = vec![true; df.height()];
    for column in columns {
        for (keep, key) in mask.iter_mut().zip(key_column(df, column)?) {
            *keep &= key.is_some();
        }
    }
    filter_rows(df, &mask)
}

/// Fits every step by ML on the rows complete for the largest model, so that
/// consecutive steps are nested and comparable.
pub fn run_sequence(
    df: &DataFrame,
    sequence: &ModelSequence,
    outcome: &str,
    group: &str,
) -> Result<SequenceResult, AnalysisError> {
    let formulas = step_formulas(df, sequence, outcome)?;
    let Some(largest) = formulas.last() else {
        return Err(AnalysisError::EmptySequence(sequence.name.clone()));
    };
    let mut columns = largest.columns();
    columns.push(group);
    let rows = complete_rows(df, &columns)?;
    log::info!(
        "Sequence '{}': {} steps on {} of {} rows",
        sequence.name,
        formulas.len(),
        rows.height(),
        df.height()
    );

    let fits: Vec<MixedFit> = formulas
        .par_iter()
        .map(|formula| -> Result<MixedFit, AnalysisError> {
            let design = Design::build(&rows, formula, group)?;
            Ok(MixedFit::fit(&design, Method::Ml)?)
        })
        .collect::<Result<_, AnalysisError>>()?;

    let mut steps: Vec<StepFit> = Vec::with_capacity(fits.len());
    for ((step, formula), fit) in sequence.steps.iter().zip(&formulas).zip(fits) {
        let comparison = steps
            .last()
            .map(|previous| likelihood_ratio(&previous.name, &previous.fit, &step.name, &fit));
        steps.push(StepFit {
            name: step.name.clone(),
            formula: formula.to_string(),
            fit,
            comparison,
        });
    }
    Ok(SequenceResult {
        name: sequence.name.clone(),
        steps,
    })
}

fn stars(p: f64) -> &'static str {
    match p {
        p if p < 0.001 => "***",
        p if p < 0.01 => "**",
        p if p < 0.05 => "*",
        _ => "",
    }
}

pub fn print_pooled(model: &PooledModel) {
    println!("\n=== Pooled model (Rubin's Rules over {} replicates) ===", model.replicates);
    println!("{}", model.formula);
    println!(
        "Observations per replicate: {}, groups: {}",
        model.n_obs, model.n_groups
    );
    println!(
        "{:<36} {:>10} {:>10} {:>8} {:>10} {:>10} {:>10}",
        "Term", "Coef.", "Std.Err.", "z", "P>|z|", "[0.025", "0.975]"
    );
    for e in model.rows() {
        println!(
            "{:<36} {:>10.4} {:>10.4} {:>8.3} {:>10.4} {:>10.4} {:>10.4} {}",
            e.term,
            e.estimate,
            e.std_err,
            e.z,
            e.p_value,
            e.ci_lower,
            e.ci_upper,
            stars(e.p_value)
        );
    }
}

pub fn print_step(step: &StepFit) {
    let fit = &step.fit;
    println!("\n--- {} ({}) ---", step.name, fit.method);
    println!("{}", step.formula);
    println!(
        "n = {}, groups = {}, group var = {:.4}, residual var = {:.4}",
        fit.n_obs, fit.n_groups, fit.group_var, fit.resid_var
    );
    println!(
        "{:<36} {:>10} {:>10} {:>8} {:>10}",
        "Term", "Coef.", "Std.Err.", "z", "P>|z|"
    );
    for (i, (term, z)) in fit.terms.iter().zip(fit.z_values()).enumerate() {
        let p = two_sided_normal_p(z);
        println!(
            "{:<36} {:>10.4} {:>10.4} {:>8.3} {:>10.4} {}",
            term, fit.coef[i], fit.std_err[i], z, p, stars(p)
        );
    }
    println!(
        "Log-likelihood: {:.3}  AIC: {:.3}  BIC: {:.3}",
        fit.log_likelihood,
        fit.aic(),
        fit.bic()
    );
    if let Some(test) = &step.comparison {
        println!(
            "LR test vs {}: chi2({}) = {:.3}, p = {:.4}",
            test.reduced, test.df, test.statistic, test.p_value
        );
    }
}

pub fn pooled_frame(model: &PooledModel) -> Result<DataFrame, FrameError> {
    let column = |f: fn(&PooledEstimate) -> f64| -> Vec<f64> { model.rows().map(f).collect() };
    Ok(DataFrame::new(vec![
        Series::new(
            "Term".into(),
            model.rows().map(|e| e.term.clone()).collect::<Vec<_>>(),
        )
        .into(),
        Series::new("Coef".into(), column(|e| e.estimate)).into(),
        Series::new("StdErr".into(), column(|e| e.std_err)).into(),
        Series::new("z".into(), column(|e| e.z)).into(),
        Series::new("P".into(), column(|e| e.p_value)).into(),
        Series::new("CI_lower".into(), column(|e| e.ci_lower)).into(),
        Series::new("CI_upper".into(), column(|e| e.ci_upper)).into(),
        Series::new("WithinVar".into(), column(|e| e.within_var)).into(),
        Series::new("BetweenVar".into(), column(|e| e.between_var)).into(),
    ])?)
}

/// One row per coefficient of every step.
pub fn coefficients_frame(result: &SequenceResult) -> Result<DataFrame, FrameError> {
    let mut step = Vec::new();
    let mut term = Vec::new();
    let mut coef = Vec::new();
    let mut std_err = Vec::new();
    let mut z = Vec::new();
    let mut p = Vec::new();
    for fit in &result.steps {
        let zs = fit.fit.z_values();
        for (i, name) in fit.fit.terms.iter().enumerate() {
            step.push(fit.name.clone());
            term.push(name.clone());
            coef.push(fit.fit.coef[i]);
            std_err.push(fit.fit.std_err[i]);
            z.push(zs[i]);
            p.push(two_sided_normal_p(zs[i]));
        }
    }
    Ok(DataFrame::new(vec![
        Series::new("Model".into(), step).into(),
        Series::new("Term".into(), term).into(),
        Series::new("Coef".into(), coef).into(),
        Series::new("StdErr".into(), std_err).into(),
        Series::new("z".into(), z).into(),
        Series::new("P".into(), p).into(),
    ])?)
}

/// Fit statistics and the likelihood-ratio test of every step.
pub fn comparison_frame(result: &SequenceResult) -> Result<DataFrame, FrameError> {
    let steps = &result.steps;
    let lrt = |f: fn(&LikelihoodRatio) -> f64| -> Vec<Option<f64>> {
        steps.iter().map(|s| s.comparison.as_ref().map(f)).collect()
    };
    Ok(DataFrame::new(vec![
        Series::new(
            "Model".into(),
            steps.iter().map(|s| s.name.clone()).collect::<Vec<_>>(),
        )
        .into(),
        Series::new(
            "Observations".into(),
            steps.iter().map(|s| s.fit.n_obs as u64).collect::<Vec<_>>(),
        )
        .into(),
        Series::new(
            "Parameters".into(),
            steps.iter().map(|s| s.fit.n_params() as u64).collect::<Vec<_>>(),
        )
        .into(),
        Series::new(
            "LogLik".into(),
            steps.iter().map(|s| s.fit.log_likelihood).collect::<Vec<_>>(),
        )
        .into(),
        Series::new(
            "AIC".into(),
            steps.iter().map(|s| s.fit.aic()).collect::<Vec<_>>(),
        )
        .into(),
        Series::new(
            "BIC".into(),
            steps.iter().map(|s| s.fit.bic()).collect::<Vec<_>>(),
        )
        .into(),
        Series::new("LR_stat".into(), lrt(|t| t.statistic)).into(),
        Series::new("LR_df".into(), lrt(|t| t.df as f64)).into(),
        Series::new("LR_p".into(), lrt(|t| t.p_value)).into(),
    ])?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> DataFrame {
        let n = 60;
        let school: Vec<i64> = (0..n).map(|i| (i / 6) as i64).collect();
        let age: Vec<f64> = (0..n).map(|i| 15.0 + ((i * 7) % 12) as f64 / 12.0).collect();
        let pc1: Vec<f64> = (0..n).map(|i| (((i * 13) % 17) as f64 - 8.0) / 8.0).collect();
        let pc2: Vec<f64> = (0..n).map(|i| (((i * 5) % 11) as f64 - 5.0) / 5.0).collect();
        let y: Vec<f64> = (0..n)
            .map(|i| {
                let school_effect = [0.3, -0.2, 0.1, 0.0, -0.3, 0.2, 0.25, -0.1, 0.05, -0.15][i / 6];
                let noise = (((i * 29) % 19) as f64 - 9.0) / 30.0;
                0.4 + 0.1 * (age[i] - 15.5) + 0.3 * pc1[i] + school_effect + noise
            })
            .collect();
        DataFrame::new(vec![
            Series::new("Y".into(), y).into(),
            Series::new("AGE".into(), age).into(),
            Series::new("Mind_PC1".into(), pc1).into(),
            Series::new("Mind_PC2".into(), pc2).into(),
            Series::new("CNTSCHID".into(), school).into(),
        ])
        .unwrap()
    }

    fn sequence() -> ModelSequence {
        ModelSequence {
            name: "main".into(),
            steps: vec![
                ModelStep {
                    name: "Controls".into(),
                    terms: vec!["AGE".into()],
                    components: vec![],
                },
                ModelStep {
                    name: "Mind".into(),
                    terms: vec![],
                    components: vec!["Mind".into(), "Absent".into()],
                },
            ],
        }
    }

    #[test]
    fn component_blocks_expand_by_prefix() {
        let df = frame();
        assert_eq!(component_columns(&df, "Mind"), vec!["Mind_PC1", "Mind_PC2"]);
        assert!(component_columns(&df, "Min").is_empty());
        let formulas = step_formulas(&df, &sequence(), "Y").unwrap();
        assert_eq!(formulas[1].to_string(), "Y ~ AGE + Mind_PC1 + Mind_PC2");
    }

    #[test]
    fn nested_steps_are_compared_in_order() {
        let result = run_sequence(&frame(), &sequence(), "Y", "CNTSCHID").unwrap();
        assert_eq!(result.steps.len(), 2);
        assert!(result.steps[0].comparison.is_none());
        let test = result.steps[1].comparison.as_ref().unwrap();
        assert_eq!(test.df, 2);
        assert!(test.statistic >= 0.0);
        assert!(test.p_value < 0.05);
        let table = comparison_frame(&result).unwrap();
        assert_eq!(table.shape(), (2, 9));
        let coefficients = coefficients_frame(&result).unwrap();
        assert_eq!(coefficients.height(), 2 + 4);
    }

    #[test]
    fn pooled_model_averages_identical_replicates() {
        let df = frame();
        let formula = Formula::parse("Y ~ AGE").unwrap();
        let model = fit_pooled(&[df.clone(), df], &formula, "CNTSCHID").unwrap();
        assert_eq!(model.replicates, 2);
        assert!(model.rows().all(|e| e.between_var == 0.0));
        assert_eq!(model.group_variance.term, GROUP_VARIANCE_TERM);
        assert_eq!(pooled_frame(&model).unwrap().height(), 3);
    }
}
