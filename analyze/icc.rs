//! Intraclass correlation from intercept-only random-intercept models.
//!
//! Replicate ICCs are combined by their arithmetic mean, not by Rubin's Rules.

use super::AnalysisError;
use super::design::Design;
use super::formula::Formula;
use super::mixed::{Method, MixedFit};
use crate::shared::frame::FrameError;
use polars::prelude::*;
use rayon::prelude::*;
use serde::Serialize;
use std::f64::consts::PI;

/// Variance of the standard logistic distribution.
pub const LOGISTIC_RESIDUAL_VAR: f64 = PI * PI / 3.0;

/// ICC above which a multilevel model is considered warranted.
pub const MULTILEVEL_THRESHOLD: f64 = 0.05;

#[derive(Debug, Clone, Serialize)]
pub struct IccSummary {
    pub level: String,
    pub grouping: String,
    pub replicates: usize,
    pub n_groups: usize,
    pub group_var: f64,
    pub resid_var: f64,
    pub icc: f64,
    /// The group variance against the logistic residual variance.
    pub logit_icc: f64,
}

impl IccSummary {
    pub fn justifies_multilevel(&self) -> bool {
        self.icc > MULTILEVEL_THRESHOLD
    }

    pub fn interpretation(&self) -> String {
        let verdict = if self.justifies_multilevel() {
            "a multilevel model is justified"
        } else {
            "a multilevel model may not be necessary"
        };
        format!(
            "{:.2}% of the variance in the outcome lies between {} units ({} groups); ICC {} {:.2}, so {verdict}.",
            100.0 * self.icc,
            self.level,
            self.n_groups,
            if self.justifies_multilevel() { ">" } else { "<=" },
            MULTILEVEL_THRESHOLD
        )
    }
}

pub fn logit_icc(group_var: f64) -> f64 {
    group_var / (group_var + LOGISTIC_RESIDUAL_VAR)
}

/// Fits `outcome ~ 1` with a random intercept for `grouping` by REML.
pub fn null_model(df: &DataFrame, outcome: &str, grouping: &str) -> Result<MixedFit, AnalysisError> {
    let design = Design::build(df, &Formula::null(outcome), grouping)?;
    Ok(MixedFit::fit(&design, Method::Reml)?)
}

/// Null-model ICC for every replicate, averaged.
pub fn pooled_icc(
    replicates: &[DataFrame],
    level: &str,
    outcome: &str,
    grouping: &str,
) -> Result<IccSummary, AnalysisError> {
    if replicates.is_empty() {
        return Err(AnalysisError::NoReplicates(grouping.to_string()));
    }
    let fits: Vec<MixedFit> = replicates
        .par_iter()
        .map(|df| null_model(df, outcome, grouping))
        .collect::<Result<_, _>>()?;
    let m = fits.len() as f64;
    let mean = |f: fn(&MixedFit) -> f64| fits.iter().map(f).sum::<f64>() / m;
    let group_var = mean(|fit| fit.group_var);
    let summary = IccSummary {
        level: level.to_string(),
        grouping: grouping.to_string(),
        replicates: fits.len(),
        n_groups: fits[0].n_groups,
        group_var,
        resid_var: mean(|fit| fit.resid_var),
        icc: mean(MixedFit::icc),
        logit_icc: logit_icc(group_var),
    };
    log::info!(
        "{} level ICC: {:.4} (logit scale {:.4}) over {} replicates",
        level,
        summary.icc,
        summary.logit_icc,
        summary.replicates
    );
    Ok(summary)
}

pub fn summary_frame(summaries: &[IccSummary]) -> Result<DataFrame, FrameError> {
    let number = |f: fn(&IccSummary) -> f64| -> Vec<f64> { summaries.iter().map(f).collect() };
    Ok(DataFrame::new(vec![
        Series::new(
            "Level".into(),
            summaries.iter().map(|s| s.level.clone()).collect::<Vec<_>>(),
        )
        .into(),
        Series::new(
            "Grouping".into(),
            summaries.iter().map(|s| s.grouping.clone()).collect::<Vec<_>>(),
        )
        .into(),
        Series::new(
            "Replicates".into(),
            summaries.iter().map(|s| s.replicates as u64).collect::<Vec<_>>(),
        )
        .into(),
        Series::new(
            "Groups".into(),
            summaries.iter().map(|s| s.n_groups as u64).collect::<Vec<_>>(),
        )
        .into(),
        Series::new("GroupVariance".into(), number(|s| s.group_var)).into(),
        Series::new("ResidualVariance".into(), number(|s| s.resid_var)).into(),
        Series::new("ICC".into(), number(|s| s.icc)).into(),
        Series::new("ICC_logit".into(), number(|s| s.logit_icc)).into(),
        Series::new(
            "Multilevel".into(),
            summaries.iter().map(IccSummary::justifies_multilevel).collect::<Vec<_>>(),
        )
        .into(),
    ])?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn replicate(shift: f64) -> DataFrame {
        let schools: Vec<i64> = (0..40).map(|i| i / 8).collect();
        let offsets = [0.0, 0.2, 0.9, 0.4, 0.7];
        let outcome: Vec<f64> = (0..40)
            .map(|i| {
                let noise = ((i * 37) % 11) as f64 / 22.0;
                offsets[i / 8] + noise + shift
            })
            .collect();
        DataFrame::new(vec![
            Series::new("ACADEMIC_RESILIENCE".into(), outcome).into(),
            Series::new("CNTSCHID".into(), schools).into(),
        ])
        .unwrap()
    }

    #[test]
    fn icc_is_a_proportion_averaged_over_replicates() {
        let replicates = vec![replicate(0.0), replicate(0.05)];
        let summary = pooled_icc(&replicates, "School", "ACADEMIC_RESILIENCE", "CNTSCHID").unwrap();
        assert_eq!(summary.replicates, 2);
        assert_eq!(summary.n_groups, 5);
        assert!((0.0..=1.0).contains(&summary.icc));
        assert!(summary.justifies_multilevel());
        // A constant shift changes nothing, so both replicates agree.
        let single = null_model(&replicates[0], "ACADEMIC_RESILIENCE", "CNTSCHID").unwrap();
        assert_abs_diff_eq!(summary.icc, single.icc(), epsilon = 1e-4);
        assert!(summary.interpretation().contains("multilevel model is justified"));
    }

    #[test]
    fn logit_icc_uses_the_logistic_residual() {
        assert_abs_diff_eq!(logit_icc(LOGISTIC_RESIDUAL_VAR), 0.5, epsilon = 1e-12);
        assert_eq!(logit_icc(0.0), 0.0);
    }

    #[test]
    fn summary_frame_has_one_row_per_level() {
        let summary = IccSummary {
            level: "Country".into(),
            grouping: "CNT".into(),
            replicates: 5,
            n_groups: 2,
            group_var: 0.01,
            resid_var: 0.2,
            icc: 0.01 / 0.21,
            logit_icc: logit_icc(0.01),
        };
        let df = summary_frame(&[summary]).unwrap();
        assert_eq!(df.shape(), (1, 9));
    }
}
