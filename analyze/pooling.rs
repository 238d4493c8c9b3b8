//! Rubin's Rules for combining estimates across imputed replicates.

use crate::shared::stats::two_sided_normal_p;
use serde::Serialize;
use thiserror::Error;

/// Normal quantile for a two-sided 95% interval.
pub const Z_95: f64 = 1.96;

#[derive(Error, Debug, PartialEq)]
pub enum PoolingError {
    #[error("No replicate estimates were supplied.")]
    NoReplicates,
    #[error("Replicate {replicate} has terms {found:?}, expected {expected:?}.")]
    TermMismatch {
        replicate: usize,
        expected: Vec<String>,
        found: Vec<String>,
    },
    #[error("Replicate {replicate} has {coefficients} coefficients but {std_errors} standard errors.")]
    LengthMismatch {
        replicate: usize,
        coefficients: usize,
        std_errors: usize,
    },
}

/// Coefficients and standard errors of one replicate fit.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicateEstimates {
    pub terms: Vec<String>,
    pub coef: Vec<f64>,
    pub std_err: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PooledEstimate {
    pub term: String,
    pub estimate: f64,
    pub std_err: f64,
    pub z: f64,
    pub p_value: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
    /// Mean of the squared replicate standard errors.
    pub within_var: f64,
    /// Sample variance of the replicate estimates.
    pub between_var: f64,
}

/// Pools per-replicate estimates. Every replicate must carry the same terms
/// in the same order. With a single replicate the between variance is zero.
pub fn pool(replicates: &[ReplicateEstimates]) -> Result<Vec<PooledEstimate>, PoolingError> {
    let first = replicates.first().ok_or(PoolingError::NoReplicates)?;
    for (index, replicate) in replicates.iter().enumerate() {
        if replicate.terms != first.terms {
            return Err(PoolingError::TermMismatch {
                replicate: index + 1,
                expected: first.terms.clone(),
                found: replicate.terms.clone(),
            });
        }
        if replicate.coef.len() != replicate.terms.len()
            || replicate.std_err.len() != replicate.terms.len()
        {
            return Err(PoolingError::LengthMismatch {
                replicate: index + 1,
                coefficients: replicate.coef.len(),
                std_errors: replicate.std_err.len(),
            });
        }
    }

    let m = replicates.len() as f64;
    let pooled = first
        .terms
        .iter()
        .enumerate()
        .map(|(k, term)| {
            let estimate = replicates.iter().map(|r| r.coef[k]).sum::<f64>() / m;
            let within_var = replicates.iter().map(|r| r.std_err[k].powi(2)).sum::<f64>() / m;
            let between_var = if replicates.len() > 1 {
                replicates
                    .iter()
                    .map(|r| (r.coef[k] - estimate).powi(2))
                    .sum::<f64>()
                    / (m - 1.0)
            } else {
                0.0
            };
            let total_var = within_var + (1.0 + 1.0 / m) * between_var;
            let std_err = total_var.sqrt();
            let z = estimate / std_err;
            PooledEstimate {
                term: term.clone(),
                estimate,
                std_err,
                z,
                p_value: two_sided_normal_p(z),
                ci_lower: estimate - Z_95 * std_err,
                ci_upper: estimate + Z_95 * std_err,
                within_var,
                between_var,
            }
        })
        .collect();
    Ok(pooled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn replicate(coef: [f64; 2], std_err: [f64; 2]) -> ReplicateEstimates {
        ReplicateEstimates {
            terms: vec!["Intercept".into(), "AGE".into()],
            coef: coef.to_vec(),
            std_err: std_err.to_vec(),
        }
    }

    #[test]
    fn pooled_values_follow_rubins_rules() {
        let pooled = pool(&[
            replicate([1.0, 0.2], [0.1, 0.05]),
            replicate([1.2, 0.4], [0.1, 0.05]),
            replicate([1.4, 0.3], [0.1, 0.05]),
        ])
        .unwrap();
        let age = &pooled[1];
        assert_abs_diff_eq!(age.estimate, 0.3, epsilon = 1e-12);
        assert_abs_diff_eq!(age.within_var, 0.0025, epsilon = 1e-12);
        assert_abs_diff_eq!(age.between_var, 0.01, epsilon = 1e-12);
        let total: f64 = 0.0025 + (1.0 + 1.0 / 3.0) * 0.01;
        assert_abs_diff_eq!(age.std_err, total.sqrt(), epsilon = 1e-12);
        assert_abs_diff_eq!(age.ci_upper - age.ci_lower, 2.0 * 1.96 * total.sqrt(), epsilon = 1e-12);
        assert!(age.p_value > 0.0 && age.p_value < 0.05);
    }

    #[test]
    fn single_replicate_has_no_between_variance() {
        let pooled = pool(&[replicate([1.0, 0.5], [0.2, 0.25])]).unwrap();
        assert_eq!(pooled[1].between_var, 0.0);
        assert_abs_diff_eq!(pooled[1].std_err, 0.25, epsilon = 1e-12);
        assert_abs_diff_eq!(pooled[1].z, 2.0, epsilon = 1e-12);
    }

    #[test]
    fn mismatched_terms_and_empty_input_are_errors() {
        assert_eq!(pool(&[]), Err(PoolingError::NoReplicates));
        let mut other = replicate([1.0, 0.5], [0.2, 0.25]);
        other.terms[1] = "C(CNT)[T.TUR]".into();
        assert!(matches!(
            pool(&[replicate([1.0, 0.5], [0.2, 0.25]), other]),
            Err(PoolingError::TermMismatch { replicate: 2, .. })
        ));
    }
}
