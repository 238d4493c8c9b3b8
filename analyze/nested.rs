//! Likelihood-ratio comparison of nested models fitted by maximum likelihood.

use super::mixed::{Method, MixedFit};
use crate::shared::stats::chi_square_survival;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LikelihoodRatio {
    pub reduced: String,
    pub full: String,
    pub statistic: f64,
    pub df: usize,
    pub p_value: f64,
}

/// `2 (ℓ_full − ℓ_reduced)` on `k_full − k_reduced` degrees of freedom.
/// REML likelihoods of models with different fixed effects are not
/// comparable, so a REML input is logged.
pub fn likelihood_ratio(
    reduced_name: &str,
    reduced: &MixedFit,
    full_name: &str,
    full: &MixedFit,
) -> LikelihoodRatio {
    if reduced.method == Method::Reml || full.method == Method::Reml {
        log::warn!("Comparing REML fits '{reduced_name}' and '{full_name}'; use ML for nested tests.");
    }
    if reduced.n_obs != full.n_obs {
        log::warn!(
            "Models '{reduced_name}' ({} rows) and '{full_name}' ({} rows) were fitted on different rows.",
            reduced.n_obs,
            full.n_obs
        );
    }
    let statistic = (2.0 * (full.log_likelihood - reduced.log_likelihood)).max(0.0);
    let df = full.n_params().saturating_sub(reduced.n_params());
    LikelihoodRatio {
        reduced: reduced_name.to_string(),
        full: full_name.to_string(),
        statistic,
        df,
        p_value: chi_square_survival(statistic, df),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn fit(log_likelihood: f64, n_coef: usize) -> MixedFit {
        MixedFit {
            terms: (0..n_coef).map(|i| format!("x{i}")).collect(),
            coef: vec![0.0; n_coef],
            std_err: vec![1.0; n_coef],
            group_var: 0.1,
            group_var_std_err: 0.05,
            resid_var: 1.0,
            log_likelihood,
            method: Method::Ml,
            n_obs: 100,
            n_groups: 10,
        }
    }

    #[test]
    fn statistic_and_df_come_from_the_difference() {
        let test = likelihood_ratio("B", &fit(-120.0, 3), "C", &fit(-115.0, 5));
        assert_abs_diff_eq!(test.statistic, 10.0, epsilon = 1e-12);
        assert_eq!(test.df, 2);
        // exp(-5) is the chi-square(2) tail at 10.
        assert_abs_diff_eq!(test.p_value, (-5.0f64).exp(), epsilon = 1e-9);
    }

    #[test]
    fn statistic_is_never_negative() {
        let test = likelihood_ratio("B", &fit(-100.0, 3), "C", &fit(-100.5, 4));
        assert_eq!(test.statistic, 0.0);
        assert_abs_diff_eq!(test.p_value, 1.0, epsilon = 1e-12);
    }
}
