use approx::assert_abs_diff_eq;
use polars::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use resilience::analyze::design::Design;
use resilience::analyze::formula::Formula;
use resilience::analyze::mixed::{Method, MixedFit};
use resilience::analyze::pooling::{PoolingError, ReplicateEstimates, pool};
use resilience::analyze::runner::{GROUP_VARIANCE_TERM, fit_pooled, pooled_frame};
use resilience::shared::frame::{numeric_column, text_column};

/// One replicate: shared structure plus replicate-specific jitter in `AGE`.
fn replicate(seed: u64, jitter: f64) -> DataFrame {
    let mut base = StdRng::seed_from_u64(99);
    let mut own = StdRng::seed_from_u64(seed);
    let n_schools = 25;
    let per_school = 16;
    let mut outcome = Vec::new();
    let mut age = Vec::new();
    let mut country = Vec::new();
    let mut school = Vec::new();
    for s in 0..n_schools {
        let effect: f64 = base.gen_range(-0.3..0.3);
        for _ in 0..per_school {
            let true_age: f64 = base.gen_range(15.2..16.3);
            let observed = true_age + jitter * own.gen_range(-0.5..0.5);
            let tur = s % 2 == 0;
            let shift = if tur { 0.15 } else { 0.0 };
            let signal = 0.4 * (true_age - 15.75) + shift + effect;
            outcome.push(if signal + base.gen_range(-0.5..0.5) > 0.1 { 1i64 } else { 0 });
            age.push(observed);
            country.push(if tur { "TUR" } else { "HKG" });
            school.push(7_920_000 + s as i64);
        }
    }
    DataFrame::new(vec![
        Series::new("ACADEMIC_RESILIENCE".into(), outcome).into(),
        Series::new("AGE".into(), age).into(),
        Series::new("CNT".into(), country).into(),
        Series::new("CNTSCHID".into(), school).into(),
    ])
    .unwrap()
}

#[test]
fn identical_replicates_pool_to_the_single_fit() {
    let formula = Formula::parse("ACADEMIC_RESILIENCE ~ AGE + C(CNT)").unwrap();
    let single = fit_pooled(&[replicate(1, 0.0)], &formula, "CNTSCHID").unwrap();
    let copies: Vec<DataFrame> = (0..3).map(|_| replicate(1, 0.0)).collect();
    let pooled = fit_pooled(&copies, &formula, "CNTSCHID").unwrap();

    assert_eq!(pooled.replicates, 3);
    assert_eq!(pooled.n_obs, 400);
    let terms: Vec<&str> = pooled.estimates.iter().map(|e| e.term.as_str()).collect();
    assert_eq!(terms, vec!["Intercept", "AGE", "C(CNT)[T.TUR]"]);
    for (one, many) in single.estimates.iter().zip(&pooled.estimates) {
        assert_abs_diff_eq!(one.estimate, many.estimate, epsilon = 1e-10);
        assert_abs_diff_eq!(one.std_err, many.std_err, epsilon = 1e-10);
        assert_abs_diff_eq!(many.between_var, 0.0, epsilon = 1e-20);
    }
}

#[test]
fn disagreement_between_replicates_widens_intervals() {
    let formula = Formula::parse("ACADEMIC_RESILIENCE ~ AGE + C(CNT)").unwrap();
    let replicates: Vec<DataFrame> = (1..=5).map(|seed| replicate(seed, 0.6)).collect();
    let pooled = fit_pooled(&replicates, &formula, "CNTSCHID").unwrap();

    let age = &pooled.estimates[1];
    assert!(age.between_var > 0.0);
    let total = age.within_var + 1.2 * age.between_var;
    assert_abs_diff_eq!(age.std_err, total.sqrt(), epsilon = 1e-12);
    assert!(age.std_err > age.within_var.sqrt());
    assert_abs_diff_eq!(age.ci_lower, age.estimate - 1.96 * age.std_err, epsilon = 1e-12);

    let frame = pooled_frame(&pooled).unwrap();
    assert_eq!(frame.height(), 4);
    assert_eq!(frame.width(), 9);
}

#[test]
fn school_variance_is_pooled_as_its_own_row() {
    let formula = Formula::parse("ACADEMIC_RESILIENCE ~ AGE + C(CNT)").unwrap();
    let replicates: Vec<DataFrame> = (1..=4).map(|seed| replicate(seed, 0.6)).collect();
    let pooled = fit_pooled(&replicates, &formula, "CNTSCHID").unwrap();

    let per_replicate: Vec<MixedFit> = replicates
        .iter()
        .map(|df| {
            let design = Design::build(df, &formula, "CNTSCHID").unwrap();
            MixedFit::fit(&design, Method::Reml).unwrap()
        })
        .collect();
    let mean = per_replicate.iter().map(|fit| fit.group_var).sum::<f64>() / 4.0;
    let variance = &pooled.group_variance;
    assert_eq!(variance.term, GROUP_VARIANCE_TERM);
    assert_abs_diff_eq!(variance.estimate, mean, epsilon = 1e-10);
    assert!(variance.estimate >= 0.0);

    let frame = pooled_frame(&pooled).unwrap();
    let terms = text_column(&frame, "Term").unwrap();
    assert_eq!(terms[3].as_deref(), Some("School Var (Random Effect)"));
    let coef = numeric_column(&frame, "Coef").unwrap();
    assert_abs_diff_eq!(coef[3], mean, epsilon = 1e-10);
}

#[test]
fn rubins_rules_hold_for_random_replicate_sets() {
    let mut rng = StdRng::seed_from_u64(2022);
    for _ in 0..300 {
        let m = rng.gen_range(1..=8);
        let n_terms = rng.gen_range(1..=4);
        let terms: Vec<String> = (0..n_terms).map(|k| format!("X{k}")).collect();
        let replicates: Vec<ReplicateEstimates> = (0..m)
            .map(|_| ReplicateEstimates {
                terms: terms.clone(),
                coef: (0..n_terms).map(|_| rng.gen_range(-3.0..3.0)).collect(),
                std_err: (0..n_terms).map(|_| rng.gen_range(0.01..1.5)).collect(),
            })
            .collect();
        let pooled = pool(&replicates).unwrap();
        assert_eq!(pooled.len(), n_terms);

        for (k, estimate) in pooled.iter().enumerate() {
            let mean = replicates.iter().map(|r| r.coef[k]).sum::<f64>() / m as f64;
            let within = replicates.iter().map(|r| r.std_err[k].powi(2)).sum::<f64>() / m as f64;
            assert_abs_diff_eq!(estimate.estimate, mean, epsilon = 1e-12);
            assert_abs_diff_eq!(estimate.within_var, within, epsilon = 1e-12);
            assert!(estimate.std_err.powi(2) >= estimate.within_var - 1e-12);
            if m == 1 {
                assert_eq!(estimate.between_var, 0.0);
                assert_abs_diff_eq!(estimate.std_err, replicates[0].std_err[k], epsilon = 1e-12);
            } else {
                assert!(estimate.between_var >= 0.0);
            }
            assert!((0.0..=1.0).contains(&estimate.p_value));
            assert_abs_diff_eq!(
                estimate.estimate - estimate.ci_lower,
                estimate.ci_upper - estimate.estimate,
                epsilon = 1e-12
            );
        }
    }
}

#[test]
fn term_sets_must_agree_across_replicates() {
    let estimates = |terms: &[&str]| ReplicateEstimates {
        terms: terms.iter().map(|t| t.to_string()).collect(),
        coef: vec![0.1; terms.len()],
        std_err: vec![0.05; terms.len()],
    };
    let result = pool(&[
        estimates(&["Intercept", "C(IMMIG)[T.2]", "C(IMMIG)[T.3]"]),
        estimates(&["Intercept", "C(IMMIG)[T.2]"]),
    ]);
    match result {
        Err(PoolingError::TermMismatch {
            replicate,
            expected,
            found,
        }) => {
            assert_eq!(replicate, 2);
            assert_eq!(expected.len(), 3);
            assert_eq!(found.len(), 2);
        }
        other => panic!("expected a term mismatch, got {other:?}"),
    }
}
