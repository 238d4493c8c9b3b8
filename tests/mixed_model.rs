use approx::assert_abs_diff_eq;
use ndarray::{Array1, Array2};
use polars::prelude::*;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use resilience::analyze::design::Design;
use resilience::analyze::formula::Formula;
use resilience::analyze::mixed::{Method, MixedFit};
use resilience::analyze::nested::likelihood_ratio;
use resilience::analyze::runner::{ModelSequence, ModelStep, run_sequence};

struct Simulated {
    x: Array2<f64>,
    y: Array1<f64>,
    noise: Vec<f64>,
    groups: Vec<usize>,
    n_groups: usize,
}

/// `y = 2 + 0.5 x + u_g + e` with `u ~ N(0, 1)` and `e ~ N(0, 0.25)`.
fn simulate(n_groups: usize, per_group: usize, seed: u64) -> Simulated {
    let mut rng = StdRng::seed_from_u64(seed);
    let standard = Normal::new(0.0, 1.0).unwrap();
    let residual = Normal::new(0.0, 0.5).unwrap();
    let n = n_groups * per_group;
    let mut x = Array2::zeros((n, 2));
    let mut y = Array1::zeros(n);
    let mut noise = Vec::with_capacity(n);
    let mut groups = Vec::with_capacity(n);
    for g in 0..n_groups {
        let effect = standard.sample(&mut rng);
        for i in 0..per_group {
            let row = g * per_group + i;
            let covariate = standard.sample(&mut rng);
            x[[row, 0]] = 1.0;
            x[[row, 1]] = covariate;
            y[row] = 2.0 + 0.5 * covariate + effect + residual.sample(&mut rng);
            noise.push(standard.sample(&mut rng));
            groups.push(g);
        }
    }
    Simulated {
        x,
        y,
        noise,
        groups,
        n_groups,
    }
}

fn terms() -> Vec<String> {
    vec!["Intercept".to_string(), "x".to_string()]
}

#[test]
fn variance_components_are_recovered() {
    let data = simulate(80, 25, 7);
    let fit = MixedFit::fit_arrays(
        terms(),
        data.x.view(),
        data.y.view(),
        &data.groups,
        data.n_groups,
        Method::Reml,
    )
    .unwrap();

    assert_abs_diff_eq!(fit.coef[1], 0.5, epsilon = 0.05);
    assert_abs_diff_eq!(fit.coef[0], 2.0, epsilon = 0.35);
    assert_abs_diff_eq!(fit.resid_var, 0.25, epsilon = 0.03);
    assert!(fit.group_var > 0.6 && fit.group_var < 1.5, "group var {}", fit.group_var);
    assert!(fit.icc() > 0.7 && fit.icc() < 0.9);
    assert!(fit.std_err.iter().all(|s| *s > 0.0));
    assert_eq!(fit.n_params(), 4);
}

#[test]
fn reml_variance_is_not_below_ml() {
    let data = simulate(15, 10, 3);
    let fit = |method| {
        MixedFit::fit_arrays(
            terms(),
            data.x.view(),
            data.y.view(),
            &data.groups,
            data.n_groups,
            method,
        )
        .unwrap()
    };
    let ml = fit(Method::Ml);
    let reml = fit(Method::Reml);
    assert!(reml.group_var >= ml.group_var * 0.999);
    assert_abs_diff_eq!(reml.coef[1], ml.coef[1], epsilon = 0.02);
}

#[test]
fn groups_without_between_variance_reduce_to_least_squares() {
    // Every group has the same mean, so the random-intercept variance is zero
    // and the fixed effects are the ordinary least-squares solution.
    let per_group = [-1.5, -0.5, 0.5, 1.5];
    let n_groups = 6;
    let n = n_groups * per_group.len();
    let mut x = Array2::zeros((n, 2));
    let mut y = Array1::zeros(n);
    let mut groups = Vec::with_capacity(n);
    for g in 0..n_groups {
        let sign = if g % 2 == 0 { 1.0 } else { -1.0 };
        for (i, &covariate) in per_group.iter().enumerate() {
            let row = g * per_group.len() + i;
            x[[row, 0]] = 1.0;
            x[[row, 1]] = covariate;
            y[row] = 1.0 + 2.0 * covariate + sign * if i % 2 == 0 { 0.3 } else { -0.3 };
            groups.push(g);
        }
    }
    let fit = MixedFit::fit_arrays(terms(), x.view(), y.view(), &groups, n_groups, Method::Ml)
        .unwrap();
    assert!(fit.group_var < 1e-3, "group var {}", fit.group_var);
    assert_abs_diff_eq!(fit.coef[0], 1.0, epsilon = 1e-3);
    assert_abs_diff_eq!(fit.coef[1], 2.0, epsilon = 0.05);
}

#[test]
fn likelihood_ratio_detects_real_and_ignores_noise_terms() {
    let data = simulate(40, 15, 21);
    let intercept_only = data.x.slice(ndarray::s![.., 0..1]).to_owned();
    let mut with_noise = Array2::zeros((data.y.len(), 3));
    with_noise.slice_mut(ndarray::s![.., 0..2]).assign(&data.x);
    for (row, value) in data.noise.iter().enumerate() {
        with_noise[[row, 2]] = *value;
    }

    let fit = |names: Vec<String>, x: &Array2<f64>| {
        MixedFit::fit_arrays(
            names,
            x.view(),
            data.y.view(),
            &data.groups,
            data.n_groups,
            Method::Ml,
        )
        .unwrap()
    };
    let null = fit(vec!["Intercept".into()], &intercept_only);
    let full = fit(terms(), &data.x);
    let noisy = fit(
        vec!["Intercept".into(), "x".into(), "noise".into()],
        &with_noise,
    );

    let real = likelihood_ratio("null", &null, "x", &full);
    assert_eq!(real.df, 1);
    assert!(real.statistic > 50.0);
    assert!(real.p_value < 1e-10);

    let spurious = likelihood_ratio("x", &full, "noise", &noisy);
    assert_eq!(spurious.df, 1);
    assert!(spurious.statistic >= 0.0);
    assert!(spurious.p_value > 1e-4);
}

#[test]
fn sequence_fits_categorical_terms_on_a_frame() {
    let data = simulate(30, 12, 5);
    let n = data.y.len();
    let levels = ["1", "2", "3"];
    let category: Vec<&str> = (0..n).map(|i| levels[i % 3]).collect();
    let mut outcome = data.y.to_vec();
    for (value, level) in outcome.iter_mut().zip(&category) {
        if *level == "3" {
            *value += 1.0;
        }
    }
    let mut covariate: Vec<Option<f64>> = data.x.column(1).iter().map(|v| Some(*v)).collect();
    covariate[0] = None;
    let school: Vec<i64> = data.groups.iter().map(|g| 9000 + *g as i64).collect();
    let df = DataFrame::new(vec![
        Series::new("Y".into(), outcome).into(),
        Series::new("AGE".into(), covariate).into(),
        Series::new("IMMIG".into(), category).into(),
        Series::new("Noise_PC1".into(), data.noise.clone()).into(),
        Series::new("CNTSCHID".into(), school).into(),
    ])
    .unwrap();

    let formula = Formula::parse("Y ~ AGE + C(IMMIG)").unwrap();
    let design = Design::build(&df, &formula, "CNTSCHID").unwrap();
    assert_eq!(
        design.names,
        vec!["Intercept", "AGE", "C(IMMIG)[T.2]", "C(IMMIG)[T.3]"]
    );
    assert_eq!(design.dropped_rows, 1);
    assert_eq!(design.n_groups, 30);

    let sequence = ModelSequence {
        name: "demo".to_string(),
        steps: vec![
            ModelStep {
                name: "Controls".to_string(),
                terms: vec!["AGE + C(IMMIG)".to_string()],
                components: Vec::new(),
            },
            ModelStep {
                name: "Noise".to_string(),
                terms: Vec::new(),
                components: vec!["Noise".to_string()],
            },
        ],
    };
    let result = run_sequence(&df, &sequence, "Y", "CNTSCHID").unwrap();
    assert_eq!(result.steps.len(), 2);
    let controls = &result.steps[0].fit;
    let noise = &result.steps[1].fit;
    assert_eq!(controls.n_obs, n - 1);
    assert_eq!(noise.n_obs, n - 1);
    assert_eq!(noise.terms.last().map(String::as_str), Some("Noise_PC1"));
    assert_abs_diff_eq!(
        controls.coefficient("C(IMMIG)[T.3]").unwrap(),
        1.0,
        epsilon = 0.15
    );
    let comparison = result.steps[1].comparison.as_ref().unwrap();
    assert_eq!(comparison.reduced, "Controls");
    assert_eq!(comparison.df, 1);
    assert!(comparison.statistic >= 0.0);
    assert!(result.steps[0].comparison.is_none());
}
