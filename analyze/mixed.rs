//! # Random-Intercept Linear Mixed Model
//!
//! `y = Xβ + u_g + ε` with `u_g ~ N(0, σ²_u)` and `ε ~ N(0, σ²)`.
//!
//! Writing `λ = σ²_u / σ²`, the marginal covariance of group `g` is
//! `σ²(I + λ11ᵀ)` and its inverse has the closed form
//! `(I − w_g 11ᵀ)/σ²` with `w_g = λ / (1 + n_g λ)`. The generalised cross
//! products therefore only need per-group sums, and for a fixed `λ` both β and
//! σ² have closed-form maximisers. The fit optimises the profiled likelihood
//! over `θ = ln λ`: a coarse grid first, then BFGS from the best grid point,
//! with the boundary `λ = 0` checked explicitly.
//!
//! The standard error of σ²_u comes from the observed information of the two
//! variance components, by central differences of the log-likelihood with β
//! profiled out.

use super::design::Design;
use crate::shared::linalg::{cholesky_inverse, cholesky_log_det, cholesky_solve};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, array};
use ndarray_linalg::error::LinalgError;
use ndarray_linalg::{Cholesky, UPLO};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use wolfe_bfgs::{Bfgs, BfgsSolution};

const THETA_MIN: f64 = -20.0;
const THETA_MAX: f64 = 12.0;
const GRID_START: f64 = -12.0;
const GRID_END: f64 = 8.0;
const GRID_STEP: f64 = 0.5;
const GRADIENT_STEP: f64 = 1e-5;
/// Relative step of the variance-component curvature.
const CURVATURE_STEP: f64 = 1e-4;
const PENALTY: f64 = 1e10;

#[derive(Error, Debug)]
pub enum MixedError {
    #[error("The model has {n_params} fixed effects but only {n_obs} observations.")]
    TooFewObservations { n_obs: usize, n_params: usize },
    #[error("A random intercept needs at least two groups; found {0}.")]
    TooFewGroups(usize),
    #[error("The fixed-effects cross-product matrix is not positive definite: {0}")]
    Singular(#[from] LinalgError),
    #[error("Group index {index} is out of range for {n_groups} groups.")]
    BadGroup { index: usize, n_groups: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    Reml,
    Ml,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Reml => write!(f, "REML"),
            Method::Ml => write!(f, "ML"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MixedFit {
    pub terms: Vec<String>,
    pub coef: Vec<f64>,
    pub std_err: Vec<f64>,
    /// Random-intercept variance σ²_u.
    pub group_var: f64,
    /// `NaN` when σ²_u sits on the boundary or the curvature is not concave.
    pub group_var_std_err: f64,
    /// Residual variance σ².
    pub resid_var: f64,
    pub log_likelihood: f64,
    pub method: Method,
    pub n_obs: usize,
    pub n_groups: usize,
}

impl MixedFit {
    /// Fits the design's formula with a random intercept per design group.
    pub fn fit(design: &Design, method: Method) -> Result<Self, MixedError> {
        Self::fit_arrays(
            design.names.clone(),
            design.x.view(),
            design.y.view(),
            &design.groups,
            design.n_groups,
            method,
        )
    }

    pub fn fit_arrays(
        terms: Vec<String>,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        groups: &[usize],
        n_groups: usize,
        method: Method,
    ) -> Result<Self, MixedError> {
        let (n, p) = x.dim();
        if n <= p {
            return Err(MixedError::TooFewObservations {
                n_obs: n,
                n_params: p,
            });
        }
        if n_groups < 2 {
            return Err(MixedError::TooFewGroups(n_groups));
        }
        if let Some(&index) = groups.iter().find(|&&g| g >= n_groups) {
            return Err(MixedError::BadGroup { index, n_groups });
        }

        let profile = Arc::new(Profile::new(x, y, groups, n_groups, method));
        let lambda = optimise_ratio(&profile);
        let evaluation = profile.evaluate(lambda)?;

        let covariance = cholesky_inverse(evaluation.factor.view()) * evaluation.sigma2;
        let std_err = covariance.diag().iter().map(|v| v.max(0.0).sqrt()).collect();
        let group_var = lambda * evaluation.sigma2;
        Ok(Self {
            terms,
            coef: evaluation.beta.to_vec(),
            std_err,
            group_var,
            group_var_std_err: group_variance_std_err(&profile, group_var, evaluation.sigma2),
            resid_var: evaluation.sigma2,
            log_likelihood: evaluation.log_likelihood,
            method,
            n_obs: n,
            n_groups,
        })
    }

    /// Fixed effects plus the two variance components.
    pub fn n_params(&self) -> usize {
        self.coef.len() + 2
    }

    pub fn aic(&self) -> f64 {
        -2.0 * self.log_likelihood + 2.0 * self.n_params() as f64
    }

    pub fn bic(&self) -> f64 {
        -2.0 * self.log_likelihood + self.n_params() as f64 * (self.n_obs as f64).ln()
    }

    /// Share of the total variance lying between groups.
    pub fn icc(&self) -> f64 {
        let total = self.group_var + self.resid_var;
        if total > 0.0 { self.group_var / total } else { 0.0 }
    }

    pub fn z_values(&self) -> Vec<f64> {
        self.coef
            .iter()
            .zip(&self.std_err)
            .map(|(c, s)| if *s > 0.0 { c / s } else { f64::NAN })
            .collect()
    }

    pub fn coefficient(&self, term: &str) -> Option<f64> {
        self.terms
            .iter()
            .position(|t| t == term)
            .map(|i| self.coef[i])
    }
}

/// Sufficient statistics of the data for every variance ratio.
struct Profile {
    xtx: Array2<f64>,
    xty: Array1<f64>,
    yty: f64,
    sizes: Vec<f64>,
    /// Per-group column sums of X, one row per group.
    group_x: Array2<f64>,
    group_y: Array1<f64>,
    n: usize,
    p: usize,
    method: Method,
}

struct Evaluation {
    log_likelihood: f64,
    beta: Array1<f64>,
    sigma2: f64,
    /// Lower Cholesky factor of `Xᵀ V⁻¹ X` with `V` scaled by σ².
    factor: Array2<f64>,
}

impl Profile {
    fn new(
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        groups: &[usize],
        n_groups: usize,
        method: Method,
    ) -> Self {
        let (n, p) = x.dim();
        let mut sizes = vec![0.0; n_groups];
        let mut group_x = Array2::zeros((n_groups, p));
        let mut group_y = Array1::zeros(n_groups);
        for (row, &g) in groups.iter().enumerate() {
            sizes[g] += 1.0;
            group_y[g] += y[row];
            let mut sums = group_x.row_mut(g);
            sums += &x.row(row);
        }
        Self {
            xtx: x.t().dot(&x),
            xty: x.t().dot(&y),
            yty: y.dot(&y),
            sizes,
            group_x,
            group_y,
            n,
            p,
            method,
        }
    }

    fn evaluate(&self, lambda: f64) -> Result<Evaluation, MixedError> {
        let mut a = self.xtx.clone();
        let mut b = self.xty.clone();
        let mut c = self.yty;
        let mut log_det_v = 0.0;
        for (g, &size) in self.sizes.iter().enumerate() {
            if size == 0.0 {
                continue;
            }
            log_det_v += (1.0 + size * lambda).ln();
            let w = lambda / (1.0 + size * lambda);
            if w == 0.0 {
                continue;
            }
            let s = self.group_x.row(g);
            let t = self.group_y[g];
            for i in 0..self.p {
                b[i] -= w * s[i] * t;
                for j in 0..self.p {
                    a[[i, j]] -= w * s[i] * s[j];
                }
            }
            c -= w * t * t;
        }

        let factor = a.cholesky(UPLO::Lower)?;
        let beta = cholesky_solve(factor.view(), b.view());
        let rss = (c - b.dot(&beta)).max(f64::MIN_POSITIVE);
        let dof = self.dof();
        let sigma2 = rss / dof;
        let mut log_likelihood = -0.5 * (dof * (2.0 * PI * sigma2).ln() + log_det_v + dof);
        if self.method == Method::Reml {
            log_likelihood -= 0.5 * cholesky_log_det(factor.view());
        }
        Ok(Evaluation {
            log_likelihood,
            beta,
            sigma2,
            factor,
        })
    }

    fn dof(&self) -> f64 {
        match self.method {
            Method::Ml => self.n as f64,
            Method::Reml => (self.n - self.p) as f64,
        }
    }

    /// Log-likelihood at explicit variance components, β profiled out. The
    /// profiled σ² maximises it along the ray of the same ratio.
    fn component_log_likelihood(&self, group_var: f64, resid_var: f64) -> Option<f64> {
        if group_var < 0.0 || resid_var <= 0.0 {
            return None;
        }
        let evaluation = self.evaluate(group_var / resid_var).ok()?;
        let ratio = evaluation.sigma2 / resid_var;
        let value = evaluation.log_likelihood - 0.5 * self.dof() * (ratio - ratio.ln() - 1.0);
        value.is_finite().then_some(value)
    }

    /// Negative log-likelihood at `θ = ln λ`, finite everywhere.
    fn objective(&self, theta: f64) -> f64 {
        let lambda = theta.clamp(THETA_MIN, THETA_MAX).exp();
        match self.evaluate(lambda) {
            Ok(evaluation) if evaluation.log_likelihood.is_finite() => -evaluation.log_likelihood,
            _ => PENALTY,
        }
    }

    fn boundary_objective(&self) -> f64 {
        match self.evaluate(0.0) {
            Ok(evaluation) if evaluation.log_likelihood.is_finite() => -evaluation.log_likelihood,
            _ => PENALTY,
        }
    }
}

/// The variance ratio maximising the profiled likelihood.
fn optimise_ratio(profile: &Arc<Profile>) -> f64 {
    let steps = ((GRID_END - GRID_START) / GRID_STEP).round() as usize;
    let (grid_theta, grid_value) = (0..=steps)
        .map(|i| GRID_START + GRID_STEP * i as f64)
        .map(|theta| (theta, profile.objective(theta)))
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .unwrap_or((GRID_START, PENALTY));

    let state = Arc::clone(profile);
    let cost_and_grad = move |point: &Array1<f64>| -> (f64, Array1<f64>) {
        let theta = point[0];
        let cost = state.objective(theta);
        let gradient = (state.objective(theta + GRADIENT_STEP)
            - state.objective(theta - GRADIENT_STEP))
            / (2.0 * GRADIENT_STEP);
        (cost, array![gradient])
    };
    let (theta, value) = match Bfgs::new(array![grid_theta], cost_and_grad)
        .with_tolerance(1e-8)
        .with_max_iterations(200)
        .run()
    {
        Ok(BfgsSolution {
            final_point,
            final_value,
            iterations,
            ..
        }) if final_value <= grid_value => {
            log::debug!("BFGS refined the variance ratio in {iterations} iterations.");
            (final_point[0].clamp(THETA_MIN, THETA_MAX), final_value)
        }
        Ok(_) => (grid_theta, grid_value),
        Err(err) => {
            log::debug!("BFGS did not converge ({err:?}); keeping the grid optimum.");
            (grid_theta, grid_value)
        }
    };

    if profile.boundary_objective() <= value {
        0.0
    } else {
        theta.exp()
    }
}

/// Inverts the 2×2 observed information of `(σ²_u, σ²)` and returns the
/// standard error of σ²_u.
fn group_variance_std_err(profile: &Profile, group_var: f64, resid_var: f64) -> f64 {
    if group_var <= 0.0 || resid_var <= 0.0 {
        return f64::NAN;
    }
    let h = CURVATURE_STEP * group_var;
    let k = CURVATURE_STEP * resid_var;
    let offsets = [
        (0.0, 0.0),
        (h, 0.0),
        (-h, 0.0),
        (0.0, k),
        (0.0, -k),
        (h, k),
        (h, -k),
        (-h, k),
        (-h, -k),
    ];
    let Some(f) = offsets
        .iter()
        .map(|&(du, de)| profile.component_log_likelihood(group_var + du, resid_var + de))
        .collect::<Option<Vec<f64>>>()
    else {
        return f64::NAN;
    };
    let uu = (f[1] - 2.0 * f[0] + f[2]) / (h * h);
    let ee = (f[3] - 2.0 * f[0] + f[4]) / (k * k);
    let ue = (f[5] - f[6] - f[7] + f[8]) / (4.0 * h * k);
    let det = uu * ee - ue * ue;
    if uu >= 0.0 || det <= 0.0 {
        return f64::NAN;
    }
    let variance = -ee / det;
    if variance > 0.0 { variance.sqrt() } else { f64::NAN }
}
