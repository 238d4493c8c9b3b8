//! Cholesky helpers for the small symmetric systems (normal equations and
//! mixed-model cross products) solved throughout the pipeline.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use ndarray_linalg::error::LinalgError;
use ndarray_linalg::{Cholesky, UPLO};

/// Lower Cholesky factor of a symmetric positive (semi-)definite matrix. When
/// the plain factorisation fails, a small ridge proportional to the mean
/// diagonal is added, growing tenfold up to four times.
pub fn robust_cholesky(matrix: &Array2<f64>) -> Result<Array2<f64>, LinalgError> {
    match matrix.cholesky(UPLO::Lower) {
        Ok(factor) => Ok(factor),
        Err(first) => {
            let n = matrix.nrows().max(1);
            let scale = (matrix.diag().sum() / n as f64).abs().max(1.0);
            let mut ridge = 1e-10 * scale;
            for _ in 0..4 {
                let mut jittered = matrix.clone();
                jittered.diag_mut().mapv_inplace(|d| d + ridge);
                if let Ok(factor) = jittered.cholesky(UPLO::Lower) {
                    log::debug!("Cholesky needed a ridge of {ridge:.3e}");
                    return Ok(factor);
                }
                ridge *= 10.0;
            }
            Err(first)
        }
    }
}

/// Solves `L x = b` for lower-triangular `L`.
pub fn solve_lower(l: ArrayView2<f64>, b: ArrayView1<f64>) -> Array1<f64> {
    let n = b.len();
    let mut x = Array1::zeros(n);
    for i in 0..n {
        let mut sum = b[i];
        for k in 0..i {
            sum -= l[[i, k]] * x[k];
        }
        x[i] = sum / l[[i, i]];
    }
    x
}

/// Solves `Lᵀ x = b` for lower-triangular `L`.
pub fn solve_lower_transposed(l: ArrayView2<f64>, b: ArrayView1<f64>) -> Array1<f64> {
    let n = b.len();
    let mut x = Array1::zeros(n);
    for i in (0..n).rev() {
        let mut sum = b[i];
        for k in (i + 1)..n {
            sum -= l[[k, i]] * x[k];
        }
        x[i] = sum / l[[i, i]];
    }
    x
}

/// Solves `A x = b` given the lower Cholesky factor of `A`.
pub fn cholesky_solve(l: ArrayView2<f64>, b: ArrayView1<f64>) -> Array1<f64> {
    let y = solve_lower(l, b);
    solve_lower_transposed(l, y.view())
}

/// `A⁻¹` from the lower Cholesky factor of `A`.
pub fn cholesky_inverse(l: ArrayView2<f64>) -> Array2<f64> {
    let n = l.nrows();
    let mut inverse = Array2::zeros((n, n));
    let mut unit = Array1::zeros(n);
    for j in 0..n {
        unit.fill(0.0);
        unit[j] = 1.0;
        inverse.column_mut(j).assign(&cholesky_solve(l, unit.view()));
    }
    inverse
}

/// `ln |A|` from the lower Cholesky factor of `A`.
pub fn cholesky_log_det(l: ArrayView2<f64>) -> f64 {
    2.0 * l.diag().iter().map(|d| d.ln()).sum::<f64>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn solves_and_inverts_symmetric_system() {
        let a = array![[4.0, 2.0, 0.6], [2.0, 5.0, 1.0], [0.6, 1.0, 3.0]];
        let l = robust_cholesky(&a).unwrap();
        let b = array![1.0, -2.0, 0.5];
        let x = cholesky_solve(l.view(), b.view());
        let back = a.dot(&x);
        for i in 0..3 {
            assert_abs_diff_eq!(back[i], b[i], epsilon = 1e-12);
        }
        let identity = a.dot(&cholesky_inverse(l.view()));
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_abs_diff_eq!(identity[[i, j]], expected, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn log_det_matches_diagonal_product() {
        let a = array![[2.0, 0.0], [0.0, 8.0]];
        let l = robust_cholesky(&a).unwrap();
        assert_abs_diff_eq!(cholesky_log_det(l.view()), 16.0f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn singular_matrix_gets_a_ridge() {
        let a = array![[1.0, 1.0], [1.0, 1.0]];
        assert!(robust_cholesky(&a).is_ok());
    }
}
