//! Z-scoring with the population standard deviation.

use ndarray::{Array2, ArrayViewMut1, Axis};

/// Centres and scales `values` in place. A constant column becomes all zeros.
/// Missing values stay missing and are excluded from the moments.
pub fn zscore_in_place(mut values: ArrayViewMut1<f64>) {
    let (sum, count) = values
        .iter()
        .filter(|v| v.is_finite())
        .fold((0.0, 0usize), |(s, c), &v| (s + v, c + 1));
    if count == 0 {
        return;
    }
    let mean = sum / count as f64;
    let variance = values
        .iter()
        .filter(|v| v.is_finite())
        .map(|v| (v - mean).powi(2))
        .sum::<f64>()
        / count as f64;
    let sd = variance.sqrt();
    values.mapv_inplace(|v| {
        if !v.is_finite() {
            v
        } else if sd > 0.0 {
            (v - mean) / sd
        } else {
            0.0
        }
    });
}

/// Standardises the listed columns of `data`.
pub fn standardize_columns(data: &mut Array2<f64>, columns: &[usize]) {
    for &column in columns {
        zscore_in_place(data.index_axis_mut(Axis(1), column));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, array};

    #[test]
    fn population_moments_are_zero_and_one() {
        let mut values: Array1<f64> = array![1.0, 2.0, 3.0, 4.0];
        zscore_in_place(values.view_mut());
        let mean = values.mean().unwrap();
        let variance = values.mapv(|v| v * v).mean().unwrap();
        assert_abs_diff_eq!(mean, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(variance, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn constant_column_becomes_zero() {
        let mut data = array![[5.0, 1.0], [5.0, 3.0]];
        standardize_columns(&mut data, &[0]);
        assert_eq!(data.column(0).to_vec(), vec![0.0, 0.0]);
        assert_eq!(data.column(1).to_vec(), vec![1.0, 3.0]);
    }
}
