//! Principal components of one standardised variable block.

use super::PcaError;
use crate::impute::standardize::zscore_in_place;
use ndarray::{Array1, Array2, ArrayView2, Axis, s};
use ndarray_linalg::{Eigh, UPLO};

#[derive(Debug, Clone)]
pub struct BlockPca {
    pub block: String,
    /// Every eigenvalue of the correlation matrix, largest first.
    pub eigenvalues: Vec<f64>,
    /// Retained loadings, one column per component.
    pub loadings: Array2<f64>,
    /// Component scores, one row per student.
    pub scores: Array2<f64>,
}

impl BlockPca {
    /// Z-scores the block, eigen-decomposes its covariance (n - 1 denominator)
    /// and keeps the components whose eigenvalue exceeds `threshold`, at least one.
    pub fn fit(block: &str, data: ArrayView2<f64>, threshold: f64) -> Result<Self, PcaError> {
        let (n, p) = data.dim();
        if n < 2 || p == 0 {
            return Err(PcaError::TooFewObservations {
                block: block.to_string(),
                rows: n,
            });
        }
        if data.iter().any(|v| !v.is_finite()) {
            return Err(PcaError::MissingValues(block.to_string()));
        }

        let mut z = data.to_owned();
        for column in z.axis_iter_mut(Axis(1)) {
            zscore_in_place(column);
        }
        let covariance = z.t().dot(&z) / (n - 1) as f64;
        let (values, vectors) = covariance
            .eigh(UPLO::Lower)
            .map_err(|source| PcaError::Eigen {
                block: block.to_string(),
                source,
            })?;

        // `eigh` returns ascending order.
        let order: Vec<usize> = (0..p).rev().collect();
        let eigenvalues: Vec<f64> = order.iter().map(|&i| values[i].max(0.0)).collect();
        let keep = eigenvalues.iter().filter(|&&v| v > threshold).count().max(1);

        let mut loadings = Array2::zeros((p, keep));
        for (k, &source) in order.iter().take(keep).enumerate() {
            let mut vector: Array1<f64> = vectors.column(source).to_owned();
            let anchor = vector
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.abs().total_cmp(&b.1.abs()))
                .map_or(0, |(i, _)| i);
            if vector[anchor] < 0.0 {
                vector.mapv_inplace(|v| -v);
            }
            loadings.column_mut(k).assign(&vector);
        }
        let scores = z.dot(&loadings);

        Ok(Self {
            block: block.to_string(),
            eigenvalues,
            loadings,
            scores,
        })
    }

    pub fn n_components(&self) -> usize {
        self.loadings.ncols()
    }

    pub fn component_names(&self) -> Vec<String> {
        (1..=self.n_components())
            .map(|k| format!("{}_PC{k}", self.block))
            .collect()
    }

    /// Share of the total variance carried by each retained component.
    pub fn explained_ratio(&self) -> Vec<f64> {
        let total: f64 = self.eigenvalues.iter().sum();
        self.eigenvalues[..self.n_components()]
            .iter()
            .map(|v| if total > 0.0 { v / total } else { 0.0 })
            .collect()
    }

    pub fn component_scores(&self, k: usize) -> Vec<f64> {
        self.scores.slice(s![.., k]).to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn correlated_block(n: usize) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(11);
        let mut data = Array2::zeros((n, 4));
        for mut row in data.outer_iter_mut() {
            let shared: f64 = rng.gen_range(-1.0..1.0);
            row[0] = shared + 0.1 * rng.gen_range(-1.0..1.0);
            row[1] = shared + 0.1 * rng.gen_range(-1.0..1.0);
            row[2] = -shared + 0.1 * rng.gen_range(-1.0..1.0);
            row[3] = rng.gen_range(-1.0..1.0);
        }
        data
    }

    #[test]
    fn retains_components_above_threshold() {
        let data = correlated_block(300);
        let pca = BlockPca::fit("Block", data.view(), 1.0).unwrap();
        let above = pca.eigenvalues.iter().filter(|&&v| v > 1.0).count().max(1);
        assert_eq!(pca.n_components(), above);
        assert_eq!(pca.component_names()[0], "Block_PC1");
        // Eigenvalues of a correlation matrix sum to the number of variables.
        assert_abs_diff_eq!(pca.eigenvalues.iter().sum::<f64>(), 4.0 * 300.0 / 299.0, epsilon = 1e-8);
    }

    #[test]
    fn largest_loading_is_positive() {
        let data = correlated_block(200);
        let flipped = data.mapv(|v| -v);
        let a = BlockPca::fit("A", data.view(), 1.0).unwrap();
        let b = BlockPca::fit("B", flipped.view(), 1.0).unwrap();
        for k in 0..a.n_components() {
            let column = a.loadings.column(k);
            let anchor = column
                .iter()
                .copied()
                .max_by(|x, y| x.abs().total_cmp(&y.abs()))
                .unwrap();
            assert!(anchor > 0.0);
        }
        // Negating the data negates the scores, not the loadings.
        assert_abs_diff_eq!(a.scores[[0, 0]], -b.scores[[0, 0]], epsilon = 1e-8);
    }

    #[test]
    fn at_least_one_component_is_kept() {
        let data = correlated_block(100);
        let pca = BlockPca::fit("Block", data.view(), 100.0).unwrap();
        assert_eq!(pca.n_components(), 1);
    }

    #[test]
    fn missing_values_are_rejected() {
        let mut data = correlated_block(10);
        data[[2, 1]] = f64::NAN;
        assert!(matches!(
            BlockPca::fit("Block", data.view(), 1.0),
            Err(PcaError::MissingValues(_))
        ));
    }
}
