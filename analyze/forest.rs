//! # Random Forest Classifier
//!
//! An ensemble of fully grown CART trees. Each tree sees a bootstrap sample
//! of the training rows and, at every node, a random subset of the features;
//! splits minimise the weighted Gini impurity of the children. Predictions
//! average the class distributions of the leaves reached. Feature importance
//! is the mean decrease in impurity, normalised per tree and then overall.

use ndarray::{ArrayView1, ArrayView2};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ForestError {
    #[error("The training data is empty.")]
    Empty,
    #[error("The feature matrix has {rows} rows but {labels} labels were given.")]
    LengthMismatch { rows: usize, labels: usize },
    #[error("Only one class is present; a classifier cannot be trained.")]
    SingleClass,
    #[error("The stratified split left the {0} set empty.")]
    EmptySplit(&'static str),
}

#[derive(Debug, Clone)]
pub struct ForestParams {
    pub n_trees: usize,
    /// Features tried per split; the square root of the feature count when `None`.
    pub max_features: Option<usize>,
    pub min_samples_split: usize,
    pub seed: u64,
}

#[derive(Debug, Clone)]
enum Node {
    Leaf {
        distribution: Vec<f64>,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone)]
struct Tree {
    nodes: Vec<Node>,
    /// Unnormalised impurity decrease per feature.
    importance: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct RandomForest {
    trees: Vec<Tree>,
    n_classes: usize,
    importances: Vec<f64>,
}

fn gini(counts: &[f64], total: f64) -> f64 {
    if total <= 0.0 {
        return 0.0;
    }
    1.0 - counts.iter().map(|c| (c / total).powi(2)).sum::<f64>()
}

struct SplitCandidate {
    feature: usize,
    threshold: f64,
    decrease: f64,
}

/// Best threshold for one feature over the node's rows, if any.
fn best_threshold(
    x: ArrayView2<f64>,
    y: &[usize],
    rows: &[usize],
    feature: usize,
    n_classes: usize,
    parent_counts: &[f64],
) -> Option<SplitCandidate> {
    let mut ordered: Vec<(f64, usize)> = rows.iter().map(|&r| (x[[r, feature]], y[r])).collect();
    ordered.sort_by(|a, b| a.0.total_cmp(&b.0));
    if ordered.first()?.0 == ordered.last()?.0 {
        return None;
    }

    let total = ordered.len() as f64;
    let parent = total * gini(parent_counts, total);
    let mut left = vec![0.0; n_classes];
    let mut best: Option<SplitCandidate> = None;
    for i in 0..ordered.len() - 1 {
        left[ordered[i].1] += 1.0;
        if ordered[i].0 == ordered[i + 1].0 {
            continue;
        }
        let n_left = (i + 1) as f64;
        let n_right = total - n_left;
        let right: Vec<f64> = parent_counts.iter().zip(&left).map(|(p, l)| p - l).collect();
        let children = n_left * gini(&left, n_left) + n_right * gini(&right, n_right);
        let decrease = parent - children;
        if best.as_ref().is_none_or(|b| decrease > b.decrease) {
            best = Some(SplitCandidate {
                feature,
                threshold: 0.5 * (ordered[i].0 + ordered[i + 1].0),
                decrease,
            });
        }
    }
    best
}

impl Tree {
    fn grow(
        x: ArrayView2<f64>,
        y: &[usize],
        n_classes: usize,
        max_features: usize,
        min_samples_split: usize,
        rng: &mut StdRng,
    ) -> Self {
        let n = x.nrows();
        let p = x.ncols();
        let sample: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();
        let mut tree = Tree {
            nodes: Vec::new(),
            importance: vec![0.0; p],
        };
        let mut features: Vec<usize> = (0..p).collect();
        // (node slot, rows reaching it)
        let mut pending: Vec<(usize, Vec<usize>)> = vec![(0, sample)];
        tree.nodes.push(Node::Leaf {
            distribution: Vec::new(),
        });

        while let Some((slot, rows)) = pending.pop() {
            let mut counts = vec![0.0; n_classes];
            for &r in &rows {
                counts[y[r]] += 1.0;
            }
            let total = rows.len() as f64;
            let pure = counts.iter().filter(|&&c| c > 0.0).count() <= 1;

            let mut best: Option<SplitCandidate> = None;
            if !pure && rows.len() >= min_samples_split {
                features.shuffle(rng);
                let mut visited = 0;
                for &feature in &features {
                    if visited >= max_features && best.is_some() {
                        break;
                    }
                    if let Some(candidate) = best_threshold(x, y, &rows, feature, n_classes, &counts) {
                        visited += 1;
                        if best.as_ref().is_none_or(|b| candidate.decrease > b.decrease) {
                            best = Some(candidate);
                        }
                    }
                }
            }

            match best.filter(|b| b.decrease > 0.0) {
                Some(split) => {
                    tree.importance[split.feature] += split.decrease;
                    let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
                        .iter()
                        .copied()
                        .partition(|&r| x[[r, split.feature]] <= split.threshold);
                    let left = tree.nodes.len();
                    let right = left + 1;
                    for _ in 0..2 {
                        tree.nodes.push(Node::Leaf {
                            distribution: Vec::new(),
                        });
                    }
                    tree.nodes[slot] = Node::Split {
                        feature: split.feature,
                        threshold: split.threshold,
                        left,
                        right,
                    };
                    pending.push((left, left_rows));
                    pending.push((right, right_rows));
                }
                None => {
                    tree.nodes[slot] = Node::Leaf {
                        distribution: counts.iter().map(|c| c / total).collect(),
                    };
                }
            }
        }
        tree
    }

    fn distribution(&self, row: ArrayView1<f64>) -> &[f64] {
        let mut index = 0;
        loop {
            match &self.nodes[index] {
                Node::Leaf { distribution } => return distribution,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    index = if row[*feature] <= *threshold { *left } else { *right };
                }
            }
        }
    }
}

impl RandomForest {
    /// Trains on `x` with class labels `y` in `0..n_classes`. Trees are grown
    /// in parallel; tree `t` draws from a generator seeded with `seed + t`.
    pub fn fit(x: ArrayView2<f64>, y: &[usize], params: &ForestParams) -> Result<Self, ForestError> {
        let (n, p) = x.dim();
        if n == 0 || p == 0 {
            return Err(ForestError::Empty);
        }
        if y.len() != n {
            return Err(ForestError::LengthMismatch {
                rows: n,
                labels: y.len(),
            });
        }
        let n_classes = y.iter().max().map_or(0, |m| m + 1);
        if y.iter().all(|&label| label == y[0]) {
            return Err(ForestError::SingleClass);
        }
        let max_features = params
            .max_features
            .unwrap_or_else(|| (p as f64).sqrt() as usize)
            .clamp(1, p);
        let min_samples_split = params.min_samples_split.max(2);

        let trees: Vec<Tree> = (0..params.n_trees.max(1))
            .into_par_iter()
            .map(|t| {
                let mut rng = StdRng::seed_from_u64(params.seed.wrapping_add(t as u64));
                Tree::grow(x, y, n_classes, max_features, min_samples_split, &mut rng)
            })
            .collect();

        let mut importances = vec![0.0; p];
        for tree in &trees {
            let total: f64 = tree.importance.iter().sum();
            if total > 0.0 {
                for (sum, value) in importances.iter_mut().zip(&tree.importance) {
                    *sum += value / total;
                }
            }
        }
        let total: f64 = importances.iter().sum();
        if total > 0.0 {
            importances.iter_mut().for_each(|v| *v /= total);
        }

        Ok(Self {
            trees,
            n_classes,
            importances,
        })
    }

    /// Mean class distribution over the trees for each row.
    pub fn predict_proba(&self, x: ArrayView2<f64>) -> Vec<Vec<f64>> {
        x.outer_iter()
            .map(|row| {
                let mut mean = vec![0.0; self.n_classes];
                for tree in &self.trees {
                    for (m, v) in mean.iter_mut().zip(tree.distribution(row)) {
                        *m += v;
                    }
                }
                let count = self.trees.len() as f64;
                mean.iter_mut().for_each(|m| *m /= count);
                mean
            })
            .collect()
    }

    pub fn predict(&self, x: ArrayView2<f64>) -> Vec<usize> {
        self.predict_proba(x)
            .into_iter()
            .map(|probabilities| {
                probabilities
                    .iter()
                    .enumerate()
                    .fold((0, f64::NEG_INFINITY), |best, (class, &p)| {
                        if p > best.1 { (class, p) } else { best }
                    })
                    .0
            })
            .collect()
    }

    /// Normalised mean decrease in impurity, one entry per feature.
    pub fn feature_importances(&self) -> &[f64] {
        &self.importances
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }
}

pub fn accuracy(predicted: &[usize], truth: &[usize]) -> f64 {
    if truth.is_empty() {
        return f64::NAN;
    }
    let correct = predicted.iter().zip(truth).filter(|(p, t)| p == t).count();
    correct as f64 / truth.len() as f64
}

/// Train and test row indices with each class split in the same proportion.
pub fn stratified_split(
    labels: &[usize],
    test_fraction: f64,
    seed: u64,
) -> Result<(Vec<usize>, Vec<usize>), ForestError> {
    let mut rng = StdRng::seed_from_u64(seed);
    let n_classes = labels.iter().max().map_or(0, |m| m + 1);
    let mut train = Vec::new();
    let mut test = Vec::new();
    for class in 0..n_classes {
        let mut rows: Vec<usize> = (0..labels.len()).filter(|&r| labels[r] == class).collect();
        rows.shuffle(&mut rng);
        let n_test = (rows.len() as f64 * test_fraction).round() as usize;
        test.extend_from_slice(&rows[..n_test]);
        train.extend_from_slice(&rows[n_test..]);
    }
    if train.is_empty() {
        return Err(ForestError::EmptySplit("training"));
    }
    if test.is_empty() {
        return Err(ForestError::EmptySplit("test"));
    }
    train.shuffle(&mut rng);
    test.sort_unstable();
    Ok((train, test))
}
