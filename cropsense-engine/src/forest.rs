//! Random forest classifier.
//!
//! CART trees grown on bootstrap samples, Gini impurity, `sqrt(n_features)`
//! candidate features per split. Class probabilities are the mean of the
//! per-tree leaf distributions. Every random draw comes from a `ChaCha8Rng`
//! seeded from [`ForestParams::seed`], so fitting is reproducible.

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Hyper-parameters of the ensemble.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForestParams {
    pub n_trees: usize,
    pub max_depth: usize,
    pub min_samples_split: usize,
    pub seed: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_trees: 100,
            max_depth: 10,
            min_samples_split: 2,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Node {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    /// Sparse `(class, probability)` pairs, non-zero entries only.
    Leaf { distribution: Vec<(usize, f64)> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTree {
    /// Root at index 0.
    nodes: Vec<Node>,
}

impl DecisionTree {
    fn leaf(&self, row: &[f64]) -> &[(usize, f64)] {
        let mut at = 0;
        loop {
            match &self.nodes[at] {
                Node::Split { feature, threshold, left, right } => {
                    at = if row[*feature] <= *threshold { *left } else { *right };
                }
                Node::Leaf { distribution } => return distribution,
            }
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Checks that every reference stays in range, so traversal cannot panic.
    fn check(&self, n_features: usize, n_classes: usize) -> Result<(), String> {
        if self.nodes.is_empty() {
            return Err("empty tree".into());
        }
        for (at, node) in self.nodes.iter().enumerate() {
            match node {
                Node::Split { feature, left, right, .. } => {
                    if *feature >= n_features {
                        return Err(format!("node {at}: feature {feature} out of range"));
                    }
                    // children are always pushed after their parent
                    if *left <= at || *right <= at || *left >= self.nodes.len() || *right >= self.nodes.len() {
                        return Err(format!("node {at}: child index out of range"));
                    }
                }
                Node::Leaf { distribution } => {
                    if distribution.iter().any(|(class, _)| *class >= n_classes) {
                        return Err(format!("node {at}: class out of range"));
                    }
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForest {
    params: ForestParams,
    n_features: usize,
    n_classes: usize,
    trees: Vec<DecisionTree>,
}

impl RandomForest {
    /// Fits the forest. `targets[i]` is the class index of `features[i]`,
    /// strictly below `n_classes`. Every row must have the same length.
    pub fn fit(features: &[Vec<f64>], targets: &[usize], n_classes: usize, params: &ForestParams) -> Self {
        assert_eq!(features.len(), targets.len(), "one target per row");
        assert!(!features.is_empty(), "cannot fit on an empty sample");

        let n_samples = features.len();
        let n_features = features[0].len();
        let max_features = ((n_features as f64).sqrt().floor() as usize).max(1);

        let mut rng = ChaCha8Rng::seed_from_u64(params.seed);
        let trees = (0..params.n_trees)
            .map(|_| {
                let mut tree_rng = ChaCha8Rng::seed_from_u64(rng.gen());
                let mut sample: Vec<usize> = (0..n_samples).map(|_| tree_rng.gen_range(0..n_samples)).collect();
                let mut builder = TreeBuilder {
                    features,
                    targets,
                    n_features,
                    n_classes,
                    max_depth: params.max_depth,
                    min_samples_split: params.min_samples_split.max(2),
                    max_features,
                    nodes: Vec::new(),
                };
                builder.grow(&mut sample, 0, &mut tree_rng);
                DecisionTree { nodes: builder.nodes }
            })
            .collect();

        Self {
            params: params.clone(),
            n_features,
            n_classes,
            trees,
        }
    }

    /// Mean class distribution over all trees. Sums to 1.
    pub fn predict_proba(&self, row: &[f64]) -> Vec<f64> {
        let mut probabilities = vec![0.0; self.n_classes];
        if self.trees.is_empty() {
            return probabilities;
        }
        for tree in &self.trees {
            for &(class, probability) in tree.leaf(row) {
                probabilities[class] += probability;
            }
        }
        let n_trees = self.trees.len() as f64;
        probabilities.iter_mut().for_each(|p| *p /= n_trees);
        probabilities
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn n_classes(&self) -> usize {
        self.n_classes
    }

    pub fn trees(&self) -> &[DecisionTree] {
        &self.trees
    }

    /// Structural validation of a deserialized forest.
    pub fn check(&self) -> Result<(), String> {
        if self.trees.is_empty() {
            return Err("forest has no trees".into());
        }
        for (index, tree) in self.trees.iter().enumerate() {
            tree.check(self.n_features, self.n_classes)
                .map_err(|e| format!("tree {index}: {e}"))?;
        }
        Ok(())
    }
}

/// Index of the highest probability; the lowest index wins a tie.
pub fn argmax(probabilities: &[f64]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (index, &p) in probabilities.iter().enumerate() {
        if best.map_or(true, |(_, top)| p > top) {
            best = Some((index, p));
        }
    }
    best.map(|(index, _)| index)
}

struct Split {
    feature: usize,
    threshold: f64,
    decrease: f64,
}

struct TreeBuilder<'a> {
    features: &'a [Vec<f64>],
    targets: &'a [usize],
    n_features: usize,
    n_classes: usize,
    max_depth: usize,
    min_samples_split: usize,
    max_features: usize,
    nodes: Vec<Node>,
}

impl TreeBuilder<'_> {
    /// Grows the subtree for `sample` and returns its root index.
    fn grow(&mut self, sample: &mut [usize], depth: usize, rng: &mut ChaCha8Rng) -> usize {
        let counts = self.class_counts(sample);
        let at = self.nodes.len();

        let pure = counts.iter().filter(|&&count| count > 0).count() <= 1;
        let split = if pure || depth >= self.max_depth || sample.len() < self.min_samples_split {
            None
        } else {
            self.best_split(sample, &counts, rng)
        };

        let Some(split) = split else {
            self.nodes.push(leaf(&counts, sample.len()));
            return at;
        };

        // placeholder, replaced once both children exist
        self.nodes.push(Node::Leaf { distribution: Vec::new() });

        let features = self.features;
        let mid = partition(sample, |row| features[row][split.feature] <= split.threshold);
        let (left_sample, right_sample) = sample.split_at_mut(mid);
        let left = self.grow(left_sample, depth + 1, rng);
        let right = self.grow(right_sample, depth + 1, rng);

        self.nodes[at] = Node::Split {
            feature: split.feature,
            threshold: split.threshold,
            left,
            right,
        };
        at
    }

    fn class_counts(&self, sample: &[usize]) -> Vec<usize> {
        let mut counts = vec![0; self.n_classes];
        for &row in sample {
            counts[self.targets[row]] += 1;
        }
        counts
    }

    /// Best Gini split among `max_features` random candidates. Like CART,
    /// keeps drawing features past `max_features` while none of the drawn
    /// ones can separate the sample.
    fn best_split(&self, sample: &[usize], counts: &[usize], rng: &mut ChaCha8Rng) -> Option<Split> {
        let total = sample.len();
        let parent = gini(counts, total);

        let mut candidates: Vec<usize> = (0..self.n_features).collect();
        candidates.shuffle(rng);

        let mut best: Option<Split> = None;
        let mut sorted: Vec<(f64, usize)> = Vec::with_capacity(total);
        let mut left = vec![0usize; self.n_classes];
        let mut right = vec![0usize; self.n_classes];

        for (visited, &feature) in candidates.iter().enumerate() {
            if visited >= self.max_features && best.is_some() {
                break;
            }

            sorted.clear();
            sorted.extend(sample.iter().map(|&row| (self.features[row][feature], self.targets[row])));
            sorted.sort_by(|a, b| a.0.total_cmp(&b.0));

            left.iter_mut().for_each(|count| *count = 0);
            right.copy_from_slice(counts);

            for k in 0..total - 1 {
                let (value, class) = sorted[k];
                left[class] += 1;
                right[class] -= 1;

                let next = sorted[k + 1].0;
                if next <= value {
                    continue;
                }

                let n_left = k + 1;
                let n_right = total - n_left;
                let impurity = (n_left as f64 * gini(&left, n_left) + n_right as f64 * gini(&right, n_right))
                    / total as f64;
                let decrease = parent - impurity;

                if best.as_ref().map_or(true, |b| decrease > b.decrease) {
                    let mut threshold = value + (next - value) / 2.0;
                    if threshold >= next {
                        threshold = value;
                    }
                    best = Some(Split { feature, threshold, decrease });
                }
            }
        }

        best
    }
}

fn gini(counts: &[usize], total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let total = total as f64;
    1.0 - counts
        .iter()
        .map(|&count| {
            let p = count as f64 / total;
            p * p
        })
        .sum::<f64>()
}

fn leaf(counts: &[usize], total: usize) -> Node {
    let distribution = counts
        .iter()
        .enumerate()
        .filter(|(_, &count)| count > 0)
        .map(|(class, &count)| (class, count as f64 / total as f64))
        .collect();
    Node::Leaf { distribution }
}

/// Moves rows matching `goes_left` to the front, returns how many matched.
fn partition(sample: &mut [usize], goes_left: impl Fn(usize) -> bool) -> usize {
    let mut mid = 0;
    for i in 0..sample.len() {
        if goes_left(sample[i]) {
            sample.swap(i, mid);
            mid += 1;
        }
    }
    mid
}
