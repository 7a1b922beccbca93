//! Shallow binary decision tree over numeric context features.
//!
//! Nodes live in a flat arena; internal nodes refer to their children by
//! index. A tree is built wholesale from a sample set and never mutated.

use serde::Serialize;

use crate::learning::{FeatureVector, NumericFeature, TrainingData};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DecisionNode {
    Leaf {
        prediction: bool,
        /// |success rate - 0.5| * 2 over the samples that reached this leaf.
        confidence: f64,
        samples: usize,
    },
    Split {
        feature: NumericFeature,
        /// Values `<= threshold` go left.
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionTree {
    nodes: Vec<DecisionNode>,
}

#[derive(Clone, Copy)]
struct Row {
    values: [f64; 4],
    outcome: bool,
}

struct Split {
    feature: usize,
    threshold: f64,
    impurity: f64,
}

impl DecisionTree {
    /// Grow a tree from `samples`. Returns `None` when there is nothing to
    /// learn from.
    pub fn train(samples: &[TrainingData], max_depth: usize, min_samples_split: usize) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let rows: Vec<Row> = samples
            .iter()
            .map(|s| Row {
                values: NumericFeature::ALL.map(|f| s.features.numeric(f)),
                outcome: s.outcome,
            })
            .collect();

        let mut tree = DecisionTree { nodes: Vec::new() };
        tree.grow(rows, 0, max_depth, min_samples_split);
        Some(tree)
    }

    /// Index of the node created for `rows`.
    fn grow(&mut self, mut rows: Vec<Row>, depth: usize, max_depth: usize, min_samples_split: usize) -> usize {
        let idx = self.nodes.len();
        self.nodes.push(leaf(&rows));

        let positives = rows.iter().filter(|r| r.outcome).count();
        let pure = positives == 0 || positives == rows.len();
        if depth >= max_depth || rows.len() < min_samples_split || pure {
            return idx;
        }
        let Some(split) = best_split(&mut rows) else {
            return idx;
        };

        let (left, right): (Vec<Row>, Vec<Row>) =
            rows.into_iter().partition(|r| r.values[split.feature] <= split.threshold);
        let left = self.grow(left, depth + 1, max_depth, min_samples_split);
        let right = self.grow(right, depth + 1, max_depth, min_samples_split);
        self.nodes[idx] = DecisionNode::Split {
            feature: NumericFeature::ALL[split.feature],
            threshold: split.threshold,
            left,
            right,
        };
        idx
    }

    /// Walk to a leaf; returns its prediction and confidence.
    pub fn predict(&self, features: &FeatureVector) -> (bool, f64) {
        let mut idx = 0;
        loop {
            match self.nodes.get(idx) {
                Some(DecisionNode::Leaf { prediction, confidence, .. }) => return (*prediction, *confidence),
                Some(DecisionNode::Split { feature, threshold, left, right }) => {
                    idx = if features.numeric(*feature) <= *threshold { *left } else { *right };
                }
                None => return (false, 0.0),
            }
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> &[DecisionNode] {
        &self.nodes
    }

    pub fn depth(&self) -> usize {
        fn walk(nodes: &[DecisionNode], idx: usize) -> usize {
            match nodes.get(idx) {
                Some(DecisionNode::Split { left, right, .. }) => 1 + walk(nodes, *left).max(walk(nodes, *right)),
                _ => 0,
            }
        }
        walk(&self.nodes, 0)
    }
}

fn leaf(rows: &[Row]) -> DecisionNode {
    let positives = rows.iter().filter(|r| r.outcome).count();
    let rate = if rows.is_empty() {
        0.5
    } else {
        positives as f64 / rows.len() as f64
    };
    DecisionNode::Leaf {
        prediction: rate >= 0.5,
        confidence: ((rate - 0.5).abs() * 2.0).clamp(0.0, 1.0),
        samples: rows.len(),
    }
}

fn gini(positives: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let p = positives as f64 / total as f64;
    1.0 - p * p - (1.0 - p) * (1.0 - p)
}

/// Lowest weighted Gini split over every feature and every distinct value.
/// Sorting per feature lets each candidate be scored in one sweep.
fn best_split(rows: &mut [Row]) -> Option<Split> {
    let total = rows.len();
    let total_pos = rows.iter().filter(|r| r.outcome).count();
    let mut best: Option<Split> = None;

    for feature in 0..NumericFeature::ALL.len() {
        rows.sort_by(|a, b| a.values[feature].total_cmp(&b.values[feature]));
        let mut left_pos = 0;
        for i in 0..total - 1 {
            if rows[i].outcome {
                left_pos += 1;
            }
            let value = rows[i].values[feature];
            if value == rows[i + 1].values[feature] {
                continue;
            }
            let left_n = i + 1;
            let right_n = total - left_n;
            let impurity = (left_n as f64 * gini(left_pos, left_n)
                + right_n as f64 * gini(total_pos - left_pos, right_n))
                / total as f64;
            if best.as_ref().map(|b| impurity < b.impurity).unwrap_or(true) {
                best = Some(Split { feature, threshold: value, impurity });
            }
        }
    }
    best
}
