//! # Classification Metrics
//!
//! Multi-class F1 in its three usual aggregations. Classes that appear in
//! neither predictions nor targets are left out of the macro and weighted
//! averages, and undefined per-class scores count as zero.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{CtaError, Result};

/// Number of semantic column types in the annotation task.
pub const NUM_COLUMN_TYPES: usize = 339;

pub const F1_MICRO: &str = "f1_micro";
pub const F1_MACRO: &str = "f1_macro";
pub const F1_WEIGHTED: &str = "f1_weighted";

/// Metric names that can be tracked during training.
pub const METRIC_NAMES: &[&str] = &[F1_MICRO, F1_MACRO, F1_WEIGHTED];

/// F1 scores of one pass over a dataset split.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricScores {
    pub f1_micro: f64,
    pub f1_macro: f64,
    pub f1_weighted: f64,
}

impl MetricScores {
    /// Looks a score up by its metric name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<f64> {
        match name {
            F1_MICRO => Some(self.f1_micro),
            F1_MACRO => Some(self.f1_macro),
            F1_WEIGHTED => Some(self.f1_weighted),
            _ => None,
        }
    }

    /// Scores keyed by metric name.
    #[must_use]
    pub fn to_map(&self) -> BTreeMap<String, f64> {
        METRIC_NAMES
            .iter()
            .filter_map(|name| self.get(name).map(|v| ((*name).to_string(), v)))
            .collect()
    }
}

/// Per-class counts accumulated over a prediction/target pair.
#[derive(Debug, Clone)]
struct ClassCounts {
    true_positive: Vec<u64>,
    predicted: Vec<u64>,
    actual: Vec<u64>,
}

impl ClassCounts {
    fn collect(predictions: &[u32], targets: &[u32], num_classes: usize) -> Result<Self> {
        let mut counts = Self {
            true_positive: vec![0; num_classes],
            predicted: vec![0; num_classes],
            actual: vec![0; num_classes],
        };

        for (&pred, &target) in predictions.iter().zip(targets) {
            for label in [pred, target] {
                if label as usize >= num_classes {
                    return Err(CtaError::LabelOutOfRange { label, num_classes });
                }
            }
            counts.predicted[pred as usize] += 1;
            counts.actual[target as usize] += 1;
            if pred == target {
                counts.true_positive[pred as usize] += 1;
            }
        }

        Ok(counts)
    }
}

fn f1(true_positive: u64, predicted: u64, actual: u64) -> f64 {
    let precision = true_positive as f64 / predicted as f64;
    let recall = true_positive as f64 / actual as f64;
    let score = 2.0 * precision * recall / (precision + recall);
    if score.is_nan() { 0.0 } else { score }
}

/// Computes micro, macro and weighted F1 over flattened label sequences.
///
/// # Arguments
/// * `predictions` - Predicted class per example
/// * `targets` - True class per example, same length as `predictions`
/// * `num_classes` - Total number of classes
pub fn multiple_f1_score(
    predictions: &[u32],
    targets: &[u32],
    num_classes: usize,
) -> Result<MetricScores> {
    if predictions.len() != targets.len() {
        return Err(CtaError::ShapeMismatch(format!(
            "{} predictions for {} targets",
            predictions.len(),
            targets.len()
        )));
    }
    if predictions.is_empty() {
        return Ok(MetricScores::default());
    }

    let counts = ClassCounts::collect(predictions, targets, num_classes)?;

    let total_tp: u64 = counts.true_positive.iter().sum();
    let total = predictions.len() as u64;
    let f1_micro = f1(total_tp, total, total);

    let mut present = 0usize;
    let mut macro_sum = 0.0;
    let mut weighted_sum = 0.0;
    for class in 0..num_classes {
        let (tp, predicted, actual) = (
            counts.true_positive[class],
            counts.predicted[class],
            counts.actual[class],
        );
        if predicted == 0 && actual == 0 {
            continue;
        }
        let score = f1(tp, predicted, actual);
        present += 1;
        macro_sum += score;
        weighted_sum += score * actual as f64 / total as f64;
    }

    Ok(MetricScores {
        f1_micro,
        f1_macro: macro_sum / present as f64,
        f1_weighted: weighted_sum,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn perfect_predictions() {
        let labels = [0, 1, 2, 2, 1];
        let scores = multiple_f1_score(&labels, &labels, 3).unwrap();
        assert!(approx(scores.f1_micro, 1.0));
        assert!(approx(scores.f1_macro, 1.0));
        assert!(approx(scores.f1_weighted, 1.0));
    }

    #[test]
    fn micro_equals_accuracy() {
        let preds = [0, 1, 1, 2];
        let targets = [0, 1, 2, 2];
        let scores = multiple_f1_score(&preds, &targets, 3).unwrap();
        assert!(approx(scores.f1_micro, 0.75));
    }

    #[test]
    fn macro_and_weighted_skip_absent_classes() {
        // class 0: tp=1 p=1 a=1 -> 1.0
        // class 1: tp=1 p=2 a=1 -> 2/3
        // class 2: tp=1 p=1 a=2 -> 2/3
        // classes 3..339 absent
        let preds = [0, 1, 1, 2];
        let targets = [0, 1, 2, 2];
        let scores = multiple_f1_score(&preds, &targets, NUM_COLUMN_TYPES).unwrap();
        assert!(approx(scores.f1_macro, (1.0 + 2.0 / 3.0 + 2.0 / 3.0) / 3.0));
        let weighted = 1.0 * 0.25 + (2.0 / 3.0) * 0.25 + (2.0 / 3.0) * 0.5;
        assert!(approx(scores.f1_weighted, weighted));
    }

    #[test]
    fn predicted_only_class_counts_as_zero_in_macro() {
        // class 0 never a target but predicted once: f1 = 0
        let preds = [0, 1];
        let targets = [1, 1];
        let scores = multiple_f1_score(&preds, &targets, 2).unwrap();
        // class 1: tp=1 p=1 a=2 -> 2/3
        assert!(approx(scores.f1_macro, (0.0 + 2.0 / 3.0) / 2.0));
        assert!(approx(scores.f1_weighted, 2.0 / 3.0));
    }

    #[test]
    fn empty_input_scores_zero() {
        let scores = multiple_f1_score(&[], &[], 3).unwrap();
        assert_eq!(scores, MetricScores::default());
    }

    #[test]
    fn out_of_range_label_rejected() {
        let err = multiple_f1_score(&[0], &[5], 3).unwrap_err();
        assert!(matches!(
            err,
            CtaError::LabelOutOfRange {
                label: 5,
                num_classes: 3
            }
        ));
    }

    #[test]
    fn length_mismatch_rejected() {
        assert!(multiple_f1_score(&[0, 1], &[0], 3).is_err());
    }

    #[test]
    fn scores_lookup_by_name() {
        let scores = MetricScores {
            f1_micro: 0.5,
            f1_macro: 0.25,
            f1_weighted: 0.75,
        };
        assert_eq!(scores.get(F1_MACRO), Some(0.25));
        assert_eq!(scores.get("accuracy"), None);
        let map = scores.to_map();
        assert_eq!(map.len(), 3);
        assert_eq!(map[F1_WEIGHTED], 0.75);
    }
}
