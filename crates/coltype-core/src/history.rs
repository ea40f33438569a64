//! # Training History
//!
//! Per-epoch loss and metric series for the train and validation splits, and
//! the best validation value seen so far for every tracked metric.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::metric::MetricScores;

/// Loss and scores of one pass over a split.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EpochSummary {
    pub loss: f64,
    pub scores: MetricScores,
}

/// Per-epoch losses of both splits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Losses {
    pub train: Vec<f64>,
    pub valid: Vec<f64>,
}

/// Per-epoch metric series of both splits, keyed by metric name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub train: BTreeMap<String, Vec<f64>>,
    pub valid: BTreeMap<String, Vec<f64>>,
}

/// Append-only record of a training run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub losses: Losses,
    pub metrics: Metrics,
}

impl TrainingHistory {
    /// Creates an empty history tracking the given metric names.
    #[must_use]
    pub fn new<S: AsRef<str>>(metric_names: &[S]) -> Self {
        let series: BTreeMap<String, Vec<f64>> = metric_names
            .iter()
            .map(|name| (name.as_ref().to_string(), Vec::new()))
            .collect();
        Self {
            losses: Losses::default(),
            metrics: Metrics {
                train: series.clone(),
                valid: series,
            },
        }
    }

    /// Appends a training epoch.
    pub fn push_train(&mut self, summary: &EpochSummary) {
        self.losses.train.push(summary.loss);
        push_scores(&mut self.metrics.train, &summary.scores);
    }

    /// Appends a validation epoch.
    pub fn push_valid(&mut self, summary: &EpochSummary) {
        self.losses.valid.push(summary.loss);
        push_scores(&mut self.metrics.valid, &summary.scores);
    }

    /// Number of completed epochs recorded.
    #[must_use]
    pub fn epochs(&self) -> usize {
        self.losses.valid.len()
    }

    /// Writes the history as pretty-printed JSON.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Reads a history previously written by [`TrainingHistory::save`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

fn push_scores(series: &mut BTreeMap<String, Vec<f64>>, scores: &MetricScores) {
    for (name, values) in series.iter_mut() {
        if let Some(value) = scores.get(name) {
            values.push(value);
        }
    }
}

/// Best validation value per tracked metric. Starts at `0.0`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BestMetrics(BTreeMap<String, f64>);

impl BestMetrics {
    #[must_use]
    pub fn new<S: AsRef<str>>(metric_names: &[S]) -> Self {
        Self(
            metric_names
                .iter()
                .map(|name| (name.as_ref().to_string(), 0.0))
                .collect(),
        )
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    /// Records `value` if it is at least the current best.
    ///
    /// Ties count as improvements. Returns `true` when the value was recorded.
    pub fn update(&mut self, name: &str, value: f64) -> bool {
        match self.0.get_mut(name) {
            Some(best) if *best <= value => {
                *best = value;
                true
            }
            _ => false,
        }
    }

    /// Keys in the `best_{metric}` form used inside checkpoints.
    #[must_use]
    pub fn to_prefixed(&self) -> BTreeMap<String, f64> {
        self.0
            .iter()
            .map(|(name, value)| (format!("best_{name}"), *value))
            .collect()
    }

    /// Restores values for `metric_names` from a `best_{metric}` map.
    ///
    /// Metrics absent from `prefixed` keep a best of `0.0`.
    #[must_use]
    pub fn from_prefixed<S: AsRef<str>>(
        metric_names: &[S],
        prefixed: &BTreeMap<String, f64>,
    ) -> Self {
        Self(
            metric_names
                .iter()
                .map(|name| {
                    let name = name.as_ref();
                    let value = prefixed
                        .get(&format!("best_{name}"))
                        .copied()
                        .unwrap_or(0.0);
                    (name.to_string(), value)
                })
                .collect(),
        )
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(name, value)| (name.as_str(), *value))
    }
}
