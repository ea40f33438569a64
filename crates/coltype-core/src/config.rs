//! # Training Configuration
//!
//! JSON configuration for a fine-tuning run. Loaded once at startup and
//! treated as read-only afterwards.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CtaError, Result};
use crate::metric::METRIC_NAMES;

/// Default random seed for shuffling and weight initialisation.
pub const DEFAULT_SEED: u64 = 13;

/// How a table is turned into token sequences.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SerializationStrategy {
    /// Whole table in one sequence, one CLS per column.
    #[default]
    TableWise,
    /// One sequence per column, followed by the rest of the table as context.
    ColumnWise,
    /// One sequence per column, nothing else.
    SingleColumn,
}

/// Dataset section (`dataset.*`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Number of cell values per column fed to the serializer.
    pub num_rows: usize,
    /// Directory holding the `*.jsonl` table files.
    pub data_dir: PathBuf,
    #[serde(default)]
    pub table_serialization_strategy: SerializationStrategy,
}

/// Data loader section (`dataloader.*`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataLoaderConfig {
    /// Accepted for compatibility; batches are produced on the calling thread.
    #[serde(default)]
    pub num_workers: usize,
    /// Fraction of samples held out for validation, in `[0, 1)`.
    pub valid_split: f64,
}

/// Optimizer section (`optimizer.*`), optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_lr")]
    pub lr: f64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
}

fn default_lr() -> f64 {
    1e-3
}

fn default_weight_decay() -> f64 {
    0.01
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            lr: default_lr(),
            weight_decay: default_weight_decay(),
        }
    }
}

/// Step learning-rate schedule (`lr_scheduler.*`), optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LrSchedulerConfig {
    /// Number of epochs between decays.
    pub step_size: usize,
    /// Multiplicative decay factor.
    pub gamma: f64,
}

/// Complete training configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Local directory with `config.json`, `tokenizer.json` and optionally
    /// `model.safetensors` of the pretrained encoder.
    pub pretrained_model_name: PathBuf,
    pub dataset: DatasetConfig,
    pub batch_size: usize,
    pub dataloader: DataLoaderConfig,
    pub num_labels: usize,
    pub num_gpu: usize,
    pub num_epochs: usize,
    pub save_period_in_epochs: usize,
    pub checkpoint_dir: PathBuf,
    #[serde(default)]
    pub start_from_checkpoint: bool,
    #[serde(default)]
    pub checkpoint_name: Option<String>,
    /// Names of tracked metrics; each must be one of [`METRIC_NAMES`].
    pub metrics: Vec<String>,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub lr_scheduler: Option<LrSchedulerConfig>,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Where the loss/metric history is written after training.
    #[serde(default)]
    pub history_path: Option<PathBuf>,
}

fn default_seed() -> u64 {
    DEFAULT_SEED
}

impl Config {
    /// Reads and validates a configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&content)
    }

    /// Parses and validates a configuration document.
    pub fn from_json(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| CtaError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges and cross-field requirements.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(CtaError::Config("batch_size must be positive".into()));
        }
        if self.num_epochs == 0 {
            return Err(CtaError::Config("num_epochs must be positive".into()));
        }
        if self.num_labels == 0 {
            return Err(CtaError::Config("num_labels must be positive".into()));
        }
        if self.save_period_in_epochs == 0 {
            return Err(CtaError::Config(
                "save_period_in_epochs must be positive".into(),
            ));
        }
        if self.dataset.num_rows == 0 {
            return Err(CtaError::Config("dataset.num_rows must be positive".into()));
        }
        if !(0.0..1.0).contains(&self.dataloader.valid_split) {
            return Err(CtaError::Config(format!(
                "dataloader.valid_split must be in [0, 1), got {}",
                self.dataloader.valid_split
            )));
        }
        if self.metrics.is_empty() {
            return Err(CtaError::Config("metrics must not be empty".into()));
        }
        for name in &self.metrics {
            if !METRIC_NAMES.contains(&name.as_str()) {
                return Err(CtaError::Config(format!(
                    "unknown metric {name:?}, expected one of {METRIC_NAMES:?}"
                )));
            }
        }
        if self.start_from_checkpoint && self.checkpoint_name.is_none() {
            return Err(CtaError::Config(
                "checkpoint_name is required when start_from_checkpoint is set".into(),
            ));
        }
        if let Some(ref scheduler) = self.lr_scheduler {
            if scheduler.step_size == 0 {
                return Err(CtaError::Config(
                    "lr_scheduler.step_size must be positive".into(),
                ));
            }
        }
        Ok(())
    }

    /// Path of the checkpoint to resume from, if resuming is enabled.
    #[must_use]
    pub fn resume_path(&self) -> Option<PathBuf> {
        if !self.start_from_checkpoint {
            return None;
        }
        self.checkpoint_name
            .as_ref()
            .map(|name| self.checkpoint_dir.join(name))
    }

    /// Destination of the history file written after training.
    #[must_use]
    pub fn history_path(&self) -> PathBuf {
        self.history_path
            .clone()
            .unwrap_or_else(|| self.checkpoint_dir.join("history.json"))
    }
}
