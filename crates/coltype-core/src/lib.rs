//! # Coltype Core
//!
//! Building blocks shared by the column-type annotation trainer: the training
//! configuration, F1 metrics, CLS-logit extraction, device selection and the
//! loss/metric history kept across epochs.
//!
//! ## Quick Start
//!
//! ```rust
//! use coltype_core::metric::multiple_f1_score;
//!
//! let scores = multiple_f1_score(&[0, 1, 1], &[0, 1, 2], 3).unwrap();
//! assert!((scores.f1_micro - 2.0 / 3.0).abs() < 1e-9);
//! ```
pub mod config;
pub mod device;
pub mod error;
pub mod history;
pub mod logits;
pub mod metric;

// Re-export primary API
pub use config::Config;
pub use device::{GpuPlan, PreparedDevice, clamp_gpu_count, prepare_device};
pub use error::{CtaError, Result};
pub use history::{BestMetrics, EpochSummary, TrainingHistory};
pub use logits::{token_logits, token_positions};
pub use metric::{METRIC_NAMES, MetricScores, NUM_COLUMN_TYPES, multiple_f1_score};
