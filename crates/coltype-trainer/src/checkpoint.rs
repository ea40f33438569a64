//! # Checkpoints
//!
//! A checkpoint is a single safetensors file. Model parameters are stored
//! under `model.`, optimizer moments under `optimizer.`, and the epoch,
//! histories and best metric values travel as JSON in the file metadata.
//! Files are written in place, without versioning or integrity checks.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use chrono::{DateTime, Local};
use coltype_core::history::{Losses, Metrics};
use coltype_core::{BestMetrics, CtaError, Result, TrainingHistory};
use serde::{Deserialize, Serialize};

use crate::model::copy_into_varmap;
use crate::optim::{NamedAdamW, OptimizerState};

const MODEL_PREFIX: &str = "model.";
const OPTIMIZER_PREFIX: &str = "optimizer.";
const STATE_KEY: &str = "training_state";
const EXTENSION: &str = "safetensors";

/// Path of the checkpoint holding the best model for `metric`.
pub fn best_checkpoint_path<P: AsRef<Path>>(dir: P, metric: &str) -> PathBuf {
    dir.as_ref().join(format!("model_best_{metric}.{EXTENSION}"))
}

/// Path of a periodic checkpoint taken after `epoch` at time `now`.
pub fn periodic_checkpoint_path<P: AsRef<Path>>(
    dir: P,
    epoch: usize,
    now: DateTime<Local>,
) -> PathBuf {
    dir.as_ref().join(format!(
        "model_epoch_{epoch}_datetime-{}.{EXTENSION}",
        now.format("%d-%m-%y_%H-%M-%S")
    ))
}

/// Scalar training state stored in the file metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    pub epoch: usize,
    pub losses: Losses,
    pub metrics: Metrics,
    /// Keys in `best_{metric}` form.
    pub best_metrics: BTreeMap<String, f64>,
    pub optimizer_step: usize,
    pub learning_rate: f64,
}

/// Everything read back from a checkpoint file.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub state: TrainingState,
    pub model: HashMap<String, Tensor>,
    pub optimizer: OptimizerState,
}

impl Checkpoint {
    /// Epoch training resumes from.
    pub fn next_epoch(&self) -> usize {
        self.state.epoch + 1
    }

    pub fn history(&self) -> TrainingHistory {
        TrainingHistory {
            losses: self.state.losses.clone(),
            metrics: self.state.metrics.clone(),
        }
    }

    pub fn best_metrics<S: AsRef<str>>(&self, metric_names: &[S]) -> BestMetrics {
        BestMetrics::from_prefixed(metric_names, &self.state.best_metrics)
    }

    /// Writes the model parameters back into `varmap`. Every parameter must
    /// be present in the checkpoint.
    pub fn restore_model(&self, varmap: &VarMap) -> Result<()> {
        let expected = varmap.all_vars().len();
        let loaded = copy_into_varmap(varmap, self.model.clone(), &[])?;
        if loaded != expected {
            return Err(CtaError::Checkpoint(format!(
                "checkpoint restored {loaded} of {expected} model parameters"
            )));
        }
        Ok(())
    }
}

fn checkpoint_err(e: impl std::fmt::Display) -> CtaError {
    CtaError::Checkpoint(e.to_string())
}

/// Saves model, optimizer and history after `epoch` to `path`.
pub fn save_checkpoint<P: AsRef<Path>>(
    path: P,
    epoch: usize,
    varmap: &VarMap,
    optimizer: &NamedAdamW,
    history: &TrainingHistory,
    best: &BestMetrics,
) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let optimizer_state = optimizer.state();
    let state = TrainingState {
        epoch,
        losses: history.losses.clone(),
        metrics: history.metrics.clone(),
        best_metrics: best.to_prefixed(),
        optimizer_step: optimizer_state.step,
        learning_rate: optimizer_state.lr,
    };

    let mut tensors: Vec<(String, Tensor)> = {
        let vars = varmap
            .data()
            .lock()
            .map_err(|_| CtaError::Checkpoint("parameter store lock poisoned".into()))?;
        vars.iter()
            .map(|(name, var)| (format!("{MODEL_PREFIX}{name}"), var.as_tensor().clone()))
            .collect()
    };
    tensors.extend(
        optimizer_state
            .moments
            .into_iter()
            .map(|(name, tensor)| (format!("{OPTIMIZER_PREFIX}{name}"), tensor)),
    );
    tensors.sort_by(|a, b| a.0.cmp(&b.0));

    let metadata = HashMap::from([(STATE_KEY.to_string(), serde_json::to_string(&state)?)]);
    safetensors::serialize_to_file(tensors, &Some(metadata), path).map_err(checkpoint_err)?;
    Ok(())
}

/// Reads a checkpoint, placing tensors on `device`.
pub fn load_checkpoint<P: AsRef<Path>>(path: P, device: &Device) -> Result<Checkpoint> {
    let buffer = std::fs::read(path.as_ref())?;

    let (_, header) = safetensors::SafeTensors::read_metadata(&buffer).map_err(checkpoint_err)?;
    let raw_state = header
        .metadata()
        .as_ref()
        .and_then(|m| m.get(STATE_KEY))
        .ok_or_else(|| {
            CtaError::Checkpoint(format!(
                "{} has no {STATE_KEY} metadata",
                path.as_ref().display()
            ))
        })?;
    let state: TrainingState = serde_json::from_str(raw_state)?;

    let mut model = HashMap::new();
    let mut moments = HashMap::new();
    for (name, tensor) in candle_core::safetensors::load_buffer(&buffer, device)? {
        if let Some(param) = name.strip_prefix(MODEL_PREFIX) {
            model.insert(param.to_string(), tensor);
        } else if let Some(moment) = name.strip_prefix(OPTIMIZER_PREFIX) {
            moments.insert(moment.to_string(), tensor);
        }
    }

    let optimizer = OptimizerState {
        step: state.optimizer_step,
        lr: state.learning_rate,
        moments,
    };
    Ok(Checkpoint {
        state,
        model,
        optimizer,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optim::AdamWParams;
    use candle_core::DType;
    use candle_nn::{Init, Optimizer};
    use chrono::TimeZone;
    use coltype_core::metric::{F1_MICRO, MetricScores};
    use coltype_core::EpochSummary;

    fn make_varmap() -> VarMap {
        let varmap = VarMap::new();
        varmap
            .get((2, 3), "layer.weight", Init::Randn { mean: 0.0, stdev: 1.0 }, DType::F32, &Device::Cpu)
            .unwrap();
        varmap
            .get(3, "layer.bias", Init::Const(0.25), DType::F32, &Device::Cpu)
            .unwrap();
        varmap
    }

    fn params(varmap: &VarMap) -> Vec<(String, Vec<f32>)> {
        let vars = varmap.data().lock().unwrap();
        let mut out: Vec<_> = vars
            .iter()
            .map(|(k, v)| {
                (
                    k.clone(),
                    v.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap(),
                )
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    #[test]
    fn checkpoint_file_names() {
        let now = Local.with_ymd_and_hms(2024, 3, 7, 14, 5, 9).unwrap();
        assert_eq!(
            periodic_checkpoint_path("ckpt", 4, now),
            PathBuf::from("ckpt").join("model_epoch_4_datetime-07-03-24_14-05-09.safetensors")
        );
        assert_eq!(
            best_checkpoint_path("ckpt", "f1_macro"),
            PathBuf::from("ckpt").join("model_best_f1_macro.safetensors")
        );
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = best_checkpoint_path(dir.path(), F1_MICRO);

        let varmap = make_varmap();
        let mut optimizer = NamedAdamW::from_varmap(&varmap, AdamWParams::default()).unwrap();
        let loss = varmap
            .all_vars()
            .iter()
            .map(|v| v.as_tensor().sqr().unwrap().sum_all().unwrap())
            .reduce(|a, b| (a + b).unwrap())
            .unwrap();
        optimizer.backward_step(&loss).unwrap();

        let mut history = TrainingHistory::new(&[F1_MICRO]);
        let summary = EpochSummary {
            loss: 0.7,
            scores: MetricScores {
                f1_micro: 0.6,
                ..Default::default()
            },
        };
        history.push_train(&summary);
        history.push_valid(&summary);
        let mut best = BestMetrics::new(&[F1_MICRO]);
        best.update(F1_MICRO, 0.6);

        save_checkpoint(&path, 2, &varmap, &optimizer, &history, &best).unwrap();
        let checkpoint = load_checkpoint(&path, &Device::Cpu).unwrap();

        assert_eq!(checkpoint.state.epoch, 2);
        assert_eq!(checkpoint.next_epoch(), 3);
        assert_eq!(checkpoint.history(), history);
        assert_eq!(checkpoint.best_metrics(&[F1_MICRO]), best);
        assert_eq!(checkpoint.optimizer.step, 1);

        let restored = make_varmap();
        checkpoint.restore_model(&restored).unwrap();
        assert_eq!(params(&restored), params(&varmap));

        let mut restored_opt = NamedAdamW::from_varmap(&restored, AdamWParams::default()).unwrap();
        restored_opt.load_state(&checkpoint.optimizer).unwrap();
        assert_eq!(restored_opt.step_count(), 1);
        let before = optimizer.state();
        let after = restored_opt.state();
        for (key, tensor) in &before.moments {
            assert_eq!(
                tensor.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
                after.moments[key].flatten_all().unwrap().to_vec1::<f32>().unwrap()
            );
        }
    }

    #[test]
    fn restore_rejects_incomplete_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.safetensors");
        let small = VarMap::new();
        small
            .get(3, "layer.bias", Init::Const(0.0), DType::F32, &Device::Cpu)
            .unwrap();
        let optimizer = NamedAdamW::from_varmap(&small, AdamWParams::default()).unwrap();
        save_checkpoint(
            &path,
            0,
            &small,
            &optimizer,
            &TrainingHistory::new(&[F1_MICRO]),
            &BestMetrics::new(&[F1_MICRO]),
        )
        .unwrap();

        let checkpoint = load_checkpoint(&path, &Device::Cpu).unwrap();
        let err = checkpoint.restore_model(&make_varmap()).unwrap_err();
        assert!(matches!(err, CtaError::Checkpoint(_)));
    }

    #[test]
    fn plain_safetensors_file_is_not_a_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.safetensors");
        let tensors = HashMap::from([(
            "w".to_string(),
            Tensor::zeros(2, DType::F32, &Device::Cpu).unwrap(),
        )]);
        candle_core::safetensors::save(&tensors, &path).unwrap();
        assert!(matches!(
            load_checkpoint(&path, &Device::Cpu),
            Err(CtaError::Checkpoint(_))
        ));
    }
}
