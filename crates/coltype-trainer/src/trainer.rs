//! Training loop for the column classifier.

use std::path::PathBuf;

use anyhow::Context;
use candle_core::{D, Device, Tensor};
use candle_nn::Optimizer;
use chrono::Local;
use coltype_core::{
    BestMetrics, Config, CtaError, EpochSummary, TrainingHistory, multiple_f1_score, token_logits,
};
use tracing::{debug, info};

use crate::checkpoint::{
    best_checkpoint_path, load_checkpoint, periodic_checkpoint_path, save_checkpoint,
};
use crate::data::{Batch, CtaDataLoader, PAD_ID};
use crate::model::ColumnClassifier;
use crate::optim::{NamedAdamW, StepLr};

/// Loss, predictions and targets of one forward pass.
struct BatchOutput {
    loss: Tensor,
    predictions: Vec<u32>,
    targets: Vec<u32>,
}

/// Runs the forward pass and cross-entropy over the CLS positions of a batch.
fn forward_batch<M: ColumnClassifier>(
    model: &M,
    batch: &Batch,
    cls_token_id: u32,
    train: bool,
) -> coltype_core::Result<BatchOutput> {
    let attention_mask = batch.data.ne(PAD_ID)?;
    let logits = model.forward_t(&batch.data, &attention_mask, train)?;
    let cls_logits = token_logits(&batch.data, &logits, cls_token_id)?;

    let columns = cls_logits.dim(0)?;
    let labels = batch.labels.dims1()?;
    if columns != labels {
        return Err(CtaError::ShapeMismatch(format!(
            "{columns} CLS tokens for {labels} labels"
        )));
    }

    let loss = candle_nn::loss::cross_entropy(&cls_logits, &batch.labels)?;
    let predictions = cls_logits.argmax(D::Minus1)?.to_vec1::<u32>()?;
    let targets = batch.labels.to_vec1::<u32>()?;
    Ok(BatchOutput {
        loss,
        predictions,
        targets,
    })
}

/// Model trainer.
///
/// Runs training and validation epochs, keeps the loss/metric history,
/// saves the best model per tracked metric and periodic snapshots, and can
/// resume from any of those checkpoints.
pub struct Trainer<M: ColumnClassifier> {
    model: M,
    optimizer: NamedAdamW,
    scheduler: Option<StepLr>,
    train_loader: CtaDataLoader,
    valid_loader: CtaDataLoader,
    device: Device,
    cls_token_id: u32,
    num_labels: usize,
    batch_size: usize,
    num_epochs: usize,
    start_epoch: usize,
    save_period_in_epochs: usize,
    checkpoint_dir: PathBuf,
    metric_names: Vec<String>,
    history: TrainingHistory,
    best: BestMetrics,
}

impl<M: ColumnClassifier> Trainer<M> {
    /// Creates a trainer, restoring the configured checkpoint when resuming.
    pub fn new(
        model: M,
        optimizer: NamedAdamW,
        config: &Config,
        device: Device,
        cls_token_id: u32,
        train_loader: CtaDataLoader,
        valid_loader: CtaDataLoader,
    ) -> anyhow::Result<Self> {
        info!(tag = "TRAINER", "--- New trainer initialized ---");

        let mut trainer = Self {
            model,
            optimizer,
            scheduler: None,
            train_loader,
            valid_loader,
            device,
            cls_token_id,
            num_labels: config.num_labels,
            batch_size: config.batch_size,
            num_epochs: config.num_epochs,
            start_epoch: 0,
            save_period_in_epochs: config.save_period_in_epochs,
            checkpoint_dir: config.checkpoint_dir.clone(),
            metric_names: config.metrics.clone(),
            history: TrainingHistory::new(&config.metrics),
            best: BestMetrics::new(&config.metrics),
        };

        if let Some(path) = config.resume_path() {
            trainer
                .load_checkpoint(&path)
                .with_context(|| format!("failed to resume from {}", path.display()))?;
        }

        trainer.scheduler = config.lr_scheduler.as_ref().map(|scheduler| {
            StepLr::new(scheduler, config.optimizer.lr).with_last_epoch(trainer.start_epoch)
        });

        Ok(trainer)
    }

    /// Trains from the start epoch through `num_epochs - 1`.
    ///
    /// Returns the losses and metrics of every epoch, including epochs
    /// restored from a checkpoint.
    pub fn train(&mut self) -> anyhow::Result<TrainingHistory> {
        for epoch in self.start_epoch..self.num_epochs {
            info!(tag = "EPOCH", epoch, "Epoch {epoch} started.");

            let train = self.train_epoch()?;
            self.history.push_train(&train);
            info!(tag = "LOSS", epoch, "Epoch {epoch}. Train loss: {}.", train.loss);
            for metric in &self.metric_names {
                if let Some(value) = train.scores.get(metric) {
                    info!(tag = "TRAIN_METRICS", epoch, "Epoch {epoch}. {metric}: {value}");
                }
            }

            let valid = self.validate_epoch()?;
            self.history.push_valid(&valid);
            info!(tag = "LOSS", epoch, "Epoch {epoch}. Valid loss: {}.", valid.loss);

            for metric in &self.metric_names {
                let Some(value) = valid.scores.get(metric) else {
                    continue;
                };
                info!(tag = "VALID_METRICS", epoch, "Epoch {epoch}. {metric}: {value}");

                if self.best.update(metric, value) {
                    info!(tag = "BEST_METRIC", epoch, "Epoch {epoch}. New best {metric}: {value}");
                    let path = best_checkpoint_path(&self.checkpoint_dir, metric);
                    self.save_checkpoint(&path, epoch)?;
                    info!(
                        tag = "BEST_SAVED",
                        epoch,
                        path = %path.display(),
                        "Epoch {epoch}. Model with best {metric}: {value} saved."
                    );
                }
            }

            if epoch % self.save_period_in_epochs == 0 {
                let path = periodic_checkpoint_path(&self.checkpoint_dir, epoch, Local::now());
                self.save_checkpoint(&path, epoch)?;
                info!(
                    tag = "PERIODIC_SAVED",
                    epoch,
                    path = %path.display(),
                    "Epoch {epoch}. Model has been saved by periodic saving mechanism."
                );
            }
            info!(tag = "TRAINER", "--- --- ---");
        }

        info!(tag = "TRAINER", "Training successfully ended.");
        Ok(self.history.clone())
    }

    fn train_epoch(&mut self) -> anyhow::Result<EpochSummary> {
        let Self {
            model,
            optimizer,
            scheduler,
            train_loader,
            device,
            cls_token_id,
            num_labels,
            batch_size,
            ..
        } = self;

        let mut running_loss = 0.0f64;
        let mut predictions = Vec::new();
        let mut targets = Vec::new();

        for (step, batch) in train_loader.batches(device).enumerate() {
            let batch = batch?;
            if batch.labels.dims1()? == 0 {
                debug!(step, "batch without labelled columns skipped");
                continue;
            }
            let output = forward_batch(&*model, &batch, *cls_token_id, true)?;
            running_loss += f64::from(output.loss.to_scalar::<f32>()?);
            optimizer.backward_step(&output.loss)?;

            predictions.extend(output.predictions);
            targets.extend(output.targets);
        }

        if let Some(scheduler) = scheduler {
            scheduler.step(optimizer);
            debug!(lr = optimizer.learning_rate(), "learning rate updated");
        }

        Ok(EpochSummary {
            loss: running_loss / *batch_size as f64,
            scores: multiple_f1_score(&predictions, &targets, *num_labels)?,
        })
    }

    fn validate_epoch(&mut self) -> anyhow::Result<EpochSummary> {
        let Self {
            model,
            valid_loader,
            device,
            cls_token_id,
            num_labels,
            batch_size,
            ..
        } = self;

        let mut running_loss = 0.0f64;
        let mut predictions = Vec::new();
        let mut targets = Vec::new();

        for batch in valid_loader.batches(device) {
            let batch = batch?;
            if batch.labels.dims1()? == 0 {
                continue;
            }
            let output = forward_batch(&*model, &batch, *cls_token_id, false)?;
            running_loss += f64::from(output.loss.to_scalar::<f32>()?);

            predictions.extend(output.predictions);
            targets.extend(output.targets);
        }

        Ok(EpochSummary {
            loss: running_loss / *batch_size as f64,
            scores: multiple_f1_score(&predictions, &targets, *num_labels)?,
        })
    }

    fn save_checkpoint(&self, path: &std::path::Path, epoch: usize) -> anyhow::Result<()> {
        save_checkpoint(
            path,
            epoch,
            self.model.varmap(),
            &self.optimizer,
            &self.history,
            &self.best,
        )
        .with_context(|| format!("failed to save checkpoint {}", path.display()))
    }

    /// Restores model, optimizer, history and best values from `path`.
    /// Training continues at the epoch after the stored one.
    pub fn load_checkpoint(&mut self, path: &std::path::Path) -> anyhow::Result<()> {
        let checkpoint = load_checkpoint(path, &self.device)?;

        self.start_epoch = checkpoint.next_epoch();
        checkpoint.restore_model(self.model.varmap())?;
        self.optimizer.load_state(&checkpoint.optimizer)?;
        self.best = checkpoint.best_metrics(&self.metric_names);
        self.history = checkpoint.history();

        info!(
            tag = "TRAINER",
            path = %path.display(),
            start_epoch = self.start_epoch,
            "checkpoint restored"
        );
        Ok(())
    }

    /// First epoch `train` will run.
    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    /// Losses and metrics recorded so far.
    pub fn history(&self) -> &TrainingHistory {
        &self.history
    }

    /// Best validation value per tracked metric.
    pub fn best_metrics(&self) -> &BestMetrics {
        &self.best
    }

    /// The model being trained.
    pub fn model(&self) -> &M {
        &self.model
    }

    /// The optimizer, including its moment state.
    pub fn optimizer(&self) -> &NamedAdamW {
        &self.optimizer
    }
}
