//! # Coltype Trainer
//!
//! Fine-tunes a BERT encoder to annotate table columns with semantic types.
//! Tables are serialized with one CLS token per column; the logits at the
//! CLS positions are the column predictions.

pub mod checkpoint;
pub mod data;
pub mod model;
pub mod optim;
pub mod trainer;

use anyhow::Context;
use coltype_core::{Config, CtaError, TrainingHistory, prepare_device};
use tracing::info;

use crate::data::{CtaDataLoader, TableDataset, TableSerializer, special_token_id};
use crate::model::{BertForColumnClassification, ColumnClassifier};
use crate::optim::{AdamWParams, NamedAdamW};

pub use trainer::Trainer;

pub const CLS_TOKEN: &str = "[CLS]";
pub const SEP_TOKEN: &str = "[SEP]";

/// Runs a complete fine-tuning job described by `config` and writes the
/// resulting history next to the checkpoints.
pub fn run_training(config: &Config) -> anyhow::Result<TrainingHistory> {
    let device = prepare_device(config.num_gpu)?.device;
    // candle only exposes seeding for accelerator generators
    if device.is_cuda() {
        device.set_seed(config.seed)?;
    }

    let tokenizer_path = config.pretrained_model_name.join("tokenizer.json");
    let tokenizer = tokenizers::Tokenizer::from_file(&tokenizer_path)
        .map_err(|e| CtaError::Tokenizer(e.to_string()))
        .with_context(|| format!("failed to load tokenizer {}", tokenizer_path.display()))?;
    let cls_token_id = special_token_id(&tokenizer, CLS_TOKEN)?;
    let sep_token_id = special_token_id(&tokenizer, SEP_TOKEN)?;

    let serializer = TableSerializer::new(cls_token_id, sep_token_id, config.dataset.num_rows)
        .with_strategy(config.dataset.table_serialization_strategy);
    let dataset = TableDataset::load(&config.dataset.data_dir, &serializer, &tokenizer)
        .with_context(|| {
            format!("failed to load dataset {}", config.dataset.data_dir.display())
        })?;

    let mut train_loader = CtaDataLoader::new(
        dataset,
        config.batch_size,
        config.dataloader.num_workers,
        config.dataloader.valid_split,
        config.seed,
    );
    let valid_loader = train_loader.get_valid_dataloader();

    let model = BertForColumnClassification::from_pretrained_dir(
        &config.pretrained_model_name,
        config.num_labels,
        &device,
    )?;
    let optimizer = NamedAdamW::from_varmap(model.varmap(), AdamWParams::from(&config.optimizer))?;

    let mut trainer = Trainer::new(
        model,
        optimizer,
        config,
        device,
        cls_token_id,
        train_loader,
        valid_loader,
    )?;
    let history = trainer.train()?;

    let history_path = config.history_path();
    history.save(&history_path)?;
    info!(path = %history_path.display(), epochs = history.epochs(), "history written");

    Ok(history)
}
