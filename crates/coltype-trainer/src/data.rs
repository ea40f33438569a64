//! # Table Data
//!
//! Loading of annotated tables, their serialization into token sequences
//! with one CLS marker per column, batch collation and the train/valid
//! split loaders.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use candle_core::{Device, Tensor};
use coltype_core::config::SerializationStrategy;
use coltype_core::{CtaError, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Token id used for padding.
pub const PAD_ID: u32 = 0;

/// Maximum sequence length accepted by the BERT encoder.
pub const MAX_SEQ_LEN: usize = 512;

/// One annotated table as stored on disk (one JSON object per line).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRecord {
    pub table_id: String,
    /// Cell values, column-major.
    pub columns: Vec<Vec<String>>,
    /// Semantic type of each column.
    pub labels: Vec<u32>,
}

/// A serialized training example.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub data: Vec<u32>,
    /// One label per CLS token in `data`.
    pub labels: Vec<u32>,
}

/// A collated batch.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Token ids, `[batch, max_len]`, right-padded with [`PAD_ID`].
    pub data: Tensor,
    /// Concatenated labels of every sample, `[num_columns]`.
    pub labels: Tensor,
}

/// Encodes cell text into token ids, without special tokens.
pub trait TextEncoder {
    fn encode_text(&self, text: &str) -> Result<Vec<u32>>;
}

impl TextEncoder for tokenizers::Tokenizer {
    fn encode_text(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .encode(text, false)
            .map_err(|e| CtaError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }
}

/// Resolves a special token of a HuggingFace tokenizer.
pub fn special_token_id(tokenizer: &tokenizers::Tokenizer, token: &str) -> Result<u32> {
    tokenizer
        .token_to_id(token)
        .ok_or_else(|| CtaError::Tokenizer(format!("tokenizer has no {token} token")))
}

/// Serializes tables into [`Sample`]s.
#[derive(Debug, Clone)]
pub struct TableSerializer {
    pub cls_id: u32,
    pub sep_id: u32,
    pub num_rows: usize,
    pub max_len: usize,
    pub strategy: SerializationStrategy,
}

impl TableSerializer {
    pub fn new(cls_id: u32, sep_id: u32, num_rows: usize) -> Self {
        Self {
            cls_id,
            sep_id,
            num_rows,
            max_len: MAX_SEQ_LEN,
            strategy: SerializationStrategy::default(),
        }
    }

    pub fn with_strategy(mut self, strategy: SerializationStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    fn encode_column<E: TextEncoder>(&self, encoder: &E, column: &[String]) -> Result<Vec<u32>> {
        let text = column
            .iter()
            .take(self.num_rows)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ");
        let mut ids = encoder.encode_text(&text)?;
        // Cell text spelling out the CLS marker must not add a column.
        ids.retain(|&id| id != self.cls_id);
        Ok(ids)
    }

    /// Serializes one table according to the configured strategy.
    pub fn serialize<E: TextEncoder>(&self, encoder: &E, record: &TableRecord) -> Result<Vec<Sample>> {
        if record.columns.len() != record.labels.len() {
            return Err(CtaError::Dataset(format!(
                "table {}: {} columns but {} labels",
                record.table_id,
                record.columns.len(),
                record.labels.len()
            )));
        }
        if self.max_len < 3 {
            return Err(CtaError::Dataset(format!(
                "max_len {} leaves no room for a column",
                self.max_len
            )));
        }

        match self.strategy {
            SerializationStrategy::TableWise => {
                self.serialize_table(encoder, record).map(|s| vec![s])
            }
            SerializationStrategy::ColumnWise => self.serialize_in_context(encoder, record),
            SerializationStrategy::SingleColumn => record
                .columns
                .iter()
                .zip(&record.labels)
                .map(|(column, &label)| {
                    let mut data = vec![self.cls_id];
                    data.extend(self.encode_column(encoder, column)?);
                    Ok(self.finish(data, vec![label]))
                })
                .collect(),
        }
    }

    /// One sample per column: `[CLS] target [SEP] other columns [SEP]`.
    fn serialize_in_context<E: TextEncoder>(
        &self,
        encoder: &E,
        record: &TableRecord,
    ) -> Result<Vec<Sample>> {
        let encoded = record
            .columns
            .iter()
            .map(|column| self.encode_column(encoder, column))
            .collect::<Result<Vec<_>>>()?;

        let samples = encoded
            .iter()
            .zip(&record.labels)
            .enumerate()
            .map(|(target, (ids, &label))| {
                let mut data = vec![self.cls_id];
                data.extend_from_slice(ids);
                data.push(self.sep_id);
                for (_, other) in encoded.iter().enumerate().filter(|(i, _)| *i != target) {
                    data.extend_from_slice(other);
                }
                self.finish(data, vec![label])
            })
            .collect();
        Ok(samples)
    }

    /// Truncates to `max_len - 1` and terminates with SEP.
    fn finish(&self, mut data: Vec<u32>, labels: Vec<u32>) -> Sample {
        data.truncate(self.max_len - 1);
        data.push(self.sep_id);
        Sample { data, labels }
    }

    fn serialize_table<E: TextEncoder>(&self, encoder: &E, record: &TableRecord) -> Result<Sample> {
        let limit = self.max_len - 1;
        let mut data = Vec::new();
        let mut labels = Vec::new();

        for (column, &label) in record.columns.iter().zip(&record.labels) {
            // A CLS past the limit would be cut off with its label orphaned.
            if data.len() >= limit {
                debug!(
                    table = %record.table_id,
                    dropped = record.labels.len() - labels.len(),
                    "columns beyond sequence limit dropped"
                );
                break;
            }
            data.push(self.cls_id);
            data.extend(self.encode_column(encoder, column)?);
            labels.push(label);
        }

        Ok(self.finish(data, labels))
    }
}

/// Reads every table record from a `.jsonl` file.
pub fn load_records<P: AsRef<Path>>(path: P) -> Result<Vec<TableRecord>> {
    let reader = BufReader::new(File::open(path.as_ref())?);
    let mut records = Vec::new();

    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        records.push(serde_json::from_str(line)?);
    }

    Ok(records)
}

/// All serialized samples of a dataset directory.
#[derive(Debug, Clone, Default)]
pub struct TableDataset {
    samples: Vec<Sample>,
}

impl TableDataset {
    pub fn from_samples(samples: Vec<Sample>) -> Self {
        Self { samples }
    }

    /// Loads and serializes every `*.jsonl` file in `data_dir`, in file name order.
    pub fn load<P: AsRef<Path>, E: TextEncoder>(
        data_dir: P,
        serializer: &TableSerializer,
        encoder: &E,
    ) -> Result<Self> {
        let mut files: Vec<_> = std::fs::read_dir(data_dir.as_ref())?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "jsonl"))
            .collect();
        files.sort();

        if files.is_empty() {
            return Err(CtaError::Dataset(format!(
                "no .jsonl tables found in {}",
                data_dir.as_ref().display()
            )));
        }

        let mut samples = Vec::new();
        let mut tables = 0usize;
        for file in &files {
            for record in load_records(file)? {
                samples.extend(serializer.serialize(encoder, &record)?);
                tables += 1;
            }
        }

        info!(
            files = files.len(),
            tables,
            samples = samples.len(),
            "dataset loaded"
        );
        Ok(Self { samples })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Sample> {
        self.samples.get(index)
    }

    pub fn into_samples(self) -> Vec<Sample> {
        self.samples
    }
}

/// Pads every sample to the longest one and concatenates their labels.
pub fn collate(samples: &[&Sample], device: &Device) -> Result<Batch> {
    let max_len = samples.iter().map(|s| s.data.len()).max().unwrap_or(0);

    let mut data = Vec::with_capacity(samples.len() * max_len);
    let mut labels = Vec::new();
    for sample in samples {
        data.extend_from_slice(&sample.data);
        data.extend(std::iter::repeat_n(PAD_ID, max_len - sample.data.len()));
        labels.extend_from_slice(&sample.labels);
    }

    let label_count = labels.len();
    Ok(Batch {
        data: Tensor::from_vec(data, (samples.len(), max_len), device)?,
        labels: Tensor::from_vec(labels, label_count, device)?,
    })
}

fn shuffle(indices: &mut [usize], rng: &mut oorandom::Rand32) {
    for i in (1..indices.len()).rev() {
        let j = rng.rand_range(0..(i as u32 + 1)) as usize;
        indices.swap(i, j);
    }
}

/// Batches one split of a dataset.
pub struct CtaDataLoader {
    samples: Vec<Sample>,
    order: Vec<usize>,
    batch_size: usize,
    shuffle: bool,
    rng: oorandom::Rand32,
    valid: Option<Vec<Sample>>,
}

impl CtaDataLoader {
    /// Splits `dataset` into a shuffled training loader holding
    /// `1 - valid_split` of the samples; the remainder is available through
    /// [`CtaDataLoader::get_valid_dataloader`].
    pub fn new(
        dataset: TableDataset,
        batch_size: usize,
        num_workers: usize,
        valid_split: f64,
        seed: u64,
    ) -> Self {
        if num_workers > 0 {
            debug!(num_workers, "batches are collated on the calling thread");
        }

        let mut rng = oorandom::Rand32::new(seed);
        let mut samples: Vec<Option<Sample>> =
            dataset.into_samples().into_iter().map(Some).collect();
        let mut indices: Vec<usize> = (0..samples.len()).collect();
        shuffle(&mut indices, &mut rng);

        let n_valid = (samples.len() as f64 * valid_split).floor() as usize;
        let (valid_idx, train_idx) = indices.split_at(n_valid);
        let mut take = |idx: &[usize]| -> Vec<Sample> {
            idx.iter().filter_map(|&i| samples[i].take()).collect()
        };
        let valid = take(valid_idx);
        let train = take(train_idx);

        info!(train = train.len(), valid = valid.len(), "dataset split");

        let mut loader = Self::from_samples(train, batch_size, true, rng);
        loader.valid = Some(valid);
        loader
    }

    fn from_samples(
        samples: Vec<Sample>,
        batch_size: usize,
        shuffle: bool,
        rng: oorandom::Rand32,
    ) -> Self {
        let order = (0..samples.len()).collect();
        Self {
            samples,
            order,
            batch_size: batch_size.max(1),
            shuffle,
            rng,
            valid: None,
        }
    }

    /// An unshuffled loader over `samples`.
    pub fn sequential(samples: Vec<Sample>, batch_size: usize) -> Self {
        Self::from_samples(samples, batch_size, false, oorandom::Rand32::new(0))
    }

    /// Hands out the held-out validation split. Empty on a second call.
    pub fn get_valid_dataloader(&mut self) -> Self {
        let valid = self.valid.take().unwrap_or_default();
        Self::sequential(valid, self.batch_size)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn num_batches(&self) -> usize {
        self.samples.len().div_ceil(self.batch_size)
    }

    /// Iterates one epoch of collated batches, reshuffling first if enabled.
    pub fn batches<'a>(&'a mut self, device: &'a Device) -> impl Iterator<Item = Result<Batch>> + 'a {
        if self.shuffle {
            shuffle(&mut self.order, &mut self.rng);
        }
        let samples = &self.samples;
        self.order.chunks(self.batch_size).map(move |chunk| {
            let picked: Vec<&Sample> = chunk.iter().map(|&i| &samples[i]).collect();
            collate(&picked, device)
        })
    }
}
