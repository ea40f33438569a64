//! BERT encoder with a per-token classification head.

use std::borrow::Cow;
use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::{Dropout, Linear, Module, ModuleT, VarBuilder, VarMap};
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use coltype_core::{CtaError, Result};
use serde::Deserialize;
use tracing::{info, warn};

/// Prefix added to parameter names by data-parallel wrappers.
const DATA_PARALLEL_PREFIX: &str = "module.";

/// A trainable model producing per-token logits.
pub trait ColumnClassifier {
    /// `input_ids`, `attention_mask`: `[batch, seq_len]`.
    /// Returns logits of shape `[batch, seq_len, num_labels]`.
    fn forward_t(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        train: bool,
    ) -> candle_core::Result<Tensor>;

    /// Store owning every trainable parameter.
    fn varmap(&self) -> &VarMap;
}

/// The subset of the encoder config the classification head needs.
#[derive(Debug, Deserialize)]
struct HeadDims {
    hidden_size: usize,
    #[serde(default)]
    hidden_dropout_prob: f64,
    #[serde(default)]
    classifier_dropout: Option<f64>,
}

/// BERT followed by dropout and a linear layer over every token.
pub struct BertForColumnClassification {
    bert: BertModel,
    dropout: Dropout,
    classifier: Linear,
    varmap: VarMap,
    num_labels: usize,
}

impl BertForColumnClassification {
    /// Builds a freshly initialised model from a BERT `config.json` document.
    pub fn new(config_json: &str, num_labels: usize, device: &Device) -> Result<Self> {
        let config: BertConfig = serde_json::from_str(config_json)?;
        let dims: HeadDims = serde_json::from_str(config_json)?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let bert = BertModel::load(vb.pp("bert"), &config)?;
        let classifier = candle_nn::linear(dims.hidden_size, num_labels, vb.pp("classifier"))?;
        let dropout = Dropout::new(dims.classifier_dropout.unwrap_or(dims.hidden_dropout_prob) as f32);

        Ok(Self {
            bert,
            dropout,
            classifier,
            varmap,
            num_labels,
        })
    }

    /// Builds the model from a pretrained directory.
    ///
    /// `config.json` is required; `model.safetensors` is loaded when present.
    pub fn from_pretrained_dir<P: AsRef<Path>>(
        dir: P,
        num_labels: usize,
        device: &Device,
    ) -> Result<Self> {
        let dir = dir.as_ref();
        let config_json = std::fs::read_to_string(dir.join("config.json"))?;
        let model = Self::new(&config_json, num_labels, device)?;

        let weights = dir.join("model.safetensors");
        if weights.exists() {
            model.load_pretrained(&weights)?;
        } else {
            warn!(dir = %dir.display(), "no pretrained weights found, encoder is randomly initialised");
        }
        Ok(model)
    }

    /// Copies matching tensors from a safetensors file into the model.
    ///
    /// Returns the number of parameters that were set.
    pub fn load_pretrained<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let device = self.bert_device();
        let tensors = candle_core::safetensors::load(path.as_ref(), &device)?;
        let loaded = copy_into_varmap(&self.varmap, tensors, &["bert."])?;
        info!(
            path = %path.as_ref().display(),
            loaded,
            "pretrained weights loaded"
        );
        Ok(loaded)
    }

    pub fn num_labels(&self) -> usize {
        self.num_labels
    }

    fn bert_device(&self) -> Device {
        self.classifier.weight().device().clone()
    }
}

impl ColumnClassifier for BertForColumnClassification {
    fn forward_t(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        train: bool,
    ) -> candle_core::Result<Tensor> {
        let token_type_ids = input_ids.zeros_like()?;
        let hidden = self
            .bert
            .forward(input_ids, &token_type_ids, Some(attention_mask))?;
        let hidden = self.dropout.forward_t(&hidden, train)?;
        self.classifier.forward(&hidden)
    }

    fn varmap(&self) -> &VarMap {
        &self.varmap
    }
}

/// Removes the data-parallel `module.` prefix from a parameter name.
pub fn strip_data_parallel_prefix(name: &str) -> &str {
    name.strip_prefix(DATA_PARALLEL_PREFIX).unwrap_or(name)
}

/// Maps TF-era LayerNorm names (`gamma`, `beta`) to `weight` and `bias`.
pub fn rename_legacy_layer_norm(name: &str) -> Cow<'_, str> {
    if let Some(stem) = name.strip_suffix(".gamma") {
        Cow::Owned(format!("{stem}.weight"))
    } else if let Some(stem) = name.strip_suffix(".beta") {
        Cow::Owned(format!("{stem}.bias"))
    } else {
        Cow::Borrowed(name)
    }
}

/// Sets every var of `varmap` that has a counterpart in `tensors`.
///
/// Names are matched after stripping the data-parallel prefix and renaming
/// legacy LayerNorm parameters, and then with each of `fallback_prefixes`
/// prepended. Unmatched vars keep their values.
pub fn copy_into_varmap(
    varmap: &VarMap,
    tensors: HashMap<String, Tensor>,
    fallback_prefixes: &[&str],
) -> Result<usize> {
    let vars = varmap
        .data()
        .lock()
        .map_err(|_| CtaError::Checkpoint("parameter store lock poisoned".into()))?;

    let mut loaded = 0usize;
    let mut unused = 0usize;
    for (name, tensor) in tensors {
        let name = rename_legacy_layer_norm(strip_data_parallel_prefix(&name));
        let var = vars.get(name.as_ref()).or_else(|| {
            fallback_prefixes
                .iter()
                .find_map(|prefix| vars.get(&format!("{prefix}{name}")))
        });
        match var {
            Some(var) => {
                var.set(&tensor.to_dtype(var.dtype())?)?;
                loaded += 1;
            }
            None => unused += 1,
        }
    }

    if loaded < vars.len() {
        warn!(
            missing = vars.len() - loaded,
            "parameters not found in weights file keep their initial values"
        );
    }
    if unused > 0 {
        warn!(unused, "tensors in weights file matched no parameter");
    }
    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TINY_BERT: &str = r#"{
        "vocab_size": 32,
        "hidden_size": 8,
        "num_hidden_layers": 1,
        "num_attention_heads": 2,
        "intermediate_size": 16,
        "hidden_act": "gelu",
        "hidden_dropout_prob": 0.1,
        "max_position_embeddings": 16,
        "type_vocab_size": 2,
        "initializer_range": 0.02,
        "layer_norm_eps": 1e-12,
        "pad_token_id": 0,
        "position_embedding_type": "absolute"
    }"#;

    #[test]
    fn forward_produces_per_token_logits() {
        let model = BertForColumnClassification::new(TINY_BERT, 5, &Device::Cpu).unwrap();
        let ids = Tensor::new(&[[2u32, 7, 9, 0], [2, 4, 0, 0]], &Device::Cpu).unwrap();
        let mask = ids.ne(0u32).unwrap();
        let logits = model.forward_t(&ids, &mask, false).unwrap();
        assert_eq!(logits.dims(), &[2, 4, 5]);
        assert_eq!(model.num_labels(), 5);
    }

    #[test]
    fn params_registered_under_bert_and_classifier() {
        let model = BertForColumnClassification::new(TINY_BERT, 3, &Device::Cpu).unwrap();
        let vars = model.varmap().data().lock().unwrap();
        assert!(vars.contains_key("classifier.weight"));
        assert!(vars.keys().any(|k| k.starts_with("bert.embeddings.")));
    }

    #[test]
    fn strips_data_parallel_prefix() {
        assert_eq!(strip_data_parallel_prefix("module.classifier.weight"), "classifier.weight");
        assert_eq!(strip_data_parallel_prefix("classifier.weight"), "classifier.weight");
    }

    #[test]
    fn renames_legacy_layer_norm_params() {
        assert_eq!(
            rename_legacy_layer_norm("embeddings.LayerNorm.gamma"),
            "embeddings.LayerNorm.weight"
        );
        assert_eq!(
            rename_legacy_layer_norm("encoder.layer.0.output.LayerNorm.beta"),
            "encoder.layer.0.output.LayerNorm.bias"
        );
        assert_eq!(rename_legacy_layer_norm("classifier.weight"), "classifier.weight");
    }

    #[test]
    fn load_pretrained_accepts_gamma_beta_layer_norm() {
        let dir = tempfile::tempdir().unwrap();
        let model = BertForColumnClassification::new(TINY_BERT, 3, &Device::Cpu).unwrap();

        let mut tensors = HashMap::new();
        tensors.insert(
            "bert.embeddings.LayerNorm.gamma".to_string(),
            Tensor::full(2.0f32, 8, &Device::Cpu).unwrap(),
        );
        tensors.insert(
            "embeddings.LayerNorm.beta".to_string(),
            Tensor::full(0.5f32, 8, &Device::Cpu).unwrap(),
        );
        let path = dir.path().join("model.safetensors");
        candle_core::safetensors::save(&tensors, &path).unwrap();

        assert_eq!(model.load_pretrained(&path).unwrap(), 2);

        let vars = model.varmap().data().lock().unwrap();
        let weight = vars["bert.embeddings.LayerNorm.weight"]
            .as_tensor()
            .to_vec1::<f32>()
            .unwrap();
        let bias = vars["bert.embeddings.LayerNorm.bias"]
            .as_tensor()
            .to_vec1::<f32>()
            .unwrap();
        assert!(weight.iter().all(|&v| v == 2.0));
        assert!(bias.iter().all(|&v| v == 0.5));
    }

    #[test]
    fn load_pretrained_matches_prefixed_and_bare_names() {
        let dir = tempfile::tempdir().unwrap();
        let model = BertForColumnClassification::new(TINY_BERT, 3, &Device::Cpu).unwrap();

        let word_embeddings = Tensor::ones((32, 8), DType::F32, &Device::Cpu).unwrap();
        let head = Tensor::full(0.5f32, (3, 8), &Device::Cpu).unwrap();
        let mut tensors = HashMap::new();
        // bare encoder name, as in a headless checkpoint
        tensors.insert("embeddings.word_embeddings.weight".to_string(), word_embeddings);
        tensors.insert("module.classifier.weight".to_string(), head);
        tensors.insert("cls.predictions.bias".to_string(), Tensor::zeros(32, DType::F32, &Device::Cpu).unwrap());
        let path = dir.path().join("model.safetensors");
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let loaded = model.load_pretrained(&path).unwrap();
        assert_eq!(loaded, 2);

        let vars = model.varmap().data().lock().unwrap();
        let head = vars["classifier.weight"].as_tensor().to_vec2::<f32>().unwrap();
        assert!(head.iter().flatten().all(|&v| v == 0.5));
        let emb = vars["bert.embeddings.word_embeddings.weight"]
            .as_tensor()
            .to_vec2::<f32>()
            .unwrap();
        assert!(emb.iter().flatten().all(|&v| v == 1.0));
    }
}
