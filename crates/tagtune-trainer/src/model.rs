//! Token classification model: a frozen encoder plus a trainable linear head.
//!
//! Only the head is created through a [`VarMap`], so only the head is seen by
//! the optimizer. Encoder weights are loaded as plain tensors and the encoder
//! output is detached before it reaches the head.

use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use candle_nn::{Embedding, Linear, Module, VarBuilder, VarMap};
use candle_transformers::models::distilbert::{Config as DistilBertConfig, DistilBertModel};
use tagtune_core::TrainingConfig;
use tracing::info;

use crate::error::{Result, TrainError};
use crate::replica::load_head_parameters;

/// Produces one hidden vector per input position.
pub trait Encoder {
    fn hidden_size(&self) -> usize;

    /// `input_ids`, `attention_mask`: `[batch, seq]` u32. Returns
    /// `[batch, seq, hidden]`.
    fn encode(&self, input_ids: &Tensor, attention_mask: &Tensor) -> candle_core::Result<Tensor>;
}

/// A model that scores every label at every position.
pub trait TokenClassifier {
    /// `[batch, seq, num_labels]` logits.
    fn logits(&self, input_ids: &Tensor, attention_mask: &Tensor) -> candle_core::Result<Tensor>;

    /// Parameters updated by the optimizer and written to checkpoints.
    fn trainable(&self) -> &VarMap;
}

/// Builds one model per worker.
///
/// Workers build their model on their own thread, so the model itself does
/// not need to be `Send`; the factory is shared between workers.
pub trait ModelFactory: Send + Sync + 'static {
    type Model: TokenClassifier;

    fn build(&self, config: &TrainingConfig, device: &Device) -> Result<Self::Model>;
}

/// Pretrained DistilBERT encoder loaded from a model directory.
pub struct DistilBertEncoder {
    model: DistilBertModel,
    hidden_size: usize,
}

impl DistilBertEncoder {
    /// Load `config.json` and `model.safetensors` from `dir`.
    pub fn load<P: AsRef<Path>>(dir: P, device: &Device) -> Result<Self> {
        let dir = dir.as_ref();
        let config_path = dir.join("config.json");
        let weights_path = dir.join("model.safetensors");

        if !weights_path.exists() {
            return Err(TrainError::ModelLoad(format!(
                "model not found at {}",
                weights_path.display()
            )));
        }

        let config_str = std::fs::read_to_string(&config_path).map_err(|e| {
            TrainError::ModelLoad(format!("failed to read {}: {e}", config_path.display()))
        })?;
        let config: DistilBertConfig = serde_json::from_str(&config_str)
            .map_err(|e| TrainError::ModelLoad(format!("failed to parse config: {e}")))?;
        let raw: serde_json::Value = serde_json::from_str(&config_str)?;
        let hidden_size = raw
            .get("dim")
            .and_then(serde_json::Value::as_u64)
            .map_or(768, |dim| dim as usize);

        // SAFETY: the weight file is not modified while it is mapped.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights_path], DType::F32, device) }?;
        let model = DistilBertModel::load(vb.pp("distilbert"), &config)
            .or_else(|_| DistilBertModel::load(vb, &config))?;

        info!(path = %dir.display(), hidden_size, "loaded encoder");
        Ok(Self { model, hidden_size })
    }
}

impl Encoder for DistilBertEncoder {
    fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    fn encode(&self, input_ids: &Tensor, attention_mask: &Tensor) -> candle_core::Result<Tensor> {
        // DistilBERT fills positions where the mask is set, so invert the
        // attention mask: 1 marks padding.
        let (batch, seq) = attention_mask.dims2()?;
        let padding = attention_mask.eq(0u32)?.reshape((batch, 1, 1, seq))?;
        self.model.forward(input_ids, &padding)
    }
}

/// Fixed random embedding table. A lightweight stand-in encoder for smoke
/// runs and tests.
pub struct EmbeddingEncoder {
    embeddings: Embedding,
    hidden_size: usize,
}

impl EmbeddingEncoder {
    pub fn new(vocab_size: usize, hidden_size: usize, seed: u64, device: &Device) -> Result<Self> {
        let mut rng = oorandom::Rand32::new(seed);
        let values: Vec<f32> = (0..vocab_size * hidden_size)
            .map(|_| rng.rand_float() * 2.0 - 1.0)
            .collect();
        let table = Tensor::from_vec(values, (vocab_size, hidden_size), device)?;
        Ok(Self {
            embeddings: Embedding::new(table, hidden_size),
            hidden_size,
        })
    }
}

impl Encoder for EmbeddingEncoder {
    fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    fn encode(&self, input_ids: &Tensor, _attention_mask: &Tensor) -> candle_core::Result<Tensor> {
        self.embeddings.forward(input_ids)
    }
}

/// Frozen encoder with a linear classification head.
pub struct TokenTagger<E> {
    encoder: E,
    head: Linear,
    varmap: VarMap,
}

impl<E: Encoder> TokenTagger<E> {
    /// The head is drawn from `seed`, so every replica built with the same
    /// seed starts from the same weights.
    pub fn new(encoder: E, num_labels: usize, seed: u64, device: &Device) -> Result<Self> {
        let hidden = encoder.hidden_size();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let head = candle_nn::linear(hidden, num_labels, vb.pp("classifier"))?;

        // Same range as candle's default linear init.
        let bound = 1.0 / (hidden as f32).sqrt();
        let mut rng = oorandom::Rand32::new(seed);
        let mut uniform = |n: usize| -> Vec<f32> {
            (0..n)
                .map(|_| (rng.rand_float() * 2.0 - 1.0) * bound)
                .collect()
        };
        let weight = Tensor::from_vec(uniform(num_labels * hidden), (num_labels, hidden), device)?;
        let bias = Tensor::from_vec(uniform(num_labels), num_labels, device)?;
        load_head_parameters(
            &varmap,
            &[
                ("classifier.weight".to_string(), weight),
                ("classifier.bias".to_string(), bias),
            ],
        )?;

        Ok(Self {
            encoder,
            head,
            varmap,
        })
    }

    pub fn encoder(&self) -> &E {
        &self.encoder
    }
}

impl<E: Encoder> TokenClassifier for TokenTagger<E> {
    fn logits(&self, input_ids: &Tensor, attention_mask: &Tensor) -> candle_core::Result<Tensor> {
        let hidden = self.encoder.encode(input_ids, attention_mask)?.detach();
        self.head.forward(&hidden)
    }

    fn trainable(&self) -> &VarMap {
        &self.varmap
    }
}

/// Loads a [`DistilBertEncoder`] from `TrainingConfig::model_name`, or from
/// an explicit directory.
#[derive(Debug, Clone, Default)]
pub struct DistilBertFactory {
    model_dir: Option<PathBuf>,
}

impl DistilBertFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.model_dir = Some(dir.into());
        self
    }
}

impl ModelFactory for DistilBertFactory {
    type Model = TokenTagger<DistilBertEncoder>;

    fn build(&self, config: &TrainingConfig, device: &Device) -> Result<Self::Model> {
        let dir = self
            .model_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(&config.model_name));
        let encoder = DistilBertEncoder::load(dir, device)?;
        TokenTagger::new(encoder, config.num_labels, config.seed, device)
    }
}

/// Builds taggers over an [`EmbeddingEncoder`]. Every worker gets the same
/// encoder table for a given seed, and the same head for a given
/// `TrainingConfig::seed`.
#[derive(Debug, Clone, Copy)]
pub struct EmbeddingFactory {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub seed: u64,
}

impl EmbeddingFactory {
    pub fn new(vocab_size: usize, hidden_size: usize) -> Self {
        Self {
            vocab_size,
            hidden_size,
            seed: 0,
        }
    }
}

impl ModelFactory for EmbeddingFactory {
    type Model = TokenTagger<EmbeddingEncoder>;

    fn build(&self, config: &TrainingConfig, device: &Device) -> Result<Self::Model> {
        let encoder = EmbeddingEncoder::new(self.vocab_size, self.hidden_size, self.seed, device)?;
        TokenTagger::new(encoder, config.num_labels, config.seed, device)
    }
}
