//! # Configuration
//!
//! Typed configuration passed explicitly into every component. A run is
//! described by a [`RunConfig`], usually loaded from JSON, which nests the
//! [`TrainingConfig`] of a single trial and optional search settings.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::align::ContinuationPolicy;
use crate::error::{CoreError, Result};
use crate::labels::BioLabel;

/// Configuration of one training run (one trial).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Directory holding `config.json`, `model.safetensors` and
    /// `tokenizer.json` of the pretrained encoder.
    pub model_name: String,
    pub num_labels: usize,
    pub num_epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    /// Evaluate and checkpoint when `epoch % checkpoint_frequency == 0`.
    pub checkpoint_frequency: usize,
    pub max_length: usize,
    pub num_workers: usize,
    /// Fraction of the optimizer steps spent warming up the learning rate.
    pub warmup_ratio: f64,
    pub weight_decay: f64,
    pub seed: u64,
    pub continuation_policy: ContinuationPolicy,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            model_name: "models/distilbert-base-uncased".to_string(),
            num_labels: BioLabel::NUM_LABELS,
            num_epochs: 3,
            batch_size: 16,
            learning_rate: 5e-5,
            checkpoint_frequency: 1,
            max_length: 128,
            num_workers: 1,
            warmup_ratio: 0.0,
            weight_decay: 0.01,
            seed: 42,
            continuation_policy: ContinuationPolicy::Propagate,
        }
    }
}

impl TrainingConfig {
    /// Create a training configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model_name(mut self, model_name: impl Into<String>) -> Self {
        self.model_name = model_name.into();
        self
    }

    pub fn with_epochs(mut self, num_epochs: usize) -> Self {
        self.num_epochs = num_epochs;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    pub fn with_checkpoint_frequency(mut self, frequency: usize) -> Self {
        self.checkpoint_frequency = frequency;
        self
    }

    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    pub fn with_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_continuation_policy(mut self, policy: ContinuationPolicy) -> Self {
        self.continuation_policy = policy;
        self
    }

    /// Whether `epoch` (0-based) is an evaluation/checkpoint epoch.
    pub fn is_checkpoint_epoch(&self, epoch: usize) -> bool {
        self.checkpoint_frequency > 0 && epoch % self.checkpoint_frequency == 0
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(CoreError::InvalidConfig(msg));
        if self.num_labels != BioLabel::NUM_LABELS {
            return fail(format!(
                "num_labels must be {} for BIO tagging, got {}",
                BioLabel::NUM_LABELS,
                self.num_labels
            ));
        }
        if self.num_epochs == 0 {
            return fail("num_epochs must be at least 1".into());
        }
        if self.batch_size == 0 {
            return fail("batch_size must be at least 1".into());
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return fail(format!("learning_rate must be positive, got {}", self.learning_rate));
        }
        if self.checkpoint_frequency == 0 {
            return fail("checkpoint_frequency must be at least 1".into());
        }
        if self.max_length < 2 {
            return fail(format!("max_length must be at least 2, got {}", self.max_length));
        }
        if self.num_workers == 0 {
            return fail("num_workers must be at least 1".into());
        }
        if !(0.0..1.0).contains(&self.warmup_ratio) {
            return fail(format!("warmup_ratio must be in [0, 1), got {}", self.warmup_ratio));
        }
        Ok(())
    }
}

/// Training fields that can be searched over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Hyperparameter {
    LearningRate,
    BatchSize,
    NumEpochs,
}

impl Hyperparameter {
    /// Write a sampled value into a training configuration.
    pub fn apply(&self, config: &mut TrainingConfig, value: f64) {
        match self {
            Hyperparameter::LearningRate => config.learning_rate = value,
            Hyperparameter::BatchSize => config.batch_size = value.round().max(1.0) as usize,
            Hyperparameter::NumEpochs => config.num_epochs = value.round().max(1.0) as usize,
        }
    }

    /// Current value of this field in `config`.
    pub fn get(&self, config: &TrainingConfig) -> f64 {
        match self {
            Hyperparameter::LearningRate => config.learning_rate,
            Hyperparameter::BatchSize => config.batch_size as f64,
            Hyperparameter::NumEpochs => config.num_epochs as f64,
        }
    }
}

/// Prior over one hyperparameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Distribution {
    /// Continuous, uniform in log space.
    LogUniform { low: f64, high: f64 },
    /// Continuous, uniform.
    Uniform { low: f64, high: f64 },
    /// Integer, uniform over `low..=high`.
    IntUniform { low: i64, high: i64 },
    /// One of a fixed set of values.
    Choice { values: Vec<f64> },
}

impl Distribution {
    fn validate(&self) -> Result<()> {
        let ok = match self {
            Distribution::LogUniform { low, high } => *low > 0.0 && low < high,
            Distribution::Uniform { low, high } => low.is_finite() && high.is_finite() && low < high,
            Distribution::IntUniform { low, high } => low <= high,
            Distribution::Choice { values } => !values.is_empty(),
        };
        if ok {
            Ok(())
        } else {
            Err(CoreError::InvalidConfig(format!("invalid distribution {self:?}")))
        }
    }
}

/// One searched dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchDimension {
    pub param: Hyperparameter,
    pub distribution: Distribution,
}

/// Typed search space over a subset of [`TrainingConfig`] fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    pub dimensions: Vec<SearchDimension>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a dimension to the space.
    pub fn with(mut self, param: Hyperparameter, distribution: Distribution) -> Self {
        self.dimensions.push(SearchDimension {
            param,
            distribution,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.dimensions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.dimensions.len()
    }

    pub fn validate(&self) -> Result<()> {
        if self.dimensions.is_empty() {
            return Err(CoreError::InvalidConfig("search space is empty".into()));
        }
        let mut seen = HashSet::new();
        for dim in &self.dimensions {
            if !seen.insert(dim.param) {
                return Err(CoreError::InvalidConfig(format!(
                    "{:?} appears twice in the search space",
                    dim.param
                )));
            }
            dim.distribution.validate()?;
        }
        Ok(())
    }
}

/// Sampled values of one trial.
pub type SampledConfig = BTreeMap<Hyperparameter, f64>;

/// Apply sampled values on top of a base configuration.
pub fn apply_sample(base: &TrainingConfig, sample: &SampledConfig) -> TrainingConfig {
    let mut config = base.clone();
    for (param, value) in sample {
        param.apply(&mut config, *value);
    }
    config
}

/// Settings of the hyperparameter search controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Number of trials to run.
    pub num_samples: usize,
    pub max_concurrent_trials: usize,
    /// Epochs every trial runs before it can be pruned.
    pub grace_period: usize,
    /// Rung spacing and kept fraction (`1 / reduction_factor`) of the pruner.
    pub reduction_factor: f64,
    /// Trials sampled at random before the suggestion model kicks in.
    pub n_startup_trials: usize,
    /// Fraction of finished trials treated as "good" by the suggestion model.
    pub gamma: f64,
    pub seed: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            num_samples: 10,
            max_concurrent_trials: 2,
            grace_period: 1,
            reduction_factor: 2.0,
            n_startup_trials: 5,
            gamma: 0.25,
            seed: 0,
        }
    }
}

impl SearchConfig {
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(CoreError::InvalidConfig(msg.to_string()));
        if self.num_samples == 0 {
            return fail("num_samples must be at least 1");
        }
        if self.max_concurrent_trials == 0 {
            return fail("max_concurrent_trials must be at least 1");
        }
        if self.grace_period == 0 {
            return fail("grace_period must be at least 1");
        }
        if self.reduction_factor < 2.0 {
            return fail("reduction_factor must be at least 2");
        }
        if !(self.gamma > 0.0 && self.gamma < 1.0) {
            return fail("gamma must be in (0, 1)");
        }
        Ok(())
    }
}

/// Search settings of a run file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    pub controller: SearchConfig,
    pub space: SearchSpace,
}

/// Everything needed to run training or a search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Training corpus files, concatenated in order.
    pub train_files: Vec<PathBuf>,
    /// Validation corpus files; when empty, `validation_ratio` of the
    /// training corpus is held out instead.
    pub validation_files: Vec<PathBuf>,
    pub validation_ratio: f64,
    /// Abort on the first malformed corpus record.
    pub strict_corpus: bool,
    /// Defaults to `<model_name>/tokenizer.json`.
    pub tokenizer_path: Option<PathBuf>,
    pub output_dir: PathBuf,
    pub training: TrainingConfig,
    pub search: Option<SearchSettings>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            train_files: Vec::new(),
            validation_files: Vec::new(),
            validation_ratio: 0.1,
            strict_corpus: false,
            tokenizer_path: None,
            output_dir: PathBuf::from("runs"),
            training: TrainingConfig::default(),
            search: None,
        }
    }
}

impl RunConfig {
    /// Load a run configuration from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: RunConfig = serde_json::from_str(&text)?;
        Ok(config)
    }

    pub fn tokenizer_path(&self) -> PathBuf {
        self.tokenizer_path
            .clone()
            .unwrap_or_else(|| Path::new(&self.training.model_name).join("tokenizer.json"))
    }

    pub fn validate(&self) -> Result<()> {
        if self.train_files.is_empty() {
            return Err(CoreError::InvalidConfig("no training corpus given".into()));
        }
        if self.validation_files.is_empty() && !(0.0..1.0).contains(&self.validation_ratio) {
            return Err(CoreError::InvalidConfig(format!(
                "validation_ratio must be in [0, 1), got {}",
                self.validation_ratio
            )));
        }
        self.training.validate()?;
        if let Some(search) = &self.search {
            search.controller.validate()?;
            search.space.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(TrainingConfig::default().validate().is_ok());
        assert!(SearchConfig::default().validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = TrainingConfig::new()
            .with_epochs(5)
            .with_batch_size(8)
            .with_learning_rate(1e-3)
            .with_checkpoint_frequency(2)
            .with_workers(4);
        assert_eq!(config.num_epochs, 5);
        assert_eq!(config.batch_size, 8);
        assert_eq!(config.num_workers, 4);
        assert!(config.is_checkpoint_epoch(0));
        assert!(!config.is_checkpoint_epoch(1));
        assert!(config.is_checkpoint_epoch(4));
    }

    #[test]
    fn test_invalid_values() {
        assert!(TrainingConfig::new().with_workers(0).validate().is_err());
        assert!(TrainingConfig::new().with_checkpoint_frequency(0).validate().is_err());
        assert!(TrainingConfig::new().with_learning_rate(f64::NAN).validate().is_err());
        assert!(TrainingConfig::new().with_max_length(1).validate().is_err());

        let mut config = TrainingConfig::new();
        config.num_labels = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_search_space_validation() {
        let space = SearchSpace::new()
            .with(Hyperparameter::LearningRate, Distribution::LogUniform { low: 1e-5, high: 1e-2 })
            .with(Hyperparameter::BatchSize, Distribution::Choice { values: vec![8.0, 16.0] });
        assert!(space.validate().is_ok());

        let dup = space
            .clone()
            .with(Hyperparameter::LearningRate, Distribution::Uniform { low: 0.1, high: 0.2 });
        assert!(dup.validate().is_err());

        let bad = SearchSpace::new()
            .with(Hyperparameter::LearningRate, Distribution::LogUniform { low: 0.0, high: 1.0 });
        assert!(bad.validate().is_err());
        assert!(SearchSpace::new().validate().is_err());
    }

    #[test]
    fn test_apply_sample() {
        let base = TrainingConfig::default();
        let sample: SampledConfig = [
            (Hyperparameter::LearningRate, 3e-4),
            (Hyperparameter::BatchSize, 31.6),
        ]
        .into_iter()
        .collect();
        let config = apply_sample(&base, &sample);
        assert_eq!(config.learning_rate, 3e-4);
        assert_eq!(config.batch_size, 32);
        assert_eq!(config.num_epochs, base.num_epochs);
    }

    #[test]
    fn test_run_config_json() {
        let json = r#"{
            "train_files": ["data/a.txt", "data/b.txt"],
            "output_dir": "out",
            "training": { "num_epochs": 4, "learning_rate": 0.001 },
            "search": {
                "controller": { "num_samples": 6 },
                "space": { "dimensions": [
                    { "param": "learning_rate",
                      "distribution": { "type": "log_uniform", "low": 1e-5, "high": 1e-3 } }
                ] }
            }
        }"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        std::fs::write(&path, json).unwrap();

        let config = RunConfig::from_file(&path).unwrap();
        assert_eq!(config.train_files.len(), 2);
        assert_eq!(config.training.num_epochs, 4);
        assert_eq!(config.training.batch_size, 16);
        let search = config.search.as_ref().unwrap();
        assert_eq!(search.controller.num_samples, 6);
        assert_eq!(search.space.len(), 1);
        assert!(config.validate().is_ok());
        assert_eq!(
            config.tokenizer_path(),
            Path::new("models/distilbert-base-uncased/tokenizer.json")
        );
    }
}
