//! # Tagtune Core
//!
//! Data side of BIO token-classification fine-tuning: corpus reading,
//! word-to-subword label alignment, per-worker sharding and token-level
//! metrics. Nothing here depends on an async runtime or on a model.
//!
//! ## Quick Start
//!
//! ```rust
//! use tagtune_core::{BioLabel, ConfusionMatrix};
//!
//! let mut matrix = ConfusionMatrix::new();
//! matrix.observe(BioLabel::Begin, BioLabel::Begin);
//! matrix.observe(BioLabel::Outside, BioLabel::Inside);
//!
//! assert_eq!(matrix.accuracy(), 0.5);
//! ```
pub mod align;
pub mod config;
pub mod corpus;
pub mod dataset;
pub mod error;
pub mod labels;
pub mod metrics;
pub mod pipeline;
pub mod tokenizer;

// Re-export primary API
pub use align::{AlignedExample, ContinuationPolicy, LabelAligner};
pub use config::{
    apply_sample, Distribution, Hyperparameter, RunConfig, SampledConfig, SearchConfig,
    SearchDimension, SearchSettings, SearchSpace, TrainingConfig,
};
pub use corpus::{split_train_validation, Corpus, CorpusReader, Sentence};
pub use dataset::{Batch, BatchTensors, Batches, Shard, ShardedDataset};
pub use error::{CoreError, Result};
pub use labels::{BioLabel, IGNORE_INDEX};
pub use metrics::{ClassMetrics, ClassificationReport, ConfusionMatrix};
pub use pipeline::{AlignedCorpus, ParsedCorpus, ShardedCorpus};
pub use tokenizer::{HfSubwordTokenizer, SubwordTokenizer};
