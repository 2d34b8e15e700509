//! # Tagtune Trainer
//!
//! Data-parallel fine-tuning of a BIO token tagger on top of
//! [`tagtune_core`]. One trial trains a configuration on every shard with
//! its own worker and averages the replicas' parameters after every epoch.
//! The search controller runs many trials concurrently, prunes weak ones
//! and selects the configuration with the best validation accuracy.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use tagtune_core::{pipeline, HfSubwordTokenizer, RunConfig};
//! use tagtune_trainer::{run_training, DistilBertFactory};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = RunConfig::from_file("run.json")?;
//! let tokenizer = HfSubwordTokenizer::from_file(config.tokenizer_path())?;
//! let data = pipeline::prepare(&config, tokenizer)?;
//!
//! let outcome = run_training(
//!     config.training.clone(),
//!     &data,
//!     Arc::new(DistilBertFactory::new()),
//!     &config.output_dir,
//! )
//! .await?;
//! println!("best val accuracy: {:?}", outcome.best_val_accuracy());
//! # Ok(())
//! # }
//! ```
pub mod checkpoint;
pub mod error;
pub mod loss;
pub mod model;
pub mod replica;
pub mod scheduler;
pub mod search;
pub mod trainer;
pub mod trial;

// Re-export primary API
pub use checkpoint::{CheckpointCoordinator, CheckpointMetrics, CheckpointRef, CheckpointStore};
pub use error::{Result, TrainError};
pub use model::{
    DistilBertEncoder, DistilBertFactory, EmbeddingEncoder, EmbeddingFactory, Encoder,
    ModelFactory, TokenClassifier, TokenTagger,
};
pub use replica::{average_parameters, HeadParameters};
pub use scheduler::LinearSchedule;
pub use search::{
    select_best, AshaScheduler, SearchController, SearchOutcome, TpeSampler, Trial, TrialResult,
    TrialStatus, RESULTS_FILE,
};
pub use trainer::{
    Decision, EpochMetrics, LoopState, ReportSink, TrainingLoop, WorkerContext, WorkerReport,
    WorkerSummary,
};
pub use trial::{
    run_trial, run_training, trial_dir, NoopObserver, TrialObserver, TrialOutcome, TrialReport,
};
