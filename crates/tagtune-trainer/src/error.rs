use std::path::PathBuf;

use tagtune_core::CoreError;
use thiserror::Error;

/// Errors raised while training, checkpointing or searching.
#[derive(Debug, Error)]
pub enum TrainError {
    /// Data preparation or configuration error from the core crate.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Candle tensor error.
    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    /// A worker was started without one of its shards.
    #[error("worker {worker} has no {split} shard")]
    MissingShard { worker: usize, split: &'static str },

    /// The loss became NaN or infinite.
    #[error("non-finite loss on worker {worker} at epoch {epoch}, step {step}")]
    NonFiniteLoss {
        worker: usize,
        epoch: usize,
        step: usize,
    },

    /// Writing a checkpoint failed. Earlier checkpoints are unaffected.
    #[error("checkpoint for epoch {epoch} failed: {source}")]
    Checkpoint {
        epoch: usize,
        #[source]
        source: std::io::Error,
    },

    /// A checkpoint for this epoch already exists.
    #[error("checkpoint already exists at {0}")]
    CheckpointExists(PathBuf),

    /// The pretrained model could not be loaded.
    #[error("failed to load model: {0}")]
    ModelLoad(String),

    /// A worker thread panicked or was cancelled.
    #[error("worker {worker} did not finish: {reason}")]
    WorkerAborted { worker: usize, reason: String },

    /// Every trial of a search failed.
    #[error("no trial finished successfully")]
    NoViableTrial,

    /// Replica parameters could not be exchanged.
    #[error("replica synchronization failed: {0}")]
    Replica(String),

    /// An orchestration channel closed unexpectedly.
    #[error("channel closed: {0}")]
    Channel(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for trainer operations.
pub type Result<T> = std::result::Result<T, TrainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let err = TrainError::NonFiniteLoss {
            worker: 1,
            epoch: 2,
            step: 3,
        };
        assert_eq!(
            err.to_string(),
            "non-finite loss on worker 1 at epoch 2, step 3"
        );

        let err: TrainError = CoreError::EmptyShard { worker: 4 }.into();
        assert_eq!(err.to_string(), "shard for worker 4 is empty");
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<TrainError>();
    }
}
