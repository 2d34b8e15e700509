//! # Checkpoints
//!
//! Layout under a trial directory:
//!
//! ```text
//! trial-0003/
//!   epoch-000000/
//!     model.safetensors
//!     metrics.json
//!   .staging-epoch-000002/   (only while a write is in flight)
//! ```
//!
//! A checkpoint directory becomes visible by renaming its staging directory
//! after both files were written, so every visible checkpoint has metrics.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, TrainError};

const WEIGHTS_FILE: &str = "model.safetensors";
const METRICS_FILE: &str = "metrics.json";
const EPOCH_PREFIX: &str = "epoch-";
const STAGING_PREFIX: &str = ".staging-epoch-";

/// Metrics stored next to the weights of a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetrics {
    pub epoch: usize,
    pub loss: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub train_accuracy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub val_accuracy: Option<f64>,
}

/// Location of a completed checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CheckpointRef {
    pub epoch: usize,
    pub path: PathBuf,
}

impl CheckpointRef {
    pub fn weights_path(&self) -> PathBuf {
        self.path.join(WEIGHTS_FILE)
    }

    pub fn metrics_path(&self) -> PathBuf {
        self.path.join(METRICS_FILE)
    }

    pub fn metrics(&self) -> Result<CheckpointMetrics> {
        let text = fs::read_to_string(self.metrics_path())?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Names of the tensors stored in the weight file.
    pub fn tensor_names(&self) -> Result<Vec<String>> {
        let data = fs::read(self.weights_path())?;
        let tensors = safetensors::SafeTensors::deserialize(&data)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        let mut names: Vec<String> = tensors.names().into_iter().cloned().collect();
        names.sort();
        Ok(names)
    }
}

/// Checkpoint directory of one trial.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn epoch_dir(&self, epoch: usize) -> PathBuf {
        self.root.join(format!("{EPOCH_PREFIX}{epoch:06}"))
    }

    fn staging_dir(&self, epoch: usize) -> PathBuf {
        self.root.join(format!("{STAGING_PREFIX}{epoch:06}"))
    }

    /// Every completed checkpoint, by ascending epoch.
    pub fn history(&self) -> Result<Vec<CheckpointRef>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut checkpoints = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(epoch) = name
                .to_str()
                .and_then(|n| n.strip_prefix(EPOCH_PREFIX))
                .and_then(|n| n.parse::<usize>().ok())
            else {
                continue;
            };
            if entry.file_type()?.is_dir() {
                checkpoints.push(CheckpointRef {
                    epoch,
                    path: entry.path(),
                });
            }
        }
        checkpoints.sort();
        Ok(checkpoints)
    }

    /// The checkpoint with the highest epoch.
    pub fn latest(&self) -> Result<Option<CheckpointRef>> {
        Ok(self.history()?.pop())
    }

    pub fn at_epoch(&self, epoch: usize) -> Option<CheckpointRef> {
        let path = self.epoch_dir(epoch);
        path.is_dir().then_some(CheckpointRef { epoch, path })
    }

    /// Write weights and metrics of `epoch`. Fails if the checkpoint exists.
    pub fn save(
        &self,
        epoch: usize,
        weights: &VarMap,
        metrics: &CheckpointMetrics,
    ) -> Result<CheckpointRef> {
        let target = self.epoch_dir(epoch);
        if target.exists() {
            return Err(TrainError::CheckpointExists(target));
        }

        let staging = self.staging_dir(epoch);
        let written = self.write_staged(&staging, &target, weights, metrics);
        if written.is_err() {
            let _ = fs::remove_dir_all(&staging);
        }
        written.map_err(|source| TrainError::Checkpoint { epoch, source })?;

        info!(epoch, path = %target.display(), "saved checkpoint");
        Ok(CheckpointRef {
            epoch,
            path: target,
        })
    }

    fn write_staged(
        &self,
        staging: &Path,
        target: &Path,
        weights: &VarMap,
        metrics: &CheckpointMetrics,
    ) -> io::Result<()> {
        if staging.exists() {
            fs::remove_dir_all(staging)?;
        }
        fs::create_dir_all(staging)?;

        weights.save(staging.join(WEIGHTS_FILE)).map_err(io::Error::other)?;
        let json = serde_json::to_vec_pretty(metrics).map_err(io::Error::other)?;
        fs::write(staging.join(METRICS_FILE), json)?;

        fs::rename(staging, target)?;
        debug!(from = %staging.display(), to = %target.display(), "published checkpoint");
        Ok(())
    }
}

/// Decides which epochs are checkpointed and by whom.
///
/// Exactly one worker per trial is the owner; only the owner ever writes.
#[derive(Debug, Clone)]
pub struct CheckpointCoordinator {
    store: CheckpointStore,
    is_checkpoint_owner: bool,
    frequency: usize,
}

impl CheckpointCoordinator {
    pub fn new(store: CheckpointStore, is_checkpoint_owner: bool, frequency: usize) -> Self {
        Self {
            store,
            is_checkpoint_owner,
            frequency,
        }
    }

    pub fn is_owner(&self) -> bool {
        self.is_checkpoint_owner
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Whether this worker writes a checkpoint at the end of `epoch`.
    pub fn should_checkpoint(&self, epoch: usize) -> bool {
        self.is_checkpoint_owner && self.frequency > 0 && epoch % self.frequency == 0
    }

    /// Persist the model if this worker owns checkpoints and `epoch` is on
    /// cadence. Returns `None` otherwise.
    pub fn persist(
        &self,
        epoch: usize,
        weights: &VarMap,
        metrics: &CheckpointMetrics,
    ) -> Result<Option<CheckpointRef>> {
        if !self.should_checkpoint(epoch) {
            return Ok(None);
        }
        fs::create_dir_all(self.store.root())
            .map_err(|source| TrainError::Checkpoint { epoch, source })?;
        self.store.save(epoch, weights, metrics).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarBuilder;

    fn weights() -> VarMap {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        candle_nn::linear(4, 3, vb.pp("classifier")).unwrap();
        varmap
    }

    fn metrics(epoch: usize) -> CheckpointMetrics {
        CheckpointMetrics {
            epoch,
            loss: 0.5,
            train_accuracy: Some(0.8),
            val_accuracy: Some(0.7),
        }
    }

    #[test]
    fn test_save_and_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let varmap = weights();

        store.save(0, &varmap, &metrics(0)).unwrap();
        let saved = store.save(2, &varmap, &metrics(2)).unwrap();

        assert_eq!(saved.path, dir.path().join("epoch-000002"));
        assert_eq!(store.latest().unwrap().unwrap().epoch, 2);
        assert_eq!(store.history().unwrap().len(), 2);
        assert!(store.at_epoch(1).is_none());

        let checkpoint = store.at_epoch(0).unwrap();
        assert_eq!(checkpoint.metrics().unwrap(), metrics(0));
        assert_eq!(
            checkpoint.tensor_names().unwrap(),
            vec!["classifier.bias".to_string(), "classifier.weight".to_string()]
        );
        assert!(!dir.path().join(".staging-epoch-000002").exists());
    }

    #[test]
    fn test_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let varmap = weights();
        store.save(1, &varmap, &metrics(1)).unwrap();
        let err = store.save(1, &varmap, &metrics(1)).unwrap_err();
        assert!(matches!(err, TrainError::CheckpointExists(_)));
    }

    #[test]
    fn test_history_ignores_staging_and_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join(".staging-epoch-000004")).unwrap();
        fs::write(dir.path().join("epoch-000009"), b"not a dir").unwrap();
        let store = CheckpointStore::new(dir.path());
        assert!(store.history().unwrap().is_empty());
        assert!(store.latest().unwrap().is_none());
    }

    #[test]
    fn test_missing_root_has_no_history() {
        let store = CheckpointStore::new("/nonexistent/tagtune/trial-0000");
        assert!(store.history().unwrap().is_empty());
    }

    #[test]
    fn test_only_owner_persists() {
        let dir = tempfile::tempdir().unwrap();
        let varmap = weights();
        let owner = CheckpointCoordinator::new(CheckpointStore::new(dir.path()), true, 2);
        let follower = CheckpointCoordinator::new(CheckpointStore::new(dir.path()), false, 2);

        assert!(follower.persist(0, &varmap, &metrics(0)).unwrap().is_none());
        assert!(owner.persist(1, &varmap, &metrics(1)).unwrap().is_none());
        assert!(owner.persist(2, &varmap, &metrics(2)).unwrap().is_some());

        let epochs: Vec<usize> = owner.store().history().unwrap().iter().map(|c| c.epoch).collect();
        assert_eq!(epochs, vec![2]);
    }

    #[test]
    fn test_failed_write_leaves_no_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        // A file where the trial directory should be makes every write fail.
        let root = dir.path().join("trial-0000");
        fs::write(&root, b"").unwrap();
        let coordinator = CheckpointCoordinator::new(CheckpointStore::new(&root), true, 1);

        let err = coordinator.persist(0, &weights(), &metrics(0)).unwrap_err();
        assert!(matches!(err, TrainError::Checkpoint { epoch: 0, .. }));
    }
}
